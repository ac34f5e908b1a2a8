use page_bridge::fetcher::{FetchError, ParticipantView};
use page_bridge::graph::GraphError;
use page_bridge::identity::placeholder;

#[test]
fn test_fetch_error_from_expired_token() {
    let err = FetchError::from(GraphError::TokenExpired);
    assert!(matches!(err, FetchError::TokenExpired));
    assert!(err.to_string().contains("reconnect"));
}

#[test]
fn test_fetch_error_from_permission_denied() {
    let err = FetchError::from(GraphError::PermissionDenied);
    assert!(matches!(err, FetchError::PermissionDenied));
    assert!(err.to_string().contains("permissions"));
}

#[test]
fn test_fetch_error_from_invalid_target() {
    let err = FetchError::from(GraphError::InvalidTarget);
    assert!(matches!(err, FetchError::InvalidPage));
    assert!(err.to_string().contains("page"));
}

#[test]
fn test_fetch_error_from_other() {
    let err = FetchError::from(GraphError::Api {
        code: 613,
        message: "rate limited".to_string(),
    });
    match err {
        FetchError::Upstream(message) => assert!(message.contains("613")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_no_accessible_page_is_distinct() {
    let err = FetchError::NoAccessiblePage;
    assert!(err.to_string().contains("no connected page"));
}

#[test]
fn test_participant_view_from_placeholder() {
    let view = ParticipantView::from(placeholder("U7"));
    assert_eq!(view.id, "U7");
    assert_eq!(view.name, "Unknown User");
    assert_eq!(view.first_name, "Unknown");
    assert_eq!(view.last_name, "User");
    assert!(view.profile_pic.is_none());
}

#[test]
fn test_participant_view_serializes() {
    let view = ParticipantView::from(placeholder("U8"));
    let value = serde_json::to_value(&view).unwrap();
    assert_eq!(value["id"], "U8");
    assert_eq!(value["name"], "Unknown User");
}
