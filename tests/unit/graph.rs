use page_bridge::graph::{
    classify_error, error_from_body, parse_participants, GraphError, SUBSCRIBED_FIELDS,
};
use serde_json::json;

#[test]
fn test_classify_expired_token() {
    assert!(matches!(
        classify_error(190, "Error validating access token"),
        GraphError::TokenExpired
    ));
}

#[test]
fn test_classify_permission_denied() {
    assert!(matches!(
        classify_error(200, "Requires pages_messaging permission"),
        GraphError::PermissionDenied
    ));
}

#[test]
fn test_classify_invalid_target() {
    assert!(matches!(
        classify_error(100, "Unsupported get request"),
        GraphError::InvalidTarget
    ));
}

#[test]
fn test_classify_other_code() {
    match classify_error(613, "Calls to this api have exceeded the rate limit") {
        GraphError::Api { code, message } => {
            assert_eq!(code, 613);
            assert!(message.contains("rate limit"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_error_from_body_present() {
    let body = json!({
        "error": {"message": "Error validating access token", "type": "OAuthException", "code": 190}
    });
    assert!(matches!(
        error_from_body(&body),
        Some(GraphError::TokenExpired)
    ));
}

#[test]
fn test_error_from_body_absent() {
    let body = json!({"data": []});
    assert!(error_from_body(&body).is_none());
}

#[test]
fn test_error_from_body_missing_code() {
    let body = json!({"error": {"message": "something odd"}});
    match error_from_body(&body) {
        Some(GraphError::Api { code, message }) => {
            assert_eq!(code, 0);
            assert_eq!(message, "something odd");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_parse_participants() {
    let body = json!({
        "participants": {"data": [
            {"id": "P1", "name": "Acme Support"},
            {"id": "U1", "name": "Jane Doe"},
        ]}
    });
    let participants = parse_participants(&body);
    assert_eq!(participants.len(), 2);
    assert_eq!(participants[1].id, "U1");
    assert_eq!(participants[1].name.as_deref(), Some("Jane Doe"));
}

#[test]
fn test_parse_participants_missing() {
    assert!(parse_participants(&json!({})).is_empty());
}

#[test]
fn test_parse_participants_skips_idless() {
    let body = json!({
        "participants": {"data": [
            {"name": "No Id"},
            {"id": "U2"},
        ]}
    });
    let participants = parse_participants(&body);
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].id, "U2");
    assert!(participants[0].name.is_none());
}

#[test]
fn test_subscribed_fields_cover_receipts() {
    assert!(SUBSCRIBED_FIELDS.contains("messages"));
    assert!(SUBSCRIBED_FIELDS.contains("messaging_postbacks"));
    assert!(SUBSCRIBED_FIELDS.contains("message_deliveries"));
    assert!(SUBSCRIBED_FIELDS.contains("message_reads"));
}
