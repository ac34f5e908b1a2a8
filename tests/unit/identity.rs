use page_bridge::identity::{identity_from_name, placeholder, split_name};

#[test]
fn test_split_name_basic() {
    let (first, last) = split_name("Jane Doe");
    assert_eq!(first, "Jane");
    assert_eq!(last, "Doe");
}

#[test]
fn test_split_name_middle_names() {
    let (first, last) = split_name("Maria del Carmen Lopez");
    assert_eq!(first, "Maria");
    assert_eq!(last, "del Carmen Lopez");
}

#[test]
fn test_split_name_single_word() {
    let (first, last) = split_name("Prince");
    assert_eq!(first, "Prince");
    assert_eq!(last, "User");
}

#[test]
fn test_split_name_empty_string() {
    let (first, last) = split_name("");
    assert_eq!(first, "Unknown");
    assert_eq!(last, "User");
}

#[test]
fn test_split_name_extra_whitespace() {
    let (first, last) = split_name("  Jane   Doe  ");
    assert_eq!(first, "Jane");
    assert_eq!(last, "Doe");
}

#[test]
fn test_placeholder_is_unknown_user() {
    let identity = placeholder("U99");
    assert_eq!(identity.id, "U99");
    assert_eq!(identity.name, "Unknown User");
    assert_eq!(identity.first_name, "Unknown");
    assert_eq!(identity.last_name, "User");
    assert!(identity.profile_pic.is_none());
    assert!(identity.locale.is_none());
    assert!(identity.timezone.is_none());
    assert!(identity.gender.is_none());
}

#[test]
fn test_identity_from_name_splits() {
    let identity = identity_from_name("U1", "Jane Doe");
    assert_eq!(identity.id, "U1");
    assert_eq!(identity.name, "Jane Doe");
    assert_eq!(identity.first_name, "Jane");
    assert_eq!(identity.last_name, "Doe");
}

#[test]
fn test_display_name_uses_full_name() {
    let identity = identity_from_name("U1", "Jane Doe");
    assert_eq!(identity.display_name(), "Jane Doe");
}

#[test]
fn test_identity_serializes_with_nullable_tail() {
    let identity = placeholder("U1");
    let value = serde_json::to_value(&identity).unwrap();
    assert_eq!(value["name"], "Unknown User");
    assert!(value["profile_pic"].is_null());
    assert!(value["locale"].is_null());
}
