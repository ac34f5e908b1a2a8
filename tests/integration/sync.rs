use chrono::{Duration, Utc};
use page_bridge::config::GraphConfig;
use page_bridge::db::{self, DbKind, MessageRecord, PageRecord};
use page_bridge::fetcher::{self, FetchError};
use page_bridge::graph::GraphClient;
use page_bridge::identity;
use page_bridge::relay::{self, SendStatus};
use serde_json::json;
use sqlx::AnyPool;
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

static DRIVERS: std::sync::Once = std::sync::Once::new();

async fn test_pool() -> (AnyPool, DbKind, TempDir) {
    DRIVERS.call_once(sqlx::any::install_default_drivers);
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state.sqlite");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let kind = db::db_kind_from_url(&url);
    let pool = AnyPool::connect(&url).await.unwrap();
    db::init_db(&pool, kind).await.unwrap();
    (pool, kind, dir)
}

fn graph_for(server: &MockServer) -> GraphClient {
    GraphClient::new(&GraphConfig {
        base_url: server.uri(),
        ..GraphConfig::default()
    })
}

fn page_record(page_id: &str, account: &str, token: &str) -> PageRecord {
    let now = Utc::now();
    PageRecord {
        page_id: page_id.to_string(),
        account_id: account.to_string(),
        page_name: "Acme Support".to_string(),
        access_token: token.to_string(),
        profile_picture: None,
        category: None,
        about: None,
        website: None,
        phone: None,
        email: None,
        webhook_verified: true,
        is_active: true,
        last_sync_at: None,
        disconnected_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn message_record(conversation_id: &str, message_id: &str, mid: &str, offset_secs: i64) -> MessageRecord {
    let now = Utc::now();
    MessageRecord {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        message_id: message_id.to_string(),
        sender_id: "U1".to_string(),
        sender_name: Some("Jane Doe".to_string()),
        text: Some("hello".to_string()),
        attachments: None,
        timestamp: now + Duration::seconds(offset_secs),
        is_from_page: false,
        message_type: "text".to_string(),
        status: "sent".to_string(),
        mid: Some(mid.to_string()),
        seq: None,
        watermark: None,
        read_flag: false,
        reply_to: None,
        agent_id: None,
        created_at: now,
    }
}

// ---- identity resolution ----

#[tokio::test]
async fn test_resolve_degrades_to_placeholder_when_everything_fails() {
    let server = MockServer::start().await;
    let graph = graph_for(&server);

    let identity = identity::resolve(&graph, "tok", "U1", Some("t_hint")).await;
    assert_eq!(identity.id, "U1");
    assert_eq!(identity.name, "Unknown User");
    assert_eq!(identity.first_name, "Unknown");
    assert_eq!(identity.last_name, "User");
    assert!(identity.profile_pic.is_none());
}

#[tokio::test]
async fn test_resolve_reads_name_from_conversation_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/t_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "participants": {"data": [
                {"id": "P1", "name": "Acme Support"},
                {"id": "U1", "name": "Jane Doe"},
            ]}
        })))
        .mount(&server)
        .await;
    let graph = graph_for(&server);

    let identity = identity::resolve(&graph, "tok", "U1", Some("t_1")).await;
    assert_eq!(identity.name, "Jane Doe");
    assert_eq!(identity.first_name, "Jane");
    assert_eq!(identity.last_name, "Doe");
}

#[tokio::test]
async fn test_resolve_falls_back_to_profile_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/U1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "U1",
            "name": "Jane Doe",
            "first_name": "Jane",
            "last_name": "Doe",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/U1/picture"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"url": "https://cdn.example.com/u1.jpg"}
        })))
        .mount(&server)
        .await;
    let graph = graph_for(&server);

    let identity = identity::resolve(&graph, "tok", "U1", None).await;
    assert_eq!(identity.name, "Jane Doe");
    assert_eq!(
        identity.profile_pic.as_deref(),
        Some("https://cdn.example.com/u1.jpg")
    );
}

#[tokio::test]
async fn test_resolve_merges_picture_into_placeholder() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/U1/picture"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"url": "https://cdn.example.com/u1.jpg"}
        })))
        .mount(&server)
        .await;
    let graph = graph_for(&server);

    let identity = identity::resolve(&graph, "tok", "U1", None).await;
    assert_eq!(identity.name, "Unknown User");
    assert_eq!(
        identity.profile_pic.as_deref(),
        Some("https://cdn.example.com/u1.jpg")
    );
}

// ---- conversation fetcher ----

#[tokio::test]
async fn test_list_conversations_keeps_degraded_entries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/P1/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "id": "t_1",
                    "updated_time": "2026-08-01T10:00:00+0000",
                    "participants": {"data": [
                        {"id": "P1", "name": "Acme Support"},
                        {"id": "U1", "name": "Jane Doe"},
                    ]},
                    "unread_count": 2,
                    "can_reply": true,
                    "message_count": 5,
                },
                {
                    "id": "t_2",
                    "updated_time": "2026-08-01T09:00:00+0000",
                    "participants": {"data": [
                        {"id": "P1", "name": "Acme Support"},
                        {"id": "U2"},
                    ]},
                    "unread_count": 0,
                },
                {
                    "id": "t_3",
                    "updated_time": "2026-08-01T08:00:00+0000",
                    "participants": {"data": [
                        {"id": "P1", "name": "Acme Support"},
                        {"id": "U3", "name": "John Roe"},
                    ]},
                    "unread_count": 1,
                },
            ]
        })))
        .mount(&server)
        .await;

    // Conversation t_1 enriches fully; t_2 and t_3 fail every profile and
    // preview call and must degrade rather than drop out of the result.
    Mock::given(method("GET"))
        .and(path("/t_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "participants": {"data": [
                {"id": "P1", "name": "Acme Support"},
                {"id": "U1", "name": "Jane Doe"},
            ]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/t_1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "mm_1", "message": "See you soon", "from": {"id": "U1", "name": "Jane Doe"},
                 "created_time": "2026-08-01T10:00:00+0000"}
            ]
        })))
        .mount(&server)
        .await;

    let graph = graph_for(&server);
    let page = page_record("P1", "acct_1", "tok_p1");

    let conversations = fetcher::list_conversations(&graph, &page, 20).await.unwrap();
    assert_eq!(conversations.len(), 3);

    assert_eq!(conversations[0].id, "t_1");
    assert_eq!(conversations[0].participant.name, "Jane Doe");
    assert_eq!(
        conversations[0].last_message.as_ref().unwrap().message,
        "See you soon"
    );
    assert_eq!(conversations[0].unread_count, 2);

    assert_eq!(conversations[1].id, "t_2");
    assert_eq!(conversations[1].participant.id, "U2");
    assert_eq!(conversations[1].participant.name, "Unknown User");
    assert_eq!(
        conversations[1].last_message.as_ref().unwrap().message,
        "No recent messages"
    );

    // The raw listing name survives when every profile lookup fails.
    assert_eq!(conversations[2].id, "t_3");
    assert_eq!(conversations[2].participant.name, "John Roe");
    assert_eq!(conversations[2].participant.first_name, "John");
    assert_eq!(conversations[2].participant.last_name, "Roe");
}

#[tokio::test]
async fn test_list_conversations_maps_expired_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/P1/conversations"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "Error validating access token", "type": "OAuthException", "code": 190}
        })))
        .mount(&server)
        .await;

    let graph = graph_for(&server);
    let page = page_record("P1", "acct_1", "tok_p1");

    let err = fetcher::list_conversations(&graph, &page, 20).await.unwrap_err();
    assert!(matches!(err, FetchError::TokenExpired));
}

#[tokio::test]
async fn test_list_messages_probes_credentials_in_order() {
    let server = MockServer::start().await;

    // Only the second page's token can read the conversation.
    Mock::given(method("GET"))
        .and(path("/t_9/messages"))
        .and(query_param("access_token", "tok_good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "mm_2", "message": "Hi! How can I help?", "from": {"id": "P2", "name": "Acme Support"},
                 "created_time": "2026-08-01T10:01:00+0000"},
                {"id": "mm_1", "message": "Hello", "from": {"id": "U1", "name": "Jane Doe"},
                 "created_time": "2026-08-01T10:00:00+0000"},
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/t_9/messages"))
        .and(query_param("access_token", "tok_bad"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "Unsupported get request", "type": "GraphMethodException", "code": 100}
        })))
        .mount(&server)
        .await;

    let graph = graph_for(&server);
    let pages = vec![
        page_record("P_other", "acct_1", "tok_bad"),
        page_record("P2", "acct_1", "tok_good"),
    ];

    let messages = fetcher::list_messages(&graph, "t_9", &pages, 50).await.unwrap();
    assert_eq!(messages.len(), 2);
    // chronological order for display
    assert_eq!(messages[0].id, "mm_1");
    assert!(!messages[0].is_from_page);
    assert_eq!(messages[1].id, "mm_2");
    assert!(messages[1].is_from_page);
    // sender identity degraded to the raw name carried on the message
    assert_eq!(messages[0].from.name, "Jane Doe");
}

#[tokio::test]
async fn test_list_messages_no_accessible_page() {
    let server = MockServer::start().await;
    let graph = graph_for(&server);
    let pages = vec![page_record("P1", "acct_1", "tok_p1")];

    let err = fetcher::list_messages(&graph, "t_none", &pages, 50).await.unwrap_err();
    assert!(matches!(err, FetchError::NoAccessiblePage));
}

// ---- outbound relay ----

#[tokio::test]
async fn test_send_picks_first_credential_with_access() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/t_42"))
        .and(query_param("access_token", "tok_good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "participants": {"data": [
                {"id": "P2", "name": "Acme Support"},
                {"id": "U9", "name": "Jane Doe"},
            ]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "recipient_id": "U9",
            "message_id": "m_out_1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let graph = graph_for(&server);
    let pages = vec![
        page_record("P_no_access", "acct_1", "tok_bad"),
        page_record("P2", "acct_1", "tok_good"),
    ];

    let outcome = relay::send(&graph, "t_42", "Thanks!", &pages).await;
    assert_eq!(outcome.status, SendStatus::Sent);
    assert_eq!(outcome.message_id, "m_out_1");
    assert!(outcome.is_from_page);
}

#[tokio::test]
async fn test_send_degrades_to_unconfirmed_without_recipient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let graph = graph_for(&server);
    let pages = vec![page_record("P1", "acct_1", "tok_p1")];

    let outcome = relay::send(&graph, "t_unreachable", "Thanks!", &pages).await;
    assert_eq!(outcome.status, SendStatus::Unconfirmed);
    assert_eq!(outcome.text, "Thanks!");
    assert!(outcome.message_id.starts_with("local_"));
}

// ---- conversation store ----

#[tokio::test]
async fn test_conversation_window_reuses_within_24h() {
    let (pool, kind, _dir) = test_pool().await;

    let first = db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
        .await
        .unwrap();
    let second = db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn test_conversation_window_rolls_over_after_gap() {
    let (pool, kind, _dir) = test_pool().await;

    let first = db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
        .await
        .unwrap();
    // Age the thread past the session window.
    let stale = Utc::now() - Duration::hours(25);
    db::record_activity(&pool, kind, &first.id, "old message", stale)
        .await
        .unwrap();

    let second = db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    // The old record is history, not garbage.
    assert!(db::get_conversation(&pool, kind, &first.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_conversation_creation_race_yields_single_record() {
    let (pool, kind, _dir) = test_pool().await;

    let a = {
        let pool = pool.clone();
        tokio::spawn(async move {
            db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24).await
        })
    };
    let b = {
        let pool = pool.clone();
        tokio::spawn(async move {
            db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24).await
        })
    };
    let first = a.await.unwrap().unwrap();
    let second = b.await.unwrap().unwrap();
    assert_eq!(first.id, second.id);

    let conversations = db::list_conversations(&pool, kind, "P1", 10, 0).await.unwrap();
    assert_eq!(conversations.len(), 1);
}

#[tokio::test]
async fn test_conversation_refreshes_identity_fields() {
    let (pool, kind, _dir) = test_pool().await;

    db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
        .await
        .unwrap();
    let refreshed = db::find_or_create_conversation(
        &pool,
        kind,
        "P1",
        "U1",
        "Jane Smith",
        Some("https://cdn.example.com/new.jpg"),
        24,
    )
    .await
    .unwrap();
    assert_eq!(refreshed.customer_name, "Jane Smith");
    assert_eq!(
        refreshed.customer_avatar.as_deref(),
        Some("https://cdn.example.com/new.jpg")
    );

    // Empty values never clobber known-good ones.
    let unchanged = db::find_or_create_conversation(&pool, kind, "P1", "U1", "", None, 24)
        .await
        .unwrap();
    assert_eq!(unchanged.customer_name, "Jane Smith");
    assert_eq!(
        unchanged.customer_avatar.as_deref(),
        Some("https://cdn.example.com/new.jpg")
    );
}

#[tokio::test]
async fn test_unread_count_lifecycle() {
    let (pool, kind, _dir) = test_pool().await;

    let conversation =
        db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
            .await
            .unwrap();
    db::increment_unread(&pool, kind, &conversation.id).await.unwrap();
    db::increment_unread(&pool, kind, &conversation.id).await.unwrap();

    let loaded = db::get_conversation(&pool, kind, &conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.unread_count, 2);

    db::mark_conversation_read(&pool, kind, &conversation.id)
        .await
        .unwrap();
    let loaded = db::get_conversation(&pool, kind, &conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.unread_count, 0);
}

// ---- message store ----

#[tokio::test]
async fn test_upsert_incoming_is_idempotent() {
    let (pool, kind, _dir) = test_pool().await;
    let conversation =
        db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
            .await
            .unwrap();

    let record = message_record(&conversation.id, "m_1", "m_1", 0);
    let stored = db::upsert_incoming(&pool, kind, &record).await.unwrap();

    let mut replay = message_record(&conversation.id, "m_1", "m_1", 0);
    replay.text = Some("different body on replay".to_string());
    let second = db::upsert_incoming(&pool, kind, &replay).await.unwrap();

    assert_eq!(stored.id, second.id);
    assert_eq!(second.text.as_deref(), Some("hello"));

    let messages = db::list_messages(&pool, kind, &conversation.id, 10, 0).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_delivery_receipt_only_touches_listed_mids() {
    let (pool, kind, _dir) = test_pool().await;
    let conversation =
        db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
            .await
            .unwrap();

    db::upsert_incoming(&pool, kind, &message_record(&conversation.id, "m_1", "m_1", 0))
        .await
        .unwrap();
    db::upsert_incoming(&pool, kind, &message_record(&conversation.id, "m_2", "m_2", 1))
        .await
        .unwrap();

    let updated = db::apply_delivery_receipt(
        &pool,
        kind,
        &conversation.id,
        &["m_1".to_string()],
        Some(1700000001000),
    )
    .await
    .unwrap();
    assert_eq!(updated, 1);

    let m1 = db::find_message_by_external_id(&pool, kind, "m_1").await.unwrap().unwrap();
    let m2 = db::find_message_by_external_id(&pool, kind, "m_2").await.unwrap().unwrap();
    assert_eq!(m1.status, "delivered");
    assert_eq!(m1.watermark, Some(1700000001000));
    assert_eq!(m2.status, "sent");

    // Re-applying the same receipt is a no-op.
    let updated = db::apply_delivery_receipt(
        &pool,
        kind,
        &conversation.id,
        &["m_1".to_string()],
        Some(1700000001000),
    )
    .await
    .unwrap();
    assert_eq!(updated, 0);
}

#[tokio::test]
async fn test_read_receipt_respects_timestamp_cutoff() {
    let (pool, kind, _dir) = test_pool().await;
    let conversation =
        db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
            .await
            .unwrap();

    db::upsert_incoming(&pool, kind, &message_record(&conversation.id, "m_old", "m_old", -60))
        .await
        .unwrap();
    db::upsert_incoming(&pool, kind, &message_record(&conversation.id, "m_new", "m_new", 3600))
        .await
        .unwrap();

    db::apply_read_receipt(&pool, kind, &conversation.id, Utc::now())
        .await
        .unwrap();

    let old = db::find_message_by_external_id(&pool, kind, "m_old").await.unwrap().unwrap();
    let new = db::find_message_by_external_id(&pool, kind, "m_new").await.unwrap().unwrap();
    assert_eq!(old.status, "read");
    assert!(old.read_flag);
    assert_eq!(new.status, "sent");
}

#[tokio::test]
async fn test_status_never_regresses() {
    let (pool, kind, _dir) = test_pool().await;
    let conversation =
        db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
            .await
            .unwrap();

    db::upsert_incoming(&pool, kind, &message_record(&conversation.id, "m_1", "m_1", 0))
        .await
        .unwrap();
    db::apply_read_receipt(&pool, kind, &conversation.id, Utc::now() + Duration::seconds(5))
        .await
        .unwrap();

    let updated = db::apply_delivery_receipt(
        &pool,
        kind,
        &conversation.id,
        &["m_1".to_string()],
        Some(1700000009000),
    )
    .await
    .unwrap();
    assert_eq!(updated, 0);

    let message = db::find_message_by_external_id(&pool, kind, "m_1").await.unwrap().unwrap();
    assert_eq!(message.status, "read");
}

#[tokio::test]
async fn test_list_messages_newest_first_with_paging() {
    let (pool, kind, _dir) = test_pool().await;
    let conversation =
        db::find_or_create_conversation(&pool, kind, "P1", "U1", "Jane Doe", None, 24)
            .await
            .unwrap();

    for i in 0..5 {
        db::upsert_incoming(
            &pool,
            kind,
            &message_record(&conversation.id, &format!("m_{i}"), &format!("m_{i}"), i),
        )
        .await
        .unwrap();
    }

    let first_page = db::list_messages(&pool, kind, &conversation.id, 2, 0).await.unwrap();
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].message_id, "m_4");
    assert_eq!(first_page[1].message_id, "m_3");

    let second_page = db::list_messages(&pool, kind, &conversation.id, 2, 2).await.unwrap();
    assert_eq!(second_page[0].message_id, "m_2");
}

// ---- page credential store ----

#[tokio::test]
async fn test_single_active_credential_per_page() {
    let (pool, kind, _dir) = test_pool().await;

    db::upsert_page(&pool, kind, &page_record("P1", "acct_1", "tok_old"))
        .await
        .unwrap();
    db::upsert_page(&pool, kind, &page_record("P1", "acct_1", "tok_new"))
        .await
        .unwrap();

    let pages = db::list_active_pages(&pool, kind, "acct_1").await.unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].access_token, "tok_new");
}

#[tokio::test]
async fn test_deactivate_page_scoped_to_owner() {
    let (pool, kind, _dir) = test_pool().await;

    db::upsert_page(&pool, kind, &page_record("P1", "acct_1", "tok_p1"))
        .await
        .unwrap();

    // The wrong account cannot disconnect someone else's page.
    let removed = db::deactivate_page(&pool, kind, "P1", "acct_other", Utc::now())
        .await
        .unwrap();
    assert!(!removed);

    let removed = db::deactivate_page(&pool, kind, "P1", "acct_1", Utc::now())
        .await
        .unwrap();
    assert!(removed);
    assert!(db::find_active_page(&pool, kind, "P1").await.unwrap().is_none());
}
