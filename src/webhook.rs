use crate::db::{self, MessageRecord, PageRecord};
use crate::identity;
use crate::AppState;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::Sha1;
use tracing::{error, warn};
use uuid::Uuid;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    pub id: String,
    pub time: Option<i64>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventActor {
    pub id: String,
}

/// Raw wire shape: at most one of message/delivery/read/postback is set.
/// `classify` folds it into the tagged union the processor dispatches on.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagingEvent {
    pub sender: Option<EventActor>,
    pub recipient: Option<EventActor>,
    pub timestamp: Option<i64>,
    pub message: Option<Value>,
    pub delivery: Option<Value>,
    pub read: Option<Value>,
    pub postback: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedAttachment {
    pub kind: String,
    pub url: Option<String>,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Message {
        mid: Option<String>,
        text: Option<String>,
        seq: Option<i64>,
        quick_reply: bool,
        attachments: Vec<ParsedAttachment>,
    },
    Delivery {
        mids: Vec<String>,
        watermark: Option<i64>,
    },
    Read {
        watermark: Option<i64>,
    },
    Postback {
        title: Option<String>,
        payload: Option<String>,
    },
}

pub fn parse_attachments(value: Option<&Value>) -> Vec<ParsedAttachment> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|att| {
                    let kind = att.get("type").and_then(|t| t.as_str())?.to_string();
                    Some(ParsedAttachment {
                        kind,
                        url: att
                            .get("payload")
                            .and_then(|p| p.get("url"))
                            .and_then(|u| u.as_str())
                            .map(|s| s.to_string()),
                        payload: att.get("payload").cloned(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn classify(event: &MessagingEvent) -> Option<EventKind> {
    if let Some(message) = event.message.as_ref() {
        return Some(EventKind::Message {
            mid: message
                .get("mid")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            text: message
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            seq: message.get("seq").and_then(|v| v.as_i64()),
            quick_reply: message.get("quick_reply").is_some(),
            attachments: parse_attachments(message.get("attachments")),
        });
    }
    if let Some(delivery) = event.delivery.as_ref() {
        return Some(EventKind::Delivery {
            mids: delivery
                .get("mids")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|m| m.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            watermark: delivery.get("watermark").and_then(|v| v.as_i64()),
        });
    }
    if let Some(read) = event.read.as_ref() {
        return Some(EventKind::Read {
            watermark: read.get("watermark").and_then(|v| v.as_i64()),
        });
    }
    if let Some(postback) = event.postback.as_ref() {
        return Some(EventKind::Postback {
            title: postback
                .get("title")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            payload: postback
                .get("payload")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        });
    }
    None
}

pub fn message_type_for(quick_reply: bool, attachments: &[ParsedAttachment]) -> String {
    if let Some(first) = attachments.first() {
        return first.kind.clone();
    }
    if quick_reply {
        return "quick_reply".to_string();
    }
    "text".to_string()
}

fn attachments_to_value(attachments: &[ParsedAttachment]) -> Option<Value> {
    if attachments.is_empty() {
        None
    } else {
        serde_json::to_value(attachments).ok()
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn event_timestamp(raw: Option<i64>) -> DateTime<Utc> {
    raw.map(millis_to_datetime).unwrap_or_else(Utc::now)
}

pub fn signature_for(app_secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha1::new_from_slice(app_secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(app_secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let expected = signature_for(app_secret, body);
    header == Some(expected.as_str())
}

pub async fn process_payload(state: &AppState, payload: &WebhookPayload) -> anyhow::Result<()> {
    for entry in &payload.entry {
        if let Err(err) = process_entry(state, entry).await {
            error!("webhook entry {} failed: {err:?}", entry.id);
        }
    }
    Ok(())
}

async fn process_entry(state: &AppState, entry: &WebhookEntry) -> anyhow::Result<()> {
    let page = db::find_active_page(&state.pool, state.db_kind, &entry.id).await?;
    let Some(page) = page else {
        // Pages can be disconnected while events are still in flight.
        warn!("page {} not connected or inactive, skipping entry", entry.id);
        return Ok(());
    };
    for event in &entry.messaging {
        if let Err(err) = process_event(state, &page, event).await {
            error!(
                "messaging event for page {} failed: {err:?}",
                page.page_id
            );
        }
    }
    Ok(())
}

pub async fn process_event(
    state: &AppState,
    page: &PageRecord,
    event: &MessagingEvent,
) -> anyhow::Result<()> {
    let Some(sender) = event.sender.as_ref() else {
        return Ok(());
    };
    if sender.id == page.page_id {
        // echo of our own outbound
        return Ok(());
    }
    let Some(kind) = classify(event) else {
        return Ok(());
    };

    let profile = identity::resolve(&state.graph, &page.access_token, &sender.id, None).await;
    let customer_name = format!("{} {}", profile.first_name, profile.last_name)
        .trim()
        .to_string();
    let conversation = db::find_or_create_conversation(
        &state.pool,
        state.db_kind,
        &page.page_id,
        &sender.id,
        &customer_name,
        profile.profile_pic.as_deref(),
        state.config.sync.conversation_window_hours,
    )
    .await?;

    let timestamp = event_timestamp(event.timestamp);

    match kind {
        EventKind::Message {
            mid,
            text,
            seq,
            quick_reply,
            attachments,
        } => {
            let Some(mid) = mid else {
                warn!("message event without mid from {}, skipping", sender.id);
                return Ok(());
            };
            let message_type = message_type_for(quick_reply, &attachments);
            let record = MessageRecord {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation.id.clone(),
                message_id: mid.clone(),
                sender_id: sender.id.clone(),
                sender_name: Some(conversation.customer_name.clone()),
                text: text.clone(),
                attachments: attachments_to_value(&attachments),
                timestamp,
                is_from_page: false,
                message_type,
                status: "sent".to_string(),
                mid: Some(mid),
                seq,
                watermark: None,
                read_flag: false,
                reply_to: None,
                agent_id: None,
                created_at: Utc::now(),
            };
            let stored = db::upsert_incoming(&state.pool, state.db_kind, &record).await?;
            if stored.id != record.id {
                // duplicate webhook delivery; the first one already counted
                return Ok(());
            }

            let preview = text
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "[Attachment]".to_string());
            db::record_activity(&state.pool, state.db_kind, &conversation.id, &preview, timestamp)
                .await?;
            db::increment_unread(&state.pool, state.db_kind, &conversation.id).await?;
        }
        EventKind::Delivery { mids, watermark } => {
            db::apply_delivery_receipt(
                &state.pool,
                state.db_kind,
                &conversation.id,
                &mids,
                watermark,
            )
            .await?;
        }
        EventKind::Read { watermark } => {
            let cutoff = watermark.map(millis_to_datetime).unwrap_or(timestamp);
            db::apply_read_receipt(&state.pool, state.db_kind, &conversation.id, cutoff).await?;
        }
        EventKind::Postback { title, payload } => {
            let text = title.clone().or(payload).unwrap_or_default();
            let record = MessageRecord {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation.id.clone(),
                // postbacks carry no upstream message id
                message_id: format!("postback_{}", Uuid::new_v4()),
                sender_id: sender.id.clone(),
                sender_name: Some(conversation.customer_name.clone()),
                text: Some(text),
                attachments: None,
                timestamp,
                is_from_page: false,
                message_type: "postback".to_string(),
                status: "sent".to_string(),
                mid: None,
                seq: None,
                watermark: None,
                read_flag: false,
                reply_to: None,
                agent_id: None,
                created_at: Utc::now(),
            };
            db::upsert_incoming(&state.pool, state.db_kind, &record).await?;

            let preview = title.unwrap_or_else(|| "[Postback]".to_string());
            db::record_activity(&state.pool, state.db_kind, &conversation.id, &preview, timestamp)
                .await?;
        }
    }
    Ok(())
}
