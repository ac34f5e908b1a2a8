use crate::db::PageRecord;
use crate::graph::GraphClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// Accepted by the upstream API with a confirmed message id.
    Sent,
    /// No credential could reach the conversation; the reply was accepted
    /// locally but the external send did not happen.
    Unconfirmed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub message_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_page: bool,
    pub status: SendStatus,
}

fn unconfirmed(text: &str) -> SendOutcome {
    SendOutcome {
        message_id: format!("local_{}", Uuid::new_v4()),
        text: text.to_string(),
        timestamp: Utc::now(),
        is_from_page: true,
        status: SendStatus::Unconfirmed,
    }
}

/// Relays an agent reply into a conversation. The owning page is unknown,
/// so credentials are probed in order: the first page whose participant
/// list yields a non-page recipient sends the message. When none does, the
/// reply degrades to an unconfirmed local outcome rather than failing the
/// agent's action; the resolution failure is logged.
pub async fn send(
    graph: &GraphClient,
    conversation_id: &str,
    text: &str,
    pages: &[PageRecord],
) -> SendOutcome {
    let mut recipient: Option<(&PageRecord, String)> = None;

    for page in pages {
        match graph
            .get_conversation_participants(conversation_id, &page.access_token)
            .await
        {
            Ok(participants) => {
                if let Some(customer) = participants.into_iter().find(|p| p.id != page.page_id) {
                    recipient = Some((page, customer.id));
                    break;
                }
            }
            Err(err) => {
                debug!(
                    "page {} cannot access conversation {conversation_id}: {err}",
                    page.page_id
                );
            }
        }
    }

    let Some((page, recipient_id)) = recipient else {
        warn!("no credential could resolve a recipient for {conversation_id}; returning unconfirmed outcome");
        return unconfirmed(text);
    };

    match graph.send_text(&page.access_token, &recipient_id, text).await {
        Ok(message_id) => SendOutcome {
            message_id,
            text: text.to_string(),
            timestamp: Utc::now(),
            is_from_page: true,
            status: SendStatus::Sent,
        },
        Err(err) => {
            warn!(
                "send via page {} to {recipient_id} failed: {err}; returning unconfirmed outcome",
                page.page_id
            );
            unconfirmed(text)
        }
    }
}
