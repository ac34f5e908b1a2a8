use crate::db::PageRecord;
use crate::graph::{GraphClient, GraphError, RemoteConversation, RemoteParticipant};
use crate::identity::{self, ResolvedIdentity};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("access token expired; reconnect the page")]
    TokenExpired,
    #[error("insufficient permissions to access conversations; reconnect the page with messaging permissions")]
    PermissionDenied,
    #[error("invalid page id or the page no longer exists")]
    InvalidPage,
    #[error("no connected page can access this conversation")]
    NoAccessiblePage,
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<GraphError> for FetchError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::TokenExpired => FetchError::TokenExpired,
            GraphError::PermissionDenied => FetchError::PermissionDenied,
            GraphError::InvalidTarget => FetchError::InvalidPage,
            other => FetchError::Upstream(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantView {
    pub id: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_pic: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<f64>,
    pub gender: Option<String>,
}

impl From<ResolvedIdentity> for ParticipantView {
    fn from(identity: ResolvedIdentity) -> Self {
        let name = identity.display_name();
        Self {
            id: identity.id,
            name,
            first_name: identity.first_name,
            last_name: identity.last_name,
            profile_pic: identity.profile_pic,
            locale: identity.locale,
            timezone: identity.timezone,
            gender: identity.gender,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewView {
    pub message: String,
    pub created_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub id: String,
    pub participant: ParticipantView,
    pub last_message: Option<PreviewView>,
    pub unread_count: i64,
    pub updated_time: Option<String>,
    pub can_reply: Option<bool>,
    pub message_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderView {
    pub id: Option<String>,
    pub name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_pic: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: String,
    pub message: String,
    pub from: SenderView,
    pub created_time: Option<String>,
    pub attachments: Option<serde_json::Value>,
    pub is_from_page: bool,
}

async fn enrich_conversation(
    graph: &GraphClient,
    page: &PageRecord,
    conv: &RemoteConversation,
    customer: &RemoteParticipant,
) -> ConversationView {
    let mut identity = identity::resolve(
        graph,
        &page.access_token,
        &customer.id,
        Some(conv.id.as_str()),
    )
    .await;
    if identity.name == "Unknown User" {
        // Every lookup degraded; the raw name from the conversation listing
        // beats the placeholder.
        if let Some(name) = customer.name.as_deref().filter(|n| !n.is_empty()) {
            let picture = identity.profile_pic.take();
            identity = identity::identity_from_name(&customer.id, name);
            identity.profile_pic = picture;
        }
    }

    let last_message = match graph.list_messages(&conv.id, &page.access_token, 1).await {
        Ok(messages) => messages.first().map(|m| PreviewView {
            message: m
                .message
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "[Attachment]".to_string()),
            created_time: m.created_time.clone(),
        }),
        Err(err) => {
            debug!("preview fetch failed for {}: {err}", conv.id);
            Some(PreviewView {
                message: "No recent messages".to_string(),
                created_time: conv.updated_time.clone(),
            })
        }
    };

    ConversationView {
        id: conv.id.clone(),
        participant: identity.into(),
        last_message,
        unread_count: conv.unread_count,
        updated_time: conv.updated_time.clone(),
        can_reply: conv.can_reply,
        message_count: conv.message_count,
    }
}

/// Lists a page's conversations from upstream, enriching each entry
/// independently. A failure inside one conversation degrades that entry;
/// it never drops it from the result.
pub async fn list_conversations(
    graph: &GraphClient,
    page: &PageRecord,
    limit: i64,
) -> Result<Vec<ConversationView>, FetchError> {
    let remote = graph
        .list_conversations(&page.page_id, &page.access_token, limit)
        .await?;

    let mut conversations = Vec::new();
    for conv in &remote {
        // The page itself is always one participant; the customer is the other.
        let Some(customer) = conv.participants.iter().find(|p| p.id != page.page_id) else {
            warn!("conversation {} has no customer participant", conv.id);
            continue;
        };
        conversations.push(enrich_conversation(graph, page, conv, customer).await);
    }
    Ok(conversations)
}

/// The caller does not know which page owns a remote conversation, so every
/// credential is tried in order; the first that can read it wins. No
/// credential succeeding is distinct from an empty conversation.
pub async fn list_messages(
    graph: &GraphClient,
    conversation_id: &str,
    pages: &[PageRecord],
    limit: i64,
) -> Result<Vec<MessageView>, FetchError> {
    let mut owning_page = None;
    let mut remote = Vec::new();

    for page in pages {
        match graph
            .list_messages(conversation_id, &page.access_token, limit)
            .await
        {
            Ok(messages) => {
                remote = messages;
                owning_page = Some(page);
                break;
            }
            Err(err) => {
                debug!(
                    "page {} cannot access conversation {conversation_id}: {err}",
                    page.page_id
                );
            }
        }
    }

    let Some(page) = owning_page else {
        return Err(FetchError::NoAccessiblePage);
    };

    let mut messages = Vec::new();
    for msg in &remote {
        let from = match msg.from_id.as_deref() {
            Some(from_id) => {
                let identity = identity::resolve(graph, &page.access_token, from_id, None).await;
                if identity.name == "Unknown User" {
                    // keep whatever raw name came with the message
                    SenderView {
                        id: Some(from_id.to_string()),
                        name: msg
                            .from_name
                            .clone()
                            .filter(|n| !n.is_empty())
                            .unwrap_or_else(|| "Unknown".to_string()),
                        first_name: None,
                        last_name: None,
                        profile_pic: identity.profile_pic,
                    }
                } else {
                    SenderView {
                        id: Some(from_id.to_string()),
                        name: identity.display_name(),
                        first_name: Some(identity.first_name),
                        last_name: Some(identity.last_name),
                        profile_pic: identity.profile_pic,
                    }
                }
            }
            None => SenderView {
                id: None,
                name: msg
                    .from_name
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                first_name: None,
                last_name: None,
                profile_pic: None,
            },
        };

        messages.push(MessageView {
            id: msg.id.clone(),
            message: msg
                .message
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "[Attachment]".to_string()),
            from,
            created_time: msg.created_time.clone(),
            attachments: msg.attachments.clone(),
            is_from_page: msg.from_id.as_deref() == Some(page.page_id.as_str()),
        });
    }

    // Upstream returns newest first; flip for chronological display.
    messages.reverse();
    Ok(messages)
}
