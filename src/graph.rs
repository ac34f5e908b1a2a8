use crate::config::GraphConfig;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const SUBSCRIBED_FIELDS: &str =
    "messages,messaging_postbacks,messaging_optins,message_deliveries,message_reads";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("access token expired")]
    TokenExpired,
    #[error("insufficient permission")]
    PermissionDenied,
    #[error("invalid or unknown remote id")]
    InvalidTarget,
    #[error("graph api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("unexpected graph response: {0}")]
    Shape(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

pub fn classify_error(code: i64, message: &str) -> GraphError {
    match code {
        190 => GraphError::TokenExpired,
        200 => GraphError::PermissionDenied,
        100 => GraphError::InvalidTarget,
        _ => GraphError::Api {
            code,
            message: message.to_string(),
        },
    }
}

pub fn error_from_body(value: &Value) -> Option<GraphError> {
    let err = value.get("error")?;
    let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown error");
    Some(classify_error(code, message))
}

#[derive(Debug, Clone)]
pub struct PageAccount {
    pub id: String,
    pub name: String,
    pub access_token: String,
    pub category: Option<String>,
    pub picture_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PageInfo {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    pub about: Option<String>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub picture_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteConversation {
    pub id: String,
    pub updated_time: Option<String>,
    pub participants: Vec<RemoteParticipant>,
    pub unread_count: i64,
    pub can_reply: Option<bool>,
    pub message_count: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub id: String,
    pub message: Option<String>,
    pub from_id: Option<String>,
    pub from_name: Option<String>,
    pub created_time: Option<String>,
    pub attachments: Option<Value>,
}

fn picture_url(value: &Value) -> Option<String> {
    value
        .get("picture")
        .and_then(|p| p.get("data"))
        .and_then(|d| d.get("url"))
        .and_then(|u| u.as_str())
        .map(|s| s.to_string())
}

pub fn parse_participants(value: &Value) -> Vec<RemoteParticipant> {
    value
        .get("participants")
        .and_then(|p| p.get("data"))
        .and_then(|d| d.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|p| {
                    let id = p.get("id").and_then(|v| v.as_str())?.to_string();
                    Some(RemoteParticipant {
                        id,
                        name: p.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(cfg: &GraphConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, GraphError> {
        let resp = self.http.get(self.url(path)).query(query).send().await?;
        decode(resp).await
    }

    async fn post_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> Result<Value, GraphError> {
        let resp = self
            .http
            .post(self.url(path))
            .query(query)
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn exchange_token(
        &self,
        app_id: &str,
        app_secret: &str,
        short_lived: &str,
    ) -> Result<String, GraphError> {
        let value = self
            .get_json(
                "/oauth/access_token",
                &[
                    ("grant_type", "fb_exchange_token"),
                    ("client_id", app_id),
                    ("client_secret", app_secret),
                    ("fb_exchange_token", short_lived),
                ],
            )
            .await?;
        value
            .get("access_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| GraphError::Shape("missing access_token".to_string()))
    }

    /// Pages the user can manage; entries without the MANAGE task are
    /// filtered out.
    pub async fn list_accounts(&self, user_token: &str) -> Result<Vec<PageAccount>, GraphError> {
        let value = self
            .get_json(
                "/me/accounts",
                &[
                    ("access_token", user_token),
                    (
                        "fields",
                        "id,name,access_token,category,about,website,phone,emails,picture{url},tasks",
                    ),
                ],
            )
            .await?;
        let items = value
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| GraphError::Shape("missing data array".to_string()))?;

        let mut pages = Vec::new();
        for item in items {
            let manages = item
                .get("tasks")
                .and_then(|t| t.as_array())
                .map(|tasks| tasks.iter().any(|t| t.as_str() == Some("MANAGE")))
                .unwrap_or(false);
            if !manages {
                continue;
            }
            let (Some(id), Some(name), Some(access_token)) = (
                item.get("id").and_then(|v| v.as_str()),
                item.get("name").and_then(|v| v.as_str()),
                item.get("access_token").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            pages.push(PageAccount {
                id: id.to_string(),
                name: name.to_string(),
                access_token: access_token.to_string(),
                category: item
                    .get("category")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                picture_url: picture_url(item),
            });
        }
        Ok(pages)
    }

    pub async fn get_page_info(
        &self,
        page_id: &str,
        page_token: &str,
    ) -> Result<PageInfo, GraphError> {
        let value = self
            .get_json(
                &format!("/{page_id}"),
                &[
                    ("access_token", page_token),
                    (
                        "fields",
                        "id,name,category,about,website,phone,emails,picture{url},fan_count,is_verified",
                    ),
                ],
            )
            .await?;
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GraphError::Shape("missing page id".to_string()))?
            .to_string();
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(PageInfo {
            id,
            name,
            category: value
                .get("category")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            about: value
                .get("about")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            website: value
                .get("website")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            phone: value
                .get("phone")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            email: value
                .get("emails")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            picture_url: picture_url(&value),
        })
    }

    pub async fn subscribe_webhook(
        &self,
        page_id: &str,
        page_token: &str,
    ) -> Result<bool, GraphError> {
        let value = self
            .post_json(
                &format!("/{page_id}/subscribed_apps"),
                &[("access_token", page_token)],
                &serde_json::json!({ "subscribed_fields": SUBSCRIBED_FIELDS }),
            )
            .await?;
        Ok(value.get("success").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn list_conversations(
        &self,
        page_id: &str,
        page_token: &str,
        limit: i64,
    ) -> Result<Vec<RemoteConversation>, GraphError> {
        let limit = limit.to_string();
        let value = self
            .get_json(
                &format!("/{page_id}/conversations"),
                &[
                    ("access_token", page_token),
                    (
                        "fields",
                        "id,updated_time,participants,can_reply,is_subscribed,message_count,unread_count",
                    ),
                    ("limit", &limit),
                ],
            )
            .await?;
        let items = value
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| GraphError::Shape("missing data array".to_string()))?;

        Ok(items
            .iter()
            .filter_map(|conv| {
                let id = conv.get("id").and_then(|v| v.as_str())?.to_string();
                Some(RemoteConversation {
                    id,
                    updated_time: conv
                        .get("updated_time")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    participants: parse_participants(conv),
                    unread_count: conv.get("unread_count").and_then(|v| v.as_i64()).unwrap_or(0),
                    can_reply: conv.get("can_reply").and_then(|v| v.as_bool()),
                    message_count: conv.get("message_count").and_then(|v| v.as_i64()),
                })
            })
            .collect())
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
        page_token: &str,
        limit: i64,
    ) -> Result<Vec<RemoteMessage>, GraphError> {
        let limit = limit.to_string();
        let value = self
            .get_json(
                &format!("/{conversation_id}/messages"),
                &[
                    ("access_token", page_token),
                    ("fields", "id,message,from,created_time,attachments"),
                    ("limit", &limit),
                ],
            )
            .await?;
        let items = value
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| GraphError::Shape("missing data array".to_string()))?;

        Ok(items
            .iter()
            .filter_map(|msg| {
                let id = msg.get("id").and_then(|v| v.as_str())?.to_string();
                Some(RemoteMessage {
                    id,
                    message: msg
                        .get("message")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    from_id: msg
                        .get("from")
                        .and_then(|f| f.get("id"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    from_name: msg
                        .get("from")
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    created_time: msg
                        .get("created_time")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    attachments: msg.get("attachments").cloned(),
                })
            })
            .collect())
    }

    pub async fn get_conversation_participants(
        &self,
        conversation_id: &str,
        page_token: &str,
    ) -> Result<Vec<RemoteParticipant>, GraphError> {
        let value = self
            .get_json(
                &format!("/{conversation_id}"),
                &[("access_token", page_token), ("fields", "participants")],
            )
            .await?;
        Ok(parse_participants(&value))
    }

    pub async fn send_text(
        &self,
        page_token: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, GraphError> {
        let payload = serde_json::json!({
            "recipient": { "id": recipient_id },
            "message": { "text": text },
            "messaging_type": "RESPONSE",
        });
        let value = self
            .post_json("/me/messages", &[("access_token", page_token)], &payload)
            .await?;
        value
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| GraphError::Shape("missing message_id".to_string()))
    }

    pub async fn get_user_profile(
        &self,
        user_id: &str,
        page_token: &str,
        fields: &str,
    ) -> Result<Value, GraphError> {
        self.get_json(
            &format!("/{user_id}"),
            &[("access_token", page_token), ("fields", fields)],
        )
        .await
    }

    /// Profile pictures are frequently retrievable even when every other
    /// profile field is permission-denied.
    pub async fn get_profile_picture(
        &self,
        user_id: &str,
        page_token: &str,
    ) -> Result<Option<String>, GraphError> {
        let value = self
            .get_json(
                &format!("/{user_id}/picture"),
                &[
                    ("access_token", page_token),
                    ("redirect", "false"),
                    ("height", "200"),
                    ("width", "200"),
                ],
            )
            .await?;
        Ok(value
            .get("data")
            .and_then(|d| d.get("url"))
            .or_else(|| value.get("url"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }
}

async fn decode(resp: reqwest::Response) -> Result<Value, GraphError> {
    let status = resp.status();
    let value: Value = resp.json().await?;
    if let Some(err) = error_from_body(&value) {
        return Err(err);
    }
    if !status.is_success() {
        return Err(GraphError::Api {
            code: status.as_u16() as i64,
            message: value.to_string(),
        });
    }
    Ok(value)
}
