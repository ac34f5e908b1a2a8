use crate::graph::GraphClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub name: String,
    pub profile_pic: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<f64>,
    pub gender: Option<String>,
}

impl ResolvedIdentity {
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
                .trim()
                .to_string()
        }
    }
}

pub fn split_name(full: &str) -> (String, String) {
    let mut parts = full.split_whitespace();
    let first = parts.next().unwrap_or("Unknown").to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    let last = if rest.is_empty() {
        "User".to_string()
    } else {
        rest
    };
    (first, last)
}

pub fn placeholder(customer_id: &str) -> ResolvedIdentity {
    ResolvedIdentity {
        id: customer_id.to_string(),
        first_name: "Unknown".to_string(),
        last_name: "User".to_string(),
        name: "Unknown User".to_string(),
        profile_pic: None,
        locale: None,
        timezone: None,
        gender: None,
    }
}

pub fn identity_from_name(customer_id: &str, full_name: &str) -> ResolvedIdentity {
    let (first, last) = split_name(full_name);
    ResolvedIdentity {
        id: customer_id.to_string(),
        first_name: first,
        last_name: last,
        name: full_name.to_string(),
        profile_pic: None,
        locale: None,
        timezone: None,
        gender: None,
    }
}

fn identity_from_profile(customer_id: &str, profile: &Value) -> Option<ResolvedIdentity> {
    let full_name = profile.get("name").and_then(|v| v.as_str())?;
    if full_name.is_empty() {
        return None;
    }
    let (split_first, split_last) = split_name(full_name);
    Some(ResolvedIdentity {
        id: profile
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(customer_id)
            .to_string(),
        first_name: profile
            .get("first_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or(split_first),
        last_name: profile
            .get("last_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or(split_last),
        name: full_name.to_string(),
        profile_pic: None,
        locale: profile
            .get("locale")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        timezone: profile.get("timezone").and_then(|v| v.as_f64()),
        gender: profile
            .get("gender")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

// Progressively narrower field sets; permission failures on the wide set
// often still allow the narrow ones.
const PROFILE_FIELD_SETS: [&str; 3] = ["name,first_name,last_name,profile_pic,id", "name,id", "name"];

/// Resolves a customer's display identity. Never fails: every lookup step
/// degrades independently and the worst case is the "Unknown User"
/// placeholder, with the profile picture merged in when it alone was
/// retrievable.
pub async fn resolve(
    graph: &GraphClient,
    page_token: &str,
    customer_id: &str,
    conversation_hint: Option<&str>,
) -> ResolvedIdentity {
    let mut identity: Option<ResolvedIdentity> = None;

    if let Some(conversation_id) = conversation_hint {
        match graph
            .get_conversation_participants(conversation_id, page_token)
            .await
        {
            Ok(participants) => {
                let hit = participants
                    .into_iter()
                    .find(|p| p.id == customer_id)
                    .and_then(|p| p.name);
                if let Some(name) = hit.filter(|n| !n.is_empty()) {
                    identity = Some(identity_from_name(customer_id, &name));
                }
            }
            Err(err) => {
                debug!("participant lookup failed for {customer_id}: {err}");
            }
        }
    }

    if identity.is_none() {
        for fields in PROFILE_FIELD_SETS {
            match graph.get_user_profile(customer_id, page_token, fields).await {
                Ok(profile) => {
                    if let Some(found) = identity_from_profile(customer_id, &profile) {
                        identity = Some(found);
                        break;
                    }
                }
                Err(err) => {
                    debug!("profile fields [{fields}] failed for {customer_id}: {err}");
                }
            }
        }
    }

    let picture = match graph.get_profile_picture(customer_id, page_token).await {
        Ok(url) => url,
        Err(err) => {
            debug!("profile picture failed for {customer_id}: {err}");
            None
        }
    };

    let mut resolved = identity.unwrap_or_else(|| placeholder(customer_id));
    if resolved.profile_pic.is_none() {
        resolved.profile_pic = picture;
    }
    resolved
}
