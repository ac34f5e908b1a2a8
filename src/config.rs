use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub graph: GraphConfig,
    pub webhook: WebhookConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

/// Agent API tokens, keyed to the account that owns them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    pub tokens: HashMap<String, String>,
}

impl AuthConfig {
    pub fn account_for_token(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.page-bridge/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub verify_token: Option<String>,
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_secret: None,
            verify_token: None,
            base_url: "https://graph.facebook.com/v18.0".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            path: "/api/webhook".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub conversation_window_hours: i64,
    pub conversation_fetch_limit: i64,
    pub message_fetch_limit: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversation_window_hours: 24,
            conversation_fetch_limit: 20,
            message_fetch_limit: 50,
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("PAGE_BRIDGE_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.page-bridge/page-bridge.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment
    if let Ok(url) = env::var("PAGE_BRIDGE_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("PAGE_BRIDGE_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(app_id) = env::var("PAGE_BRIDGE_APP_ID") {
        if !app_id.trim().is_empty() {
            cfg.graph.app_id = Some(app_id);
        }
    }

    if let Ok(secret) = env::var("PAGE_BRIDGE_APP_SECRET") {
        if !secret.trim().is_empty() {
            cfg.graph.app_secret = Some(secret);
        }
    }

    if let Ok(token) = env::var("PAGE_BRIDGE_VERIFY_TOKEN") {
        if !token.trim().is_empty() {
            cfg.graph.verify_token = Some(token);
        }
    }

    if let Ok(url) = env::var("PAGE_BRIDGE_GRAPH_BASE_URL") {
        if !url.trim().is_empty() {
            cfg.graph.base_url = url;
        }
    }

    // Single-operator shorthand: one token bound to the "default" account.
    if let Ok(token) = env::var("PAGE_BRIDGE_API_TOKEN") {
        if !token.trim().is_empty() {
            cfg.auth.tokens.insert(token, "default".to_string());
        }
    }

    cfg
}

pub fn ensure_config_dir() {
    let path = resolve_config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}", path.to_string_lossy())
}
