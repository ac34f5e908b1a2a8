use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_id: String,
    pub account_id: String,
    pub page_name: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub profile_picture: Option<String>,
    pub category: Option<String>,
    pub about: Option<String>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub webhook_verified: bool,
    pub is_active: bool,
    #[serde(skip)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub page_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_avatar: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub last_message_text: Option<String>,
    pub unread_count: i64,
    pub status: String,
    pub assigned_agent: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub notes: Option<String>,
    pub is_active: bool,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: Option<String>,
    pub attachments: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub is_from_page: bool,
    pub message_type: String,
    pub status: String,
    pub mid: Option<String>,
    pub seq: Option<i64>,
    pub watermark: Option<i64>,
    pub read_flag: bool,
    pub reply_to: Option<String>,
    pub agent_id: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now))
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn bool_to_i64(v: bool) -> i64 {
    if v {
        1
    } else {
        0
    }
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS pages (
            page_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            page_name TEXT NOT NULL,
            access_token TEXT NOT NULL,
            profile_picture TEXT,
            category TEXT,
            about TEXT,
            website TEXT,
            phone TEXT,
            email TEXT,
            webhook_verified INTEGER NOT NULL,
            is_active INTEGER NOT NULL,
            last_sync_at INTEGER,
            disconnected_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_pages_account ON pages(account_id, is_active)"#,
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            page_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            customer_name TEXT NOT NULL,
            customer_avatar TEXT,
            last_message_at INTEGER NOT NULL,
            last_message_text TEXT,
            unread_count INTEGER NOT NULL,
            status TEXT NOT NULL,
            assigned_agent TEXT,
            tags TEXT,
            notes TEXT,
            is_active INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_conversations_page ON conversations(page_id, last_message_at)"#,
        r#"CREATE TABLE IF NOT EXISTS conversation_heads (
            page_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            last_message_at INTEGER NOT NULL,
            PRIMARY KEY (page_id, customer_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            message_id TEXT NOT NULL UNIQUE,
            sender_id TEXT NOT NULL,
            sender_name TEXT,
            text TEXT,
            attachments TEXT,
            timestamp INTEGER NOT NULL,
            is_from_page INTEGER NOT NULL,
            message_type TEXT NOT NULL,
            status TEXT NOT NULL,
            mid TEXT,
            seq INTEGER,
            watermark INTEGER,
            read_flag INTEGER NOT NULL,
            reply_to TEXT,
            agent_id TEXT,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_mid ON messages(conversation_id, mid)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

fn page_from_row(row: &AnyRow) -> Result<PageRecord> {
    let last_sync_at: Option<i64> = row.try_get("last_sync_at")?;
    let disconnected_at: Option<i64> = row.try_get("disconnected_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(PageRecord {
        page_id: row.try_get("page_id")?,
        account_id: row.try_get("account_id")?,
        page_name: row.try_get("page_name")?,
        access_token: row.try_get("access_token")?,
        profile_picture: row.try_get("profile_picture")?,
        category: row.try_get("category")?,
        about: row.try_get("about")?,
        website: row.try_get("website")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        webhook_verified: row.try_get::<i64, _>("webhook_verified")? != 0,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        last_sync_at: last_sync_at.map(i64_to_datetime),
        disconnected_at: disconnected_at.map(i64_to_datetime),
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn conversation_from_row(row: &AnyRow) -> Result<ConversationRecord> {
    let tags: Option<String> = row.try_get("tags")?;
    let last_message_at: i64 = row.try_get("last_message_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(ConversationRecord {
        id: row.try_get("id")?,
        page_id: row.try_get("page_id")?,
        customer_id: row.try_get("customer_id")?,
        customer_name: row.try_get("customer_name")?,
        customer_avatar: row.try_get("customer_avatar")?,
        last_message_at: i64_to_datetime(last_message_at),
        last_message_text: row.try_get("last_message_text")?,
        unread_count: row.try_get("unread_count")?,
        status: row.try_get("status")?,
        assigned_agent: row.try_get("assigned_agent")?,
        tags: tags.and_then(|v| serde_json::from_str(&v).ok()),
        notes: row.try_get("notes")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn message_from_row(row: &AnyRow) -> Result<MessageRecord> {
    let attachments: Option<String> = row.try_get("attachments")?;
    let timestamp: i64 = row.try_get("timestamp")?;
    let created_at: i64 = row.try_get("created_at")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        message_id: row.try_get("message_id")?,
        sender_id: row.try_get("sender_id")?,
        sender_name: row.try_get("sender_name")?,
        text: row.try_get("text")?,
        attachments: attachments.and_then(|v| serde_json::from_str(&v).ok()),
        timestamp: i64_to_datetime(timestamp),
        is_from_page: row.try_get::<i64, _>("is_from_page")? != 0,
        message_type: row.try_get("message_type")?,
        status: row.try_get("status")?,
        mid: row.try_get("mid")?,
        seq: row.try_get("seq")?,
        watermark: row.try_get("watermark")?,
        read_flag: row.try_get::<i64, _>("read_flag")? != 0,
        reply_to: row.try_get("reply_to")?,
        agent_id: row.try_get("agent_id")?,
        created_at: i64_to_datetime(created_at),
    })
}

const PAGE_COLUMNS: &str = "page_id, account_id, page_name, access_token, profile_picture, category, about, website, phone, email, webhook_verified, is_active, last_sync_at, disconnected_at, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, page_id, customer_id, customer_name, customer_avatar, last_message_at, last_message_text, unread_count, status, assigned_agent, tags, notes, is_active, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, message_id, sender_id, sender_name, text, attachments, timestamp, is_from_page, message_type, status, mid, seq, watermark, read_flag, reply_to, agent_id, created_at";

pub async fn upsert_page(pool: &AnyPool, kind: DbKind, record: &PageRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO pages (
            page_id, account_id, page_name, access_token, profile_picture, category, about, website, phone, email,
            webhook_verified, is_active, last_sync_at, disconnected_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(page_id) DO UPDATE SET
            account_id=excluded.account_id,
            page_name=excluded.page_name,
            access_token=excluded.access_token,
            profile_picture=excluded.profile_picture,
            category=excluded.category,
            about=excluded.about,
            website=excluded.website,
            phone=excluded.phone,
            email=excluded.email,
            webhook_verified=excluded.webhook_verified,
            is_active=excluded.is_active,
            last_sync_at=excluded.last_sync_at,
            disconnected_at=excluded.disconnected_at,
            updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.page_id)
        .bind(&record.account_id)
        .bind(&record.page_name)
        .bind(&record.access_token)
        .bind(record.profile_picture.as_deref())
        .bind(record.category.as_deref())
        .bind(record.about.as_deref())
        .bind(record.website.as_deref())
        .bind(record.phone.as_deref())
        .bind(record.email.as_deref())
        .bind(bool_to_i64(record.webhook_verified))
        .bind(bool_to_i64(record.is_active))
        .bind(record.last_sync_at.map(datetime_to_i64))
        .bind(record.disconnected_at.map(datetime_to_i64))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_page(pool: &AnyPool, kind: DbKind, page_id: &str) -> Result<Option<PageRecord>> {
    let base_sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE page_id = ?");
    let sql = rewrite_sql(&base_sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(page_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(page_from_row).transpose()
}

pub async fn find_active_page(
    pool: &AnyPool,
    kind: DbKind,
    page_id: &str,
) -> Result<Option<PageRecord>> {
    let base_sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE page_id = ? AND is_active = 1");
    let sql = rewrite_sql(&base_sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(page_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(page_from_row).transpose()
}

pub async fn list_active_pages(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
) -> Result<Vec<PageRecord>> {
    let base_sql = format!(
        "SELECT {PAGE_COLUMNS} FROM pages WHERE account_id = ? AND is_active = 1 ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&base_sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(account_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(page_from_row).collect()
}

pub async fn deactivate_page(
    pool: &AnyPool,
    kind: DbKind,
    page_id: &str,
    account_id: &str,
    when: DateTime<Utc>,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE pages SET is_active = 0, disconnected_at = ?, updated_at = ?
           WHERE page_id = ? AND account_id = ? AND is_active = 1"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(when))
        .bind(datetime_to_i64(when))
        .bind(page_id)
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_page_sync(
    pool: &AnyPool,
    kind: DbKind,
    page_id: &str,
    when: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE pages SET last_sync_at = ?, updated_at = ? WHERE page_id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(when))
        .bind(datetime_to_i64(when))
        .bind(page_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn current_conversation(
    pool: &AnyPool,
    kind: DbKind,
    page_id: &str,
    customer_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<Option<ConversationRecord>> {
    let sql = rewrite_sql(
        r#"SELECT c.id, c.page_id, c.customer_id, c.customer_name, c.customer_avatar, c.last_message_at,
                  c.last_message_text, c.unread_count, c.status, c.assigned_agent, c.tags, c.notes,
                  c.is_active, c.created_at, c.updated_at
           FROM conversation_heads h
           JOIN conversations c ON c.id = h.conversation_id
           WHERE h.page_id = ? AND h.customer_id = ? AND h.last_message_at >= ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(page_id)
        .bind(customer_id)
        .bind(datetime_to_i64(cutoff))
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(conversation_from_row).transpose()
}

async fn insert_conversation(
    pool: &AnyPool,
    kind: DbKind,
    record: &ConversationRecord,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversations (
            id, page_id, customer_id, customer_name, customer_avatar, last_message_at, last_message_text,
            unread_count, status, assigned_agent, tags, notes, is_active, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.page_id)
        .bind(&record.customer_id)
        .bind(&record.customer_name)
        .bind(record.customer_avatar.as_deref())
        .bind(datetime_to_i64(record.last_message_at))
        .bind(record.last_message_text.as_deref())
        .bind(record.unread_count)
        .bind(&record.status)
        .bind(record.assigned_agent.as_deref())
        .bind(record.tags.as_ref().map(|v| v.to_string()))
        .bind(record.notes.as_deref())
        .bind(bool_to_i64(record.is_active))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

async fn refresh_customer_identity(
    pool: &AnyPool,
    kind: DbKind,
    mut conversation: ConversationRecord,
    customer_name: &str,
    customer_avatar: Option<&str>,
) -> Result<ConversationRecord> {
    let name_changed = !customer_name.is_empty() && conversation.customer_name != customer_name;
    let avatar_changed = match customer_avatar {
        Some(url) if !url.is_empty() => conversation.customer_avatar.as_deref() != Some(url),
        _ => false,
    };
    if !name_changed && !avatar_changed {
        return Ok(conversation);
    }

    if name_changed {
        conversation.customer_name = customer_name.to_string();
    }
    if avatar_changed {
        conversation.customer_avatar = customer_avatar.map(|s| s.to_string());
    }
    conversation.updated_at = Utc::now();

    let sql = rewrite_sql(
        "UPDATE conversations SET customer_name = ?, customer_avatar = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&conversation.customer_name)
        .bind(conversation.customer_avatar.as_deref())
        .bind(datetime_to_i64(conversation.updated_at))
        .bind(&conversation.id)
        .execute(pool)
        .await?;
    Ok(conversation)
}

/// Finds the conversation for (page, customer) inside the rolling session
/// window, or creates one. Creation races are settled through the
/// conversation_heads row: the candidate is inserted first, the head is
/// advanced only when absent or stale, and the loser withdraws its
/// candidate and adopts the winner.
pub async fn find_or_create_conversation(
    pool: &AnyPool,
    kind: DbKind,
    page_id: &str,
    customer_id: &str,
    customer_name: &str,
    customer_avatar: Option<&str>,
    window_hours: i64,
) -> Result<ConversationRecord> {
    let now = Utc::now();
    let cutoff = now - Duration::hours(window_hours);

    if let Some(existing) = current_conversation(pool, kind, page_id, customer_id, cutoff).await? {
        return refresh_customer_identity(pool, kind, existing, customer_name, customer_avatar)
            .await;
    }

    let candidate = ConversationRecord {
        id: Uuid::new_v4().to_string(),
        page_id: page_id.to_string(),
        customer_id: customer_id.to_string(),
        customer_name: if customer_name.is_empty() {
            "Unknown User".to_string()
        } else {
            customer_name.to_string()
        },
        customer_avatar: customer_avatar
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        last_message_at: now,
        last_message_text: None,
        unread_count: 0,
        status: "open".to_string(),
        assigned_agent: None,
        tags: None,
        notes: None,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    insert_conversation(pool, kind, &candidate).await?;

    let head_sql = rewrite_sql(
        r#"INSERT INTO conversation_heads (page_id, customer_id, conversation_id, last_message_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(page_id, customer_id) DO UPDATE SET
               conversation_id=excluded.conversation_id,
               last_message_at=excluded.last_message_at
           WHERE conversation_heads.last_message_at < ?"#,
        kind,
    );
    sqlx::query(head_sql.as_ref())
        .bind(page_id)
        .bind(customer_id)
        .bind(&candidate.id)
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(cutoff))
        .execute(pool)
        .await?;

    let winner_sql = rewrite_sql(
        "SELECT conversation_id FROM conversation_heads WHERE page_id = ? AND customer_id = ?",
        kind,
    );
    let winner_id: Option<String> = sqlx::query_scalar(winner_sql.as_ref())
        .bind(page_id)
        .bind(customer_id)
        .fetch_optional(pool)
        .await?;

    match winner_id {
        Some(id) if id == candidate.id => Ok(candidate),
        Some(id) => {
            let delete_sql = rewrite_sql("DELETE FROM conversations WHERE id = ?", kind);
            sqlx::query(delete_sql.as_ref())
                .bind(&candidate.id)
                .execute(pool)
                .await?;
            let winner = get_conversation(pool, kind, &id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("conversation head points at missing row"))?;
            refresh_customer_identity(pool, kind, winner, customer_name, customer_avatar).await
        }
        None => Ok(candidate),
    }
}

pub async fn get_conversation(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<ConversationRecord>> {
    let base_sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?");
    let sql = rewrite_sql(&base_sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(conversation_from_row).transpose()
}

pub async fn list_conversations(
    pool: &AnyPool,
    kind: DbKind,
    page_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<ConversationRecord>> {
    let base_sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE page_id = ? ORDER BY last_message_at DESC LIMIT ? OFFSET ?"
    );
    let sql = rewrite_sql(&base_sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(page_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(conversation_from_row).collect()
}

pub async fn record_activity(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    preview: &str,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE conversations SET last_message_at = ?, last_message_text = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(timestamp))
        .bind(preview)
        .bind(datetime_to_i64(Utc::now()))
        .bind(conversation_id)
        .execute(pool)
        .await?;

    let head_sql = rewrite_sql(
        "UPDATE conversation_heads SET last_message_at = ? WHERE conversation_id = ?",
        kind,
    );
    sqlx::query(head_sql.as_ref())
        .bind(datetime_to_i64(timestamp))
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn increment_unread(pool: &AnyPool, kind: DbKind, conversation_id: &str) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE conversations SET unread_count = unread_count + 1, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_conversation_read(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE conversations SET unread_count = 0, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Idempotent by external message id: a redelivered event returns the
/// stored row untouched.
pub async fn upsert_incoming(
    pool: &AnyPool,
    kind: DbKind,
    record: &MessageRecord,
) -> Result<MessageRecord> {
    let sql = rewrite_sql(
        r#"INSERT INTO messages (
            id, conversation_id, message_id, sender_id, sender_name, text, attachments, timestamp,
            is_from_page, message_type, status, mid, seq, watermark, read_flag, reply_to, agent_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(message_id) DO NOTHING"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(&record.message_id)
        .bind(&record.sender_id)
        .bind(record.sender_name.as_deref())
        .bind(record.text.as_deref())
        .bind(record.attachments.as_ref().map(|v| v.to_string()))
        .bind(datetime_to_i64(record.timestamp))
        .bind(bool_to_i64(record.is_from_page))
        .bind(&record.message_type)
        .bind(&record.status)
        .bind(record.mid.as_deref())
        .bind(record.seq)
        .bind(record.watermark)
        .bind(bool_to_i64(record.read_flag))
        .bind(record.reply_to.as_deref())
        .bind(record.agent_id.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;

    find_message_by_external_id(pool, kind, &record.message_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("message vanished after upsert"))
}

pub async fn find_message_by_external_id(
    pool: &AnyPool,
    kind: DbKind,
    message_id: &str,
) -> Result<Option<MessageRecord>> {
    let base_sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?");
    let sql = rewrite_sql(&base_sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

/// Forward-only: only messages still in 'sent' move to 'delivered', so a
/// receipt replay or a late delivery after a read is a no-op.
pub async fn apply_delivery_receipt(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    mids: &[String],
    watermark: Option<i64>,
) -> Result<u64> {
    if mids.is_empty() {
        return Ok(0);
    }
    let placeholders = mids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let base_sql = format!(
        "UPDATE messages SET status = 'delivered', watermark = ? WHERE conversation_id = ? AND status = 'sent' AND mid IN ({})",
        placeholders
    );
    let sql = rewrite_sql(&base_sql, kind);
    let mut query = sqlx::query(sql.as_ref()).bind(watermark).bind(conversation_id);
    for mid in mids {
        query = query.bind(mid);
    }
    let result = query.execute(pool).await?;
    Ok(result.rows_affected())
}

/// Everything at or before the watermark moves to 'read'; replays and
/// out-of-order delivery receipts cannot regress it.
pub async fn apply_read_receipt(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status = 'read', read_flag = 1
           WHERE conversation_id = ? AND timestamp <= ? AND status IN ('sent', 'delivered')"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(datetime_to_i64(cutoff))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn list_messages(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRecord>> {
    let base_sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY timestamp DESC LIMIT ? OFFSET ?"
    );
    let sql = rewrite_sql(&base_sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(message_from_row).collect()
}
