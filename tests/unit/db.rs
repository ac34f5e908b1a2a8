use page_bridge::db::{db_kind_from_url, rewrite_sql, DbKind};

#[test]
fn test_db_kind_from_url_sqlite() {
    assert_eq!(db_kind_from_url("sqlite://state.sqlite"), DbKind::Sqlite);
    assert_eq!(db_kind_from_url("SQLite://state.sqlite"), DbKind::Sqlite);
}

#[test]
fn test_db_kind_from_url_postgres() {
    assert_eq!(
        db_kind_from_url("postgres://localhost/bridge"),
        DbKind::Postgres
    );
    assert_eq!(
        db_kind_from_url("postgresql://localhost/bridge"),
        DbKind::Postgres
    );
}

#[test]
fn test_db_kind_from_url_unknown_defaults_sqlite() {
    assert_eq!(db_kind_from_url("mysql://localhost/bridge"), DbKind::Sqlite);
}

#[test]
fn test_rewrite_sql_sqlite_passthrough() {
    let sql = "SELECT * FROM messages WHERE conversation_id = ? AND status = ?";
    let rewritten = rewrite_sql(sql, DbKind::Sqlite);
    assert_eq!(rewritten.as_ref(), sql);
}

#[test]
fn test_rewrite_sql_postgres_placeholders() {
    let sql = "SELECT * FROM messages WHERE conversation_id = ? AND status = ?";
    let rewritten = rewrite_sql(sql, DbKind::Postgres);
    assert_eq!(
        rewritten.as_ref(),
        "SELECT * FROM messages WHERE conversation_id = $1 AND status = $2"
    );
}

#[test]
fn test_rewrite_sql_postgres_in_list() {
    let sql = "UPDATE messages SET status = 'delivered' WHERE mid IN (?,?,?)";
    let rewritten = rewrite_sql(sql, DbKind::Postgres);
    assert_eq!(
        rewritten.as_ref(),
        "UPDATE messages SET status = 'delivered' WHERE mid IN ($1,$2,$3)"
    );
}

#[test]
fn test_rewrite_sql_no_placeholders() {
    let sql = "SELECT COUNT(1) FROM conversations";
    let rewritten = rewrite_sql(sql, DbKind::Postgres);
    assert_eq!(rewritten.as_ref(), sql);
}
