/// Schema for the durable key-value store.
pub const SCHEMA: &str = r#"
-- Whole-value key/value records (cache entries, ledgers, outbox queues)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_kv_store_stored_at ON kv_store(stored_at);
"#;
