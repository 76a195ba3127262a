/// Schema for the key/value store.
pub const SCHEMA: &str = r#"
-- One row per key; data is serialized JSON
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    ttl_ms INTEGER,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_kv_store_expires
    ON kv_store(expires_at);
"#;
