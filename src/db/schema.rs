/// Schema for the cache and sync tables.
pub const SCHEMA: &str = r#"
-- HTTP response cache, one row per (namespace, key)
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(namespace, stored_at);

-- Arbitrary JSON values stashed by foreground code
CREATE TABLE IF NOT EXISTS app_data (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Write operations not yet confirmed by the server
CREATE TABLE IF NOT EXISTS sync_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    op_type TEXT NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    payload BLOB,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    dead_lettered INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_operations_created
    ON sync_operations(created_at);
CREATE INDEX IF NOT EXISTS idx_sync_operations_type
    ON sync_operations(op_type);
"#;
