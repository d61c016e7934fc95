//! Static schema. Per-collection cache tables are created on first write, see
//! `store::sqlite`.

pub const SCHEMA: &str = r#"
-- Installation identity and other engine metadata
CREATE TABLE IF NOT EXISTS app_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Pending mutations; id order is replay order
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    key TEXT,
    data TEXT,
    timestamp TEXT NOT NULL,
    method TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    payload TEXT,
    id_field TEXT,
    pending_identity INTEGER NOT NULL DEFAULT 0,
    depends_on INTEGER,
    state TEXT NOT NULL DEFAULT 'pending',
    error_class TEXT,
    last_error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_transactions_state ON transactions(state, id);

-- Server identities learned when a queued create replays
CREATE TABLE IF NOT EXISTS identity_map (
    collection TEXT NOT NULL,
    client_key TEXT NOT NULL,
    server_id TEXT NOT NULL,
    PRIMARY KEY (collection, client_key)
);
"#;

/// Prefix of every per-collection cache table.
pub const CACHE_TABLE_PREFIX: &str = "cache_";
