//! Catalog schema.

/// Schema DDL, applied by `migrate()`. Statements are idempotent.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS librarians (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    auth_token TEXT NOT NULL,
    transfers_enabled INTEGER NOT NULL DEFAULT 1,
    network_transport INTEGER NOT NULL DEFAULT 1,
    sneakernet_transport INTEGER NOT NULL DEFAULT 0,
    disabled_since TEXT,
    last_seen_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    backend_kind TEXT NOT NULL,
    root TEXT NOT NULL,
    capacity_bytes INTEGER NOT NULL,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    ingestable INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY,
    julian_date REAL NOT NULL,
    polarization TEXT NOT NULL,
    length_seconds REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    name TEXT PRIMARY KEY,
    source_librarian TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    uploaded_at TEXT NOT NULL,
    observation_id INTEGER REFERENCES observations(id)
);

CREATE INDEX IF NOT EXISTS idx_files_uploaded_at ON files(uploaded_at, name);

CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL REFERENCES files(name),
    store_id INTEGER NOT NULL REFERENCES stores(id),
    path TEXT NOT NULL,
    deletion_policy TEXT NOT NULL,
    created_at TEXT NOT NULL,
    available INTEGER NOT NULL DEFAULT 1,
    calculated_checksum TEXT,
    calculated_size INTEGER,
    checksum_time TEXT,
    UNIQUE (store_id, path)
);

CREATE INDEX IF NOT EXISTS idx_instances_file ON instances(file_name);
CREATE INDEX IF NOT EXISTS idx_instances_store_created ON instances(store_id, created_at);

CREATE TABLE IF NOT EXISTS remote_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL,
    librarian_id INTEGER NOT NULL REFERENCES librarians(id),
    copy_time TEXT NOT NULL,
    last_verified_at TEXT,
    verified_checksum TEXT,
    sender TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_remote_instances_file ON remote_instances(file_name, librarian_id);

CREATE TABLE IF NOT EXISTS outgoing_transfers (
    id BLOB PRIMARY KEY,
    file_name TEXT NOT NULL,
    destination_id INTEGER NOT NULL REFERENCES librarians(id),
    source_store_id INTEGER REFERENCES stores(id),
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    remote_transfer_id BLOB,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    transport TEXT NOT NULL,
    bytes_transferred INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outgoing_status ON outgoing_transfers(status, created_at);
CREATE INDEX IF NOT EXISTS idx_outgoing_file_dest ON outgoing_transfers(file_name, destination_id);

CREATE TABLE IF NOT EXISTS incoming_transfers (
    id BLOB PRIMARY KEY,
    file_name TEXT NOT NULL,
    source_librarian_id INTEGER NOT NULL REFERENCES librarians(id),
    store_id INTEGER REFERENCES stores(id),
    staging_path TEXT,
    declared_size INTEGER NOT NULL,
    declared_checksum TEXT NOT NULL,
    observation_id INTEGER,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    source_transfer_id BLOB NOT NULL,
    UNIQUE (source_librarian_id, source_transfer_id)
);

CREATE INDEX IF NOT EXISTS idx_incoming_status ON incoming_transfers(status, created_at);

CREATE TABLE IF NOT EXISTS send_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    outgoing_transfer_id BLOB NOT NULL REFERENCES outgoing_transfers(id),
    priority INTEGER NOT NULL DEFAULT 0,
    enqueued_at TEXT NOT NULL,
    claimed_by BLOB,
    claim_deadline TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_send_queue_status ON send_queue(status, priority, enqueued_at);

CREATE TABLE IF NOT EXISTS corrupt_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL,
    file_source TEXT NOT NULL,
    instance_id INTEGER NOT NULL,
    detected_at TEXT NOT NULL,
    detector TEXT NOT NULL,
    corrupt_count INTEGER NOT NULL DEFAULT 1,
    replacement_requested INTEGER NOT NULL DEFAULT 0,
    repair_transfer_id BLOB,
    UNIQUE (instance_id)
);
"#;
