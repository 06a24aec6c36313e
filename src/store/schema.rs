//! SQL schema for the offline store.
//!
//! Every collection shares the same row shape: up to two key columns, an
//! optional secondary-index column and the serialized row as a JSON blob.
//! The `changes` journal is the exception, keyed by an auto-assigned
//! sequence number.

pub const SCHEMA: &str = r#"
-- Query descriptions, keyed by query id.
-- idx holds the id of the query's persistent-object description.
CREATE TABLE IF NOT EXISTS queries (
    key1 TEXT NOT NULL,
    key2 TEXT NOT NULL DEFAULT '',
    idx TEXT,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (key1, key2)
);

CREATE INDEX IF NOT EXISTS idx_queries ON queries(idx);

-- Flattened result rows, keyed by (owning persistent-object id, item id).
-- idx repeats the owner id so "all rows for an owner" is one index lookup.
CREATE TABLE IF NOT EXISTS query_results (
    key1 TEXT NOT NULL,
    key2 TEXT NOT NULL DEFAULT '',
    idx TEXT,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (key1, key2)
);

CREATE INDEX IF NOT EXISTS idx_query_results ON query_results(idx);

-- Entity-type name per query id and per persistent-object id.
CREATE TABLE IF NOT EXISTS action_classes_by_id (
    key1 TEXT NOT NULL,
    key2 TEXT NOT NULL DEFAULT '',
    idx TEXT,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (key1, key2)
);

-- Journal of pending local mutations.
CREATE TABLE IF NOT EXISTS changes (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    idx TEXT,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Verbatim response bodies for well-known requests.
CREATE TABLE IF NOT EXISTS requests (
    key1 TEXT NOT NULL,
    key2 TEXT NOT NULL DEFAULT '',
    idx TEXT,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (key1, key2)
);
"#;
