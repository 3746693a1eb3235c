//! `SQLite` schema for the dead-letter store.

/// Discarded records. `payload` holds ciphertext only.
pub const CREATE_DEAD_LETTERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    retries INTEGER NOT NULL,
    event_count INTEGER NOT NULL,
    payload TEXT NOT NULL,
    reason TEXT NOT NULL,
    discarded_at TEXT NOT NULL
)
";

/// Index for age-ordered listing and pruning.
pub const CREATE_DISCARDED_AT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_dead_letters_discarded_at ON dead_letters(discarded_at DESC)
";

/// Index for per-priority listing.
pub const CREATE_PRIORITY_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_dead_letters_priority ON dead_letters(priority)
";

/// Key-value metadata, including the schema version.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_DEAD_LETTERS_TABLE,
    CREATE_DISCARDED_AT_INDEX,
    CREATE_PRIORITY_INDEX,
    CREATE_METADATA_TABLE,
];
