use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial messaging schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                handle        TEXT NOT NULL UNIQUE,
                display_name  TEXT,
                avatar_ref    TEXT,
                role          TEXT NOT NULL DEFAULT 'user'
                              CHECK (role IN ('user', 'admin', 'moderator')),
                password      TEXT NOT NULL,
                is_online     INTEGER NOT NULL DEFAULT 0,
                last_seen     TEXT,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE conversations (
                id          TEXT PRIMARY KEY,
                is_group    INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_conversations_recency
                ON conversations(updated_at DESC, id DESC);

            CREATE TABLE conversation_participants (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                user_id          TEXT NOT NULL REFERENCES users(id),
                joined_at        TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id);

            -- At most one direct conversation per unordered user pair.
            -- user_low < user_high always.
            CREATE TABLE direct_pairs (
                user_low         TEXT NOT NULL,
                user_high        TEXT NOT NULL,
                conversation_id  TEXT NOT NULL UNIQUE
                                 REFERENCES conversations(id) DEFERRABLE INITIALLY DEFERRED,
                PRIMARY KEY (user_low, user_high),
                CHECK (user_low < user_high)
            );

            CREATE TABLE messages (
                id                 TEXT PRIMARY KEY,
                conversation_id    TEXT NOT NULL REFERENCES conversations(id),
                sender_id          TEXT NOT NULL REFERENCES users(id),
                content            TEXT NOT NULL,
                is_read            INTEGER NOT NULL DEFAULT 0,
                client_ref         TEXT,
                toxicity_score     REAL,
                toxicity_category  TEXT,
                status             TEXT CHECK (status IN ('allowed', 'warned', 'blocked')),
                rewritten_version  TEXT,
                is_flagged         INTEGER,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at, id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
