use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const GRAVE_TYPE_CARD: i64 = 0;
pub const GRAVE_TYPE_NOTE: i64 = 1;
pub const GRAVE_TYPE_DECK: i64 = 2;

#[derive(Clone, Debug)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub username: String,
    pub subscription_status: String,
    pub subscription_expiry: Option<i64>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncMeta {
    pub user_id: i64,
    pub usn: i64,
    pub last_sync: Option<i64>,
}

// Entity rows double as wire shapes: a push overwrites the full row, so the
// stored columns and the JSON fields are the same set. The `usn` field is
// advisory on the way in (the server restamps it) and authoritative on the
// way out.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Deck {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config_id: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub modified_at: i64,
    #[serde(default)]
    pub usn: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Note {
    pub id: i64,
    pub guid: String,
    pub mid: i64,
    #[serde(rename = "mod", default)]
    pub mtime: i64,
    #[serde(default)]
    pub usn: i64,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub flds: String,
    #[serde(default)]
    pub sfld: String,
    #[serde(default)]
    pub csum: i64,
    #[serde(default)]
    pub flags: i64,
    #[serde(default)]
    pub data: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Card {
    pub id: i64,
    pub note_id: i64,
    pub deck_id: i64,
    #[serde(default)]
    pub ordinal: i64,
    #[serde(default)]
    pub modified_at: i64,
    #[serde(default)]
    pub usn: i64,
    #[serde(default)]
    pub state: i64,
    #[serde(default)]
    pub queue: i64,
    #[serde(default)]
    pub due: i64,
    #[serde(default)]
    pub interval: i64,
    #[serde(default)]
    pub ease_factor: i64,
    #[serde(default)]
    pub reps: i64,
    #[serde(default)]
    pub lapses: i64,
    #[serde(default)]
    pub left_count: i64,
    #[serde(default)]
    pub original_due: i64,
    #[serde(default)]
    pub original_deck_id: i64,
    #[serde(default)]
    pub flags: i64,
    #[serde(default)]
    pub data: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Grave {
    pub oid: i64,
    #[serde(rename = "type")]
    pub kind: i64,
}

#[derive(Clone, Debug)]
pub struct MediaEntry {
    pub hash: String,
    pub filename: String,
    pub size: i64,
    pub usn: i64,
}

fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("decksync.sqlite3")
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let mut user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version < 1 {
        // v1: accounts + bearer sessions.
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  username TEXT NOT NULL,
  subscription_status TEXT NOT NULL DEFAULT 'free',
  subscription_expiry INTEGER,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
  token_hash TEXT PRIMARY KEY,
  user_id INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  expires_at INTEGER NOT NULL,
  FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);
"#,
        )?;
        conn.execute_batch("PRAGMA user_version = 1;")?;
        user_version = 1;
    }

    if user_version < 2 {
        // v2: per-user sync state. Entity tables key on (user_id, id) so
        // client-assigned ids converge across devices; every table that
        // participates in pull carries a (user_id, usn) index.
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS sync_meta (
  user_id INTEGER PRIMARY KEY,
  usn INTEGER NOT NULL DEFAULT 0,
  last_sync INTEGER
);

CREATE TABLE IF NOT EXISTS decks (
  id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  config_id INTEGER NOT NULL DEFAULT 1,
  created_at INTEGER NOT NULL DEFAULT 0,
  modified_at INTEGER NOT NULL DEFAULT 0,
  usn INTEGER NOT NULL,
  PRIMARY KEY (user_id, id)
);
CREATE INDEX IF NOT EXISTS idx_decks_user_usn ON decks(user_id, usn);

CREATE TABLE IF NOT EXISTS notes (
  id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  guid TEXT NOT NULL DEFAULT '',
  mid INTEGER NOT NULL DEFAULT 0,
  mod INTEGER NOT NULL DEFAULT 0,
  usn INTEGER NOT NULL,
  tags TEXT NOT NULL DEFAULT '',
  flds TEXT NOT NULL DEFAULT '',
  sfld TEXT NOT NULL DEFAULT '',
  csum INTEGER NOT NULL DEFAULT 0,
  flags INTEGER NOT NULL DEFAULT 0,
  data TEXT NOT NULL DEFAULT '',
  PRIMARY KEY (user_id, id)
);
CREATE INDEX IF NOT EXISTS idx_notes_user_usn ON notes(user_id, usn);

CREATE TABLE IF NOT EXISTS cards (
  id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  note_id INTEGER NOT NULL,
  deck_id INTEGER NOT NULL,
  ordinal INTEGER NOT NULL DEFAULT 0,
  modified_at INTEGER NOT NULL DEFAULT 0,
  usn INTEGER NOT NULL,
  state INTEGER NOT NULL DEFAULT 0,
  queue INTEGER NOT NULL DEFAULT 0,
  due INTEGER NOT NULL DEFAULT 0,
  interval INTEGER NOT NULL DEFAULT 0,
  ease_factor INTEGER NOT NULL DEFAULT 0,
  reps INTEGER NOT NULL DEFAULT 0,
  lapses INTEGER NOT NULL DEFAULT 0,
  left_count INTEGER NOT NULL DEFAULT 0,
  original_due INTEGER NOT NULL DEFAULT 0,
  original_deck_id INTEGER NOT NULL DEFAULT 0,
  flags INTEGER NOT NULL DEFAULT 0,
  data TEXT NOT NULL DEFAULT '',
  PRIMARY KEY (user_id, id)
);
CREATE INDEX IF NOT EXISTS idx_cards_user_usn ON cards(user_id, usn);

CREATE TABLE IF NOT EXISTS graves (
  user_id INTEGER NOT NULL,
  oid INTEGER NOT NULL,
  type INTEGER NOT NULL,
  usn INTEGER NOT NULL,
  PRIMARY KEY (user_id, oid, type)
);
CREATE INDEX IF NOT EXISTS idx_graves_user_usn ON graves(user_id, usn);

CREATE TABLE IF NOT EXISTS media (
  user_id INTEGER NOT NULL,
  hash TEXT NOT NULL,
  filename TEXT NOT NULL DEFAULT '',
  size INTEGER NOT NULL DEFAULT 0,
  usn INTEGER NOT NULL,
  PRIMARY KEY (user_id, hash)
);
CREATE INDEX IF NOT EXISTS idx_media_user_usn ON media(user_id, usn);

PRAGMA user_version = 2;
"#,
        )?;
        user_version = 2;
    }

    if user_version < 3 {
        // v3: scheduler state columns newer clients persist alongside the
        // classic fields. Additive so v2 databases upgrade in place.
        if !has_column(conn, "cards", "stability")? {
            conn.execute_batch("ALTER TABLE cards ADD COLUMN stability REAL NOT NULL DEFAULT 0;")?;
        }
        if !has_column(conn, "cards", "difficulty")? {
            conn.execute_batch(
                "ALTER TABLE cards ADD COLUMN difficulty REAL NOT NULL DEFAULT 0;",
            )?;
        }
        conn.execute_batch("PRAGMA user_version = 3;")?;
    }

    Ok(())
}

pub fn open(data_dir: &Path) -> Result<Connection> {
    fs::create_dir_all(data_dir)?;
    let conn = Connection::open(db_path(data_dir))?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    migrate(&conn)?;
    debug!("database open");
    Ok(conn)
}

pub fn with_immediate_transaction<T>(
    conn: &Connection,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE;")?;
    match f() {
        Ok(v) => {
            conn.execute_batch("COMMIT;")?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(e)
        }
    }
}

// Deferred transaction for multi-statement reads: under WAL every SELECT
// inside sees the same snapshot, so pull cannot observe half of a
// concurrent push.
pub fn with_read_transaction<T>(conn: &Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN DEFERRED;")?;
    match f() {
        Ok(v) => {
            conn.execute_batch("COMMIT;")?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(e)
        }
    }
}

pub fn create_user(
    conn: &Connection,
    email: &str,
    password_hash: &str,
    username: &str,
) -> Result<User> {
    let now = now_ms();
    conn.execute(
        r#"INSERT INTO users (email, password_hash, username, created_at)
           VALUES (?1, ?2, ?3, ?4)"#,
        params![email, password_hash, username, now],
    )?;
    let id = conn.last_insert_rowid();
    Ok(User {
        id,
        email: email.to_string(),
        password_hash: password_hash.to_string(),
        username: username.to_string(),
        subscription_status: "free".to_string(),
        subscription_expiry: None,
        created_at_ms: now,
    })
}

pub fn get_user(conn: &Connection, user_id: i64) -> Result<Option<User>> {
    conn.query_row(
        r#"SELECT id, email, password_hash, username, subscription_status,
                  subscription_expiry, created_at
           FROM users WHERE id = ?1"#,
        params![user_id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                email: row.get(1)?,
                password_hash: row.get(2)?,
                username: row.get(3)?,
                subscription_status: row.get(4)?,
                subscription_expiry: row.get(5)?,
                created_at_ms: row.get(6)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn set_subscription_status(
    conn: &Connection,
    user_id: i64,
    status: &str,
    expiry_ms: Option<i64>,
) -> Result<()> {
    let updated = conn.execute(
        r#"UPDATE users SET subscription_status = ?2, subscription_expiry = ?3 WHERE id = ?1"#,
        params![user_id, status, expiry_ms],
    )?;
    if updated == 0 {
        return Err(anyhow!("user not found: {user_id}"));
    }
    Ok(())
}

pub fn get_sync_meta(conn: &Connection, user_id: i64) -> Result<SyncMeta> {
    let row: Option<(i64, Option<i64>)> = conn
        .query_row(
            r#"SELECT usn, last_sync FROM sync_meta WHERE user_id = ?1"#,
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (usn, last_sync) = row.unwrap_or((0, None));
    Ok(SyncMeta {
        user_id,
        usn,
        last_sync,
    })
}

pub fn upsert_deck(conn: &Connection, user_id: i64, deck: &Deck, usn: i64) -> Result<()> {
    conn.execute(
        r#"INSERT INTO decks
           (id, user_id, name, description, config_id, created_at, modified_at, usn)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
           ON CONFLICT(user_id, id) DO UPDATE SET
             name = excluded.name,
             description = excluded.description,
             config_id = excluded.config_id,
             created_at = excluded.created_at,
             modified_at = excluded.modified_at,
             usn = excluded.usn"#,
        params![
            deck.id,
            user_id,
            deck.name,
            deck.description,
            deck.config_id,
            deck.created_at,
            deck.modified_at,
            usn
        ],
    )?;
    Ok(())
}

pub fn upsert_note(conn: &Connection, user_id: i64, note: &Note, usn: i64) -> Result<()> {
    conn.execute(
        r#"INSERT INTO notes
           (id, user_id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
           ON CONFLICT(user_id, id) DO UPDATE SET
             guid = excluded.guid,
             mid = excluded.mid,
             mod = excluded.mod,
             usn = excluded.usn,
             tags = excluded.tags,
             flds = excluded.flds,
             sfld = excluded.sfld,
             csum = excluded.csum,
             flags = excluded.flags,
             data = excluded.data"#,
        params![
            note.id, user_id, note.guid, note.mid, note.mtime, usn, note.tags, note.flds,
            note.sfld, note.csum, note.flags, note.data
        ],
    )?;
    Ok(())
}

pub fn upsert_card(conn: &Connection, user_id: i64, card: &Card, usn: i64) -> Result<()> {
    conn.execute(
        r#"INSERT INTO cards
           (id, user_id, note_id, deck_id, ordinal, modified_at, usn, state, queue, due,
            interval, ease_factor, reps, lapses, left_count, original_due, original_deck_id,
            flags, data)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
           ON CONFLICT(user_id, id) DO UPDATE SET
             note_id = excluded.note_id,
             deck_id = excluded.deck_id,
             ordinal = excluded.ordinal,
             modified_at = excluded.modified_at,
             usn = excluded.usn,
             state = excluded.state,
             queue = excluded.queue,
             due = excluded.due,
             interval = excluded.interval,
             ease_factor = excluded.ease_factor,
             reps = excluded.reps,
             lapses = excluded.lapses,
             left_count = excluded.left_count,
             original_due = excluded.original_due,
             original_deck_id = excluded.original_deck_id,
             flags = excluded.flags,
             data = excluded.data"#,
        params![
            card.id,
            user_id,
            card.note_id,
            card.deck_id,
            card.ordinal,
            card.modified_at,
            usn,
            card.state,
            card.queue,
            card.due,
            card.interval,
            card.ease_factor,
            card.reps,
            card.lapses,
            card.left_count,
            card.original_due,
            card.original_deck_id,
            card.flags,
            card.data
        ],
    )?;
    Ok(())
}

// Re-recording an existing grave (push retries, coalesced client batches)
// moves it to the new USN so clients that already consumed the old window
// see it again; harmless either way.
pub fn record_grave(conn: &Connection, user_id: i64, oid: i64, kind: i64, usn: i64) -> Result<()> {
    conn.execute(
        r#"INSERT INTO graves (user_id, oid, type, usn)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(user_id, oid, type) DO UPDATE SET usn = excluded.usn"#,
        params![user_id, oid, kind, usn],
    )?;
    Ok(())
}

// An upsert resurrects an id a grave may still mark as deleted. Pull
// arrays are unordered, so a stale grave next to a live row would let
// clients delete the newer row; the grave has to go.
pub fn clear_grave(conn: &Connection, user_id: i64, oid: i64, kind: i64) -> Result<()> {
    conn.execute(
        r#"DELETE FROM graves WHERE user_id = ?1 AND oid = ?2 AND type = ?3"#,
        params![user_id, oid, kind],
    )?;
    Ok(())
}

// Deleting a row that is already gone is not an error; the grave above is
// the durable record of intent.
pub fn delete_for_grave(conn: &Connection, user_id: i64, oid: i64, kind: i64) -> Result<()> {
    let sql = match kind {
        GRAVE_TYPE_CARD => r#"DELETE FROM cards WHERE user_id = ?1 AND id = ?2"#,
        GRAVE_TYPE_NOTE => r#"DELETE FROM notes WHERE user_id = ?1 AND id = ?2"#,
        GRAVE_TYPE_DECK => r#"DELETE FROM decks WHERE user_id = ?1 AND id = ?2"#,
        _ => return Err(anyhow!("unknown grave type: {kind}")),
    };
    conn.execute(sql, params![user_id, oid])?;
    Ok(())
}

pub fn decks_since(conn: &Connection, user_id: i64, since: i64) -> Result<Vec<Deck>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, name, description, config_id, created_at, modified_at, usn
           FROM decks WHERE user_id = ?1 AND usn > ?2"#,
    )?;
    let mut rows = stmt.query(params![user_id, since])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(Deck {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            config_id: row.get(3)?,
            created_at: row.get(4)?,
            modified_at: row.get(5)?,
            usn: row.get(6)?,
        });
    }
    Ok(out)
}

pub fn notes_since(conn: &Connection, user_id: i64, since: i64) -> Result<Vec<Note>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data
           FROM notes WHERE user_id = ?1 AND usn > ?2"#,
    )?;
    let mut rows = stmt.query(params![user_id, since])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(Note {
            id: row.get(0)?,
            guid: row.get(1)?,
            mid: row.get(2)?,
            mtime: row.get(3)?,
            usn: row.get(4)?,
            tags: row.get(5)?,
            flds: row.get(6)?,
            sfld: row.get(7)?,
            csum: row.get(8)?,
            flags: row.get(9)?,
            data: row.get(10)?,
        });
    }
    Ok(out)
}

pub fn cards_since(conn: &Connection, user_id: i64, since: i64) -> Result<Vec<Card>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, note_id, deck_id, ordinal, modified_at, usn, state, queue, due,
                  interval, ease_factor, reps, lapses, left_count, original_due,
                  original_deck_id, flags, data
           FROM cards WHERE user_id = ?1 AND usn > ?2"#,
    )?;
    let mut rows = stmt.query(params![user_id, since])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(Card {
            id: row.get(0)?,
            note_id: row.get(1)?,
            deck_id: row.get(2)?,
            ordinal: row.get(3)?,
            modified_at: row.get(4)?,
            usn: row.get(5)?,
            state: row.get(6)?,
            queue: row.get(7)?,
            due: row.get(8)?,
            interval: row.get(9)?,
            ease_factor: row.get(10)?,
            reps: row.get(11)?,
            lapses: row.get(12)?,
            left_count: row.get(13)?,
            original_due: row.get(14)?,
            original_deck_id: row.get(15)?,
            flags: row.get(16)?,
            data: row.get(17)?,
        });
    }
    Ok(out)
}

pub fn graves_since(conn: &Connection, user_id: i64, since: i64) -> Result<Vec<Grave>> {
    let mut stmt =
        conn.prepare(r#"SELECT oid, type FROM graves WHERE user_id = ?1 AND usn > ?2"#)?;
    let mut rows = stmt.query(params![user_id, since])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(Grave {
            oid: row.get(0)?,
            kind: row.get(1)?,
        });
    }
    Ok(out)
}

pub fn upsert_media_entry(
    conn: &Connection,
    user_id: i64,
    hash: &str,
    filename: &str,
    size: i64,
    usn: i64,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO media (user_id, hash, filename, size, usn)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(user_id, hash) DO UPDATE SET
             filename = excluded.filename,
             size = excluded.size,
             usn = excluded.usn"#,
        params![user_id, hash, filename, size, usn],
    )?;
    Ok(())
}

pub fn media_list(conn: &Connection, user_id: i64) -> Result<Vec<MediaEntry>> {
    let mut stmt =
        conn.prepare(r#"SELECT hash, filename, size, usn FROM media WHERE user_id = ?1"#)?;
    let mut rows = stmt.query(params![user_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(MediaEntry {
            hash: row.get(0)?,
            filename: row.get(1)?,
            size: row.get(2)?,
            usn: row.get(3)?,
        });
    }
    Ok(out)
}

pub fn media_filename(conn: &Connection, user_id: i64, hash: &str) -> Result<Option<String>> {
    conn.query_row(
        r#"SELECT filename FROM media WHERE user_id = ?1 AND hash = ?2"#,
        params![user_id, hash],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

// Full-reset wipe: entity rows, graves and the media index go; user and
// session rows stay. Runs inside the caller's transaction.
pub fn delete_user_sync_data(conn: &Connection, user_id: i64) -> Result<()> {
    conn.execute(r#"DELETE FROM cards WHERE user_id = ?1"#, params![user_id])?;
    conn.execute(r#"DELETE FROM notes WHERE user_id = ?1"#, params![user_id])?;
    conn.execute(r#"DELETE FROM decks WHERE user_id = ?1"#, params![user_id])?;
    conn.execute(r#"DELETE FROM graves WHERE user_id = ?1"#, params![user_id])?;
    conn.execute(r#"DELETE FROM media WHERE user_id = ?1"#, params![user_id])?;
    conn.execute(
        r#"UPDATE sync_meta SET usn = 0, last_sync = NULL WHERE user_id = ?1"#,
        params![user_id],
    )?;
    Ok(())
}
