use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{self, Card, Deck, Grave, Note};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SyncPayload {
    #[serde(default)]
    pub decks: Vec<Deck>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub graves: Vec<Grave>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PullResponse {
    pub server_usn: i64,
    pub decks: Vec<Deck>,
    pub notes: Vec<Note>,
    pub cards: Vec<Card>,
    pub graves: Vec<Grave>,
}

impl SyncPayload {
    /// Surface payload problems before any transaction opens.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for grave in &self.graves {
            match grave.kind {
                db::GRAVE_TYPE_CARD | db::GRAVE_TYPE_NOTE | db::GRAVE_TYPE_DECK => {}
                other => return Err(format!("unknown grave type: {other}")),
            }
        }
        Ok(())
    }
}

/// Bump the user's counter and return the new value. Must run inside the
/// caller's write transaction: the row update takes the per-user lock that
/// serializes concurrent pushes, and a rollback leaves no advance behind.
pub fn allocate_usn(conn: &Connection, user_id: i64) -> Result<i64> {
    conn.execute(
        r#"INSERT INTO sync_meta (user_id, usn) VALUES (?1, 0)
           ON CONFLICT(user_id) DO NOTHING"#,
        params![user_id],
    )?;
    let usn: i64 = conn.query_row(
        r#"UPDATE sync_meta SET usn = usn + 1, last_sync = ?2 WHERE user_id = ?1 RETURNING usn"#,
        params![user_id, db::now_ms()],
        |row| row.get(0),
    )?;
    Ok(usn)
}

// Upserts first, graves second. A batch may carry both an upsert and a
// grave for the same id; the delete intent wins. Every row written here
// carries the single USN allocated at the top.
fn apply_push(conn: &Connection, user_id: i64, payload: &SyncPayload) -> Result<i64> {
    let usn = allocate_usn(conn, user_id)?;

    for deck in &payload.decks {
        db::upsert_deck(conn, user_id, deck, usn)?;
        db::clear_grave(conn, user_id, deck.id, db::GRAVE_TYPE_DECK)?;
    }
    for note in &payload.notes {
        db::upsert_note(conn, user_id, note, usn)?;
        db::clear_grave(conn, user_id, note.id, db::GRAVE_TYPE_NOTE)?;
    }
    for card in &payload.cards {
        db::upsert_card(conn, user_id, card, usn)?;
        db::clear_grave(conn, user_id, card.id, db::GRAVE_TYPE_CARD)?;
    }
    for grave in &payload.graves {
        db::record_grave(conn, user_id, grave.oid, grave.kind, usn)?;
        db::delete_for_grave(conn, user_id, grave.oid, grave.kind)?;
    }

    Ok(usn)
}

/// Apply a client batch atomically under one new USN.
pub fn push(conn: &Connection, user_id: i64, payload: &SyncPayload) -> Result<i64> {
    let usn = db::with_immediate_transaction(conn, || apply_push(conn, user_id, payload))?;
    debug!(
        user_id,
        usn,
        decks = payload.decks.len(),
        notes = payload.notes.len(),
        cards = payload.cards.len(),
        graves = payload.graves.len(),
        "push applied"
    );
    Ok(usn)
}

/// Everything the user changed after `since`, read at one snapshot so a
/// concurrent push is either fully visible or not at all. Absence of a row
/// never means deletion; only graves do.
pub fn pull(conn: &Connection, user_id: i64, since: i64) -> Result<PullResponse> {
    db::with_read_transaction(conn, || {
        let meta = db::get_sync_meta(conn, user_id)?;
        Ok(PullResponse {
            server_usn: meta.usn,
            decks: db::decks_since(conn, user_id, since)?,
            notes: db::notes_since(conn, user_id, since)?,
            cards: db::cards_since(conn, user_id, since)?,
            graves: db::graves_since(conn, user_id, since)?,
        })
    })
}

/// Wipe the user's synced state and re-ingest the supplied payload in the
/// same transaction. The counter restarts at zero, so the ingested rows all
/// land on USN 1. Media blobs are not touched here; the index is cleared
/// and clients re-advertise through the media endpoints.
pub fn full_reset(conn: &Connection, user_id: i64, payload: &SyncPayload) -> Result<i64> {
    let usn = db::with_immediate_transaction(conn, || {
        db::delete_user_sync_data(conn, user_id)?;
        apply_push(conn, user_id, payload)
    })?;
    debug!(user_id, usn, "full reset applied");
    Ok(usn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Connection, i64) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");
        let user = db::create_user(&conn, "s@example.com", "x", "s").expect("user");
        (dir, conn, user.id)
    }

    #[test]
    fn allocate_usn_counts_up_from_one() {
        let (_dir, conn, user_id) = setup();
        let a = db::with_immediate_transaction(&conn, || allocate_usn(&conn, user_id))
            .expect("allocate");
        let b = db::with_immediate_transaction(&conn, || allocate_usn(&conn, user_id))
            .expect("allocate");
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        let meta = db::get_sync_meta(&conn, user_id).expect("meta");
        assert_eq!(meta.usn, 2);
        assert!(meta.last_sync.is_some());
    }

    #[test]
    fn rolled_back_allocation_leaves_no_advance() {
        let (_dir, conn, user_id) = setup();
        let result: Result<i64> = db::with_immediate_transaction(&conn, || {
            let _ = allocate_usn(&conn, user_id)?;
            Err(anyhow::anyhow!("abort"))
        });
        assert!(result.is_err());
        assert_eq!(db::get_sync_meta(&conn, user_id).expect("meta").usn, 0);
    }

    #[test]
    fn validate_flags_unknown_grave_types() {
        let payload = SyncPayload {
            graves: vec![Grave { oid: 1, kind: 7 }],
            ..Default::default()
        };
        assert!(payload.validate().is_err());

        let ok = SyncPayload {
            graves: vec![Grave {
                oid: 1,
                kind: db::GRAVE_TYPE_DECK,
            }],
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }
}
