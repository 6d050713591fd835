use decksync::api::SyncService;
use decksync::media::MediaStore;
use decksync::{auth, db};

fn pro_service() -> (tempfile::TempDir, SyncService, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().join("decksync");

    let conn = db::open(&data_dir).expect("open");
    let user = db::create_user(&conn, "u@example.com", "hash", "u").expect("user");
    db::set_subscription_status(&conn, user.id, "pro", None).expect("subscribe");
    let token = auth::issue_token(&conn, user.id).expect("token");

    let service = SyncService::new(
        data_dir.clone(),
        MediaStore::local(data_dir.join("media")),
    );
    (dir, service, format!("Bearer {token}"))
}

fn push(service: &SyncService, bearer: &str, body: serde_json::Value) -> i64 {
    service
        .sync_push(bearer, &serde_json::to_vec(&body).expect("encode"))
        .expect("push")
        .server_usn
}

#[test]
fn deck_delete_propagates_via_grave() {
    let (_dir, service, bearer) = pro_service();

    push(
        &service,
        &bearer,
        serde_json::json!({"decks": [{"id": 1000, "name": "Geo"}]}),
    );
    push(
        &service,
        &bearer,
        serde_json::json!({"decks": [{"id": 1000, "name": "Geography"}]}),
    );
    let usn = push(
        &service,
        &bearer,
        serde_json::json!({"graves": [{"oid": 1000, "type": 2}]}),
    );
    assert_eq!(usn, 3);

    let pulled = service.sync_pull(&bearer, Some(2)).expect("pull");
    assert!(pulled.decks.is_empty());
    assert_eq!(pulled.graves.len(), 1);
    assert_eq!(pulled.graves[0].oid, 1000);
    assert_eq!(pulled.graves[0].kind, 2);

    // The live row is gone entirely, not just outside the window.
    let all = service.sync_pull(&bearer, Some(0)).expect("pull all");
    assert!(all.decks.is_empty());
}

#[test]
fn grave_wins_over_upsert_in_the_same_push() {
    let (_dir, service, bearer) = pro_service();

    let usn = push(
        &service,
        &bearer,
        serde_json::json!({
            "decks": [{"id": 2000, "name": "X"}],
            "graves": [{"oid": 2000, "type": 2}]
        }),
    );

    let pulled = service.sync_pull(&bearer, Some(usn - 1)).expect("pull");
    assert!(pulled.decks.is_empty());
    assert_eq!(pulled.graves.len(), 1);
    assert_eq!(pulled.graves[0].oid, 2000);
}

#[test]
fn deleting_a_nonexistent_row_still_records_the_grave() {
    let (_dir, service, bearer) = pro_service();

    let usn = push(
        &service,
        &bearer,
        serde_json::json!({"graves": [{"oid": 42, "type": 1}]}),
    );
    assert_eq!(usn, 1);

    let pulled = service.sync_pull(&bearer, Some(0)).expect("pull");
    assert_eq!(pulled.graves.len(), 1);
    assert_eq!(pulled.graves[0].oid, 42);
    assert_eq!(pulled.graves[0].kind, 1);
}

#[test]
fn note_and_card_graves_delete_their_rows() {
    let (_dir, service, bearer) = pro_service();

    push(
        &service,
        &bearer,
        serde_json::json!({
            "notes": [{"id": 1, "guid": "g1", "mid": 1}],
            "cards": [{"id": 2, "note_id": 1, "deck_id": 1}]
        }),
    );
    push(
        &service,
        &bearer,
        serde_json::json!({
            "graves": [{"oid": 2, "type": 0}, {"oid": 1, "type": 1}]
        }),
    );

    let pulled = service.sync_pull(&bearer, Some(0)).expect("pull");
    assert!(pulled.notes.is_empty());
    assert!(pulled.cards.is_empty());
    assert_eq!(pulled.graves.len(), 2);
}

#[test]
fn reupserting_a_deleted_id_clears_its_grave() {
    let (_dir, service, bearer) = pro_service();

    push(
        &service,
        &bearer,
        serde_json::json!({"decks": [{"id": 3000, "name": "Phys"}]}),
    );
    push(
        &service,
        &bearer,
        serde_json::json!({"graves": [{"oid": 3000, "type": 2}]}),
    );
    push(
        &service,
        &bearer,
        serde_json::json!({"decks": [{"id": 3000, "name": "Physics"}]}),
    );

    // A client catching up from scratch must not see both a live row and a
    // grave for the same id; the arrays are unordered.
    let pulled = service.sync_pull(&bearer, Some(0)).expect("pull");
    assert_eq!(pulled.decks.len(), 1);
    assert_eq!(pulled.decks[0].name, "Physics");
    assert!(pulled.graves.is_empty());
}

#[test]
fn graves_survive_across_pull_windows() {
    let (_dir, service, bearer) = pro_service();

    push(
        &service,
        &bearer,
        serde_json::json!({"graves": [{"oid": 9, "type": 2}]}),
    );
    // Later activity must not hide the older grave from a client that is
    // further behind.
    push(
        &service,
        &bearer,
        serde_json::json!({"decks": [{"id": 10, "name": "New"}]}),
    );

    let pulled = service.sync_pull(&bearer, Some(0)).expect("pull");
    assert_eq!(pulled.graves.len(), 1);
    assert_eq!(pulled.decks.len(), 1);
}
