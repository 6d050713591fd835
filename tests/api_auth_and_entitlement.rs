use decksync::api::SyncService;
use decksync::error::ApiError;
use decksync::media::MediaStore;
use decksync::{auth, db};

fn service_with_user(status: &str) -> (tempfile::TempDir, SyncService, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().join("decksync");

    let conn = db::open(&data_dir).expect("open");
    let user = db::create_user(&conn, "u@example.com", "hash", "u").expect("user");
    db::set_subscription_status(&conn, user.id, status, None).expect("status");
    let token = auth::issue_token(&conn, user.id).expect("token");

    let service = SyncService::new(
        data_dir.clone(),
        MediaStore::local(data_dir.join("media")),
    );
    (dir, service, format!("Bearer {token}"))
}

fn assert_forbidden<T: std::fmt::Debug>(result: Result<T, ApiError>) {
    let err = result.expect_err("should be forbidden");
    assert!(matches!(err, ApiError::Forbidden(_)), "got {err:?}");
    assert_eq!(err.status_code(), 403);
}

#[test]
fn free_tier_gets_403_on_every_endpoint_without_side_effects() {
    let (dir, service, bearer) = service_with_user("free");
    let push = serde_json::json!({"decks": [{"id": 1, "name": "D"}]});
    let push = serde_json::to_vec(&push).expect("encode");

    assert_forbidden(service.sync_meta(&bearer));
    assert_forbidden(service.sync_push(&bearer, &push));
    assert_forbidden(service.sync_pull(&bearer, Some(0)));
    assert_forbidden(service.sync_full(&bearer, &push));
    assert_forbidden(service.media_list(&bearer));
    assert_forbidden(service.media_upload(&bearer, br#"{"hash":"abc123"}"#));
    assert_forbidden(service.media_upload_bytes(&bearer, "abc123", "f", b"x"));
    assert_forbidden(service.media_download(&bearer, "abc123"));

    // No counter advance, no rows.
    let conn = db::open(&dir.path().join("decksync")).expect("open");
    let meta = db::get_sync_meta(&conn, 1).expect("meta");
    assert_eq!(meta.usn, 0);
    assert!(db::decks_since(&conn, 1, 0).expect("decks").is_empty());
}

#[test]
fn missing_or_invalid_credentials_get_401() {
    let (_dir, service, _bearer) = service_with_user("pro");

    for header in ["", "Bearer ", "Bearer not-a-real-token", "Basic abc"] {
        let err = service.sync_meta(header).expect_err("should be rejected");
        assert!(matches!(err, ApiError::Unauthenticated(_)), "got {err:?}");
        assert_eq!(err.status_code(), 401);
    }
}

#[test]
fn entitled_user_passes_the_gate() {
    let (_dir, service, bearer) = service_with_user("pro");
    let meta = service.sync_meta(&bearer).expect("meta");
    assert_eq!(meta.usn, 0);
}

#[test]
fn upgrading_status_flips_the_gate() {
    let (dir, service, bearer) = service_with_user("free");
    assert_forbidden(service.sync_meta(&bearer));

    let conn = db::open(&dir.path().join("decksync")).expect("open");
    db::set_subscription_status(&conn, 1, "pro", Some(4_102_444_800_000)).expect("upgrade");

    assert!(service.sync_meta(&bearer).is_ok());
}

#[test]
fn custom_allowed_statuses_are_honored() {
    let (_dir, mut service, bearer) = service_with_user("lifetime");
    assert_forbidden(service.sync_meta(&bearer));

    service.allowed_statuses = vec!["pro".to_string(), "lifetime".to_string()];
    assert!(service.sync_meta(&bearer).is_ok());
}
