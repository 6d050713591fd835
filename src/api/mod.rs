use std::path::PathBuf;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{self, Principal};
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::media::{self, MediaStore};
use crate::sync::{self, PullResponse, SyncPayload};

pub const DEFAULT_MAX_PUSH_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_MEDIA_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone, Debug, Serialize)]
pub struct UsnResponse {
    pub server_usn: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MediaItem {
    pub hash: String,
    pub filename: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct MediaListResponse {
    pub media: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
struct MediaUploadRequest {
    hash: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    size: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MediaUploadResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// How the transport should answer a media download: 307 to a presigned
/// URL, or stream a local file (single-node fallback).
#[derive(Debug)]
pub enum MediaDownload {
    Redirect(String),
    File { path: PathBuf, filename: String },
}

/// One value per process, handed to the transport shell; every method is a
/// complete endpoint: credential resolution, entitlement gate, body
/// parsing and the store transaction.
pub struct SyncService {
    pub data_dir: PathBuf,
    pub media: MediaStore,
    pub max_push_bytes: usize,
    pub max_media_bytes: usize,
    pub allowed_statuses: Vec<String>,
}

impl SyncService {
    pub fn new(data_dir: impl Into<PathBuf>, media: MediaStore) -> Self {
        Self {
            data_dir: data_dir.into(),
            media,
            max_push_bytes: DEFAULT_MAX_PUSH_BYTES,
            max_media_bytes: DEFAULT_MAX_MEDIA_BYTES,
            allowed_statuses: vec!["pro".to_string()],
        }
    }

    fn open_db(&self) -> ApiResult<Connection> {
        db::open(&self.data_dir).map_err(ApiError::from_store)
    }

    fn authenticate(&self, conn: &Connection, authorization: &str) -> ApiResult<Principal> {
        let principal = auth::resolve_bearer(conn, authorization).map_err(ApiError::from_store)?;
        principal.ok_or_else(|| {
            debug!("rejected bearer credential");
            ApiError::Unauthenticated("missing or invalid credential".to_string())
        })
    }

    fn require_entitled(&self, principal: &Principal) -> ApiResult<()> {
        if !auth::is_entitled(principal, &self.allowed_statuses) {
            return Err(ApiError::Forbidden(
                "sync requires a subscription".to_string(),
            ));
        }
        Ok(())
    }

    fn admit(&self, conn: &Connection, authorization: &str) -> ApiResult<Principal> {
        let principal = self.authenticate(conn, authorization)?;
        self.require_entitled(&principal)?;
        Ok(principal)
    }

    fn parse_json<T: DeserializeOwned>(&self, body: &[u8], cap: usize) -> ApiResult<T> {
        if body.len() > cap {
            return Err(ApiError::BadRequest(format!(
                "payload too large: {} bytes (limit {cap})",
                body.len()
            )));
        }
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
    }

    fn parse_payload(&self, body: &[u8]) -> ApiResult<SyncPayload> {
        let payload: SyncPayload = self.parse_json(body, self.max_push_bytes)?;
        payload.validate().map_err(ApiError::BadRequest)?;
        Ok(payload)
    }

    /// GET /sync/meta
    pub fn sync_meta(&self, authorization: &str) -> ApiResult<db::SyncMeta> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;
        db::get_sync_meta(&conn, principal.user_id).map_err(ApiError::from_store)
    }

    /// POST /sync/push
    pub fn sync_push(&self, authorization: &str, body: &[u8]) -> ApiResult<UsnResponse> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;
        let payload = self.parse_payload(body)?;

        let server_usn =
            sync::push(&conn, principal.user_id, &payload).map_err(ApiError::from_store)?;
        Ok(UsnResponse { server_usn })
    }

    /// GET /sync/pull?since=N
    pub fn sync_pull(&self, authorization: &str, since: Option<i64>) -> ApiResult<PullResponse> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;
        sync::pull(&conn, principal.user_id, since.unwrap_or(0)).map_err(ApiError::from_store)
    }

    /// POST /sync/full: wipe and re-ingest; owns the user's state.
    pub fn sync_full(&self, authorization: &str, body: &[u8]) -> ApiResult<UsnResponse> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;
        let payload = self.parse_payload(body)?;

        let server_usn =
            sync::full_reset(&conn, principal.user_id, &payload).map_err(ApiError::from_store)?;
        Ok(UsnResponse { server_usn })
    }

    /// GET /sync/media
    pub fn media_list(&self, authorization: &str) -> ApiResult<MediaListResponse> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;

        let media = db::media_list(&conn, principal.user_id)
            .map_err(ApiError::from_store)?
            .into_iter()
            .map(|entry| MediaItem {
                hash: entry.hash,
                filename: entry.filename,
            })
            .collect();
        Ok(MediaListResponse { media })
    }

    // The media row is written before the client uploads a byte. A row may
    // therefore advertise a blob that never arrives; the object store 404s
    // on fetch and a retried upload lands on the same content-addressed key.
    fn record_media_entry(
        &self,
        conn: &Connection,
        user_id: i64,
        hash: &str,
        filename: &str,
        size: i64,
    ) -> ApiResult<i64> {
        db::with_immediate_transaction(conn, || {
            let usn = sync::allocate_usn(conn, user_id)?;
            db::upsert_media_entry(conn, user_id, hash, filename, size, usn)?;
            Ok(usn)
        })
        .map_err(ApiError::from_store)
    }

    /// POST /sync/media/upload, presigned-URL branch.
    pub fn media_upload(&self, authorization: &str, body: &[u8]) -> ApiResult<MediaUploadResponse> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;

        let req: MediaUploadRequest = self.parse_json(body, self.max_push_bytes)?;
        if !media::is_valid_hash(&req.hash) {
            return Err(ApiError::BadRequest("hash required".to_string()));
        }

        let MediaStore::Remote(store) = &self.media else {
            return Err(ApiError::BadRequest(
                "object store not configured; use the direct upload endpoint".to_string(),
            ));
        };

        self.record_media_entry(&conn, principal.user_id, &req.hash, &req.filename, req.size)?;

        let key = media::media_key(principal.user_id, &req.hash);
        let upload_url = store
            .presign_put_url(&key, media::UPLOAD_URL_TTL)
            .map_err(ApiError::Internal)?;

        Ok(MediaUploadResponse {
            upload_url: Some(upload_url),
            hash: req.hash,
            status: None,
        })
    }

    /// POST /sync/media/upload, direct-bytes branch for single-node
    /// deployments without object-store credentials.
    pub fn media_upload_bytes(
        &self,
        authorization: &str,
        hash: &str,
        filename: &str,
        bytes: &[u8],
    ) -> ApiResult<MediaUploadResponse> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;

        if !media::is_valid_hash(hash) {
            return Err(ApiError::BadRequest("hash required".to_string()));
        }
        if bytes.len() > self.max_media_bytes {
            return Err(ApiError::BadRequest(format!(
                "file too large: {} bytes (limit {})",
                bytes.len(),
                self.max_media_bytes
            )));
        }

        let MediaStore::Local(store) = &self.media else {
            return Err(ApiError::BadRequest(
                "direct upload disabled; request an upload URL".to_string(),
            ));
        };

        self.record_media_entry(&conn, principal.user_id, hash, filename, bytes.len() as i64)?;
        store
            .write(principal.user_id, hash, bytes)
            .map_err(ApiError::Internal)?;

        Ok(MediaUploadResponse {
            upload_url: None,
            hash: hash.to_string(),
            status: Some("ok".to_string()),
        })
    }

    /// GET /sync/media/{hash}
    pub fn media_download(&self, authorization: &str, hash: &str) -> ApiResult<MediaDownload> {
        let conn = self.open_db()?;
        let principal = self.admit(&conn, authorization)?;

        if !media::is_valid_hash(hash) {
            return Err(ApiError::BadRequest("hash required".to_string()));
        }

        match &self.media {
            MediaStore::Remote(store) => {
                // No index lookup here: the bucket answers 404 for blobs
                // that never arrived.
                let key = media::media_key(principal.user_id, hash);
                let url = store
                    .presign_get_url(&key, media::DOWNLOAD_URL_TTL)
                    .map_err(ApiError::Internal)?;
                Ok(MediaDownload::Redirect(url))
            }
            MediaStore::Local(store) => {
                if !store.exists(principal.user_id, hash) {
                    return Err(ApiError::NotFound("media not found".to_string()));
                }
                let filename = db::media_filename(&conn, principal.user_id, hash)
                    .map_err(ApiError::from_store)?
                    .unwrap_or_else(|| hash.to_string());
                Ok(MediaDownload::File {
                    path: store.blob_path(principal.user_id, hash),
                    filename,
                })
            }
        }
    }
}
