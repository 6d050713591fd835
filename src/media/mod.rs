use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use tracing::{info, warn};

pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(60 * 60);
pub const MEDIA_CONTENT_TYPE: &str = "application/octet-stream";

/// Where media bytes live. `Remote` never touches the bytes: it mints
/// presigned URLs and the client talks to the bucket directly. `Local` is
/// the single-node fallback that accepts and serves bytes itself.
pub enum MediaStore {
    Remote(RemoteMediaStore),
    Local(LocalMediaStore),
}

pub struct RemoteMediaStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

pub struct LocalMediaStore {
    root: PathBuf,
}

// Object keys are `{user_id}/{hash}`: per-user isolation without relying on
// presigner scoping, and content addressing makes re-uploads idempotent.
pub fn media_key(user_id: i64, hash: &str) -> String {
    format!("{user_id}/{hash}")
}

// The hash lands in object keys and filesystem paths, so only accept what a
// hex digest can look like.
pub fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty() && hash.len() <= 128 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

// The AWS SDK is async; everything around it is not. Same bridge the rest
// of our stack uses: a throwaway current-thread runtime. Presigning does no
// network I/O, so this completes in microseconds.
fn run_async<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed creating async runtime for media store")?;
    rt.block_on(fut)
}

impl MediaStore {
    /// Build from `R2_*` environment variables; incomplete configuration
    /// falls back to local storage under `{data_dir}/media`.
    pub fn from_env(data_dir: &Path) -> Result<Self> {
        let account_id = env::var("R2_ACCOUNT_ID").unwrap_or_default();
        let access_key_id = env::var("R2_ACCESS_KEY_ID").unwrap_or_default();
        let secret_access_key = env::var("R2_SECRET_ACCESS_KEY").unwrap_or_default();
        let bucket = env::var("R2_BUCKET_NAME").unwrap_or_default();

        if account_id.is_empty()
            || access_key_id.is_empty()
            || secret_access_key.is_empty()
            || bucket.is_empty()
        {
            warn!("object store not configured; media falls back to local files");
            return Ok(MediaStore::Local(LocalMediaStore::new(
                data_dir.join("media"),
            )));
        }

        let endpoint = format!("https://{account_id}.r2.cloudflarestorage.com");
        let store = RemoteMediaStore::connect(&endpoint, &access_key_id, &secret_access_key, bucket)?;
        info!("object store configured for media");
        Ok(MediaStore::Remote(store))
    }

    pub fn local(root: PathBuf) -> Self {
        MediaStore::Local(LocalMediaStore::new(root))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, MediaStore::Remote(_))
    }
}

impl RemoteMediaStore {
    pub fn connect(
        endpoint_url: &str,
        access_key_id: &str,
        secret_access_key: &str,
        bucket: String,
    ) -> Result<Self> {
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "static");
        let endpoint_url = endpoint_url.to_string();
        let cfg = run_async(async move {
            Ok(aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new("auto"))
                .endpoint_url(endpoint_url)
                .credentials_provider(credentials)
                .load()
                .await)
        })?;

        Ok(Self {
            client: aws_sdk_s3::Client::new(&cfg),
            bucket,
        })
    }

    pub fn presign_put_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        run_async(async move {
            let presigning = PresigningConfig::expires_in(ttl)
                .map_err(|e| anyhow!("invalid presign expiry: {e}"))?;
            let presigned = client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .content_type(MEDIA_CONTENT_TYPE)
                .presigned(presigning)
                .await
                .map_err(|e| anyhow!("failed presigning put for {key}: {e}"))?;
            Ok(presigned.uri().to_string())
        })
    }

    pub fn presign_get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        run_async(async move {
            let presigning = PresigningConfig::expires_in(ttl)
                .map_err(|e| anyhow!("invalid presign expiry: {e}"))?;
            let presigned = client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .presigned(presigning)
                .await
                .map_err(|e| anyhow!("failed presigning get for {key}: {e}"))?;
            Ok(presigned.uri().to_string())
        })
    }
}

impl LocalMediaStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn blob_path(&self, user_id: i64, hash: &str) -> PathBuf {
        self.root.join(user_id.to_string()).join(hash)
    }

    // Content-addressed key: overwriting an existing blob with the same
    // hash is a no-op in effect.
    pub fn write(&self, user_id: i64, hash: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(user_id, hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)
            .with_context(|| format!("failed writing media blob {}", path.display()))?;
        Ok(())
    }

    pub fn exists(&self, user_id: i64, hash: &str) -> bool {
        self.blob_path(user_id, hash).is_file()
    }
}
