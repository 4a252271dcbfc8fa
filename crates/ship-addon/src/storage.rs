use async_trait::async_trait;
use std::{collections::BTreeMap, sync::{Arc, Mutex}};
use tracing::{info, warn};
use crate::config::StorageConfig;

/// Durable object storage for assembled publish logs and version uploadables.
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str, sha256: &str) -> anyhow::Result<()>;
    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    async fn copy_object(&self, from: &str, to: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject { pub body: Vec<u8>, pub content_type: String, pub sha256: String }

/// In-process object map, used when `SHIP_STORAGE_MODE=mock` and in tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage { objects: Mutex<BTreeMap<String, StoredObject>> }

impl MemoryObjectStorage {
    pub fn new() -> Self { Self::default() }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>>> {
        self.objects.lock().map_err(|_| anyhow::anyhow!("object storage lock poisoned"))
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str, sha256: &str) -> anyhow::Result<()> {
        self.lock()?.insert(key.to_string(), StoredObject { body, content_type: content_type.to_string(), sha256: sha256.to_string() });
        Ok(())
    }
    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).map(|o| o.body.clone()))
    }
    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.lock()?.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
    async fn copy_object(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let mut objects = self.lock()?;
        let obj = objects.get(from).cloned().ok_or_else(|| anyhow::anyhow!("object {from} not found"))?;
        objects.insert(to.to_string(), obj);
        Ok(())
    }
}

#[cfg(feature="s3")]
#[derive(Clone)]
pub struct S3ObjectStorage { client: aws_sdk_s3::Client, bucket: String }

#[cfg(feature="s3")]
impl std::fmt::Debug for S3ObjectStorage { fn fmt(&self, f:&mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("S3ObjectStorage").field("bucket", &self.bucket).finish() } }

#[cfg(feature="s3")]
#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str, sha256: &str) -> anyhow::Result<()> {
        use aws_sdk_s3::primitives::ByteStream;
        self.client.put_object().bucket(&self.bucket).key(key)
            .content_type(content_type)
            .metadata("sha256", sha256)
            .body(ByteStream::from(body))
            .send().await?;
        Ok(())
    }
    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(out) => Ok(Some(out.body.collect().await?.into_bytes().to_vec())),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) { return Ok(None); }
                Err(e.into())
            }
        }
    }
    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix).set_continuation_token(token.take()).send().await?;
            keys.extend(out.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            match (out.is_truncated().unwrap_or(false), out.next_continuation_token()) {
                (true, Some(next)) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(keys)
    }
    async fn copy_object(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.client.copy_object().bucket(&self.bucket).key(to)
            .copy_source(format!("{}/{}", self.bucket, from))
            .send().await?;
        Ok(())
    }
}

pub async fn from_config(cfg: &StorageConfig) -> Arc<dyn ObjectStorage> {
    if cfg.mode.eq_ignore_ascii_case("s3") {
        #[cfg(feature="s3")]
        {
            use aws_config::BehaviorVersion;
            let shared = aws_config::defaults(BehaviorVersion::latest()).region(aws_sdk_s3::config::Region::new(cfg.region.clone())).load().await;
            let mut builder = aws_sdk_s3::config::Builder::from(&shared);
            if let Some(ep) = &cfg.endpoint_url {
                // MinIO and friends need path-style addressing
                builder = builder.endpoint_url(ep).force_path_style(true);
            }
            let client = aws_sdk_s3::Client::from_conf(builder.build());
            info!(bucket=%cfg.bucket, "object_storage.init_s3");
            return Arc::new(S3ObjectStorage { client, bucket: cfg.bucket.clone() });
        }
        #[cfg(not(feature="s3"))]
        warn!("s3 feature not enabled, falling back to in-memory object storage");
    }
    info!(mode=%cfg.mode, bucket=%cfg.bucket, "object_storage.init_memory");
    Arc::new(MemoryObjectStorage::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_copy_and_list() {
        let s = MemoryObjectStorage::new();
        s.put_object("uploadables/a/icon.png", b"png".to_vec(), "image/png", "abc").await.unwrap();
        s.put_object("uploadables/b/other.png", b"x".to_vec(), "image/png", "def").await.unwrap();
        s.copy_object("uploadables/a/icon.png", "uploadables/c/icon.png").await.unwrap();
        assert_eq!(s.list_keys("uploadables/c/").await.unwrap(), vec!["uploadables/c/icon.png".to_string()]);
        assert_eq!(s.get_object("uploadables/c/icon.png").await.unwrap(), Some(b"png".to_vec()));
        assert_eq!(s.get_object("missing").await.unwrap(), None);
        assert!(s.copy_object("missing", "x").await.is_err());
    }
}
