// ============================================================================
// OBJECT STORAGE
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Flat key/value blob storage used for snapshot parts and metadata.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file; returns the number of bytes stored.
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64>;
    /// Download `key` into `dest`; returns the number of bytes written.
    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64>;
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    /// `Ok(None)` when the key does not exist.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;

    fn describe(&self) -> String;
}

// --- Local directory ---

/// Object store backed by a directory tree; keys are relative paths.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            anyhow::bail!("invalid object key {:?}", key);
        }
        Ok(self.root.join(rel))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        let dest = self.path_for(key)?;
        Self::ensure_parent(&dest).await?;
        let n = tokio::fs::copy(path, &dest)
            .await
            .with_context(|| format!("storing {} as {}", path.display(), key))?;
        Ok(n)
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let src = self.path_for(key)?;
        Self::ensure_parent(dest).await?;
        let n = tokio::fs::copy(&src, dest)
            .await
            .with_context(|| format!("fetching {}", key))?;
        Ok(n)
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let dest = self.path_for(key)?;
        Self::ensure_parent(&dest).await?;
        tokio::fs::write(&dest, bytes)
            .await
            .with_context(|| format!("writing {}", key))?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let src = self.path_for(key)?;
        match tokio::fs::read(&src).await {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", key)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&root)?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)?).await?)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

// --- S3-compatible (R2, MinIO, AWS) ---

#[derive(Clone, Debug, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()));
        if let Some(url) = &settings.endpoint_url {
            loader = loader.endpoint_url(url);
        }
        if let (Some(key), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "spotguard",
            ));
        }
        let sdk_config = loader.load().await;
        // Custom endpoints (R2, MinIO) only support path-style addressing.
        let conf = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.endpoint_url.is_some())
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(conf),
            bucket: settings.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("PUT s3://{}/{}", self.bucket, key))?;
        Ok(size)
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("GET s3://{}/{}", self.bucket, key))?;
        let mut reader = resp.body.into_async_read();
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;
        let n = tokio::io::copy(&mut reader, &mut file).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(n)
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(bytes.into())
            .send()
            .await
            .with_context(|| format!("PUT s3://{}/{}", self.bucket, key))?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.as_service_error().map_or(false, |se| se.is_no_such_key()) => {
                return Ok(None)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("GET s3://{}/{}", self.bucket, key))
            }
        };
        let data = resp.body.collect().await?.into_bytes();
        Ok(Some(data.to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .with_context(|| format!("LIST s3://{}/{}", self.bucket, prefix))?;
            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );
            match resp.next_continuation_token() {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("DELETE s3://{}/{}", self.bucket, key))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map_or(false, |se| se.is_not_found()) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("HEAD s3://{}/{}", self.bucket, key)),
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
