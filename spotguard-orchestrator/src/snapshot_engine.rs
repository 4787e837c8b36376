// ============================================================================
// SNAPSHOT / RESTORE ENGINE
// ============================================================================
//
// create:  node workspace -> tar -> N byte ranges -> gzip in parallel
//          -> N concurrent uploads -> metadata.json
// restore: metadata.json -> N concurrent downloads -> gunzip + verify
//          -> ordered concat + verify -> extract on node
//
// Any failing part fails the whole operation. Scratch files live in a
// temporary directory removed on every exit path.

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use spotguard_common::{
    compression_ratio, RestoreInfo, SnapshotMetadata, SnapshotPart, DEFAULT_SNAPSHOT_PARTS,
};

use crate::node_transport::NodeTransport;
use crate::object_store::ObjectStore;

const CODEC: &str = "gzip";
const IO_CHUNK: usize = 256 * 1024;

#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    pub num_parts: usize,
    pub prefix: String,
    pub compression_level: u32,
    /// Concurrent part uploads/downloads.
    pub max_parallel_transfers: usize,
    /// Parent of the per-operation scratch directory (system temp dir when unset).
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            num_parts: DEFAULT_SNAPSHOT_PARTS,
            prefix: "snapshots".to_string(),
            compression_level: 1,
            max_parallel_transfers: DEFAULT_SNAPSHOT_PARTS,
            scratch_dir: None,
        }
    }
}

/// `num_parts` contiguous `(offset, len)` ranges covering `total` bytes.
/// Leading ranges absorb the remainder; trailing ones may be empty.
pub fn split_ranges(total: u64, num_parts: usize) -> Vec<(u64, u64)> {
    let n = num_parts.max(1) as u64;
    let base = total / n;
    let rem = total % n;
    let mut offset = 0;
    (0..n)
        .map(|i| {
            let len = base + u64::from(i < rem);
            let r = (offset, len);
            offset += len;
            r
        })
        .collect()
}

pub fn snapshot_id_for(instance_id: &str, at: chrono::DateTime<Utc>) -> String {
    format!("{}-{}", instance_id, at.format("%Y%m%d%H%M%S"))
}

pub struct SnapshotEngine {
    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn NodeTransport>,
    config: SnapshotConfig,
    /// Ids of snapshots still being uploaded, so two snapshots in the same second differ.
    reserved_ids: Mutex<HashSet<String>>,
}

impl SnapshotEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn NodeTransport>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            reserved_ids: Mutex::new(HashSet::new()),
        }
    }

    fn part_key(&self, snapshot_id: &str, index: usize) -> String {
        format!("{}/{}/part-{:02}.gz", self.config.prefix, snapshot_id, index)
    }

    fn metadata_key(&self, snapshot_id: &str) -> String {
        format!("{}/{}/metadata.json", self.config.prefix, snapshot_id)
    }

    fn scratch(&self) -> Result<tempfile::TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("spotguard-snapshot-");
            b
        };
        let dir = match &self.config.scratch_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn allocate_id(&self, instance_id: &str) -> Result<String> {
        let base = snapshot_id_for(instance_id, Utc::now());
        let mut reserved = self.reserved_ids.lock().await;
        let mut candidate = base.clone();
        let mut suffix = 0u32;
        while reserved.contains(&candidate)
            || self.store.exists(&self.metadata_key(&candidate)).await?
        {
            suffix += 1;
            candidate = format!("{}-{}", base, suffix);
        }
        reserved.insert(candidate.clone());
        Ok(candidate)
    }

    async fn release_id(&self, snapshot_id: &str) {
        self.reserved_ids.lock().await.remove(snapshot_id);
    }

    pub async fn create_snapshot(
        &self,
        instance_id: &str,
        host: &str,
        port: u16,
        workspace_path: &str,
        name: Option<&str>,
    ) -> Result<SnapshotMetadata> {
        let started = Instant::now();
        let scratch = self.scratch()?;
        let archive = scratch.path().join("workspace.tar");

        tracing::info!(
            "📸 [snapshot] {} archiving {}:{}{}",
            instance_id,
            host,
            port,
            workspace_path
        );
        let size_original = self
            .transport
            .pull_archive(host, port, workspace_path, &archive)
            .await
            .with_context(|| format!("archiving workspace of {}", instance_id))?;

        let ranges = split_ranges(size_original, self.config.num_parts);
        let level = self.config.compression_level;
        let compressions = ranges.iter().enumerate().map(|(index, &(offset, len))| {
            let archive = archive.clone();
            let out = scratch.path().join(format!("part-{:02}.gz", index));
            tokio::task::spawn_blocking(move || {
                compress_range(&archive, offset, len, &out, level)
                    .map(|(size_compressed, sha256)| (index, len, size_compressed, sha256, out))
            })
        });
        let whole_hash = {
            let archive = archive.clone();
            tokio::task::spawn_blocking(move || sha256_file(&archive))
        };
        let (compressed, whole) = tokio::join!(
            futures_util::future::join_all(compressions),
            whole_hash
        );
        let archive_sha = whole??;
        let mut parts = Vec::with_capacity(compressed.len());
        for res in compressed {
            let (index, len, size_compressed, sha256, path) =
                res?.context("compressing snapshot part")?;
            parts.push((
                SnapshotPart {
                    index,
                    key: String::new(),
                    size_original: len,
                    size_compressed,
                    sha256,
                },
                path,
            ));
        }

        let snapshot_id = self.allocate_id(instance_id).await?;
        let committed = async {
            let parts: Vec<(SnapshotPart, PathBuf)> = parts
                .into_iter()
                .map(|(mut part, path)| {
                    part.key = self.part_key(&snapshot_id, part.index);
                    (part, path)
                })
                .collect();

            let uploads: Vec<Result<String>> = stream::iter(parts.clone())
                .map(|(part, path)| {
                    let store = self.store.clone();
                    async move {
                        let n = store.put_file(&part.key, &path).await?;
                        if n != part.size_compressed {
                            anyhow::bail!(
                                "uploaded {} of {} bytes for {}",
                                n,
                                part.size_compressed,
                                part.key
                            );
                        }
                        Ok::<String, anyhow::Error>(part.key)
                    }
                })
                .buffer_unordered(self.config.max_parallel_transfers.max(1))
                .collect()
                .await;
            if let Some(err) = uploads.iter().find_map(|r| r.as_ref().err()) {
                let msg = format!("{:#}", err);
                self.remove_keys(uploads.iter().filter_map(|r| r.as_ref().ok().cloned()).collect())
                    .await;
                anyhow::bail!("snapshot upload failed for {}: {}", instance_id, msg);
            }

            let parts: Vec<SnapshotPart> = parts.into_iter().map(|(p, _)| p).collect();
            let size_compressed: u64 = parts.iter().map(|p| p.size_compressed).sum();
            let meta = SnapshotMetadata {
                snapshot_id: snapshot_id.clone(),
                instance_id: instance_id.to_string(),
                name: name.map(str::to_string),
                created_at: Utc::now(),
                workspace_path: workspace_path.to_string(),
                size_original,
                size_compressed,
                compression_ratio: compression_ratio(size_original, size_compressed),
                num_parts: parts.len(),
                codec: CODEC.to_string(),
                sha256: archive_sha,
                r2_path: format!(
                    "{}/{}/{}",
                    self.store.describe(),
                    self.config.prefix,
                    snapshot_id
                ),
                parts,
            };
            let body = serde_json::to_vec_pretty(&meta)?;
            if let Err(e) = self.store.put_bytes(&self.metadata_key(&snapshot_id), body).await {
                self.remove_keys(meta.parts.iter().map(|p| p.key.clone()).collect())
                    .await;
                return Err(e).context("writing snapshot metadata");
            }
            Ok::<SnapshotMetadata, anyhow::Error>(meta)
        }
        .await;
        // From here on the metadata object itself guards the id.
        self.release_id(&snapshot_id).await;
        let meta = committed?;

        tracing::info!(
            "✅ [snapshot] {} done: {} -> {} bytes (x{:.2}) in {:.1}s",
            snapshot_id,
            meta.size_original,
            meta.size_compressed,
            meta.compression_ratio,
            started.elapsed().as_secs_f64()
        );
        Ok(meta)
    }

    pub async fn get_metadata(&self, snapshot_id: &str) -> Result<Option<SnapshotMetadata>> {
        let Some(bytes) = self.store.get_bytes(&self.metadata_key(snapshot_id)).await? else {
            return Ok(None);
        };
        let meta = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing metadata of {}", snapshot_id))?;
        Ok(Some(meta))
    }

    pub async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        host: &str,
        port: u16,
        workspace_path: &str,
    ) -> Result<RestoreInfo> {
        let started = Instant::now();
        let meta = self
            .get_metadata(snapshot_id)
            .await?
            .with_context(|| format!("snapshot {} not found", snapshot_id))?;
        if meta.parts.len() != meta.num_parts {
            anyhow::bail!(
                "snapshot {} is incomplete: {} of {} parts listed",
                snapshot_id,
                meta.parts.len(),
                meta.num_parts
            );
        }
        let scratch = self.scratch()?;
        tracing::info!(
            "📦 [restore] {} -> {}:{}{} ({} parts)",
            snapshot_id,
            host,
            port,
            workspace_path,
            meta.num_parts
        );

        let downloads: Vec<Result<()>> = stream::iter(meta.parts.clone())
            .map(|part| {
                let store = self.store.clone();
                let dest = scratch.path().join(format!("part-{:02}.gz", part.index));
                async move {
                    let n = store.get_file(&part.key, &dest).await?;
                    if n != part.size_compressed {
                        anyhow::bail!(
                            "restore verification failed: {} is {} bytes, expected {}",
                            part.key,
                            n,
                            part.size_compressed
                        );
                    }
                    Ok::<(), anyhow::Error>(())
                }
            })
            .buffer_unordered(self.config.max_parallel_transfers.max(1))
            .collect()
            .await;
        for res in downloads {
            res?;
        }

        let decompressions = meta.parts.iter().map(|part| {
            let src = scratch.path().join(format!("part-{:02}.gz", part.index));
            let dst = scratch.path().join(format!("part-{:02}.raw", part.index));
            let part = part.clone();
            tokio::task::spawn_blocking(move || -> Result<PathBuf> {
                let (size, sha) = decompress_part(&src, &dst).with_context(|| {
                    format!("restore verification failed: part {} is unreadable", part.index)
                })?;
                if size != part.size_original || sha != part.sha256 {
                    anyhow::bail!(
                        "restore verification failed: part {} checksum mismatch",
                        part.index
                    );
                }
                Ok(dst)
            })
        });
        let mut raw_parts = Vec::with_capacity(meta.num_parts);
        for res in futures_util::future::join_all(decompressions).await {
            raw_parts.push(res??);
        }

        let archive = scratch.path().join("workspace.tar");
        let expected = meta.sha256.clone();
        let archive_out = archive.clone();
        let bytes_restored = tokio::task::spawn_blocking(move || -> Result<u64> {
            let (size, sha) = concat_parts(&raw_parts, &archive_out)?;
            if sha != expected {
                anyhow::bail!("restore verification failed: archive checksum mismatch");
            }
            Ok(size)
        })
        .await??;

        self.transport
            .push_archive(host, port, workspace_path, &archive)
            .await
            .with_context(|| format!("extracting {} on {}:{}", snapshot_id, host, port))?;

        let info = RestoreInfo {
            snapshot_id: snapshot_id.to_string(),
            host: host.to_string(),
            port,
            workspace_path: workspace_path.to_string(),
            bytes_restored,
            num_parts: meta.num_parts,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            "✅ [restore] {} restored ({} bytes in {:.1}s)",
            snapshot_id,
            info.bytes_restored,
            info.duration_secs
        );
        Ok(info)
    }

    /// Snapshots newest first, optionally only those of one instance.
    pub async fn list_snapshots(&self, instance_id: Option<&str>) -> Result<Vec<SnapshotMetadata>> {
        let keys = self.store.list(&format!("{}/", self.config.prefix)).await?;
        let mut out = Vec::new();
        for key in keys.iter().filter(|k| k.ends_with("/metadata.json")) {
            let Some(bytes) = self.store.get_bytes(key).await? else {
                continue;
            };
            match serde_json::from_slice::<SnapshotMetadata>(&bytes) {
                Ok(meta) if instance_id.map_or(true, |i| meta.instance_id == i) => out.push(meta),
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️  [snapshot] unreadable metadata {}: {}", key, e),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub async fn latest_snapshot(&self, instance_id: &str) -> Result<Option<SnapshotMetadata>> {
        Ok(self.list_snapshots(Some(instance_id)).await?.into_iter().next())
    }

    /// Remove every object of a snapshot. Returns false when nothing existed.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        let keys = self
            .store
            .list(&format!("{}/{}/", self.config.prefix, snapshot_id))
            .await?;
        if keys.is_empty() {
            return Ok(false);
        }
        // Metadata first so a half-deleted snapshot is never listed.
        let meta_key = self.metadata_key(snapshot_id);
        self.store.delete(&meta_key).await?;
        for key in keys.iter().filter(|k| **k != meta_key) {
            self.store.delete(key).await?;
        }
        tracing::info!("🗑️ [snapshot] deleted {} ({} objects)", snapshot_id, keys.len());
        Ok(true)
    }

    async fn remove_keys(&self, keys: Vec<String>) {
        for key in keys {
            if let Err(e) = self.store.delete(&key).await {
                tracing::warn!("⚠️  [snapshot] cleanup of {} failed: {:?}", key, e);
            }
        }
    }
}

fn hex_digest(hasher: Sha256) -> String {
    hex::encode(hasher.finalize())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(hasher))
}

/// Gzip `len` bytes of `archive` starting at `offset` into `out`.
/// Returns the compressed size and the SHA-256 of the raw range.
fn compress_range(archive: &Path, offset: u64, len: u64, out: &Path, level: u32) -> Result<(u64, String)> {
    let mut file = File::open(archive)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = file.take(len);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(out)?), Compression::new(level));
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK];
    let mut read_total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
        read_total += n as u64;
    }
    if read_total != len {
        anyhow::bail!("archive shrank while splitting: read {} of {} bytes", read_total, len);
    }
    let writer = encoder.finish()?;
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing part: {}", e.error()))?
        .sync_all()?;
    Ok((std::fs::metadata(out)?.len(), hex_digest(hasher)))
}

/// Gunzip `src` into `dst`; returns the raw size and its SHA-256.
fn decompress_part(src: &Path, dst: &Path) -> Result<(u64, String)> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut out = BufWriter::new(File::create(dst)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    loop {
        let n = decoder
            .read(&mut buf)
            .context("restore verification failed: corrupt part")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
    out.flush()?;
    Ok((total, hex_digest(hasher)))
}

/// Concatenate raw parts in order into `dst`; returns total size and SHA-256.
fn concat_parts(parts: &[PathBuf], dst: &Path) -> Result<(u64, String)> {
    let mut out = BufWriter::new(File::create(dst)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    for part in parts {
        let mut reader = BufReader::new(File::open(part)?);
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
    out.flush()?;
    Ok((total, hex_digest(hasher)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_everything_once() {
        let r = split_ranges(100, 32);
        assert_eq!(r.len(), 32);
        assert_eq!(r.iter().map(|(_, l)| l).sum::<u64>(), 100);
        assert_eq!(r[0], (0, 4));
        assert_eq!(r[3], (12, 4));
        assert_eq!(r[4], (16, 3));
        for w in r.windows(2) {
            assert_eq!(w[0].0 + w[0].1, w[1].0);
        }
    }

    #[test]
    fn tiny_archives_leave_empty_tail_ranges() {
        let r = split_ranges(3, 32);
        assert_eq!(r.len(), 32);
        assert_eq!(r[2], (2, 1));
        assert_eq!(r[3], (3, 0));
    }

    #[test]
    fn snapshot_ids_embed_timestamp() {
        let at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(snapshot_id_for("inst-9", at), "inst-9-20260304050607");
    }

    #[tokio::test]
    async fn reserved_ids_are_released_after_create() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("f.txt"), b"data").unwrap();
        let engine = SnapshotEngine::new(
            Arc::new(crate::object_store::LocalObjectStore::new(dir.path().join("bucket"))),
            Arc::new(crate::node_transport::LocalTransport),
            SnapshotConfig {
                num_parts: 2,
                scratch_dir: Some(dir.path().join("scratch")),
                ..Default::default()
            },
        );
        let ws = ws.to_str().unwrap();
        let first = engine.create_snapshot("i", "h", 22, ws, None).await.unwrap();
        let second = engine.create_snapshot("i", "h", 22, ws, None).await.unwrap();
        assert_ne!(first.snapshot_id, second.snapshot_id);
        assert!(engine.reserved_ids.lock().await.is_empty());

        assert!(engine.create_snapshot("i", "h", 22, "/no/such/dir", None).await.is_err());
        assert!(engine.reserved_ids.lock().await.is_empty());
    }

    #[test]
    fn compress_then_decompress_range() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let gz = dir.path().join("p.gz");
        let (compressed, sha) = compress_range(&src, 1000, 5000, &gz, 1).unwrap();
        assert!(compressed > 0);

        let raw = dir.path().join("p.raw");
        let (size, sha2) = decompress_part(&gz, &raw).unwrap();
        assert_eq!(size, 5000);
        assert_eq!(sha, sha2);
        assert_eq!(std::fs::read(&raw).unwrap(), &data[1000..6000]);
    }
}
