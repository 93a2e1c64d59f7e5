//! Packed single-file entry archive and its copy-on-write transaction
//!
//! Layout of an archive file:
//!
//! ```text
//! magic "VSA\0" | version u32 LE | index length u64 LE | bincode index | member blobs
//! ```
//!
//! Each index record gives the member's offset (relative to the first blob),
//! lengths, codec and a CRC32 of the uncompressed bytes.
//!
//! [`ArchiveTransaction::begin`] unpacks the current archive into a private
//! scratch directory. Mutations touch only that directory. `commit` packs
//! the scratch area into a sibling temporary file, syncs it and renames it
//! over the archive, so readers see either the old or the new archive.
//! Dropping a transaction without committing leaves the archive untouched.
//! [`ArchiveTransaction::begin_empty`] skips the unpacking for full rebuilds.

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::config::ArchiveConfig;
use crate::error::{Result, VolsegError};
use crate::io::{FileSystemIOManager, IOManager};
use crate::utils::{calculate_checksum, format_bytes};
use bytes::Bytes;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ARCHIVE_MAGIC: [u8; 4] = *b"VSA\0";
pub const ARCHIVE_VERSION: u32 = 1;

const HEADER_LEN: u64 = 16;

/// Index record of one archive member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub key: String,
    pub offset: u64,
    pub compressed_len: u64,
    pub uncompressed_len: u64,
    pub compression: CompressionMethod,
    pub checksum: u32,
}

/// Read-only view of a committed archive.
///
/// The file handle opened by [`PackedArchive::open`] is kept, so a view
/// keeps reading the archive it opened even after a commit replaced it.
#[derive(Debug, Clone)]
pub struct PackedArchive {
    path: PathBuf,
    file: Arc<Mutex<fs::File>>,
    data_start: u64,
    members: BTreeMap<String, MemberRecord>,
}

impl PackedArchive {
    /// Open an archive and load its index
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let storage = |msg: String| VolsegError::StorageIo(format!("{}: {}", path.display(), msg));

        let mut file = fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                VolsegError::NotFound(format!("Archive {}", path.display()))
            }
            _ => storage(e.to_string()),
        })?;
        let file_len = file.metadata().await.map_err(|e| storage(e.to_string()))?.len();

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .await
            .map_err(|e| storage(format!("truncated header ({})", e)))?;
        if header[0..4] != ARCHIVE_MAGIC {
            return Err(storage("not a volseg archive".to_string()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != ARCHIVE_VERSION {
            return Err(storage(format!("unsupported archive version {}", version)));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[8..16]);
        let index_len = u64::from_le_bytes(len_bytes);
        if HEADER_LEN + index_len > file_len {
            return Err(storage(format!("index length {} exceeds file size", index_len)));
        }

        let mut index = vec![0u8; index_len as usize];
        file.read_exact(&mut index)
            .await
            .map_err(|e| storage(e.to_string()))?;
        let records: Vec<MemberRecord> = bincode::deserialize(&index)?;

        let data_start = HEADER_LEN + index_len;
        let mut members = BTreeMap::new();
        for record in records {
            if data_start + record.offset + record.compressed_len > file_len {
                return Err(storage(format!("member {} extends past end of file", record.key)));
            }
            members.insert(record.key.clone(), record);
        }

        debug!(path = %path.display(), members = members.len(), "opened archive");
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
            data_start,
            members,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains_key(key)
    }

    /// Member keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn record(&self, key: &str) -> Option<&MemberRecord> {
        self.members.get(key)
    }

    /// Read, verify and decompress one member
    pub async fn read(&self, key: &str) -> Result<Bytes> {
        let record = self
            .members
            .get(key)
            .ok_or_else(|| VolsegError::NotFound(format!("Archive member {}", key)))?;

        let mut packed = vec![0u8; record.compressed_len as usize];
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(self.data_start + record.offset)).await?;
            file.read_exact(&mut packed).await?;
        }

        let data = record
            .compression
            .codec(CompressionLevel::default())
            .decompress(&packed, record.uncompressed_len as usize)?;
        if calculate_checksum(&data) != record.checksum {
            return Err(VolsegError::StorageIo(format!(
                "Checksum mismatch for member {} of {}",
                key,
                self.path.display()
            )));
        }
        Ok(Bytes::from(data))
    }

    /// Read several members concurrently, preserving order
    pub async fn read_many(&self, keys: &[String]) -> Result<Vec<Bytes>> {
        try_join_all(keys.iter().map(|key| self.read(key))).await
    }
}

/// Pack `members` into a new archive file at `path`
async fn write_archive(
    path: &Path,
    members: &[(String, Bytes)],
    method: CompressionMethod,
    level: CompressionLevel,
) -> Result<u64> {
    let codec = method.codec(level);
    let mut records = Vec::with_capacity(members.len());
    let mut blobs = Vec::with_capacity(members.len());
    let mut offset = 0u64;
    for (key, data) in members {
        let packed = codec.compress(data)?;
        records.push(MemberRecord {
            key: key.clone(),
            offset,
            compressed_len: packed.len() as u64,
            uncompressed_len: data.len() as u64,
            compression: method,
            checksum: calculate_checksum(data),
        });
        offset += packed.len() as u64;
        blobs.push(packed);
    }
    let index = bincode::serialize(&records)?;

    let mut file = fs::File::create(path).await?;
    file.write_all(&ARCHIVE_MAGIC).await?;
    file.write_all(&ARCHIVE_VERSION.to_le_bytes()).await?;
    file.write_all(&(index.len() as u64).to_le_bytes()).await?;
    file.write_all(&index).await?;
    for blob in &blobs {
        file.write_all(blob).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(HEADER_LEN + index.len() as u64 + offset)
}

/// Staged, all-or-nothing update of one entry archive
pub struct ArchiveTransaction {
    archive_path: PathBuf,
    scratch_dir: PathBuf,
    scratch: FileSystemIOManager,
    compression: CompressionMethod,
    level: CompressionLevel,
    finished: bool,
}

impl ArchiveTransaction {
    /// Stage the current archive (if any) into a fresh scratch directory.
    ///
    /// The scratch directory is created under `config.scratch_dir`, or next
    /// to the archive when none is configured.
    pub async fn begin(archive_path: impl AsRef<Path>, config: &ArchiveConfig) -> Result<Self> {
        let txn = Self::with_scratch(archive_path.as_ref(), config).await?;
        if fs::try_exists(&txn.archive_path).await? {
            let archive = PackedArchive::open(&txn.archive_path).await?;
            for key in archive.keys() {
                let data = archive.read(key).await?;
                txn.scratch.write(key, &data).await?;
            }
            debug!(
                archive = %txn.archive_path.display(),
                members = archive.len(),
                "staged archive into scratch area"
            );
        }
        Ok(txn)
    }

    /// Start from an empty scratch area; the commit replaces every member
    /// of an existing archive without unpacking it first
    pub async fn begin_empty(archive_path: impl AsRef<Path>, config: &ArchiveConfig) -> Result<Self> {
        Self::with_scratch(archive_path.as_ref(), config).await
    }

    async fn with_scratch(archive_path: &Path, config: &ArchiveConfig) -> Result<Self> {
        let archive_path = archive_path.to_path_buf();
        let parent = archive_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let scratch_root = config.scratch_dir.clone().unwrap_or(parent);
        let stem = archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("archive");
        let scratch_dir = scratch_root.join(format!(".{}-scratch-{}", stem, Uuid::new_v4()));

        fs::create_dir_all(&scratch_dir).await.map_err(|e| {
            VolsegError::StorageIo(format!("cannot create {}: {}", scratch_dir.display(), e))
        })?;
        Ok(Self {
            scratch: FileSystemIOManager::new(&scratch_dir),
            archive_path,
            scratch_dir,
            compression: config.compression,
            level: config.level,
            finished: false,
        })
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.scratch.write(key, data).await
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        self.scratch.read(key).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        self.scratch.exists(key).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.scratch.delete(key).await
    }

    /// Drop a whole subtree, e.g. one lattice segmentation
    pub async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        self.scratch.delete_prefix(prefix).await
    }

    /// Staged keys, sorted
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.scratch.list("").await
    }

    /// Uncompressed bytes currently staged
    pub async fn staged_size(&self) -> Result<u64> {
        let keys = self.scratch.list("").await?;
        let sizes = try_join_all(keys.iter().map(|k| self.scratch.size(k))).await?;
        Ok(sizes.into_iter().map(|n| n as u64).sum())
    }

    /// Pack the scratch area and atomically replace the archive
    pub async fn commit(mut self) -> Result<PathBuf> {
        let keys = self.scratch.list("").await?;
        let values = try_join_all(keys.iter().map(|k| self.scratch.read(k))).await?;
        let members: Vec<(String, Bytes)> = keys.into_iter().zip(values).collect();

        if let Some(parent) = self.archive_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = self
            .archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("archive");
        let tmp_path = self
            .archive_path
            .with_file_name(format!("{}.tmp-{}", file_name, Uuid::new_v4()));

        let written = match write_archive(&tmp_path, &members, self.compression, self.level).await {
            Ok(n) => n,
            Err(e) => {
                remove_quietly(&tmp_path).await;
                return Err(VolsegError::StorageIo(format!(
                    "writing {} failed: {}",
                    tmp_path.display(),
                    e
                )));
            }
        };
        if let Err(e) = fs::rename(&tmp_path, &self.archive_path).await {
            remove_quietly(&tmp_path).await;
            return Err(VolsegError::StorageIo(format!(
                "replacing {} failed: {}",
                self.archive_path.display(),
                e
            )));
        }

        info!(
            archive = %self.archive_path.display(),
            members = members.len(),
            size = %format_bytes(written as usize),
            "committed archive"
        );
        self.finished = true;
        self.reclaim_scratch().await;
        Ok(self.archive_path.clone())
    }

    /// Discard staged changes
    pub async fn abort(mut self) {
        self.finished = true;
        self.reclaim_scratch().await;
        debug!(archive = %self.archive_path.display(), "aborted archive transaction");
    }

    async fn reclaim_scratch(&self) {
        if let Err(e) = fs::remove_dir_all(&self.scratch_dir).await {
            warn!(scratch = %self.scratch_dir.display(), error = %e, "failed to remove scratch area");
        }
    }
}

impl Drop for ArchiveTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.scratch_dir) {
            warn!(scratch = %self.scratch_dir.display(), error = %e, "failed to remove scratch area");
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temporary archive");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn committed(dir: &Path, members: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("data.vsa");
        let txn = ArchiveTransaction::begin(&path, &ArchiveConfig::default()).await.unwrap();
        for (key, data) in members {
            txn.put(key, data).await.unwrap();
        }
        txn.commit().await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = committed(dir.path(), &[("metadata.json", b"{}"), ("_volume_data/1/0/0/grid", &[7u8; 1000])]).await;

        let archive = PackedArchive::open(&path).await.unwrap();
        assert_eq!(archive.keys().collect::<Vec<_>>(), vec!["_volume_data/1/0/0/grid", "metadata.json"]);
        assert_eq!(&archive.read("metadata.json").await.unwrap()[..], b"{}");
        assert_eq!(archive.read("_volume_data/1/0/0/grid").await.unwrap().len(), 1000);
        assert!(matches!(archive.read("nope").await, Err(VolsegError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_begin_stages_existing_members() {
        let dir = TempDir::new().unwrap();
        let path = committed(dir.path(), &[("a/1", b"one"), ("b/1", b"two")]).await;

        let txn = ArchiveTransaction::begin(&path, &ArchiveConfig::default()).await.unwrap();
        assert_eq!(txn.keys().await.unwrap(), vec!["a/1", "b/1"]);
        assert_eq!(txn.remove_prefix("a/").await.unwrap(), 1);
        txn.put("c/1", b"three").await.unwrap();
        txn.commit().await.unwrap();

        let archive = PackedArchive::open(&path).await.unwrap();
        assert_eq!(archive.keys().collect::<Vec<_>>(), vec!["b/1", "c/1"]);
    }

    #[tokio::test]
    async fn test_begin_empty_replaces_every_member() {
        let dir = TempDir::new().unwrap();
        let scratch_root = TempDir::new().unwrap();
        let path = committed(dir.path(), &[("a/1", b"one"), ("b/1", b"two")]).await;
        let config = ArchiveConfig {
            scratch_dir: Some(scratch_root.path().to_path_buf()),
            ..Default::default()
        };

        let txn = ArchiveTransaction::begin_empty(&path, &config).await.unwrap();
        assert!(txn.scratch_dir().starts_with(scratch_root.path()));
        assert!(txn.keys().await.unwrap().is_empty());
        assert_eq!(txn.staged_size().await.unwrap(), 0);
        txn.put("c/1", b"three").await.unwrap();
        txn.put("c/2", b"four").await.unwrap();
        assert_eq!(txn.staged_size().await.unwrap(), 9);
        txn.commit().await.unwrap();

        let archive = PackedArchive::open(&path).await.unwrap();
        assert_eq!(archive.keys().collect::<Vec<_>>(), vec!["c/1", "c/2"]);
        assert_eq!(std::fs::read_dir(scratch_root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_commit_leaves_archive() {
        let dir = TempDir::new().unwrap();
        let path = committed(dir.path(), &[("a", b"original")]).await;
        let before = std::fs::read(&path).unwrap();

        let scratch = {
            let txn = ArchiveTransaction::begin(&path, &ArchiveConfig::default()).await.unwrap();
            txn.put("a", b"changed").await.unwrap();
            txn.remove("a").await.unwrap();
            txn.scratch_dir().to_path_buf()
        };

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(!scratch.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_view_survives_commit() {
        let dir = TempDir::new().unwrap();
        let path = committed(dir.path(), &[("a", b"old")]).await;
        let before = PackedArchive::open(&path).await.unwrap();

        let txn = ArchiveTransaction::begin(&path, &ArchiveConfig::default()).await.unwrap();
        txn.put("a", b"new contents").await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(&before.read("a").await.unwrap()[..], b"old");
        let after = PackedArchive::open(&path).await.unwrap();
        assert_eq!(&after.read("a").await.unwrap()[..], b"new contents");
    }

    #[tokio::test]
    async fn test_abort_leaves_no_archive_when_none_existed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.vsa");
        let txn = ArchiveTransaction::begin(&path, &ArchiveConfig::default()).await.unwrap();
        txn.put("x", b"1").await.unwrap();
        txn.abort().await;
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_foreign_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.vsa");
        std::fs::write(&path, b"PK\x03\x04 not ours at all").unwrap();
        assert!(matches!(
            PackedArchive::open(&path).await,
            Err(VolsegError::StorageIo(_))
        ));

        let path = committed(dir.path(), &[("k", b"payload payload payload")]).await;
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        let archive = PackedArchive::open(&path).await.unwrap();
        assert!(archive.read("k").await.is_err());
    }

    #[tokio::test]
    async fn test_identical_input_gives_identical_archives() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let members: [(&str, &[u8]); 2] = [("x/1", b"first"), ("x/2", &[3u8; 512])];
        let pa = committed(a.path(), &members).await;
        let pb = committed(b.path(), &members).await;
        assert_eq!(std::fs::read(pa).unwrap(), std::fs::read(pb).unwrap());
    }

    #[tokio::test]
    async fn test_deflate_members() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.vsa");
        let config = ArchiveConfig {
            compression: CompressionMethod::Deflate,
            ..Default::default()
        };
        let txn = ArchiveTransaction::begin(&path, &config).await.unwrap();
        txn.put("k", &[9u8; 2048]).await.unwrap();
        txn.commit().await.unwrap();

        let archive = PackedArchive::open(&path).await.unwrap();
        let record = archive.record("k").unwrap();
        assert_eq!(record.compression, CompressionMethod::Deflate);
        assert!(record.compressed_len < 2048);
        assert_eq!(archive.read("k").await.unwrap().len(), 2048);
    }
}
