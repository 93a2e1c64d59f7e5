//! File-system entry database
//!
//! ```text
//! {root}/{namespace}/{id}/data.vsa                      packed entry archive
//! {root}/{namespace}/{id}/geometric_segmentation.json   primitive segmentations
//! ```
//!
//! Parsed metadata is cached per entry. Writers go through
//! [`FileSystemDb::begin_update`] and must call [`FileSystemDb::invalidate`]
//! after committing; the helpers in this module do so themselves.

use crate::access::EntryReader;
use crate::archive::{ArchiveTransaction, PackedArchive};
use crate::config::ArchiveConfig;
use crate::error::{Result, VolsegError};
use crate::layout::{lattice_prefix, mesh_prefix, volume_prefix, StoreKey};
use crate::metadata::EntryMetadata;
use crate::primitives::{append_segmentation, GeometricSegmentation};
use crate::types::EntryId;
use crate::utils::matches_keyword;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

pub const ARCHIVE_FILE_NAME: &str = "data.vsa";
pub const GEOMETRIC_SEGMENTATION_FILE_NAME: &str = "geometric_segmentation.json";

/// Segmentation kinds an entry can hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SegmentationRef {
    Lattice(u32),
    Mesh,
    Primitive(String),
}

#[derive(Debug)]
pub struct FileSystemDb {
    root: PathBuf,
    archive_config: ArchiveConfig,
    metadata_cache: RwLock<HashMap<EntryId, Arc<EntryMetadata>>>,
}

impl FileSystemDb {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            archive_config: ArchiveConfig::default(),
            metadata_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_archive_config(mut self, config: ArchiveConfig) -> Self {
        self.archive_config = config;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of an entry; namespace and id must be plain names
    pub fn entry_dir(&self, entry: &EntryId) -> Result<PathBuf> {
        for part in [&entry.namespace, &entry.id] {
            let plain = !part.is_empty()
                && part != "."
                && part != ".."
                && !part.contains(['/', '\\']);
            if !plain {
                return Err(VolsegError::InvalidInput(format!("Invalid entry id {}", entry)));
            }
        }
        Ok(self.root.join(&entry.namespace).join(&entry.id))
    }

    pub fn archive_path(&self, entry: &EntryId) -> Result<PathBuf> {
        Ok(self.entry_dir(entry)?.join(ARCHIVE_FILE_NAME))
    }

    pub async fn contains(&self, entry: &EntryId) -> Result<bool> {
        Ok(fs::try_exists(self.archive_path(entry)?).await?)
    }

    /// Namespaces with at least one directory, sorted
    pub async fn list_sources(&self) -> Result<Vec<String>> {
        subdirectories(&self.root).await
    }

    /// Committed entries of one namespace, sorted, at most `limit`
    pub async fn list_entries(&self, source: &str, limit: usize) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        for id in subdirectories(&self.root.join(source)).await? {
            if entries.len() >= limit {
                break;
            }
            if fs::try_exists(self.root.join(source).join(&id).join(ARCHIVE_FILE_NAME)).await? {
                entries.push(id);
            }
        }
        Ok(entries)
    }

    /// Entries across all namespaces whose id contains `keyword`; at most
    /// `limit` in total, filled namespace by namespace
    pub async fn search_entries(&self, limit: usize, keyword: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let mut found = BTreeMap::new();
        let mut remaining = limit;
        for source in self.list_sources().await? {
            if remaining == 0 {
                break;
            }
            let ids: Vec<String> = self
                .list_entries(&source, usize::MAX)
                .await?
                .into_iter()
                .filter(|id| matches_keyword(id, keyword))
                .take(remaining)
                .collect();
            remaining -= ids.len();
            if !ids.is_empty() {
                found.insert(source, ids);
            }
        }
        Ok(found)
    }

    /// Metadata of a committed entry, cached after the first read
    pub async fn read_metadata(&self, entry: &EntryId) -> Result<Arc<EntryMetadata>> {
        if let Some(metadata) = self.metadata_cache.read().get(entry) {
            return Ok(Arc::clone(metadata));
        }

        let archive = self.open_archive(entry).await?;
        let bytes = archive.read(&StoreKey::Metadata.path()).await?;
        let metadata = Arc::new(EntryMetadata::from_json(&bytes)?);
        self.metadata_cache
            .write()
            .insert(entry.clone(), Arc::clone(&metadata));
        debug!(%entry, "cached entry metadata");
        Ok(metadata)
    }

    async fn open_archive(&self, entry: &EntryId) -> Result<PackedArchive> {
        PackedArchive::open(self.archive_path(entry)?)
            .await
            .map_err(|e| match e {
                VolsegError::NotFound(_) => VolsegError::NotFound(format!("Entry {}", entry)),
                other => other,
            })
    }

    /// Reader over the committed archive of an entry
    pub async fn open_entry(&self, entry: &EntryId) -> Result<EntryReader> {
        let metadata = self.read_metadata(entry).await?;
        EntryReader::open_with_metadata(self.archive_path(entry)?, metadata)
            .await
            .map_err(|e| match e {
                VolsegError::NotFound(_) => VolsegError::NotFound(format!("Entry {}", entry)),
                other => other,
            })
    }

    /// Stage an update of an entry archive (created on commit if absent)
    pub async fn begin_update(&self, entry: &EntryId) -> Result<ArchiveTransaction> {
        let dir = self.entry_dir(entry)?;
        fs::create_dir_all(&dir).await?;
        ArchiveTransaction::begin(dir.join(ARCHIVE_FILE_NAME), &self.archive_config).await
    }

    /// Stage a full rebuild of an entry with its own packing options; the
    /// current archive is not unpacked and is replaced on commit
    pub async fn begin_rebuild(&self, entry: &EntryId, config: &ArchiveConfig) -> Result<ArchiveTransaction> {
        let dir = self.entry_dir(entry)?;
        fs::create_dir_all(&dir).await?;
        ArchiveTransaction::begin_empty(dir.join(ARCHIVE_FILE_NAME), config).await
    }

    /// Forget cached metadata of an entry
    pub fn invalidate(&self, entry: &EntryId) {
        self.metadata_cache.write().remove(entry);
    }

    /// Delete an entry with everything stored for it
    pub async fn remove_entry(&self, entry: &EntryId) -> Result<()> {
        let dir = self.entry_dir(entry)?;
        if !fs::try_exists(&dir).await? {
            return Err(VolsegError::NotFound(format!("Entry {}", entry)));
        }
        fs::remove_dir_all(&dir).await?;
        self.invalidate(entry);
        info!(%entry, "removed entry");
        Ok(())
    }

    /// Drop the volume subtree of an entry
    pub async fn remove_volume(&self, entry: &EntryId) -> Result<()> {
        self.edit_archive(entry, |metadata| {
            metadata.volume.take().map(|_| volume_prefix()).ok_or_else(|| {
                VolsegError::NotFound(format!("Entry {} has no volume", entry))
            })
        })
        .await
    }

    /// Drop one segmentation of an entry
    pub async fn remove_segmentation(&self, entry: &EntryId, segmentation: &SegmentationRef) -> Result<()> {
        match segmentation {
            SegmentationRef::Lattice(id) => {
                let id = *id;
                self.edit_archive(entry, |metadata| {
                    metadata.lattices.remove(&id).map(|_| lattice_prefix(id)).ok_or_else(|| {
                        VolsegError::NotFound(format!("Entry {} has no lattice {}", entry, id))
                    })
                })
                .await
            }
            SegmentationRef::Mesh => {
                self.edit_archive(entry, |metadata| {
                    metadata.meshes.take().map(|_| mesh_prefix()).ok_or_else(|| {
                        VolsegError::NotFound(format!("Entry {} has no mesh segmentation", entry))
                    })
                })
                .await
            }
            SegmentationRef::Primitive(id) => {
                let mut list = self.read_geometric_segmentations(entry).await?;
                let before = list.len();
                list.retain(|s| &s.segmentation_id != id);
                if list.len() == before {
                    return Err(VolsegError::NotFound(format!(
                        "Entry {} has no geometric segmentation {}",
                        entry, id
                    )));
                }
                self.write_geometric_segmentations(entry, &list).await
            }
        }
    }

    /// Remove a subtree chosen by `edit` and rewrite metadata in one commit
    async fn edit_archive<F>(&self, entry: &EntryId, edit: F) -> Result<()>
    where
        F: FnOnce(&mut EntryMetadata) -> Result<String>,
    {
        let mut metadata = (*self.read_metadata(entry).await?).clone();
        let prefix = edit(&mut metadata)?;
        metadata.touch();
        metadata.validate()?;

        let txn = self.begin_update(entry).await?;
        let removed = txn.remove_prefix(&prefix).await?;
        txn.put(&StoreKey::Metadata.path(), &metadata.to_json()?).await?;
        txn.commit().await?;
        self.invalidate(entry);
        info!(%entry, %prefix, removed, "removed subtree");
        Ok(())
    }

    fn geometric_path(&self, entry: &EntryId) -> Result<PathBuf> {
        Ok(self.entry_dir(entry)?.join(GEOMETRIC_SEGMENTATION_FILE_NAME))
    }

    /// All primitive segmentations of an entry; empty if none were added
    pub async fn read_geometric_segmentations(&self, entry: &EntryId) -> Result<Vec<GeometricSegmentation>> {
        let path = self.geometric_path(entry)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(VolsegError::Io(e)),
        }
    }

    pub async fn get_geometric_segmentation(&self, entry: &EntryId, segmentation_id: &str) -> Result<GeometricSegmentation> {
        self.read_geometric_segmentations(entry)
            .await?
            .into_iter()
            .find(|s| s.segmentation_id == segmentation_id)
            .ok_or_else(|| {
                VolsegError::NotFound(format!(
                    "Entry {} has no geometric segmentation {}",
                    entry, segmentation_id
                ))
            })
    }

    /// Append one primitive segmentation; ids must be new
    pub async fn append_geometric_segmentation(&self, entry: &EntryId, segmentation: GeometricSegmentation) -> Result<()> {
        let mut list = self.read_geometric_segmentations(entry).await?;
        let id = segmentation.segmentation_id.clone();
        append_segmentation(&mut list, segmentation)?;
        self.write_geometric_segmentations(entry, &list).await?;
        debug!(%entry, segmentation = %id, "appended geometric segmentation");
        Ok(())
    }

    /// Write-new-then-rename, like archive commits
    async fn write_geometric_segmentations(&self, entry: &EntryId, list: &[GeometricSegmentation]) -> Result<()> {
        let path = self.geometric_path(entry)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_file_name(format!("{}.tmp-{}", GEOMETRIC_SEGMENTATION_FILE_NAME, Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec_pretty(list)?).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(VolsegError::StorageIo(format!("replacing {} failed: {}", path.display(), e)));
        }
        Ok(())
    }
}

async fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !fs::try_exists(dir).await? {
        return Ok(names);
    }
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::ShapePrimitive;
    use tempfile::TempDir;

    async fn commit_empty_entry(db: &FileSystemDb, entry: &EntryId) {
        let txn = db.begin_update(entry).await.unwrap();
        let metadata = EntryMetadata::new(entry.clone());
        txn.put(&StoreKey::Metadata.path(), &metadata.to_json().unwrap())
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_listing() {
        let dir = TempDir::new().unwrap();
        let db = FileSystemDb::new(dir.path());
        for (ns, id) in [("emdb", "emd-1"), ("emdb", "emd-2"), ("empiar", "empiar-10070")] {
            commit_empty_entry(&db, &EntryId::new(ns, id)).await;
        }
        // a directory without an archive is not an entry
        std::fs::create_dir_all(dir.path().join("emdb/unfinished")).unwrap();

        assert_eq!(db.list_sources().await.unwrap(), vec!["emdb", "empiar"]);
        assert_eq!(db.list_entries("emdb", 10).await.unwrap(), vec!["emd-1", "emd-2"]);
        assert_eq!(db.list_entries("emdb", 1).await.unwrap(), vec!["emd-1"]);
        assert!(db.list_entries("pdbe", 10).await.unwrap().is_empty());

        let found = db.search_entries(10, "emd").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["emdb"], vec!["emd-1", "emd-2"]);
        let found = db.search_entries(2, "").await.unwrap();
        assert_eq!(found.values().map(Vec::len).sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn test_metadata_cache_and_invalidation() {
        let dir = TempDir::new().unwrap();
        let db = FileSystemDb::new(dir.path());
        let entry = EntryId::new("emdb", "emd-1");
        assert!(matches!(db.read_metadata(&entry).await, Err(VolsegError::NotFound(_))));

        commit_empty_entry(&db, &entry).await;
        let first = db.read_metadata(&entry).await.unwrap();
        let second = db.read_metadata(&entry).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        db.invalidate(&entry);
        let third = db.read_metadata(&entry).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let db = FileSystemDb::new(dir.path());
        assert!(db.entry_dir(&EntryId::new("..", "x")).is_err());
        assert!(db.entry_dir(&EntryId::new("emdb", "a/b")).is_err());
        assert!(db.entry_dir(&EntryId::new("emdb", "")).is_err());
    }

    #[tokio::test]
    async fn test_geometric_segmentations() {
        let dir = TempDir::new().unwrap();
        let db = FileSystemDb::new(dir.path());
        let entry = EntryId::new("emdb", "emd-1");
        assert!(db.read_geometric_segmentations(&entry).await.unwrap().is_empty());

        let seg = GeometricSegmentation::new("spheres").with_primitives(
            0,
            vec![ShapePrimitive::Sphere {
                id: 1,
                center: [1.0, 2.0, 3.0],
                radius: 4.0,
            }],
        );
        db.append_geometric_segmentation(&entry, seg.clone()).await.unwrap();
        db.append_geometric_segmentation(&entry, GeometricSegmentation::new("empty"))
            .await
            .unwrap();
        assert!(matches!(
            db.append_geometric_segmentation(&entry, seg.clone()).await,
            Err(VolsegError::AlreadyExists(_))
        ));

        assert_eq!(db.get_geometric_segmentation(&entry, "spheres").await.unwrap(), seg);
        db.remove_segmentation(&entry, &SegmentationRef::Primitive("spheres".into()))
            .await
            .unwrap();
        assert!(matches!(
            db.get_geometric_segmentation(&entry, "spheres").await,
            Err(VolsegError::NotFound(_))
        ));
        assert_eq!(db.read_geometric_segmentations(&entry).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let dir = TempDir::new().unwrap();
        let db = FileSystemDb::new(dir.path());
        let entry = EntryId::new("emdb", "emd-9");
        commit_empty_entry(&db, &entry).await;
        assert!(db.contains(&entry).await.unwrap());
        db.remove_entry(&entry).await.unwrap();
        assert!(!db.contains(&entry).await.unwrap());
        assert!(db.remove_entry(&entry).await.is_err());
    }
}
