//! Transport-agnostic query service
//!
//! A [`VolumeServer`] answers slice and mesh queries against a
//! [`FileSystemDb`]. Every query runs under the configured deadline and
//! fails with [`VolsegError::Timeout`] when it is exceeded.

use crate::access::EntryReader;
use crate::config::ServerConfig;
use crate::db::FileSystemDb;
use crate::encoding::{BincodeSliceEncoder, SliceData, SliceEncoder};
use crate::error::{Result, VolsegError};
use crate::metadata::EntryMetadata;
use crate::primitives::GeometricSegmentation;
use crate::selector::{ResolutionSelector, Selection};
use crate::types::{DataKind, EntryId, IndexBox, Level, LevelBox, PhysicalBox};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Slice query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub source: String,
    pub entry_id: String,
    pub data_kind: DataKind,
    /// Lattice to read; the first available one if absent or unknown
    #[serde(default)]
    pub segmentation_id: Option<u32>,
    pub time: u32,
    pub channel_id: u32,
    /// Physical query box; the whole grid if absent
    #[serde(default, rename = "box")]
    pub query_box: Option<PhysicalBox>,
    #[serde(default)]
    pub max_points: Option<u64>,
}

impl VolumeRequest {
    pub fn volume(source: impl Into<String>, entry_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry_id: entry_id.into(),
            data_kind: DataKind::Volume,
            segmentation_id: None,
            time: 0,
            channel_id: 0,
            query_box: None,
            max_points: None,
        }
    }

    pub fn segmentation(source: impl Into<String>, entry_id: impl Into<String>, segmentation_id: Option<u32>) -> Self {
        Self {
            data_kind: DataKind::Segmentation,
            segmentation_id,
            ..Self::volume(source, entry_id)
        }
    }

    pub fn with_box(mut self, query_box: PhysicalBox) -> Self {
        self.query_box = Some(query_box);
        self
    }

    pub fn with_max_points(mut self, max_points: u64) -> Self {
        self.max_points = Some(max_points);
        self
    }

    pub fn with_frame(mut self, time: u32, channel_id: u32) -> Self {
        self.time = time;
        self.channel_id = channel_id;
        self
    }

    fn entry(&self) -> EntryId {
        EntryId::new(&self.source, &self.entry_id)
    }
}

/// Answer to a [`VolumeRequest`]
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeResponse {
    Slice {
        level: Level,
        /// Inclusive index box served, in the grid of `level`
        index_box: IndexBox,
        level_box: LevelBox,
        /// Lattice actually read, for segmentation queries
        lattice_id: Option<u32>,
        payload: Bytes,
    },
    /// Segmentation query against an entry without lattices
    NoSegmentation,
}

/// Mesh query for one (segment, detail level)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshRequest {
    pub source: String,
    pub entry_id: String,
    pub segment_id: u32,
    pub detail_level: u32,
}

pub struct VolumeServer {
    db: Arc<FileSystemDb>,
    encoder: Box<dyn SliceEncoder>,
    selector: ResolutionSelector,
    timeout: Duration,
}

impl VolumeServer {
    pub fn new(db: Arc<FileSystemDb>, timeout: Duration) -> Self {
        Self {
            db,
            encoder: Box::new(BincodeSliceEncoder),
            selector: ResolutionSelector::new(),
            timeout,
        }
    }

    /// Server over the database at `config.db_path`
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            Arc::new(FileSystemDb::new(&config.db_path)),
            config.query_timeout(),
        ))
    }

    pub fn with_encoder(mut self, encoder: Box<dyn SliceEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn db(&self) -> &Arc<FileSystemDb> {
        &self.db
    }

    pub fn content_type(&self) -> &'static str {
        self.encoder.content_type()
    }

    async fn with_deadline<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| VolsegError::Timeout(format!("{} exceeded {:?}", what, self.timeout)))?
    }

    /// Select a level and box, read the slice and encode it
    pub async fn get_slice(&self, request: &VolumeRequest) -> Result<VolumeResponse> {
        self.with_deadline("slice query", self.slice(request)).await
    }

    async fn slice(&self, request: &VolumeRequest) -> Result<VolumeResponse> {
        let entry = request.entry();
        let reader = self.db.open_entry(&entry).await?;
        let metadata = reader.metadata();

        let lattice_id = match request.data_kind {
            DataKind::Volume => None,
            DataKind::Segmentation => {
                match self
                    .selector
                    .decide_lattice(request.segmentation_id, &metadata.lattice_ids())
                {
                    Some(id) => Some(id),
                    None => {
                        debug!(%entry, "no lattice segmentation");
                        return Ok(VolumeResponse::NoSegmentation);
                    }
                }
            }
        };

        let native = metadata.native_box(request.data_kind, lattice_id)?;
        let persisted = metadata.persisted_levels(request.data_kind, lattice_id)?;
        let selection = self.selector.select(
            &native,
            &persisted,
            request.query_box.as_ref(),
            request.max_points,
        )?;

        let data = read_selection(&reader, request, lattice_id, &selection).await?;
        let payload = self.encoder.encode_slice(&selection, &data)?;
        Ok(VolumeResponse::Slice {
            level: selection.level,
            index_box: selection.index_box,
            level_box: selection.level_box,
            lattice_id,
            payload,
        })
    }

    /// Encoded meshes of one segment at one detail level
    pub async fn get_meshes(&self, request: &MeshRequest) -> Result<Bytes> {
        self.with_deadline("mesh query", async {
            let entry = EntryId::new(&request.source, &request.entry_id);
            let reader = self.db.open_entry(&entry).await?;
            let meshes = reader
                .read_meshes(request.segment_id, request.detail_level)
                .await?;
            self.encoder.encode_meshes(&meshes)
        })
        .await
    }

    pub async fn get_metadata(&self, source: &str, entry_id: &str) -> Result<Arc<EntryMetadata>> {
        self.with_deadline("metadata query", self.db.read_metadata(&EntryId::new(source, entry_id)))
            .await
    }

    /// Entries per namespace whose id contains `keyword`
    pub async fn list_entries(&self, limit: usize, keyword: &str) -> Result<BTreeMap<String, Vec<String>>> {
        self.with_deadline("entry listing", self.db.search_entries(limit, keyword))
            .await
    }

    pub async fn get_geometric_segmentation(
        &self,
        source: &str,
        entry_id: &str,
        segmentation_id: &str,
    ) -> Result<GeometricSegmentation> {
        let entry = EntryId::new(source, entry_id);
        self.with_deadline(
            "geometric segmentation query",
            self.db.get_geometric_segmentation(&entry, segmentation_id),
        )
        .await
    }
}

async fn read_selection(
    reader: &EntryReader,
    request: &VolumeRequest,
    lattice_id: Option<u32>,
    selection: &Selection,
) -> Result<SliceData> {
    match lattice_id {
        None => Ok(SliceData::Volume(
            reader
                .read_volume_slice(selection.level, request.time, request.channel_id, &selection.index_box)
                .await?,
        )),
        Some(lattice_id) => Ok(SliceData::Lattice {
            lattice_id,
            slice: reader
                .read_lattice_slice(
                    lattice_id,
                    selection.level,
                    request.time,
                    request.channel_id,
                    &selection.index_box,
                )
                .await?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StoreKey;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unknown_entry_is_not_found() {
        let dir = TempDir::new().unwrap();
        let server = VolumeServer::new(Arc::new(FileSystemDb::new(dir.path())), Duration::from_secs(5));
        let result = server.get_slice(&VolumeRequest::volume("emdb", "missing")).await;
        assert!(matches!(result, Err(VolsegError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_segmentation_query_without_lattices() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(FileSystemDb::new(dir.path()));
        let entry = EntryId::new("emdb", "bare");
        let txn = db.begin_update(&entry).await.unwrap();
        txn.put(
            &StoreKey::Metadata.path(),
            &EntryMetadata::new(entry.clone()).to_json().unwrap(),
        )
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let server = VolumeServer::new(db, Duration::from_secs(5));
        let response = server
            .get_slice(&VolumeRequest::segmentation("emdb", "bare", Some(3)))
            .await
            .unwrap();
        assert_eq!(response, VolumeResponse::NoSegmentation);
        assert_eq!(server.content_type(), BincodeSliceEncoder.content_type());
    }

    #[tokio::test]
    async fn test_deadline() {
        let dir = TempDir::new().unwrap();
        let server = VolumeServer::new(Arc::new(FileSystemDb::new(dir.path())), Duration::from_millis(10));
        let slow = server
            .with_deadline("sleep", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(slow, Err(VolsegError::Timeout(_))));
    }

    #[test]
    fn test_request_json() {
        let json = r#"{"source":"emdb","entry_id":"emd-1","data_kind":"segmentation",
            "time":0,"channel_id":0,"box":{"min":[0,0,0],"max":[10,10,10]},"max_points":1000}"#;
        let request: VolumeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.data_kind, DataKind::Segmentation);
        assert_eq!(request.segmentation_id, None);
        assert_eq!(request.query_box.unwrap().max, [10.0; 3]);
    }
}
