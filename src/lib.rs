//! volseg - multi-resolution volumetric segmentation store
//!
//! Builds downsampling pyramids of density maps and their segmentations,
//! packs every entry into a single archive, and answers region queries at
//! a resolution chosen to fit a caller's point budget.
//!
//! # Features
//!
//! - Continuous downsampling with a separable (1, 4, 6, 4, 1) kernel and
//!   mirror boundaries, optionally chunked with bit-identical output
//! - Label-preserving categorical downsampling with deduplicated set tables
//! - Mesh level-of-detail ladders that stop per segment
//! - Copy-on-write archive transactions (Deflate or Zstd members)
//! - Query-time level and box selection with edge clamping
//! - Bounded batch builds where one failing entry never stops the rest
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use volseg::{FileSystemDb, PhysicalBox, VolumeRequest, VolumeServer};
//!
//! # async fn example() -> volseg::Result<()> {
//! let db = Arc::new(FileSystemDb::new("/data/db"));
//! let server = VolumeServer::new(db, std::time::Duration::from_secs(30));
//!
//! let request = VolumeRequest::volume("emdb", "emd-1832")
//!     .with_box(PhysicalBox::new([0.0; 3], [100.0; 3]))
//!     .with_max_points(1_000_000);
//! let response = server.get_slice(&request).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod archive;
pub mod batch;
pub mod categorical;
pub mod compression;
pub mod config;
pub mod db;
pub mod encoding;
pub mod entry;
pub mod error;
pub mod grid;
pub mod io;
pub mod kernel;
pub mod layout;
pub mod mesh;
pub mod metadata;
pub mod primitives;
pub mod pyramid;
pub mod selector;
pub mod service;
pub mod types;
pub mod utils;

// Re-exports
pub use access::{EntryReader, LatticeSlice};
pub use archive::{ArchiveTransaction, PackedArchive};
pub use batch::{BatchReport, BuildPool, EntryLoader, WorkingArea};
pub use categorical::{CategoricalDownsampler, CategoricalLevel, Footprint, SetTable};
pub use compression::{CompressionMethod, Compressor};
pub use config::{ArchiveConfig, BuildConfig, MeshConfig, ServerConfig};
pub use db::{FileSystemDb, SegmentationRef};
pub use encoding::{BincodeSliceEncoder, SliceData, SliceEncoder};
pub use entry::{EntryBuilder, EntryInput};
pub use error::{Result, VolsegError};
pub use grid::ScalarGrid;
pub use io::{FileSystemIOManager, IOManager};
pub use kernel::SeparableKernel;
pub use mesh::{Mesh, MeshLodBuilder, MeshSimplifier, SimplificationCurve};
pub use metadata::EntryMetadata;
pub use primitives::{GeometricSegmentation, ShapePrimitive};
pub use pyramid::{PersistencePolicy, PyramidBuilder, PyramidConfig};
pub use selector::{ResolutionSelector, Selection};
pub use service::{MeshRequest, VolumeRequest, VolumeResponse, VolumeServer};
pub use types::{DataKind, DataType, EntryId, IndexBox, Level, LevelBox, PhysicalBox};

/// Version of the volseg implementation
pub const VOLSEG_VERSION: &str = env!("CARGO_PKG_VERSION");
