//! Build and server configuration
//!
//! All structs deserialize from JSON with every field optional; missing
//! fields take their defaults. Call `validate` (or load through
//! [`BuildConfig::load`] / [`ServerConfig::load`], which do) before use.

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{Result, VolsegError};
use crate::mesh::{MeshLodBuilder, SimplificationCurve, DEFAULT_DENSITY_THRESHOLD};
use crate::pyramid::PyramidConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Archive packing options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub compression: CompressionMethod,
    pub level: CompressionLevel,
    /// Where transactions stage their scratch areas; next to the archive if unset
    pub scratch_dir: Option<PathBuf>,
}

/// Mesh ladder options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub simplification_curve: SimplificationCurve,
    /// Vertices per unit area at which a ladder stops; 0 disables the check
    pub density_threshold: f64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            simplification_curve: SimplificationCurve::default(),
            density_threshold: DEFAULT_DENSITY_THRESHOLD,
        }
    }
}

impl MeshConfig {
    pub fn builder(&self) -> Result<MeshLodBuilder> {
        MeshLodBuilder::new(self.simplification_curve.clone(), self.density_threshold)
    }
}

/// Offline build settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub pyramid: PyramidConfig,
    pub mesh: MeshConfig,
    pub archive: ArchiveConfig,
    /// Entries built concurrently by a batch
    pub max_workers: usize,
    /// Parent of per-entry working areas; system temp dir if unset
    pub working_dir: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            pyramid: PyramidConfig::default(),
            mesh: MeshConfig::default(),
            archive: ArchiveConfig::default(),
            max_workers: 4,
            working_dir: None,
        }
    }
}

impl BuildConfig {
    pub fn with_pyramid(mut self, pyramid: PyramidConfig) -> Self {
        self.pyramid = pyramid;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    pub fn with_archive(mut self, archive: ArchiveConfig) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.pyramid.validate()?;
        self.mesh.builder()?;
        if self.max_workers == 0 {
            return Err(VolsegError::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref()).await?;
        config.validate()?;
        Ok(config)
    }
}

/// Query-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root of the entry database
    pub db_path: PathBuf,
    /// Deadline for a single query
    pub query_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("db"),
            query_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query_timeout_ms == 0 {
            return Err(VolsegError::Configuration(
                "query_timeout_ms must be positive".to_string(),
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(VolsegError::Configuration("db_path is empty".to_string()));
        }
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref()).await?;
        config.validate()?;
        Ok(config)
    }
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| VolsegError::Configuration(format!("{}: {}", path.display(), e)))
}
