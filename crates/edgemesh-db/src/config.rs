use std::env;
use std::path::{Path, PathBuf};

/// Store configuration.
///
/// Reads from the `EDGE_MESH_STORE_PATH` environment variable, falling back
/// to `edgemesh.db` under the platform data directory when unset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub store_path: PathBuf,
}

impl StoreConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `EDGE_MESH_STORE_PATH` env var, then the platform default.
    pub fn from_env() -> Self {
        let store_path = env::var("EDGE_MESH_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        Self { store_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
        }
    }

    /// The default store location: `<data dir>/edgemesh/edgemesh.db`, or
    /// `./edgemesh.db` when no data directory can be determined.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("edgemesh").join("edgemesh.db"))
            .unwrap_or_else(|| PathBuf::from("edgemesh.db"))
    }

    /// The directory that must exist before the store file can be created.
    pub fn parent_dir(&self) -> Option<&Path> {
        self.store_path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
