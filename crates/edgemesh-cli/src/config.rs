//! Configuration file management for edgemesh.
//!
//! Provides a TOML-based config file at `~/.config/edgemesh/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use edgemesh_db::config::StoreConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub store: StoreSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSection {
    /// Path to the SQLite store file.
    pub path: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Shared secret agents must present in `X-EdgeMesh-Secret`.
    /// When unset, the agent and task endpoints are open.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the edgemesh config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/edgemesh` or
/// `~/.config/edgemesh`. We intentionally ignore the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("edgemesh");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("edgemesh")
}

/// Return the path to the edgemesh config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Secret generation
// -----------------------------------------------------------------------

/// Generate a random shared secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_shared_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct EdgeMeshConfig {
    pub store_config: StoreConfig,
    pub shared_secret: Option<String>,
}

impl EdgeMeshConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - Store path: `cli_store_path` > `EDGE_MESH_STORE_PATH` env >
    ///   `config_file.store.path` > platform default.
    /// - Shared secret: `EDGE_MESH_SHARED_SECRET` env >
    ///   `config_file.auth.shared_secret` > none (open endpoints).
    pub fn resolve(cli_store_path: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let store_config = if let Some(path) = cli_store_path {
            StoreConfig::new(path)
        } else if let Ok(path) = std::env::var("EDGE_MESH_STORE_PATH") {
            StoreConfig::new(path)
        } else if let Some(ref cfg) = file_config {
            StoreConfig::new(&cfg.store.path)
        } else {
            StoreConfig::new(StoreConfig::default_path())
        };

        let shared_secret = if let Ok(secret) = std::env::var("EDGE_MESH_SHARED_SECRET") {
            Some(secret)
        } else {
            file_config.and_then(|cfg| cfg.auth.shared_secret)
        };
        let shared_secret = shared_secret.filter(|s| !s.is_empty());

        Ok(Self {
            store_config,
            shared_secret,
        })
    }
}
