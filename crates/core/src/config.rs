use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub workers: Workers,
    #[serde(default)]
    pub spool: Spool,
    #[serde(default)]
    pub transfer: Transfer,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub catalog: Catalog,
    #[serde(default)]
    pub media_tool: MediaTool,
    #[serde(default)]
    pub control: Control,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub chat: Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workers {
    pub transcode_workers: usize,
    pub download_concurrency: usize,
    pub db_writer_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spool {
    pub spool_dir: PathBuf,
    pub spool_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub upload_chunk_cap_bytes: u64,
    pub download_chunk_bytes: u64,
    pub initial_range_cap_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_upload_size_bytes: u64,
    pub max_pdf_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub root_folder_id: String,
    pub credentials_path: PathBuf,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTool {
    pub media_tool_path: PathBuf,
    pub media_probe_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Control {
    pub control_socket_path: PathBuf,
}

/// Settings inert to this repo's own logic, but carried so cookie max-ages
/// set by an upstream collaborator stay in one configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub log_format: String,
}

/// The bot-API-style chat backend C3 downloads attachments from. The API
/// token itself is never stored in the config file; it is read from
/// `api_token_env` at daemon startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub base_url: String,
    pub api_token_env: String,
}

impl Default for Workers {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            transcode_workers: (cpus / 2).clamp(1, 4),
            download_concurrency: 3,
            db_writer_workers: 2,
        }
    }
}

impl Default for Spool {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("./spool"),
            spool_ttl_seconds: 86_400,
        }
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            upload_chunk_cap_bytes: 10 * 1024 * 1024,
            download_chunk_bytes: 2 * 1024 * 1024,
            initial_range_cap_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_upload_size_bytes: 10 * 1024 * 1024 * 1024,
            max_pdf_size_bytes: 500 * 1024 * 1024,
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root_folder_id: String::new(),
            credentials_path: PathBuf::from("./credentials.json"),
            base_url: String::new(),
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./catalog.sqlite3"),
        }
    }
}

impl Default for MediaTool {
    fn default() -> Self {
        Self {
            media_tool_path: PathBuf::from("ffmpeg"),
            media_probe_path: PathBuf::from("ffprobe"),
        }
    }
}

impl Default for Control {
    fn default() -> Self {
        Self {
            control_socket_path: PathBuf::from("./mediavault.sock"),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            access_token_ttl_seconds: 900,
            refresh_token_ttl_seconds: 2_592_000,
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_format: "json".to_string(),
        }
    }
}

impl Default for Chat {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token_env: "MEDIAVAULT_CHAT_API_TOKEN".to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&raw)
            .map_err(|e| Error::validation(format!("invalid config at {path:?}: {e}")))?;
        if settings.version != SETTINGS_SCHEMA_VERSION {
            return Err(Error::validation(format!(
                "unsupported config schema version {} (expected {})",
                settings.version, SETTINGS_SCHEMA_VERSION
            )));
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_sections() {
        let toml_src = "version = 1\n";
        let settings: Settings = toml::from_str(toml_src).unwrap();
        assert_eq!(settings.workers.download_concurrency, 3);
        assert_eq!(settings.transfer.upload_chunk_cap_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.logging.log_format, "json");
    }

    #[test]
    fn rejects_unsupported_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "version = 99\n").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
