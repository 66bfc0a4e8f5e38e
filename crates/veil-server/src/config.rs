//! Server configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use veil_core::{LogConfig, PsiParams, ThreadPoolConfig};

use crate::db::SenderDb;
use crate::error::{Result, ServerError};

/// Default nonce size for labeled databases built from CSV
pub const DEFAULT_NONCE_BYTE_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// PSI parameters JSON; required when building from CSV
    #[serde(default)]
    pub params_path: Option<PathBuf>,
    /// Saved SenderDB to serve
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// CSV source to build the SenderDB from (when `db_path` is unset)
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
    /// Save the database here after building it
    #[serde(default)]
    pub save_db_path: Option<PathBuf>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_nonce_byte_count")]
    pub nonce_byte_count: usize,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub log: LogConfig,
    /// Serve Prometheus metrics on this address
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

fn default_listen_addr() -> SocketAddr {
    ([127, 0, 0, 1], 1212).into()
}

fn default_thread_count() -> usize {
    ThreadPoolConfig::default().thread_count
}

fn default_nonce_byte_count() -> usize {
    DEFAULT_NONCE_BYTE_COUNT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            params_path: None,
            db_path: None,
            csv_path: None,
            save_db_path: None,
            listen_addr: default_listen_addr(),
            thread_count: default_thread_count(),
            nonce_byte_count: DEFAULT_NONCE_BYTE_COUNT,
            compressed: false,
            log: LogConfig::default(),
            metrics_addr: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn with_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_csv(mut self, csv: impl Into<PathBuf>, params: impl Into<PathBuf>) -> Self {
        self.csv_path = Some(csv.into());
        self.params_path = Some(params.into());
        self
    }

    pub fn pool_config(&self) -> ThreadPoolConfig {
        ThreadPoolConfig {
            thread_count: self.thread_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.pool_config().validate()?;
        if self.db_path.is_none() && self.csv_path.is_none() {
            return Err(ServerError::Config(
                "one of db_path or csv_path must be set".into(),
            ));
        }
        if self.db_path.is_none() && self.params_path.is_none() {
            return Err(ServerError::Config(
                "params_path is required to build from CSV".into(),
            ));
        }
        Ok(())
    }

    /// Load or build the database this config points at
    pub fn open_database(&self, pool: &rayon::ThreadPool) -> Result<SenderDb> {
        self.validate()?;

        let db = match (&self.db_path, &self.csv_path, &self.params_path) {
            (Some(db_path), _, _) => SenderDb::load_from_path(db_path)?,
            (None, Some(csv_path), Some(params_path)) => {
                let params = PsiParams::from_file(params_path)?;
                SenderDb::load_from_csv_path(csv_path, params, self.nonce_byte_count, self.compressed, pool)?
            }
            _ => return Err(ServerError::Config("no database source configured".into())),
        };

        if let Some(out) = &self.save_db_path {
            db.save_to_path(out)?;
            tracing::info!(path = %out.display(), "SenderDB saved");
        }
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use veil_core::params::test_params;

    #[test]
    fn test_json_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"db_path": "sender.db"}"#).unwrap();
        assert_eq!(config.listen_addr, default_listen_addr());
        assert_eq!(config.nonce_byte_count, 16);
        assert!(config.thread_count >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_section() {
        let json = r#"{"db_path": "sender.db", "log": {"level": "debug", "file": "server.log", "console": false}}"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.log,
            veil_core::LogConfig::new(veil_core::LogLevel::Debug)
                .with_file("server.log")
                .with_console(false)
        );
    }

    #[test]
    fn test_validate_requires_source() {
        assert!(ServerConfig::default().validate().is_err());

        let mut config = ServerConfig::default();
        config.csv_path = Some("db.csv".into());
        assert!(config.validate().is_err());

        config.thread_count = 0;
        config.params_path = Some("params.json".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_open_from_csv_and_save() {
        let dir = tempdir().unwrap();
        let params_path = dir.path().join("params.json");
        let csv_path = dir.path().join("db.csv");
        let db_path = dir.path().join("sender.db");
        std::fs::write(&params_path, test_params().to_json().unwrap()).unwrap();
        std::fs::write(&csv_path, "a,1\nb,22\n").unwrap();

        let mut config = ServerConfig::default().with_csv(&csv_path, &params_path);
        config.thread_count = 1;
        config.save_db_path = Some(db_path.clone());

        let pool = config.pool_config().build().unwrap();
        let db = config.open_database(&pool).unwrap();
        assert_eq!(db.item_count(), 2);
        assert_eq!(db.label_byte_count(), 2);

        let reopened = ServerConfig::default().with_db(&db_path).open_database(&pool).unwrap();
        assert_eq!(reopened.item_count(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.json");
        let config = ServerConfig::default().with_db("sender.db");
        config.save(&path).unwrap();
        assert_eq!(ServerConfig::load(&path).unwrap(), config);
    }
}
