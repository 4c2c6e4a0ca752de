//! Node configuration for the Strata full node.
//!
//! [`NodeConfig::load`] layers three sources, later ones winning: the
//! built-in defaults, an optional TOML file, and `STRATA_*` environment
//! variables (`STRATA_DB_CACHE_MB=512`, `STRATA_IMPORT=a.dat,b.dat`).
//! Command-line flags are applied on top by the binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use strata_chain::ChainstateConfig;
use strata_core::constants::{DEFAULT_LIMIT_FREE_RELAY, DEFAULT_MAX_ORPHAN_TXS, NetworkType};

use crate::error::NodeError;

const ENV_PREFIX: &str = "STRATA";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Configuration for a full node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    pub network: NetworkType,
    /// Log level filter string (e.g. "info", "debug", "strata_chain=trace").
    pub log_level: String,
    pub log_format: LogFormat,
    /// Flush the coins cache to disk once it grows past this many MiB.
    pub db_cache_mb: usize,
    /// Signature verification threads. Zero verifies on the calling thread.
    pub script_threads: usize,
    pub max_mempool_txs: usize,
    pub max_mempool_bytes: usize,
    pub max_orphan_txs: usize,
    /// Thousands of bytes per minute of free transactions to relay.
    pub limit_free_relay: u64,
    /// Block files to import on startup.
    pub import: Vec<PathBuf>,
    /// Rebuild the chain state from the stored block files.
    pub reindex: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata");
        let chain = ChainstateConfig::default();

        Self {
            data_dir,
            network: NetworkType::Mainnet,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            db_cache_mb: chain.coins_cache_bytes / (1024 * 1024),
            script_threads: 0,
            max_mempool_txs: chain.max_mempool_txs,
            max_mempool_bytes: chain.max_mempool_bytes,
            max_orphan_txs: DEFAULT_MAX_ORPHAN_TXS,
            limit_free_relay: DEFAULT_LIMIT_FREE_RELAY,
            import: Vec::new(),
            reindex: false,
        }
    }
}

impl NodeConfig {
    /// Defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, NodeError> {
        Self::load_with_env(file, None)
    }

    /// [`NodeConfig::load`] reading `STRATA_*` variables from `env` instead
    /// of the process environment.
    pub fn load_with_env(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, NodeError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("import")
                .source(env),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Directory holding this network's data. Mainnet uses `data_dir`
    /// itself; other networks get a subdirectory.
    pub fn chain_dir(&self) -> PathBuf {
        match self.network {
            NetworkType::Mainnet => self.data_dir.clone(),
            other => self.data_dir.join(other.data_dir_suffix()),
        }
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.chain_dir().join("chaindata")
    }

    /// Directory of the block and undo files.
    pub fn blocks_dir(&self) -> PathBuf {
        self.chain_dir().join("blocks")
    }

    pub fn fee_estimates_path(&self) -> PathBuf {
        self.chain_dir().join("fee_estimates.json")
    }

    /// Chain state tunables derived from this configuration.
    pub fn chainstate_config(&self) -> ChainstateConfig {
        ChainstateConfig {
            coins_cache_bytes: self.db_cache_mb.saturating_mul(1024 * 1024),
            script_threads: self.script_threads,
            max_orphan_txs: self.max_orphan_txs,
            max_mempool_txs: self.max_mempool_txs,
            max_mempool_bytes: self.max_mempool_bytes,
            limit_free_relay: self.limit_free_relay,
            ..ChainstateConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn default_data_dir_ends_with_strata() {
        let cfg = NodeConfig::default();
        assert!(
            cfg.data_dir.ends_with("strata"),
            "data_dir should end with 'strata': {:?}",
            cfg.data_dir
        );
    }

    #[test]
    fn defaults_survive_layering() {
        let cfg = NodeConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(cfg, NodeConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            "network = \"regtest\"\nlog_format = \"json\"\ndb_cache_mb = 8\nimport = [\"a.dat\"]\n",
        )
        .unwrap();
        let cfg = NodeConfig::load_with_env(Some(&path), env(&[])).unwrap();
        assert_eq!(cfg.network, NetworkType::Regtest);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.db_cache_mb, 8);
        assert_eq!(cfg.import, vec![PathBuf::from("a.dat")]);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "max_orphan_txs = 5\n").unwrap();
        let cfg = NodeConfig::load_with_env(
            Some(&path),
            env(&[
                ("STRATA_MAX_ORPHAN_TXS", "9"),
                ("STRATA_REINDEX", "true"),
                ("STRATA_IMPORT", "x.dat,y.dat"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.max_orphan_txs, 9);
        assert!(cfg.reindex);
        assert_eq!(cfg.import, vec![PathBuf::from("x.dat"), PathBuf::from("y.dat")]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = NodeConfig::load_with_env(Some(&dir.path().join("absent.toml")), env(&[]));
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[test]
    fn paths_follow_network() {
        let mut cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/strata-test"),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/strata-test/chaindata"));
        cfg.network = NetworkType::Regtest;
        assert_eq!(cfg.blocks_dir(), PathBuf::from("/tmp/strata-test/regtest/blocks"));
        assert_eq!(
            cfg.fee_estimates_path(),
            PathBuf::from("/tmp/strata-test/regtest/fee_estimates.json")
        );
    }

    #[test]
    fn chainstate_config_carries_limits() {
        let cfg = NodeConfig {
            db_cache_mb: 2,
            script_threads: 3,
            max_orphan_txs: 11,
            ..NodeConfig::default()
        };
        let chain = cfg.chainstate_config();
        assert_eq!(chain.coins_cache_bytes, 2 * 1024 * 1024);
        assert_eq!(chain.script_threads, 3);
        assert_eq!(chain.max_orphan_txs, 11);
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
