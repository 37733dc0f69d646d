use std::path::{Path, PathBuf};

use chain::LedgerConfig;
use serde::{Deserialize, Serialize};

/// Node-level configuration; flattens into the ledger's config plus the
/// genesis data file location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub db_path: PathBuf,
    pub genesis_data_file: PathBuf,
    pub history_data_file: Option<PathBuf>,
    pub expected_history_hash: Option<[u8; 32]>,
    pub default_domain: u32,
    pub foundation_domain: u32,
    pub donation_per_xcx_pay: u128,
    pub outvalmin: u32,
    pub outvalmax: u32,
    pub mining_start_time: u64,
}

impl NodeConfig {
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        NodeConfig {
            db_path: dir.join("obol.db"),
            genesis_data_file: dir.join("genesis.dat"),
            ..NodeConfig::default()
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            db_path: self.db_path.clone(),
            default_domain: self.default_domain,
            foundation_domain: self.foundation_domain,
            donation_per_xcx_pay: self.donation_per_xcx_pay,
            outvalmin: self.outvalmin,
            outvalmax: self.outvalmax,
            mining_start_time: self.mining_start_time,
            history_data_file: self.history_data_file.clone(),
            expected_history_hash: self.expected_history_hash,
            ..LedgerConfig::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        let ledger = LedgerConfig::default();
        NodeConfig {
            db_path: ledger.db_path.clone(),
            genesis_data_file: PathBuf::from("genesis.dat"),
            history_data_file: None,
            expected_history_hash: None,
            default_domain: ledger.default_domain,
            foundation_domain: ledger.foundation_domain,
            donation_per_xcx_pay: ledger.donation_per_xcx_pay,
            outvalmin: ledger.outvalmin,
            outvalmax: ledger.outvalmax,
            mining_start_time: ledger.mining_start_time,
        }
    }
}
