use chain::{Block, BlockHeader, GenesisData, Ledger, LedgerConfig, Transaction, BLOCK_TAG};
use exchange::Oid;
use std::path::Path;

pub fn genesis_data(blockchain_id: u64, nwitnesses: u32, maxmal: u32) -> GenesisData {
    let signing_keys = (0..nwitnesses)
        .map(|i| {
            let mut key = [0u8; 32];
            key[..4].copy_from_slice(&(i + 1).to_le_bytes());
            key
        })
        .collect();
    GenesisData {
        blockchain_id,
        nwitnesses,
        maxmal,
        signing_keys,
    }
}

pub fn open_ledger(dir: &Path, genesis: &GenesisData) -> Ledger {
    let config = LedgerConfig {
        db_path: dir.join("db"),
        ..LedgerConfig::default()
    };
    Ledger::open(config, genesis.clone()).expect("ledger opens")
}

/// Feeds blocks down one chain, tracking the tip oid.
pub struct ChainDriver {
    pub tip: Oid,
    pub level: u64,
}

impl ChainDriver {
    pub fn from_genesis(genesis: &GenesisData) -> Self {
        ChainDriver {
            tip: genesis.oid(),
            level: 0,
        }
    }

    pub fn make_block(&self, witness: u16, timestamp: u64, txs: Vec<Transaction>) -> Block {
        let header = BlockHeader {
            tag: BLOCK_TAG,
            level: self.level + 1,
            timestamp,
            prior_oid: self.tip,
            witness,
        };
        Block::new(header, txs).expect("block encodes")
    }

    /// Adds the block and runs confirmation; advances the tip.
    pub fn push(
        &mut self,
        ledger: &Ledger,
        witness: u16,
        timestamp: u64,
        txs: Vec<Transaction>,
    ) -> Oid {
        let block = self.make_block(witness, timestamp, txs);
        let oid = ledger.add_candidate_block(block).expect("block accepted");
        ledger.do_confirmations(&oid).expect("confirmation runs");
        self.tip = oid;
        self.level += 1;
        oid
    }
}
