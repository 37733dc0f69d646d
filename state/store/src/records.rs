use serde::{Deserialize, Serialize};

/// Value of a spent serialnum: the presented hashkey and the commitnum of
/// the first output of the spending transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialnumRecord {
    pub hashkey: [u8; 32],
    pub tx_commitnum: u64,
}

/// Commitment-tree root snapshot recorded at a block level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRootRecord {
    pub timestamp: u64,
    pub next_commitnum: u64,
    pub root: [u8; 32],
}

/// Indexed stealth output. The low bit of `domain` records that the asset
/// and amount fields are unencrypted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputRecord {
    pub domain: u32,
    pub asset_enc: u64,
    pub amount_enc: u32,
    pub param_level: u64,
    pub commitnum: u64,
}

/// Per-level snapshot of the next exchange request and match numbers, used
/// to recover a persistent request's block time after a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XcxNumsRecord {
    pub level: u64,
    pub timestamp: u64,
    pub next_xreqnum: u64,
    pub next_xmatchnum: u64,
}
