use exchange::Oid;
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ChainResult};
use crate::tx::Transaction;

pub const BLOCK_TAG: u32 = 0x424c4b01;

/// Per-block consensus parameters, snapshotted from genesis and carried on
/// every block's aux record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub nwitnesses: u16,
    pub maxmal: u16,
    pub nconfsigs: u16,
    pub nseqconfsigs: u16,
    pub nskipconfsigs: u16,
    pub next_nwitnesses: u16,
    pub next_maxmal: u16,
    pub signing_keys: Vec<[u8; 32]>,
}

impl ChainParams {
    pub fn new(nwitnesses: u16, maxmal: u16, signing_keys: Vec<[u8; 32]>) -> Self {
        let mut params = ChainParams {
            nwitnesses,
            maxmal,
            nconfsigs: 0,
            nseqconfsigs: 0,
            nskipconfsigs: 0,
            next_nwitnesses: nwitnesses,
            next_maxmal: maxmal,
            signing_keys,
        };
        params.set_conf_sigs();
        params
    }

    /// Derives the confirmation thresholds from the witness counts:
    /// `nconfsigs` is the general quorum, the sequential threshold tolerates
    /// an honest majority of the non-malicious set, and a skip round must
    /// clear the full quorum (capped at the witness count).
    pub fn set_conf_sigs(&mut self) {
        let honest = self.nwitnesses - self.maxmal;
        self.nconfsigs = honest + honest / 2;
        self.nseqconfsigs = honest / 2 + self.maxmal + 1;
        self.nskipconfsigs = self.nconfsigs.min(self.nwitnesses).max(self.nseqconfsigs);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub tag: u32,
    pub level: u64,
    pub timestamp: u64,
    pub prior_oid: Oid,
    pub witness: u16,
}

/// A block as carried in memory: the parsed header and body plus the exact
/// wire bytes that hash to its oid and land in the blockchain table.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
    wire: Vec<u8>,
}

impl Block {
    pub fn new(header: BlockHeader, txs: Vec<Transaction>) -> ChainResult<Self> {
        let wire = encode_wire(&header, &txs)?;
        Ok(Block { header, txs, wire })
    }

    pub fn decode(wire: &[u8]) -> ChainResult<Self> {
        let (header, txs) = decode_wire(wire)?;
        if header.tag != BLOCK_TAG {
            return Err(ChainError::InvalidBlock("bad block tag"));
        }
        Ok(Block {
            header,
            txs,
            wire: wire.to_vec(),
        })
    }

    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn hash(&self) -> Oid {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"obol.block");
        hasher.update(&self.wire);
        *hasher.finalize().as_bytes()
    }
}

fn encode_wire(header: &BlockHeader, txs: &[Transaction]) -> ChainResult<Vec<u8>> {
    let mut wire = Vec::new();
    wire.extend_from_slice(&header.tag.to_le_bytes());
    wire.extend_from_slice(&header.level.to_le_bytes());
    wire.extend_from_slice(&header.timestamp.to_le_bytes());
    wire.extend_from_slice(&header.prior_oid);
    wire.extend_from_slice(&header.witness.to_le_bytes());
    for tx in txs {
        let blob = tx.to_wire()?;
        wire.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        wire.extend_from_slice(&blob);
    }
    Ok(wire)
}

const HEADER_BYTES: usize = 4 + 8 + 8 + 32 + 2;

fn decode_wire(wire: &[u8]) -> ChainResult<(BlockHeader, Vec<Transaction>)> {
    if wire.len() < HEADER_BYTES {
        return Err(ChainError::InvalidBlock("truncated header"));
    }
    let tag = u32::from_le_bytes(wire[0..4].try_into().unwrap());
    let level = u64::from_le_bytes(wire[4..12].try_into().unwrap());
    let timestamp = u64::from_le_bytes(wire[12..20].try_into().unwrap());
    let mut prior_oid = [0u8; 32];
    prior_oid.copy_from_slice(&wire[20..52]);
    let witness = u16::from_le_bytes(wire[52..54].try_into().unwrap());

    let mut txs = Vec::new();
    let mut pos = HEADER_BYTES;
    while pos < wire.len() {
        if pos + 4 > wire.len() {
            return Err(ChainError::InvalidBlock("truncated tx size"));
        }
        let size = u32::from_le_bytes(wire[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + size > wire.len() {
            return Err(ChainError::InvalidBlock("truncated tx body"));
        }
        txs.push(Transaction::from_wire(&wire[pos..pos + size])?);
        pos += size;
    }

    Ok((
        BlockHeader {
            tag,
            level,
            timestamp,
            prior_oid,
            witness,
        },
        txs,
    ))
}

/// Per-block working state maintained alongside the wire form.
#[derive(Clone, Debug)]
pub struct BlockAux {
    pub oid: Oid,
    pub block_hash: Oid,
    /// True when the block was produced out of strict witness rotation.
    pub skip: bool,
    pub marked_for_indelible: bool,
    pub total_donations: u128,
    pub params: ChainParams,
}

/// Persisted slice of the aux state, stored under the block-aux parameter
/// key (subkey = level mod 64).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockAuxRecord {
    pub oid: Oid,
    pub block_hash: Oid,
    pub skip: bool,
    pub total_donations: u128,
    pub params: ChainParams,
}

impl BlockAux {
    pub fn record(&self) -> BlockAuxRecord {
        BlockAuxRecord {
            oid: self.oid,
            block_hash: self.block_hash,
            skip: self.skip,
            total_donations: self.total_donations,
            params: self.params.clone(),
        }
    }

    pub fn from_record(record: BlockAuxRecord, marked_for_indelible: bool) -> Self {
        BlockAux {
            oid: record.oid,
            block_hash: record.block_hash,
            skip: record.skip,
            marked_for_indelible,
            total_donations: record.total_donations,
            params: record.params,
        }
    }
}
