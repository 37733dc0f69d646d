use std::fs;
use std::path::Path;

use blake2::{Blake2s256, Digest};
use state_store::keys::DB_KEY_DONATION_TOTALS;
use state_store::{CommitRootRecord, StoreWriter, TxOutputRecord};
use tracing::info;

use crate::amount::{amount_encode, AMOUNT_MAX_EXPONENT};
use crate::error::{ChainError, ChainResult};
use crate::ledger::Ledger;

/// History roots predate genesis, so they live at descending pseudo-levels
/// from the top of the level space, out of the way of real levels.
const HISTORY_LEVEL_START: u64 = u64::MAX - 1;

/// Loads the mainnet bootstrap history file: per-witness donation totals,
/// spent serialnums, and pre-genesis outputs with their roots, all covered
/// by a trailing blake2s checksum.
pub(crate) fn load_history_file(
    ledger: &Ledger,
    writer: &mut StoreWriter<'_>,
    path: &Path,
) -> ChainResult<()> {
    let bytes = fs::read(path)?;
    if bytes.len() < 32 {
        return Err(ChainError::InvalidFile("history file too short"));
    }

    let (body, trailing) = bytes.split_at(bytes.len() - 32);
    let computed: [u8; 32] = Blake2s256::digest(body).into();
    if computed != trailing {
        return Err(ChainError::InvalidFile("history file hash mismatch"));
    }
    if let Some(expected) = ledger.config.expected_history_hash {
        if computed != expected {
            return Err(ChainError::InvalidFile("history file hash not the configured one"));
        }
    }

    let mut pos = 0usize;

    // Donation totals, one per witness, zero terminated.
    let mut witness = 0u32;
    loop {
        let total = u128::from_le_bytes(read(body, &mut pos, 16)?.try_into().unwrap());
        if total == 0 {
            break;
        }
        writer.parameter_insert(DB_KEY_DONATION_TOTALS, witness, &total.to_be_bytes())?;
        witness += 1;
    }

    // Spent serialnums, zero terminated.
    let mut serialnum_count = 0u64;
    loop {
        let serialnum: [u8; 32] = read(body, &mut pos, 32)?.try_into().unwrap();
        if serialnum == [0u8; 32] {
            break;
        }
        writer.serialnum_insert(&serialnum, &[0u8; 32], 0)?;
        serialnum_count += 1;
    }

    // Output tuples, terminated by a zero address. Root changes mark the
    // boundaries of pre-genesis pseudo-levels.
    let mut level = HISTORY_LEVEL_START;
    let mut last_root = [0u8; 32];
    let mut output_count = 0u64;
    loop {
        let address: [u8; 32] = read(body, &mut pos, 32)?.try_into().unwrap();
        if address == [0u8; 32] {
            break;
        }
        let asset = u64::from_le_bytes(read(body, &mut pos, 8)?.try_into().unwrap());
        let amount = u64::from_le_bytes(read(body, &mut pos, 8)?.try_into().unwrap());
        let root: [u8; 32] = read(body, &mut pos, 32)?.try_into().unwrap();
        let commitment: [u8; 32] = read(body, &mut pos, 32)?.try_into().unwrap();

        let commitnum = ledger.append_commitment(writer, &commitment)?;

        if last_root != root {
            if last_root != [0u8; 32] {
                let record = CommitRootRecord {
                    timestamp: 0,
                    next_commitnum: commitnum,
                    root: last_root,
                };
                writer.commit_roots_insert(level, &record)?;
                level -= 1;
            }
            last_root = root;
        }

        let domain = if asset != 0 { 2 } else { 3 };
        let record = TxOutputRecord {
            domain,
            asset_enc: asset,
            amount_enc: amount_encode(amount as u128, false, 0, AMOUNT_MAX_EXPONENT),
            param_level: level,
            commitnum,
        };
        writer.tx_output_insert(&address, &record)?;
        output_count += 1;
    }

    if last_root != [0u8; 32] {
        let record = CommitRootRecord {
            timestamp: 0,
            next_commitnum: ledger.tree.lock().next_commitnum(),
            root: last_root,
        };
        writer.commit_roots_insert(level, &record)?;
    }

    info!(
        witnesses = witness,
        serialnums = serialnum_count,
        outputs = output_count,
        "history data file loaded"
    );

    Ok(())
}

fn read<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> ChainResult<&'a [u8]> {
    if *pos + n > bytes.len() {
        return Err(ChainError::InvalidFile("history file truncated"));
    }
    let slice = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

/// Builds a history file image from parts; shared by tests and tooling.
pub fn build_history_file(
    donation_totals: &[u128],
    serialnums: &[[u8; 32]],
    outputs: &[([u8; 32], u64, u64, [u8; 32], [u8; 32])],
) -> Vec<u8> {
    let mut body = Vec::new();
    for total in donation_totals {
        body.extend_from_slice(&total.to_le_bytes());
    }
    body.extend_from_slice(&0u128.to_le_bytes());
    for serialnum in serialnums {
        body.extend_from_slice(serialnum);
    }
    body.extend_from_slice(&[0u8; 32]);
    for (address, asset, amount, root, commitment) in outputs {
        body.extend_from_slice(address);
        body.extend_from_slice(&asset.to_le_bytes());
        body.extend_from_slice(&amount.to_le_bytes());
        body.extend_from_slice(root);
        body.extend_from_slice(commitment);
    }
    body.extend_from_slice(&[0u8; 32]);
    let hash: [u8; 32] = Blake2s256::digest(&body).into();
    body.extend_from_slice(&hash);
    body
}
