//! Parameter keys and byte-key encodings. All composite keys are big-endian
//! so sled's lexicographic order matches numeric order.

/// Parameter-table keys.
pub const DB_KEY_SCHEMA: u8 = 0;
pub const DB_KEY_GENESIS_HASH: u8 = 1;
pub const DB_KEY_BLOCK_AUX: u8 = 2;
pub const DB_KEY_COMMIT_BLOCKLEVEL: u8 = 3;
pub const DB_KEY_COMMIT_COMMITNUM_LO: u8 = 4;
pub const DB_KEY_COMMIT_COMMITNUM_HI: u8 = 5;
pub const DB_KEY_COMMIT_NULL_INPUT: u8 = 6;
pub const DB_KEY_CCMINT_COUNT: u8 = 7;
pub const DB_KEY_DONATION_TOTALS: u8 = 8;
pub const DB_KEY_XMATCHING: u8 = 9;
pub const DB_KEY_XMINING: u8 = 10;

pub fn parameter_key(key: u8, subkey: u32) -> Vec<u8> {
    let mut k = Vec::with_capacity(5);
    k.push(key);
    k.extend_from_slice(&subkey.to_be_bytes());
    k
}

pub fn u64_key(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

pub fn u64_from_key(k: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(k.try_into().ok()?))
}

pub fn commit_tree_key(height: usize, offset: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    k.push(height as u8);
    k.extend_from_slice(&offset.to_be_bytes());
    k
}

pub fn tx_output_key(address: &[u8; 32], commitnum: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(40);
    k.extend_from_slice(address);
    k.extend_from_slice(&commitnum.to_be_bytes());
    k
}

pub fn deadline_key(deadline: u64, xmatchnum: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    k.extend_from_slice(&deadline.to_be_bytes());
    k.extend_from_slice(&xmatchnum.to_be_bytes());
    k
}

pub fn deadline_key_xmatchnum(k: &[u8]) -> Option<u64> {
    if k.len() != 16 {
        return None;
    }
    Some(u64::from_be_bytes(k[8..16].try_into().ok()?))
}
