use std::fs;
use std::io::Read;
use std::path::Path;

use exchange::Oid;

use crate::block::{Block, BlockAux, BlockHeader, ChainParams, BLOCK_TAG};
use crate::error::{ChainError, ChainResult};

pub const GENESIS_FILE_TAG: u32 = 0x0247_4343;

const PRIVATE_KEY_FILE_PREFIX: &str = "private_signing_key_witness_";

/// Contents of the genesis data file: the blockchain identity and the
/// authorized witness set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenesisData {
    pub blockchain_id: u64,
    pub nwitnesses: u32,
    pub maxmal: u32,
    pub signing_keys: Vec<[u8; 32]>,
}

impl GenesisData {
    /// Hash of everything after the tag and blockchain id; becomes the
    /// genesis block hash and is pinned in the parameter table.
    pub fn block_hash(&self) -> Oid {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.nwitnesses.to_le_bytes());
        hasher.update(&self.maxmal.to_le_bytes());
        for key in &self.signing_keys {
            hasher.update(key);
        }
        *hasher.finalize().as_bytes()
    }

    /// The genesis oid ties the chain to its blockchain id rather than to
    /// the wire form: the id in the low bytes, the rest zero.
    pub fn oid(&self) -> Oid {
        let mut oid = [0u8; 32];
        oid[..8].copy_from_slice(&self.blockchain_id.to_le_bytes());
        oid
    }

    pub fn params(&self) -> ChainParams {
        ChainParams::new(
            self.nwitnesses as u16,
            self.maxmal as u16,
            self.signing_keys.clone(),
        )
    }

    /// The level-0 block and its aux state.
    pub fn block(&self) -> ChainResult<(Block, BlockAux)> {
        let header = BlockHeader {
            tag: BLOCK_TAG,
            level: 0,
            timestamp: 0,
            prior_oid: [0u8; 32],
            witness: 0,
        };
        let block = Block::new(header, vec![])?;
        let aux = BlockAux {
            oid: self.oid(),
            block_hash: self.block_hash(),
            skip: false,
            marked_for_indelible: false,
            total_donations: 0,
            params: self.params(),
        };
        Ok((block, aux))
    }

    pub fn load(path: impl AsRef<Path>) -> ChainResult<Self> {
        let mut file = fs::File::open(path.as_ref())?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut pos = 0usize;

        let tag = u32::from_le_bytes(take(&bytes, &mut pos, 4)?.try_into().unwrap());
        if tag != GENESIS_FILE_TAG {
            return Err(ChainError::InvalidFile("bad genesis file tag"));
        }
        let blockchain_id = u64::from_le_bytes(take(&bytes, &mut pos, 8)?.try_into().unwrap());
        let nwitnesses = u32::from_le_bytes(take(&bytes, &mut pos, 4)?.try_into().unwrap());
        let maxmal = u32::from_le_bytes(take(&bytes, &mut pos, 4)?.try_into().unwrap());
        if nwitnesses == 0 || nwitnesses > u16::MAX as u32 || maxmal >= nwitnesses {
            return Err(ChainError::InvalidFile("bad genesis witness counts"));
        }

        let mut signing_keys = Vec::with_capacity(nwitnesses as usize);
        for _ in 0..nwitnesses {
            let mut key = [0u8; 32];
            key.copy_from_slice(take(&bytes, &mut pos, 32)?);
            signing_keys.push(key);
        }

        if pos != bytes.len() {
            return Err(ChainError::InvalidFile("unexpected extra data in genesis file"));
        }

        Ok(GenesisData {
            blockchain_id,
            nwitnesses,
            maxmal,
            signing_keys,
        })
    }

    pub fn write(&self, path: impl AsRef<Path>) -> ChainResult<()> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&GENESIS_FILE_TAG.to_le_bytes());
        bytes.extend_from_slice(&self.blockchain_id.to_le_bytes());
        bytes.extend_from_slice(&self.nwitnesses.to_le_bytes());
        bytes.extend_from_slice(&self.maxmal.to_le_bytes());
        for key in &self.signing_keys {
            bytes.extend_from_slice(key);
        }
        fs::write(path.as_ref(), bytes)?;
        Ok(())
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> ChainResult<&'a [u8]> {
    if *pos + n > bytes.len() {
        return Err(ChainError::InvalidFile("genesis file truncated"));
    }
    let slice = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

/// Generates fresh genesis data files: the public file plus one private
/// signing-key file per witness, in `dir`.
pub fn create_genesis_data_files(
    dir: impl AsRef<Path>,
    file_name: &str,
    blockchain_id: u64,
    nwitnesses: u32,
    maxmal: u32,
    mut random: impl FnMut(&mut [u8; 32]),
) -> ChainResult<GenesisData> {
    let dir = dir.as_ref();
    let mut signing_keys = Vec::with_capacity(nwitnesses as usize);
    for i in 0..nwitnesses {
        let mut private_key = [0u8; 32];
        random(&mut private_key);
        // Keys are opaque to the core; signature checking happens upstream.
        let public_key = *blake3::hash(&private_key).as_bytes();
        fs::write(
            dir.join(format!("{PRIVATE_KEY_FILE_PREFIX}{i}.dat")),
            private_key,
        )?;
        signing_keys.push(public_key);
    }

    let genesis = GenesisData {
        blockchain_id,
        nwitnesses,
        maxmal,
        signing_keys,
    };
    genesis.write(dir.join(file_name))?;
    Ok(genesis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut seed = 0u8;
        let genesis = create_genesis_data_files(dir.path(), "genesis.dat", 1, 4, 1, |key| {
            seed += 1;
            key.fill(seed);
        })
        .unwrap();
        let loaded = GenesisData::load(dir.path().join("genesis.dat")).unwrap();
        assert_eq!(loaded, genesis);
        assert_eq!(loaded.block_hash(), genesis.block_hash());
        for i in 0..4 {
            assert!(dir.path().join(format!("private_signing_key_witness_{i}.dat")).exists());
        }
    }

    #[test]
    fn block_hash_excludes_blockchain_id() {
        let a = GenesisData {
            blockchain_id: 1,
            nwitnesses: 2,
            maxmal: 0,
            signing_keys: vec![[1u8; 32], [2u8; 32]],
        };
        let mut b = a.clone();
        b.blockchain_id = 9;
        assert_eq!(a.block_hash(), b.block_hash());
        assert_ne!(a.oid(), b.oid());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genesis.dat");
        let genesis = GenesisData {
            blockchain_id: 1,
            nwitnesses: 2,
            maxmal: 0,
            signing_keys: vec![[1u8; 32], [2u8; 32]],
        };
        genesis.write(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(GenesisData::load(&path).is_err());
    }
}
