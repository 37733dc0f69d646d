//! Append-only Merkle accumulator for output commitments.
//!
//! Leaves are keyed by `commitnum`, assigned in insertion order. The tree is
//! fixed-height with zero-valued defaults, so the root at any point is a
//! function of the leaves appended so far. Appends report every interior
//! node they touch as `(height, offset, hash)` writes, which the caller
//! persists; the in-memory state is just the frontier and can be rebuilt
//! from those persisted nodes.

use thiserror::Error;

pub type Commitment = [u8; 32];

/// Tree height; bounds the chain at 2^40 output commitments.
pub const COMMITMENT_TREE_DEPTH: usize = 40;

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("tree depth must be greater than zero")]
    InvalidDepth,
    #[error("merkle tree is full")]
    TreeFull,
    #[error("restore is missing node at height {height} offset {offset}")]
    MissingNode { height: usize, offset: u64 },
}

/// One node write produced by an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeWrite {
    pub height: usize,
    pub offset: u64,
    pub hash: Commitment,
}

fn merkle_node(left: &Commitment, right: &Commitment) -> Commitment {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

fn default_nodes(depth: usize) -> Vec<Commitment> {
    let mut nodes = Vec::with_capacity(depth + 1);
    nodes.push([0u8; 32]);
    for level in 0..depth {
        let prev = nodes[level];
        nodes.push(merkle_node(&prev, &prev));
    }
    nodes
}

#[derive(Clone, Debug)]
pub struct CommitmentTree {
    depth: usize,
    next_commitnum: u64,
    frontier: Vec<Commitment>,
    defaults: Vec<Commitment>,
}

impl CommitmentTree {
    pub fn new(depth: usize) -> Result<Self, MerkleError> {
        if depth == 0 {
            return Err(MerkleError::InvalidDepth);
        }
        Ok(CommitmentTree {
            depth,
            next_commitnum: 0,
            frontier: vec![[0u8; 32]; depth],
            defaults: default_nodes(depth),
        })
    }

    /// Rebuilds the frontier for a tree holding `next_commitnum` leaves.
    /// `lookup` resolves persisted nodes by `(height, offset)`.
    pub fn restore<F>(depth: usize, next_commitnum: u64, mut lookup: F) -> Result<Self, MerkleError>
    where
        F: FnMut(usize, u64) -> Option<Commitment>,
    {
        let mut tree = CommitmentTree::new(depth)?;
        tree.next_commitnum = next_commitnum;
        for height in 0..depth {
            if (next_commitnum >> height) & 1 == 1 {
                let offset = (next_commitnum >> height) - 1;
                tree.frontier[height] = lookup(height, offset)
                    .ok_or(MerkleError::MissingNode { height, offset })?;
            }
        }
        Ok(tree)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn next_commitnum(&self) -> u64 {
        self.next_commitnum
    }

    pub fn is_full(&self) -> bool {
        let capacity = 1u64.checked_shl(self.depth as u32).unwrap_or(u64::MAX);
        self.next_commitnum >= capacity
    }

    /// Appends one commitment, returning its commitnum and the node writes
    /// along its path to the root (height 0 is the leaf itself; the final
    /// entry at `depth` is the new root).
    pub fn append(&mut self, commitment: Commitment) -> Result<(u64, Vec<NodeWrite>), MerkleError> {
        if self.is_full() {
            return Err(MerkleError::TreeFull);
        }

        let commitnum = self.next_commitnum;
        let mut writes = Vec::with_capacity(self.depth + 1);
        let mut current = commitment;
        let mut position = commitnum;

        writes.push(NodeWrite {
            height: 0,
            offset: position,
            hash: current,
        });

        for height in 0..self.depth {
            if position & 1 == 0 {
                self.frontier[height] = current;
                current = merkle_node(&current, &self.defaults[height]);
            } else {
                current = merkle_node(&self.frontier[height], &current);
            }
            position >>= 1;
            writes.push(NodeWrite {
                height: height + 1,
                offset: position,
                hash: current,
            });
        }

        self.next_commitnum += 1;
        Ok((commitnum, writes))
    }

    /// Root over the leaves appended so far, with unset leaves zero.
    pub fn root(&self) -> Commitment {
        let mut current = self.defaults[0];
        let mut position = self.next_commitnum;
        for height in 0..self.depth {
            if position & 1 == 1 {
                current = merkle_node(&self.frontier[height], &current);
            } else {
                current = merkle_node(&current, &self.defaults[height]);
            }
            position >>= 1;
        }
        current
    }
}
