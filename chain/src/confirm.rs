use exchange::Oid;
use state_store::keys::{DB_KEY_BLOCK_AUX, DB_KEY_DONATION_TOTALS};
use state_store::{StoreRead, StoreWriter};
use tracing::{debug, info, trace};

use crate::arena::NodeIndex;
use crate::block::{Block, BlockAux};
use crate::error::{ChainError, ChainResult};
use crate::ledger::{ChainState, Ledger, PRUNE_TRAILING_ROUNDS};

impl Ledger {
    /// Links an incoming candidate block into the arena. The prior block
    /// must already be known; level, timestamp and witness are checked
    /// against it and the skip flag is derived from the rotation order.
    pub fn add_candidate_block(&self, block: Block) -> ChainResult<Oid> {
        let mut chain = self.chain.lock();
        let oid = block.hash();

        if chain.arena.lookup_oid(&oid).is_some() {
            trace!(oid = %hex::encode(&oid[..8]), "duplicate candidate block");
            return Ok(oid);
        }

        let prior_index = chain
            .arena
            .lookup_oid(&block.header.prior_oid)
            .ok_or(ChainError::InvalidBlock("unknown prior block"))?;
        let prior = chain.arena.get(prior_index).expect("prior node present");

        if block.header.level != prior.block.header.level + 1 {
            return Err(ChainError::InvalidBlock("level is not prior level plus one"));
        }
        if block.header.timestamp < prior.block.header.timestamp {
            return Err(ChainError::InvalidBlock("timestamp below prior block"));
        }

        let params = prior.aux.params.clone();
        if block.header.witness >= params.nwitnesses {
            return Err(ChainError::InvalidBlock("witness index out of range"));
        }

        let expected_witness = if prior.block.header.level == 0 {
            0
        } else {
            (prior.block.header.witness + 1) % params.nwitnesses
        };
        let skip = block.header.witness != expected_witness;

        let aux = BlockAux {
            oid,
            block_hash: oid,
            skip,
            marked_for_indelible: false,
            total_donations: 0,
            params,
        };

        debug!(
            level = block.header.level,
            witness = block.header.witness,
            skip,
            oid = %hex::encode(&oid[..8]),
            "candidate block added"
        );

        chain.arena.insert(block, aux, Some(prior_index));
        Ok(oid)
    }

    /// Drives confirmation from a newly-arrived block: promotes every
    /// ancestor that now satisfies the quorum rule inside one write
    /// transaction, commits, then publishes the new last-indelible pointer.
    pub fn do_confirmations(&self, oid: &Oid) -> ChainResult<()> {
        if self.fatal.is_set() {
            return Err(ChainError::Fatal("prior fatal error"));
        }

        let mut chain = self.chain.lock();
        let start = chain
            .arena
            .lookup_oid(oid)
            .ok_or(ChainError::InvalidBlock("unknown block"))?;

        let mut writer: Option<StoreWriter<'_>> = None;
        let mut promoted_any = false;

        loop {
            if self.shutdown.is_set() {
                return Err(ChainError::Shutdown);
            }
            if !self.do_confirm_one(&mut chain, &mut writer, start)? {
                break;
            }
            promoted_any = true;
        }

        if !promoted_any {
            if let Some(w) = writer {
                w.rollback();
            }
            return Ok(());
        }

        let mut writer = writer.expect("promotion opened a write");
        self.save_mining(&mut writer)?;
        writer.commit()?;

        let new_index = chain.new_indelible.take().expect("new indelible block recorded");
        chain.last_indelible = Some(new_index);
        self.set_last_indelible(&chain, new_index);

        let prune_level = compute_prune_level(&chain);
        chain.arena.prune(prune_level);

        Ok(())
    }

    /// One promotion attempt: walk back from `start` over unmarked blocks,
    /// and if the walk is long enough under the quorum rule, promote the
    /// oldest unmarked ancestor. Returns false when nothing new promoted.
    fn do_confirm_one<'a>(
        &'a self,
        chain: &mut ChainState,
        writer: &mut Option<StoreWriter<'a>>,
        start: NodeIndex,
    ) -> ChainResult<bool> {
        let node = chain.arena.get(start).expect("start node present");
        if node.aux.marked_for_indelible {
            // Re-applying an already-indelible block is a no-op.
            return Ok(false);
        }

        let nseqconfsigs = node.aux.params.nseqconfsigs as u64;
        let nskipconfsigs = node.aux.params.nskipconfsigs as u64;

        let mut nconfsigs = 1u64;
        let mut any_skip = node.aux.skip;
        let mut oldest = start;
        let mut current = start;

        loop {
            if self.shutdown.is_set() {
                return Err(ChainError::Shutdown);
            }
            let current_node = chain.arena.get(current).expect("walk node present");
            let Some(prior_index) = current_node.prior else {
                break;
            };
            let Some(prior_node) = chain.arena.get(prior_index) else {
                // Pruned ancestors are behind the confirmation window and
                // therefore indelible.
                break;
            };

            if prior_node.block.header.level + 1 != current_node.block.header.level {
                return Err(self.fatal_error("block level sequence error"));
            }
            if prior_node.aux.marked_for_indelible {
                break;
            }

            current = prior_index;
            oldest = prior_index;
            nconfsigs += 1;
            any_skip |= prior_node.aux.skip;

            trace!(
                nconfsigs,
                level = prior_node.block.header.level,
                any_skip,
                "confirmation walk"
            );
        }

        let have_indelible = chain.last_indelible.is_some() || chain.new_indelible.is_some();
        let needed = if any_skip { nskipconfsigs } else { nseqconfsigs };
        if have_indelible && nconfsigs < needed {
            trace!(nconfsigs, needed, "no new indelible block");
            return Ok(false);
        }

        self.set_newly_indelible_block(chain, writer, oldest)
    }

    /// Promotes one block: marks it, validates its linkage against the
    /// current chain tip, indexes its transactions, synchronizes exchange
    /// matching, runs expiration and pruning, snapshots the commitment root
    /// and writes the block row and derived rows. Everything lands in the
    /// caller's write transaction.
    pub(crate) fn set_newly_indelible_block<'a>(
        &'a self,
        chain: &mut ChainState,
        writer: &mut Option<StoreWriter<'a>>,
        index: NodeIndex,
    ) -> ChainResult<bool> {
        if writer.is_none() {
            *writer = Some(self.store.begin_write()?);
        }
        let writer = writer.as_mut().expect("writer open");

        let (level, timestamp, witness, prior_oid, oid, wire, txs) = {
            let node = chain.arena.get(index).expect("promote node present");
            if node.aux.marked_for_indelible {
                return Ok(false);
            }
            (
                node.block.header.level,
                node.block.header.timestamp,
                node.block.header.witness,
                node.block.header.prior_oid,
                node.aux.oid,
                node.block.wire().to_vec(),
                node.block.txs.clone(),
            )
        };

        chain
            .arena
            .get_mut(index)
            .expect("promote node present")
            .aux
            .marked_for_indelible = true;

        let tip = chain.new_indelible.or(chain.last_indelible);
        match tip {
            None => {
                if level != 0 {
                    return Err(self.fatal_error("first indelible block is not genesis"));
                }
            }
            Some(tip_index) => {
                let tip_node = chain.arena.get(tip_index).expect("tip node present");
                let expected_level = tip_node.block.header.level + 1;
                if level != expected_level || prior_oid != tip_node.aux.oid {
                    return Err(if level <= expected_level {
                        self.fatal_error("two indelible blocks at the same level")
                    } else {
                        self.fatal_error("blockchain sequence error")
                    });
                }
            }
        }

        // Snapshot before indexing: requests persisted by this block get
        // xreqnums at or above this value and are spared by prune pass zero.
        let new_xreqnum = self.nums.next_xreqnum();

        let total_donations = self.index_txs(writer, level, timestamp, &txs)?;
        chain
            .arena
            .get_mut(index)
            .expect("promote node present")
            .aux
            .total_donations = total_donations;

        self.synchronize_matching(writer, level, timestamp, new_xreqnum)?;
        self.save_next_nums(writer, level, timestamp)?;
        self.expire_matches(writer, timestamp)?;
        writer.xmatchingreq_prune(timestamp)?;

        self.update_commit_root(writer, level, timestamp)?;
        writer.blockchain_insert(level, &wire)?;

        self.split_donations(writer, total_donations, witness, chain, index)?;

        let aux_record = chain
            .arena
            .get(index)
            .expect("promote node present")
            .aux
            .record();
        writer.parameter_insert(
            DB_KEY_BLOCK_AUX,
            (level % 64) as u32,
            &bincode::serialize(&aux_record)?,
        )?;

        info!(
            level,
            timestamp,
            witness,
            oid = %hex::encode(&oid[..8]),
            donations = total_donations,
            "block promoted to indelible"
        );

        chain.new_indelible = Some(index);
        Ok(true)
    }

    /// Splits the block's donations across the witness set: the block's
    /// witness takes the big split, every other witness takes
    /// `total * 2 / (3 * nwitnesses)`. A degenerate total collapses to the
    /// big split alone.
    fn split_donations(
        &self,
        writer: &mut StoreWriter<'_>,
        total: u128,
        witness: u16,
        chain: &ChainState,
        index: NodeIndex,
    ) -> ChainResult<()> {
        if total == 0 {
            return Ok(());
        }

        let nwitnesses = chain
            .arena
            .get(index)
            .expect("promote node present")
            .aux
            .params
            .nwitnesses;
        debug_assert!(nwitnesses > 0);

        let mut big_split = total;
        let mut little_split = total * 2 / (3 * nwitnesses as u128);
        let little_sum = (nwitnesses as u128 - 1) * little_split;
        if big_split > little_sum {
            big_split -= little_sum;
        } else {
            little_split = 0;
        }

        trace!(total, big_split, little_split, "splitting donations");

        for i in 0..nwitnesses {
            let prior = match writer.parameter_select(DB_KEY_DONATION_TOTALS, i as u32)? {
                Some(bytes) => u128::from_be_bytes(
                    bytes
                        .try_into()
                        .map_err(|_| self.fatal_error("corrupt donation total"))?,
                ),
                None => 0,
            };
            let share = if i == witness { big_split } else { little_split };
            writer.parameter_insert(
                DB_KEY_DONATION_TOTALS,
                i as u32,
                &(prior + share).to_be_bytes(),
            )?;
        }

        Ok(())
    }

    fn update_commit_root(
        &self,
        writer: &mut StoreWriter<'_>,
        level: u64,
        timestamp: u64,
    ) -> ChainResult<()> {
        let tree = self.tree.lock();
        let record = state_store::CommitRootRecord {
            timestamp,
            next_commitnum: tree.next_commitnum(),
            root: tree.root(),
        };
        writer.commit_roots_insert(level, &record)?;
        writer.parameter_insert(
            state_store::keys::DB_KEY_COMMIT_BLOCKLEVEL,
            0,
            &level.to_le_bytes(),
        )?;
        Ok(())
    }

    fn save_next_nums(&self, writer: &mut StoreWriter<'_>, level: u64, timestamp: u64) -> ChainResult<()> {
        if !self.nums.take_unsaved() {
            return Ok(());
        }
        let record = state_store::XcxNumsRecord {
            level,
            timestamp,
            next_xreqnum: self.nums.next_xreqnum(),
            next_xmatchnum: self.nums.next_xmatchnum(),
        };
        writer.xcx_nums_insert(&record)?;
        Ok(())
    }
}

fn compute_prune_level(chain: &ChainState) -> u64 {
    let Some(last) = chain.last_indelible else {
        return chain.startup_prune_level;
    };
    let Some(node) = chain.arena.get(last) else {
        return chain.startup_prune_level;
    };
    let trailing = PRUNE_TRAILING_ROUNDS * node.aux.params.nwitnesses as u64;
    node.block
        .header
        .level
        .saturating_sub(trailing)
        .max(chain.startup_prune_level)
}
