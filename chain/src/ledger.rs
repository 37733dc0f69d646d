use std::path::PathBuf;
use std::sync::Arc;

use exchange::{
    matching_epoch, ExchangeMining, ExchangeMiningParams, ExchangeNums, MatchWorker, Oid,
    RecalcTime, ShutdownFlag, XreqKind, XreqStore,
};
use parking_lot::Mutex;
use state_merkle::CommitmentTree;
use state_store::keys::{
    DB_KEY_COMMIT_COMMITNUM_HI, DB_KEY_COMMIT_COMMITNUM_LO, DB_KEY_GENESIS_HASH, DB_KEY_SCHEMA,
    DB_KEY_XMATCHING, DB_KEY_XMINING,
};
use state_store::{FatalFlag, Store, StoreRead, StoreWriter};
use tracing::{debug, info};

use crate::arena::{BlockArena, NodeIndex};
use crate::block::{Block, BlockAux, BlockAuxRecord};
use crate::error::{ChainError, ChainResult};
use crate::genesis::GenesisData;
use crate::history;

pub const SCHEMA_VERSION: u32 = 1;

/// Rounds of blocks kept behind the last indelible block before the arena
/// truncates.
pub const PRUNE_TRAILING_ROUNDS: u64 = 4;

#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub default_domain: u32,
    pub foundation_domain: u32,
    /// Witness incentive deducted from the buyer side of a paid match.
    pub donation_per_xcx_pay: u128,
    /// Exponent range for native-asset output amounts.
    pub outvalmin: u32,
    pub outvalmax: u32,
    pub mining_start_time: u64,
    pub commitment_tree_depth: usize,
    pub history_data_file: Option<PathBuf>,
    /// Checksum the history file must carry; a configuration input.
    pub expected_history_hash: Option<[u8; 32]>,
    /// Destinations for the per-block mint outputs; empty disables them.
    pub mint_destinations: Vec<[u8; 32]>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            db_path: PathBuf::from("obol.db"),
            default_domain: 1,
            foundation_domain: 2,
            donation_per_xcx_pay: 0,
            outvalmin: 0,
            outvalmax: crate::amount::AMOUNT_MAX_EXPONENT,
            mining_start_time: 0,
            commitment_tree_depth: state_merkle::COMMITMENT_TREE_DEPTH,
            history_data_file: None,
            expected_history_hash: None,
            mint_destinations: Vec::new(),
        }
    }
}

/// Snapshot published after each commit; the only view of chain state that
/// readers may rely on.
#[derive(Clone, Copy, Debug, Default)]
pub struct LastIndelible {
    pub level: u64,
    pub timestamp: u64,
    pub oid: Oid,
    pub last_matching_completed_block_time: u64,
    pub last_matching_start_block_time: u64,
}

pub(crate) struct ChainState {
    pub arena: BlockArena,
    pub last_indelible: Option<NodeIndex>,
    pub new_indelible: Option<NodeIndex>,
    pub startup_prune_level: u64,
}

pub(crate) struct MatchingState {
    pub worker: Option<MatchWorker>,
    pub last_matching_epoch: u64,
    pub matching_block_time: u64,
    pub last_matched_block_time: u64,
    pub max_xreqnum: u64,
}

/// The engine root: owns the store, the commitment tree, the exchange state
/// and the block arena. One per process; every subsystem call goes through a
/// handle to it.
pub struct Ledger {
    pub(crate) config: LedgerConfig,
    pub(crate) genesis: GenesisData,
    pub(crate) store: Store,
    pub(crate) fatal: Arc<FatalFlag>,
    pub(crate) shutdown: Arc<ShutdownFlag>,
    pub(crate) xreqs: Arc<XreqStore>,
    pub(crate) nums: ExchangeNums,
    pub(crate) mining: Mutex<ExchangeMining>,
    pub(crate) tree: Mutex<CommitmentTree>,
    pub(crate) chain: Mutex<ChainState>,
    pub(crate) matching: Mutex<MatchingState>,
    published: Mutex<LastIndelible>,
}

impl Ledger {
    pub fn open(config: LedgerConfig, genesis: GenesisData) -> ChainResult<Ledger> {
        let fatal = Arc::new(FatalFlag::new());
        let shutdown = Arc::new(ShutdownFlag::new());
        let store = Store::open(&config.db_path, Arc::clone(&fatal))?;

        let next_commitnum = read_next_commitnum(&store)?;
        let tree = CommitmentTree::restore(config.commitment_tree_depth, next_commitnum, |h, o| {
            store.commit_tree_select(h, o).ok().flatten()
        })?;

        let nums_snapshot = store.xcx_nums_select_le(u64::MAX)?;
        let nums = match nums_snapshot {
            Some(rec) => ExchangeNums::restore(rec.next_xreqnum, rec.next_xmatchnum),
            None => ExchangeNums::restore(0, 0),
        };

        let mining = ExchangeMining::new(config.mining_start_time);

        let ledger = Ledger {
            config,
            genesis,
            store,
            fatal,
            shutdown,
            xreqs: Arc::new(XreqStore::new()),
            nums,
            mining: Mutex::new(mining),
            tree: Mutex::new(tree),
            chain: Mutex::new(ChainState {
                arena: BlockArena::new(),
                last_indelible: None,
                new_indelible: None,
                startup_prune_level: 0,
            }),
            matching: Mutex::new(MatchingState {
                worker: None,
                last_matching_epoch: 0,
                matching_block_time: 0,
                last_matched_block_time: 0,
                max_xreqnum: 0,
            }),
            published: Mutex::new(LastIndelible::default()),
        };

        match ledger.store.blockchain_select_max()? {
            None => ledger.bootstrap()?,
            Some(level) => ledger.restore(level)?,
        }

        ledger.restore_xreqs()?;
        ledger.start_matching()?;

        Ok(ledger)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn fatal(&self) -> &Arc<FatalFlag> {
        &self.fatal
    }

    pub fn shutdown_flag(&self) -> &Arc<ShutdownFlag> {
        &self.shutdown
    }

    pub fn xreq_store(&self) -> &Arc<XreqStore> {
        &self.xreqs
    }

    pub fn last_indelible(&self) -> LastIndelible {
        *self.published.lock()
    }

    /// Stops the matching worker and marks the process as shutting down;
    /// any in-flight write rolls back when its owner observes the flag.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        if let Some(mut worker) = self.matching.lock().worker.take() {
            worker.shutdown();
        }
    }

    /// Fresh store: pin the schema and genesis hash, seed the commitment
    /// tree with the null commitment, optionally replay the history file,
    /// then promote the genesis block.
    fn bootstrap(&self) -> ChainResult<()> {
        info!(blockchain = self.genesis.blockchain_id, "bootstrapping fresh store");

        let mut chain = self.chain.lock();
        let mut writer = Some(self.store.begin_write()?);
        {
            let w = writer.as_mut().expect("writer open");
            w.parameter_insert(DB_KEY_SCHEMA, 0, &SCHEMA_VERSION.to_le_bytes())?;
            w.parameter_insert(DB_KEY_GENESIS_HASH, 0, &self.genesis.block_hash())?;

            // The null commitment occupies commitnum zero.
            let null_commitment = [0u8; 32];
            let commitnum = self.append_commitment(w, &null_commitment)?;
            debug_assert_eq!(commitnum, 0);
            w.parameter_insert(
                state_store::keys::DB_KEY_COMMIT_NULL_INPUT,
                0,
                &null_commitment,
            )?;

            if let Some(path) = self.config.history_data_file.clone() {
                history::load_history_file(self, w, &path)?;
            }

            self.save_mining(w)?;
        }

        let (block, aux) = self.genesis.block()?;
        let index = chain.arena.insert(block, aux, None);
        let promoted = self.set_newly_indelible_block(&mut chain, &mut writer, index)?;
        if !promoted {
            return Err(ChainError::Fatal("genesis block did not promote"));
        }

        writer.expect("writer open").commit()?;
        let new_index = chain.new_indelible.take().expect("genesis promoted");
        chain.last_indelible = Some(new_index);
        self.set_last_indelible(&chain, new_index);
        Ok(())
    }

    /// Existing store: verify the genesis hash, restore mining state, and
    /// reload the tail of the chain into the arena.
    fn restore(&self, last_level: u64) -> ChainResult<()> {
        info!(last_level, "restoring from store");

        let stored_hash = self
            .store
            .parameter_select(DB_KEY_GENESIS_HASH, 0)?
            .ok_or(ChainError::Fatal("missing genesis hash parameter"))?;
        if stored_hash != self.genesis.block_hash() {
            self.fatal.set("genesis block hash mismatch");
            return Err(ChainError::Fatal("genesis block hash mismatch"));
        }

        if let Some(bytes) = self.store.parameter_select(DB_KEY_XMINING, 0)? {
            let params: ExchangeMiningParams = bincode::deserialize(&bytes)?;
            self.mining.lock().restore(params);
        }

        let mut chain = self.chain.lock();
        chain.startup_prune_level = last_level;

        let last_aux = self.load_block_aux(last_level)?;
        let nblocks = {
            let p = &last_aux.params;
            ((p.next_nwitnesses - p.next_maxmal) / 2 + p.next_maxmal + 1) as u64
        };
        let first_level = last_level.saturating_sub(nblocks - 1);

        let mut prior: Option<NodeIndex> = None;
        let mut newest: Option<NodeIndex> = None;
        for level in first_level..=last_level {
            let bytes = self
                .store
                .blockchain_select(level)?
                .ok_or(ChainError::Fatal("missing block row during restore"))?;
            let block = Block::decode(&bytes)?;
            let aux = BlockAux::from_record(self.load_block_aux(level)?, true);
            let index = chain.arena.insert(block, aux, prior);
            prior = Some(index);
            newest = Some(index);
        }

        let newest = newest.expect("restored at least one block");
        chain.last_indelible = Some(newest);
        self.set_last_indelible(&chain, newest);
        Ok(())
    }

    fn load_block_aux(&self, level: u64) -> ChainResult<BlockAuxRecord> {
        let bytes = self
            .store
            .parameter_select(state_store::keys::DB_KEY_BLOCK_AUX, (level % 64) as u32)?
            .ok_or(ChainError::Fatal("missing block aux parameter"))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Rebuilds the in-memory request table from the persistent request
    /// rows, relinking mining-trade pairs by their consecutive xreqnums and
    /// recovering each request's block time from the per-level snapshots.
    fn restore_xreqs(&self) -> ChainResult<()> {
        let mut table = self.xreqs.write();
        let mut next_xreqnum = 0u64;
        let mut expected_mining_sell_xreqnum = 0u64;

        while !self.shutdown.is_set() {
            let Some(req) = self.store.xmatchreq_select_next(next_xreqnum)? else {
                break;
            };
            debug_assert!(req.xreqnum < self.nums.next_xreqnum());
            next_xreqnum = req.xreqnum + 1;

            if req.is_closed() || req.open_amount == 0 {
                continue;
            }

            let mut xreq = exchange::Xreq::new(req.kind);
            xreq.objid = req.objid;
            xreq.expire_time = req.expire_time;
            xreq.base_asset = req.base_asset;
            xreq.quote_asset = req.quote_asset;
            xreq.foreign_asset = req.foreign_asset;
            xreq.foreign_address = req.foreign_address.clone();
            xreq.destination = req.destination;
            xreq.min_amount = req.min_amount;
            xreq.max_amount = req.max_amount;
            xreq.net_rate_required = req.net_rate_required;
            xreq.wait_discount = req.wait_discount;
            xreq.base_costs = req.base_costs;
            xreq.quote_costs = req.quote_costs;
            xreq.pledge = req.pledge;
            xreq.hold_time = req.hold_time;
            xreq.hold_time_required = req.hold_time_required;
            xreq.min_wait_time = req.min_wait_time;
            xreq.consideration_required = req.consideration_required;
            xreq.consideration_offered = req.consideration_offered;
            xreq.accept_time_required = req.accept_time_required;
            xreq.accept_time_offered = req.accept_time_offered;
            xreq.payment_time = req.payment_time;
            xreq.confirmations = req.confirmations;
            xreq.auto_accept = req.auto_accept;

            xreq.xreqnum = req.xreqnum;
            xreq.open_amount = req.open_amount;
            xreq.open_rate_required = xreq.match_rate_required(xreq.open_amount);
            xreq.recalc_time = RecalcTime::Next;
            xreq.blocktime = self
                .store
                .xcx_nums_blocktime(req.xreqnum)?
                .ok_or(ChainError::Fatal("missing exchange request blocktime"))?;

            xreq.seqnum = table.alloc_seqnum();

            // A linked mining pair always has consecutive xreqnums; one half
            // may be missing if it was pruned, so link only when both line up.
            if xreq.kind == XreqKind::MiningSell && xreq.xreqnum == expected_mining_sell_xreqnum {
                xreq.linked_seqnum = xreq.seqnum - 1;
            }
            if xreq.kind == XreqKind::MiningBuy {
                xreq.linked_seqnum = xreq.seqnum + 1;
                expected_mining_sell_xreqnum = xreq.xreqnum + 1;
            }

            debug!(xreqnum = xreq.xreqnum, seqnum = xreq.seqnum, "restored open request");
            table.insert(xreq);
        }

        info!(
            persistent = table.count_persistent(),
            "exchange request table restored"
        );
        Ok(())
    }

    /// Spawns the matching worker and starts the first round against the
    /// persisted matching snapshot.
    fn start_matching(&self) -> ChainResult<()> {
        let published = self.last_indelible();
        let mut matching = self.matching.lock();

        matching.last_matching_epoch = matching_epoch(published.timestamp);
        matching.matching_block_time =
            matching.last_matching_epoch * exchange::XCX_MATCHING_SECS_PER_EPOCH;

        matching.max_xreqnum = match self.store.parameter_select(DB_KEY_XMATCHING, 0)? {
            Some(bytes) => u64::from_le_bytes(
                bytes
                    .try_into()
                    .map_err(|_| ChainError::Fatal("corrupt matching parameter"))?,
            ),
            None => 0,
        };

        info!(
            block_time = matching.matching_block_time,
            max_xreqnum = matching.max_xreqnum,
            "starting exchange matching"
        );

        let worker = MatchWorker::spawn(Arc::clone(&self.xreqs), Arc::clone(&self.shutdown));
        worker.start_round(matching.matching_block_time, matching.max_xreqnum)?;
        matching.worker = Some(worker);
        Ok(())
    }

    pub(crate) fn set_last_indelible(&self, chain: &ChainState, index: NodeIndex) {
        let node = chain.arena.get(index).expect("indelible node present");
        let matching = self.matching.lock();
        let mut published = self.published.lock();
        published.level = node.block.header.level;
        published.timestamp = node.block.header.timestamp;
        published.oid = node.aux.oid;
        published.last_matching_completed_block_time = matching.last_matched_block_time;
        published.last_matching_start_block_time = matching.matching_block_time;
        debug!(level = published.level, "last indelible published");
    }

    /// Appends one commitment to the tree and persists the touched nodes
    /// plus the next-commitnum parameter rows.
    pub(crate) fn append_commitment(
        &self,
        writer: &mut StoreWriter<'_>,
        commitment: &[u8; 32],
    ) -> ChainResult<u64> {
        let mut tree = self.tree.lock();
        let (commitnum, writes) = tree.append(*commitment)?;
        for w in &writes {
            writer.commit_tree_insert(w.height, w.offset, &w.hash)?;
        }
        let next = tree.next_commitnum();
        writer.parameter_insert(
            DB_KEY_COMMIT_COMMITNUM_LO,
            0,
            &((next & u32::MAX as u64) as u32).to_le_bytes(),
        )?;
        writer.parameter_insert(DB_KEY_COMMIT_COMMITNUM_HI, 0, &((next >> 32) as u32).to_le_bytes())?;
        Ok(commitnum)
    }

    pub(crate) fn save_mining(&self, writer: &mut StoreWriter<'_>) -> ChainResult<()> {
        let mut mining = self.mining.lock();
        let dirty = mining.dirty_params().cloned();
        if let Some(params) = dirty {
            writer.parameter_insert(DB_KEY_XMINING, 0, &bincode::serialize(&params)?)?;
            mining.mark_saved();
        }
        Ok(())
    }

    pub(crate) fn fatal_error(&self, msg: &'static str) -> ChainError {
        self.fatal.set(msg);
        ChainError::Fatal(msg)
    }
}

fn read_next_commitnum(store: &Store) -> ChainResult<u64> {
    let lo = store.parameter_select(DB_KEY_COMMIT_COMMITNUM_LO, 0)?;
    let hi = store.parameter_select(DB_KEY_COMMIT_COMMITNUM_HI, 0)?;
    let lo = match lo {
        Some(bytes) => u32::from_le_bytes(
            bytes
                .try_into()
                .map_err(|_| ChainError::Fatal("corrupt commitnum parameter"))?,
        ) as u64,
        None => return Ok(0),
    };
    let hi = match hi {
        Some(bytes) => u32::from_le_bytes(
            bytes
                .try_into()
                .map_err(|_| ChainError::Fatal("corrupt commitnum parameter"))?,
        ) as u64,
        None => 0,
    };
    Ok((hi << 32) | lo)
}
