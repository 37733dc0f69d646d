use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use exchange::{Xmatch, XmatchReq, XreqDisposition};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{FatalFlag, StoreError, StoreResult};
use crate::keys;
use crate::records::{CommitRootRecord, SerialnumRecord, TxOutputRecord, XcxNumsRecord};
use crate::write::{StoreWriter, WriteSet, WAL_KEY};

/// Logical tables behind the gateway, one sled tree each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum TableId {
    Parameters = 0,
    Blockchain,
    Serialnums,
    CommitTree,
    CommitRoots,
    TxOutputs,
    XcxNums,
    Xmatches,
    XmatchDeadlines,
    Xmatchreqs,
    XmatchingReqs,
    BlockedForeignAddresses,
}

pub(crate) const TABLE_COUNT: usize = 12;

pub(crate) const TABLE_NAMES: [&str; TABLE_COUNT] = [
    "parameters",
    "blockchain",
    "serialnums",
    "commit_tree",
    "commit_roots",
    "tx_outputs",
    "xcx_nums",
    "xmatches",
    "xmatch_deadlines",
    "xmatchreqs",
    "xmatching_reqs",
    "blocked_foreign_addresses",
];

/// Mode argument of `commit_roots_select_level`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootSelect {
    /// The root recorded exactly at the level.
    Exact,
    /// The smallest-level root at or above the level.
    OrGreater,
    /// The greatest-level root at or below the level.
    OrLess,
}

/// Deterministic failure injection for write paths, active in debug builds
/// when a non-zero rate is configured. A rate of N fails roughly one write
/// call in N.
#[derive(Debug)]
pub(crate) struct ErrorSim {
    rate: AtomicU32,
    state: AtomicU64,
}

impl ErrorSim {
    fn new() -> Self {
        ErrorSim {
            rate: AtomicU32::new(0),
            state: AtomicU64::new(0x243f_6a88_85a3_08d3),
        }
    }

    pub(crate) fn maybe_fail(&self) -> StoreResult<()> {
        #[cfg(debug_assertions)]
        {
            let rate = self.rate.load(Ordering::Relaxed);
            if rate != 0 {
                let s = self
                    .state
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                        Some(s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
                    })
                    .unwrap_or_default();
                if (s >> 33) % rate as u64 == 0 {
                    return Err(StoreError::Simulated);
                }
            }
        }
        Ok(())
    }
}

/// Serialized, single-writer gateway to the durable tables. Readers go
/// straight to the committed trees; writers stage a write-set under the
/// process-wide write mutex and commit it atomically through the wal tree.
pub struct Store {
    pub(crate) db: sled::Db,
    pub(crate) tables: Vec<sled::Tree>,
    pub(crate) wal: sled::Tree,
    write_mutex: Mutex<()>,
    fatal: Arc<FatalFlag>,
    pub(crate) error_sim: ErrorSim,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, fatal: Arc<FatalFlag>) -> StoreResult<Self> {
        let db = sled::open(path.as_ref())?;
        let mut tables = Vec::with_capacity(TABLE_COUNT);
        for name in TABLE_NAMES {
            tables.push(db.open_tree(name)?);
        }
        let wal = db.open_tree("wal")?;

        let store = Store {
            db,
            tables,
            wal,
            write_mutex: Mutex::new(()),
            fatal,
            error_sim: ErrorSim::new(),
        };

        store.recover_wal()?;

        Ok(store)
    }

    /// Replays a write-set whose commit record survived a crash between the
    /// wal flush and the table applies. Applying is idempotent.
    fn recover_wal(&self) -> StoreResult<()> {
        if let Some(bytes) = self.wal.get(WAL_KEY)? {
            info!("replaying interrupted commit from wal");
            let set = WriteSet::from_wal_bytes(&bytes)?;
            self.apply_write_set(&set)?;
            self.wal.remove(WAL_KEY)?;
            self.db.flush()?;
        }
        Ok(())
    }

    pub(crate) fn apply_write_set(&self, set: &WriteSet) -> StoreResult<()> {
        for (table, entries) in set.tables() {
            if entries.is_empty() {
                continue;
            }
            let mut batch = sled::Batch::default();
            for (key, value) in entries {
                match value {
                    Some(v) => batch.insert(key.as_slice(), v.as_slice()),
                    None => batch.remove(key.as_slice()),
                }
            }
            self.tree(table).apply_batch(batch)?;
        }
        Ok(())
    }

    pub(crate) fn tree(&self, table: TableId) -> &sled::Tree {
        &self.tables[table as usize]
    }

    pub fn fatal(&self) -> &Arc<FatalFlag> {
        &self.fatal
    }

    /// Debug-build failure injection; a no-op knob in release builds.
    pub fn set_error_simulation(&self, rate: u32) {
        self.error_sim.rate.store(rate, Ordering::Relaxed);
    }

    /// Acquires the process-wide write mutex and opens a staged write.
    /// Blocks while another writer holds the mutex; refuses after a fatal
    /// error. Dropping the returned writer without committing rolls back.
    pub fn begin_write(&self) -> StoreResult<StoreWriter<'_>> {
        if self.fatal.is_set() {
            return Err(StoreError::Fatal);
        }
        let guard = self.write_mutex.lock();
        debug!("write mutex acquired");
        Ok(StoreWriter::new(self, guard))
    }

    /// Flushes committed data to disk; runs on the checkpoint worker.
    pub(crate) fn checkpoint(db: sled::Db) {
        let _ = std::thread::Builder::new()
            .name("obol-checkpoint".into())
            .spawn(move || {
                if let Err(err) = db.flush() {
                    tracing::warn!(%err, "checkpoint flush failed");
                }
            });
    }
}

/// Read interface shared by the plain store (committed data) and an open
/// writer (committed data overlaid with its staged write-set).
pub trait StoreRead {
    fn raw_get(&self, table: TableId, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// First entry of the table inside `[lo, hi]` bounds, in forward or
    /// reverse key order.
    fn raw_first(
        &self,
        table: TableId,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
        reverse: bool,
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>>;

    fn parameter_select(&self, key: u8, subkey: u32) -> StoreResult<Option<Vec<u8>>> {
        self.raw_get(TableId::Parameters, &keys::parameter_key(key, subkey))
    }

    fn blockchain_select(&self, level: u64) -> StoreResult<Option<Vec<u8>>> {
        self.raw_get(TableId::Blockchain, &keys::u64_key(level))
    }

    fn blockchain_select_max(&self) -> StoreResult<Option<u64>> {
        let last = self.raw_first(
            TableId::Blockchain,
            Bound::Unbounded,
            Bound::Unbounded,
            true,
        )?;
        Ok(last.and_then(|(k, _)| keys::u64_from_key(&k)))
    }

    fn serialnum_select(&self, serialnum: &[u8; 32]) -> StoreResult<Option<SerialnumRecord>> {
        self.raw_get(TableId::Serialnums, serialnum)?
            .map(|v| bincode::deserialize(&v).map_err(StoreError::from))
            .transpose()
    }

    fn commit_tree_select(&self, height: usize, offset: u64) -> StoreResult<Option<[u8; 32]>> {
        Ok(self
            .raw_get(TableId::CommitTree, &keys::commit_tree_key(height, offset))?
            .and_then(|v| v.try_into().ok()))
    }

    fn commit_roots_select_level(
        &self,
        level: u64,
        mode: RootSelect,
    ) -> StoreResult<Option<(u64, CommitRootRecord)>> {
        let key = keys::u64_key(level);
        let found = match mode {
            RootSelect::Exact => self
                .raw_get(TableId::CommitRoots, &key)?
                .map(|v| (key.clone(), v)),
            RootSelect::OrGreater => self.raw_first(
                TableId::CommitRoots,
                Bound::Included(key),
                Bound::Unbounded,
                false,
            )?,
            RootSelect::OrLess => self.raw_first(
                TableId::CommitRoots,
                Bound::Unbounded,
                Bound::Included(key),
                true,
            )?,
        };
        decode_root_row(found)
    }

    /// The root whose leaf range covers `commitnum`: the lowest-level root
    /// with `next_commitnum > commitnum`.
    fn commit_roots_select_commitnum(
        &self,
        commitnum: u64,
    ) -> StoreResult<Option<(u64, CommitRootRecord)>> {
        let mut lo = Bound::Unbounded;
        loop {
            let row = self.raw_first(TableId::CommitRoots, lo, Bound::Unbounded, false)?;
            let Some((level, record)) = decode_root_row(row)? else {
                return Ok(None);
            };
            if record.next_commitnum > commitnum {
                return Ok(Some((level, record)));
            }
            lo = Bound::Excluded(keys::u64_key(level));
        }
    }

    fn tx_outputs_select(
        &self,
        address: &[u8; 32],
        commitnum_start: u64,
        limit: usize,
    ) -> StoreResult<Vec<TxOutputRecord>> {
        let mut out = Vec::new();
        let mut lo = Bound::Included(keys::tx_output_key(address, commitnum_start));
        let hi = Bound::Included(keys::tx_output_key(address, u64::MAX));
        while out.len() < limit {
            let Some((key, value)) = self.raw_first(TableId::TxOutputs, lo, hi.clone(), false)?
            else {
                break;
            };
            out.push(bincode::deserialize(&value)?);
            lo = Bound::Excluded(key);
        }
        Ok(out)
    }

    fn xcx_nums_select_le(&self, level: u64) -> StoreResult<Option<XcxNumsRecord>> {
        let row = self.raw_first(
            TableId::XcxNums,
            Bound::Unbounded,
            Bound::Included(keys::u64_key(level)),
            true,
        )?;
        row.map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .transpose()
    }

    /// Timestamp of the block that persisted `xreqnum`: the timestamp of the
    /// lowest level whose snapshot has `next_xreqnum > xreqnum`.
    fn xcx_nums_blocktime(&self, xreqnum: u64) -> StoreResult<Option<u64>> {
        let mut lo = Bound::Unbounded;
        loop {
            let row = self.raw_first(TableId::XcxNums, lo, Bound::Unbounded, false)?;
            let Some((key, value)) = row else {
                return Ok(None);
            };
            let record: XcxNumsRecord = bincode::deserialize(&value)?;
            if record.next_xreqnum > xreqnum {
                return Ok(Some(record.timestamp));
            }
            lo = Bound::Excluded(key);
        }
    }

    fn xmatch_select(&self, xmatchnum: u64) -> StoreResult<Option<Xmatch>> {
        self.raw_get(TableId::Xmatches, &keys::u64_key(xmatchnum))?
            .map(|v| bincode::deserialize(&v).map_err(StoreError::from))
            .transpose()
    }

    /// The match with the earliest payment deadline at or before
    /// `max_deadline`.
    fn xmatch_select_next_deadline(&self, max_deadline: u64) -> StoreResult<Option<Xmatch>> {
        let row = self.raw_first(
            TableId::XmatchDeadlines,
            Bound::Included(keys::deadline_key(1, 0)),
            Bound::Included(keys::deadline_key(max_deadline, u64::MAX)),
            false,
        )?;
        let Some((key, _)) = row else {
            return Ok(None);
        };
        let xmatchnum =
            keys::deadline_key_xmatchnum(&key).ok_or(StoreError::Corrupt("xmatch_deadlines"))?;
        self.xmatch_select(xmatchnum)
    }

    fn blocked_foreign_address_select(&self, blockchain: u64, address: &str) -> StoreResult<bool> {
        let mut key = blockchain.to_be_bytes().to_vec();
        key.extend_from_slice(address.as_bytes());
        Ok(self.raw_get(TableId::BlockedForeignAddresses, &key)?.is_some())
    }

    fn xmatchreq_select(&self, xreqnum: u64) -> StoreResult<Option<XmatchReq>> {
        self.raw_get(TableId::Xmatchreqs, &keys::u64_key(xreqnum))?
            .map(|v| bincode::deserialize(&v).map_err(StoreError::from))
            .transpose()
    }

    /// Next persisted request with `xreqnum >= min_xreqnum`, for the startup
    /// rebuild scan.
    fn xmatchreq_select_next(&self, min_xreqnum: u64) -> StoreResult<Option<XmatchReq>> {
        let row = self.raw_first(
            TableId::Xmatchreqs,
            Bound::Included(keys::u64_key(min_xreqnum)),
            Bound::Unbounded,
            false,
        )?;
        row.map(|(_, v)| bincode::deserialize(&v).map_err(StoreError::from))
            .transpose()
    }
}

fn decode_root_row(
    row: Option<(Vec<u8>, Vec<u8>)>,
) -> StoreResult<Option<(u64, CommitRootRecord)>> {
    let Some((key, value)) = row else {
        return Ok(None);
    };
    let level = keys::u64_from_key(&key).ok_or(StoreError::Corrupt("commit_roots"))?;
    let record = bincode::deserialize(&value)?;
    Ok(Some((level, record)))
}

impl StoreRead for Store {
    fn raw_get(&self, table: TableId, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.tree(table).get(key)?.map(|v| v.to_vec()))
    }

    fn raw_first(
        &self,
        table: TableId,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
        reverse: bool,
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.tree(table).range((lo, hi));
        let item = if reverse { iter.next_back() } else { iter.next() };
        Ok(item
            .transpose()?
            .map(|(k, v)| (k.to_vec(), v.to_vec())))
    }
}

/// Helpers shared with the writer for typed mutations.
impl Store {
    pub(crate) fn encode_xmatch(m: &Xmatch) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(m)?)
    }

    pub(crate) fn encode_xmatchreq(r: &XmatchReq) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(r)?)
    }

    pub(crate) fn decode_xmatchreq(bytes: &[u8]) -> StoreResult<XmatchReq> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub(crate) fn update_disposition(
        bytes: &[u8],
        disposition: XreqDisposition,
    ) -> StoreResult<Vec<u8>> {
        let mut req = Self::decode_xmatchreq(bytes)?;
        req.disposition = disposition;
        Self::encode_xmatchreq(&req)
    }
}
