use std::collections::BTreeMap;
use std::ops::Bound;

use exchange::{Xmatch, XmatchReq, XreqDisposition};
use parking_lot::MutexGuard;
use tracing::{debug, trace};

use crate::error::{InsertOutcome, StoreError, StoreResult};
use crate::keys;
use crate::records::{CommitRootRecord, SerialnumRecord, TxOutputRecord, XcxNumsRecord};
use crate::store::{Store, StoreRead, TableId, TABLE_COUNT};

pub(crate) const WAL_KEY: &[u8] = b"pending";

type Entries = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Staged mutations of one write transaction: per table, key to new value
/// (None is a delete). Committed atomically via the wal tree.
#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    maps: [Entries; TABLE_COUNT],
}

impl WriteSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.maps.iter().all(|m| m.is_empty())
    }

    fn map(&self, table: TableId) -> &Entries {
        &self.maps[table as usize]
    }

    pub(crate) fn map_mut(&mut self, table: TableId) -> &mut Entries {
        &mut self.maps[table as usize]
    }

    pub(crate) fn tables(&self) -> impl Iterator<Item = (TableId, &Entries)> {
        const IDS: [TableId; TABLE_COUNT] = [
            TableId::Parameters,
            TableId::Blockchain,
            TableId::Serialnums,
            TableId::CommitTree,
            TableId::CommitRoots,
            TableId::TxOutputs,
            TableId::XcxNums,
            TableId::Xmatches,
            TableId::XmatchDeadlines,
            TableId::Xmatchreqs,
            TableId::XmatchingReqs,
            TableId::BlockedForeignAddresses,
        ];
        IDS.iter().map(|&id| (id, self.map(id)))
    }

    pub(crate) fn to_wal_bytes(&self) -> StoreResult<Vec<u8>> {
        let flat: Vec<(u8, Vec<(Vec<u8>, Option<Vec<u8>>)>)> = self
            .tables()
            .map(|(id, entries)| {
                (
                    id as u8,
                    entries
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            })
            .collect();
        Ok(bincode::serialize(&flat)?)
    }

    pub(crate) fn from_wal_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let flat: Vec<(u8, Vec<(Vec<u8>, Option<Vec<u8>>)>)> = bincode::deserialize(bytes)?;
        let mut set = WriteSet::default();
        for (id, entries) in flat {
            if id as usize >= TABLE_COUNT {
                return Err(StoreError::Corrupt("wal"));
            }
            set.maps[id as usize].extend(entries);
        }
        Ok(set)
    }
}

/// An open write transaction. Holds the process-wide write mutex; all
/// mutations stage into the write-set and its reads see staged data over
/// committed data. `commit` makes the whole set durable atomically;
/// dropping without commit discards it.
pub struct StoreWriter<'a> {
    store: &'a Store,
    overlay: WriteSet,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> StoreWriter<'a> {
    pub(crate) fn new(store: &'a Store, guard: MutexGuard<'a, ()>) -> Self {
        StoreWriter {
            store,
            overlay: WriteSet::default(),
            _guard: guard,
        }
    }

    fn stage(&mut self, table: TableId, key: Vec<u8>, value: Option<Vec<u8>>) {
        trace!(table = ?table, key = ?key.len(), delete = value.is_none(), "stage");
        self.overlay.map_mut(table).insert(key, value);
    }

    /// Commits the staged write-set: the serialized set is flushed into the
    /// wal tree first, so a crash mid-apply replays on the next open. The
    /// write mutex is released before the checkpoint flush starts.
    pub fn commit(self) -> StoreResult<()> {
        let StoreWriter {
            store,
            overlay,
            _guard,
        } = self;

        if overlay.is_empty() {
            return Ok(());
        }

        store.error_sim.maybe_fail()?;

        let wal_bytes = overlay.to_wal_bytes()?;
        store.wal.insert(WAL_KEY, wal_bytes)?;
        store.db.flush()?;

        store.apply_write_set(&overlay)?;
        store.wal.remove(WAL_KEY)?;

        debug!("write committed");

        drop(_guard);
        Store::checkpoint(store.db.clone());

        Ok(())
    }

    /// Discards the staged write-set. Equivalent to dropping the writer;
    /// spelled out for call sites that roll back deliberately.
    pub fn rollback(self) {
        debug!("write rolled back");
    }

    // ---- staged mutations ----

    pub fn parameter_insert(&mut self, key: u8, subkey: u32, value: &[u8]) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::Parameters,
            keys::parameter_key(key, subkey),
            Some(value.to_vec()),
        );
        Ok(())
    }

    pub fn blockchain_insert(&mut self, level: u64, block_bytes: &[u8]) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::Blockchain,
            keys::u64_key(level),
            Some(block_bytes.to_vec()),
        );
        Ok(())
    }

    /// Records a serialnum as spent. An existing row (committed or staged)
    /// is a double-spend, reported as `Duplicate`.
    pub fn serialnum_insert(
        &mut self,
        serialnum: &[u8; 32],
        hashkey: &[u8; 32],
        tx_commitnum: u64,
    ) -> StoreResult<InsertOutcome> {
        self.store.error_sim.maybe_fail()?;
        if self.raw_get(TableId::Serialnums, serialnum)?.is_some() {
            return Ok(InsertOutcome::Duplicate);
        }
        let record = SerialnumRecord {
            hashkey: *hashkey,
            tx_commitnum,
        };
        self.stage(
            TableId::Serialnums,
            serialnum.to_vec(),
            Some(bincode::serialize(&record)?),
        );
        Ok(InsertOutcome::Inserted)
    }

    pub fn commit_tree_insert(&mut self, height: usize, offset: u64, hash: &[u8; 32]) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::CommitTree,
            keys::commit_tree_key(height, offset),
            Some(hash.to_vec()),
        );
        Ok(())
    }

    pub fn commit_roots_insert(&mut self, level: u64, record: &CommitRootRecord) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::CommitRoots,
            keys::u64_key(level),
            Some(bincode::serialize(record)?),
        );
        Ok(())
    }

    pub fn tx_output_insert(&mut self, address: &[u8; 32], record: &TxOutputRecord) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::TxOutputs,
            keys::tx_output_key(address, record.commitnum),
            Some(bincode::serialize(record)?),
        );
        Ok(())
    }

    pub fn xcx_nums_insert(&mut self, record: &XcxNumsRecord) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::XcxNums,
            keys::u64_key(record.level),
            Some(bincode::serialize(record)?),
        );
        Ok(())
    }

    /// Upserts a match and keeps the deadline index in step.
    pub fn xmatch_insert(&mut self, m: &Xmatch) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        if let Some(old) = self.xmatch_select(m.xmatchnum)? {
            if old.next_deadline != 0 && old.next_deadline != m.next_deadline {
                self.stage(
                    TableId::XmatchDeadlines,
                    keys::deadline_key(old.next_deadline, old.xmatchnum),
                    None,
                );
            }
        }
        if m.next_deadline != 0 {
            self.stage(
                TableId::XmatchDeadlines,
                keys::deadline_key(m.next_deadline, m.xmatchnum),
                Some(Vec::new()),
            );
        }
        self.stage(
            TableId::Xmatches,
            keys::u64_key(m.xmatchnum),
            Some(Store::encode_xmatch(m)?),
        );
        Ok(())
    }

    pub fn xmatchreq_insert(&mut self, req: &XmatchReq) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::Xmatchreqs,
            keys::u64_key(req.xreqnum),
            Some(Store::encode_xmatchreq(req)?),
        );
        Ok(())
    }

    /// Blocks a foreign address from appearing on future sell requests; the
    /// transaction validation path consults this table.
    pub fn blocked_foreign_address_insert(&mut self, blockchain: u64, address: &str) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        let mut key = blockchain.to_be_bytes().to_vec();
        key.extend_from_slice(address.as_bytes());
        self.stage(TableId::BlockedForeignAddresses, key, Some(Vec::new()));
        Ok(())
    }

    /// Records a request copy for transaction-server clients, keyed by its
    /// deletion deadline so pruning is a range sweep.
    pub fn xmatchingreq_insert(&mut self, delete_time: u64, req: &XmatchReq) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        self.stage(
            TableId::XmatchingReqs,
            keys::deadline_key(delete_time, req.xreqnum),
            Some(Store::encode_xmatchreq(req)?),
        );
        Ok(())
    }

    /// Deletes matching-request copies whose deletion deadline has passed.
    pub fn xmatchingreq_prune(&mut self, block_time: u64) -> StoreResult<()> {
        let mut lo = Bound::Unbounded;
        let hi = Bound::Included(keys::deadline_key(block_time, u64::MAX));
        loop {
            let Some((key, _)) = self.raw_first(TableId::XmatchingReqs, lo, hi.clone(), false)?
            else {
                return Ok(());
            };
            self.stage(TableId::XmatchingReqs, key.clone(), None);
            lo = Bound::Excluded(key);
        }
    }

    pub fn xmatchreq_update(&mut self, xreqnum: u64, disposition: XreqDisposition) -> StoreResult<()> {
        self.store.error_sim.maybe_fail()?;
        let bytes = self
            .raw_get(TableId::Xmatchreqs, &keys::u64_key(xreqnum))?
            .ok_or(StoreError::Missing("xmatchreq"))?;
        let updated = Store::update_disposition(&bytes, disposition)?;
        self.stage(TableId::Xmatchreqs, keys::u64_key(xreqnum), Some(updated));
        Ok(())
    }
}

impl StoreRead for StoreWriter<'_> {
    fn raw_get(&self, table: TableId, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if let Some(staged) = self.overlay.map(table).get(key) {
            return Ok(staged.clone());
        }
        self.store.raw_get(table, key)
    }

    fn raw_first(
        &self,
        table: TableId,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
        reverse: bool,
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let tree = self.store.tree(table).range((lo.clone(), hi.clone()));
        let overlay = self.overlay.map(table).range((lo, hi));

        let mut tree_iter = tree;
        let mut overlay_iter = overlay;

        let mut next_tree = advance_tree(&mut tree_iter, reverse)?;
        let mut next_overlay = advance_overlay(&mut overlay_iter, reverse);

        loop {
            match (next_tree.take(), next_overlay.take()) {
                (None, None) => return Ok(None),
                (Some(t), None) => return Ok(Some(t)),
                (None, Some((k, v))) => match v {
                    Some(v) => return Ok(Some((k, v))),
                    None => {
                        next_overlay = advance_overlay(&mut overlay_iter, reverse);
                        next_tree = None;
                    }
                },
                (Some(t), Some(o)) => {
                    let overlay_first = if reverse { o.0 >= t.0 } else { o.0 <= t.0 };
                    if overlay_first {
                        let same_key = o.0 == t.0;
                        match o.1 {
                            Some(v) => return Ok(Some((o.0, v))),
                            None => {
                                // Staged delete shadows the committed row.
                                next_overlay = advance_overlay(&mut overlay_iter, reverse);
                                next_tree = if same_key {
                                    advance_tree(&mut tree_iter, reverse)?
                                } else {
                                    Some(t)
                                };
                            }
                        }
                    } else {
                        return Ok(Some(t));
                    }
                }
            }
        }
    }
}

fn advance_tree(
    iter: &mut sled::Iter,
    reverse: bool,
) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
    let item = if reverse { iter.next_back() } else { iter.next() };
    Ok(item
        .transpose()?
        .map(|(k, v)| (k.to_vec(), v.to_vec())))
}

fn advance_overlay<'m>(
    iter: &mut (impl DoubleEndedIterator<Item = (&'m Vec<u8>, &'m Option<Vec<u8>>)>),
    reverse: bool,
) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
    let item = if reverse { iter.next_back() } else { iter.next() };
    item.map(|(k, v)| (k.clone(), v.clone()))
}
