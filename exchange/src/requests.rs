use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Amount, Oid, RecalcTime, Xreq, XreqKind};

/// Orders f64 rates totally (IEEE total order) so they can key a BTreeSet.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RateOrd(pub f64);

impl Eq for RateOrd {}

impl PartialOrd for RateOrd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RateOrd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One traded pair: every request names the base and quote assets plus the
/// foreign asset it settles against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairKey {
    pub base_asset: u64,
    pub quote_asset: u64,
    pub foreign_asset: u64,
}

impl PairKey {
    fn of(req: &Xreq) -> Self {
        PairKey {
            base_asset: req.base_asset,
            quote_asset: req.quote_asset,
            foreign_asset: req.foreign_asset,
        }
    }
}

/// Composite key of the rate-ordered scan index. Buyers store the negated
/// open rate so that ascending order walks both sides from most to least
/// attractive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RateKey {
    pair: PairKey,
    is_buyer: bool,
    rate: RateOrd,
    xreqnum: u64,
    seqnum: u64,
}

impl RateKey {
    fn of(req: &Xreq) -> Self {
        let rate = if req.is_buyer() {
            -req.open_rate_required
        } else {
            req.open_rate_required
        };
        RateKey {
            pair: PairKey::of(req),
            is_buyer: req.is_buyer(),
            rate: RateOrd(rate),
            xreqnum: req.xreqnum,
            seqnum: req.seqnum,
        }
    }
}

/// In-memory table of open exchange requests with the ordered indexes the
/// matcher scans. Rebuilt from the persistent request table at startup.
#[derive(Default)]
pub struct Xreqs {
    reqs: BTreeMap<u64, Xreq>,
    by_objid: HashMap<Oid, u64>,
    by_xreqnum: BTreeMap<u64, u64>,
    rate_index: BTreeSet<RateKey>,
    expire_index: BTreeSet<(u64, u64, u64)>,
    pending_order: BTreeMap<u64, u64>,
    next_seqnum: u64,
    passnum: u64,
    persistent_count: usize,
    pending_count: usize,
}

impl Xreqs {
    pub fn new() -> Self {
        Xreqs {
            next_seqnum: 1,
            passnum: 1,
            ..Default::default()
        }
    }

    pub fn alloc_seqnum(&mut self) -> u64 {
        let n = self.next_seqnum;
        self.next_seqnum += 1;
        n
    }

    pub(crate) fn next_passnum(&mut self) -> u64 {
        let n = self.passnum;
        self.passnum += 1;
        n
    }

    pub fn count_persistent(&self) -> usize {
        self.persistent_count
    }

    pub fn count_pending(&self) -> usize {
        self.pending_count
    }

    fn index(&mut self, req: &Xreq) {
        self.by_objid.insert(req.objid, req.seqnum);
        if req.xreqnum != 0 {
            self.by_xreqnum.insert(req.xreqnum, req.seqnum);
            self.persistent_count += 1;
        } else {
            self.pending_count += 1;
        }
        self.rate_index.insert(RateKey::of(req));
        self.expire_index
            .insert((req.expire_time, req.xreqnum, req.seqnum));
        if req.pending.order != 0 {
            self.pending_order.insert(req.pending.order, req.seqnum);
        }
    }

    fn unindex(&mut self, req: &Xreq) {
        self.by_objid.remove(&req.objid);
        if req.xreqnum != 0 {
            self.by_xreqnum.remove(&req.xreqnum);
            self.persistent_count -= 1;
        } else {
            self.pending_count -= 1;
        }
        self.rate_index.remove(&RateKey::of(req));
        self.expire_index
            .remove(&(req.expire_time, req.xreqnum, req.seqnum));
        if req.pending.order != 0 {
            self.pending_order.remove(&req.pending.order);
        }
    }

    /// Inserts a request, replacing any existing request with the same objid
    /// (a request resubmitted to the chain supersedes its pending copy).
    pub fn insert(&mut self, req: Xreq) {
        debug_assert_ne!(req.seqnum, 0);
        if let Some(&old_seqnum) = self.by_objid.get(&req.objid) {
            if old_seqnum != req.seqnum {
                self.remove(old_seqnum);
            }
        }
        if let Some(old) = self.reqs.remove(&req.seqnum) {
            self.unindex(&old);
        }
        self.index(&req);
        self.reqs.insert(req.seqnum, req);
    }

    pub fn get(&self, seqnum: u64) -> Option<&Xreq> {
        self.reqs.get(&seqnum)
    }

    /// Writes back a modified request, refreshing every index it appears in.
    pub fn update(&mut self, req: Xreq) {
        let old = self
            .reqs
            .remove(&req.seqnum)
            .expect("update of request not in table");
        self.unindex(&old);
        self.index(&req);
        self.reqs.insert(req.seqnum, req);
    }

    pub fn remove(&mut self, seqnum: u64) -> Option<Xreq> {
        let old = self.reqs.remove(&seqnum)?;
        self.unindex(&old);
        Some(old)
    }

    /// Next request whose expire time has been reached at `block_time`.
    pub fn select_expire(&self, block_time: u64) -> Option<Xreq> {
        let &(expire_time, _, seqnum) = self.expire_index.iter().next()?;
        if expire_time > block_time {
            return None;
        }
        self.reqs.get(&seqnum).cloned()
    }

    /// Next persistent request with `xreqnum >= min_xreqnum`, optionally
    /// restricted to one kind.
    pub fn select_xreqnum(&self, min_xreqnum: u64, kind: Option<XreqKind>) -> Option<Xreq> {
        for (_, &seqnum) in self.by_xreqnum.range(min_xreqnum.max(1)..) {
            let req = &self.reqs[&seqnum];
            match kind {
                Some(k) if req.kind != k => continue,
                _ => return Some(req.clone()),
            }
        }
        None
    }

    /// First non-persistent (pending) request in seqnum order.
    pub fn select_pending(&self) -> Option<Xreq> {
        self.reqs
            .values()
            .find(|req| req.xreqnum == 0)
            .cloned()
    }

    pub fn select_seqnum(&self, seqnum: u64) -> Option<Xreq> {
        self.reqs.get(&seqnum).cloned()
    }

    /// Pairs that currently have both an eligible buyer and an eligible
    /// seller among persistent requests up to `max_xreqnum`.
    pub(crate) fn pair_groups(&self, block_time: u64, max_xreqnum: u64) -> Vec<PairKey> {
        let mut buyers: BTreeSet<PairKey> = BTreeSet::new();
        let mut sellers: BTreeSet<PairKey> = BTreeSet::new();
        for key in &self.rate_index {
            let req = &self.reqs[&key.seqnum];
            if !self.scan_eligible(req, block_time, max_xreqnum) {
                continue;
            }
            if key.is_buyer {
                buyers.insert(key.pair);
            } else {
                sellers.insert(key.pair);
            }
        }
        buyers.intersection(&sellers).copied().collect()
    }

    fn scan_eligible(&self, req: &Xreq, block_time: u64, max_xreqnum: u64) -> bool {
        if req.xreqnum == 0 || req.xreqnum > max_xreqnum {
            return false;
        }
        if req.matching_amount == 0 || req.expire_time <= block_time {
            return false;
        }
        if req.is_buyer() && req.amount_as_float(req.matching_amount) <= req.base_costs {
            return false;
        }
        true
    }

    /// Buyer seqnums for one pair, most attractive open rate first.
    pub(crate) fn majors(&self, pair: PairKey, block_time: u64, max_xreqnum: u64) -> Vec<u64> {
        self.side_scan(pair, true, block_time, max_xreqnum)
    }

    /// Seller seqnums for one pair, lowest required open rate first.
    pub(crate) fn minors(&self, pair: PairKey, block_time: u64, max_xreqnum: u64) -> Vec<u64> {
        self.side_scan(pair, false, block_time, max_xreqnum)
    }

    fn side_scan(
        &self,
        pair: PairKey,
        is_buyer: bool,
        block_time: u64,
        max_xreqnum: u64,
    ) -> Vec<u64> {
        let lo = RateKey {
            pair,
            is_buyer,
            rate: RateOrd(f64::NEG_INFINITY),
            xreqnum: 0,
            seqnum: 0,
        };
        let hi = RateKey {
            pair,
            is_buyer,
            rate: RateOrd(f64::INFINITY),
            xreqnum: u64::MAX,
            seqnum: u64::MAX,
        };
        self.rate_index
            .range(lo..=hi)
            .filter(|key| self.scan_eligible(&self.reqs[&key.seqnum], block_time, max_xreqnum))
            .map(|key| key.seqnum)
            .collect()
    }

    /// Sets up a matching pass: refreshes the recalc flags, and on the first
    /// pass of a round resets every in-scope request's matching state from
    /// its open state.
    pub(crate) fn matching_init(
        &mut self,
        block_time: u64,
        first_pass: bool,
        prior_passnum: u64,
        max_xreqnum: u64,
    ) {
        let seqnums: Vec<u64> = self.reqs.keys().copied().collect();
        for seqnum in seqnums {
            let req = &self.reqs[&seqnum];
            if req.xreqnum == 0 || req.xreqnum > max_xreqnum {
                continue;
            }
            let mut req = req.clone();
            if first_pass {
                req.matching_amount = req.open_amount;
                req.matching_rate_required = req.open_rate_required;
                req.recalc = match req.recalc_time {
                    RecalcTime::Next => true,
                    RecalcTime::At(t) => t <= block_time,
                    RecalcTime::Not => false,
                };
                if req.recalc {
                    req.recalc_time = RecalcTime::Not;
                }
                req.best.clear();
            } else {
                let had_match = req.last_matched == prior_passnum;
                let best_stale = req.best.amount != 0 && {
                    match self.reqs.get(&req.best.other_seqnum) {
                        None => true,
                        Some(other) => {
                            other.last_matched == prior_passnum
                                || other.expire_time <= block_time
                        }
                    }
                };
                req.recalc = had_match || best_stale;
                if req.recalc {
                    req.best.clear();
                }
            }
            self.update(req);
        }
    }

    /// Buyer seqnums holding a candidate best match, for mutual-match
    /// detection.
    pub(crate) fn mutual_candidates(&self, max_xreqnum: u64) -> Vec<u64> {
        self.reqs
            .values()
            .filter(|req| {
                req.is_buyer()
                    && req.best.amount != 0
                    && req.xreqnum != 0
                    && req.xreqnum <= max_xreqnum
            })
            .map(|req| req.seqnum)
            .collect()
    }

    /// The unconsumed pending actual match with the lowest order, returned as
    /// (sell seqnum, buy seqnum).
    pub fn next_pending_match(&self) -> Option<(u64, u64)> {
        for (_, &sell_seqnum) in self.pending_order.iter() {
            let sell = &self.reqs[&sell_seqnum];
            debug_assert!(sell.is_seller());
            return Some((sell_seqnum, sell.best.other_seqnum));
        }
        None
    }

    /// Drops pending-match bookkeeping recorded in epochs before
    /// `current_epoch`; consumed entries have already had their order
    /// cleared, so only informational fields remain.
    pub(crate) fn clear_old_pending_matches(&mut self, current_epoch: u64, max_xreqnum: u64) {
        let stale: Vec<u64> = self
            .reqs
            .values()
            .filter(|req| {
                req.xreqnum != 0
                    && req.xreqnum <= max_xreqnum
                    && req.pending.epoch != 0
                    && req.pending.epoch != current_epoch
                    && req.pending.order == 0
            })
            .map(|req| req.seqnum)
            .collect();
        for seqnum in stale {
            let mut req = self.reqs[&seqnum].clone();
            req.pending = Default::default();
            self.update(req);
        }
    }

    /// Total of matched-but-unconsumed amounts, used by tests and status
    /// reporting.
    pub fn pending_match_total(&self) -> Amount {
        self.pending_order
            .values()
            .map(|seqnum| self.reqs[seqnum].pending.amount)
            .sum()
    }
}

/// Shared handle to the request table. The matching worker and the
/// confirmation thread take the write lock for whole scan phases; readers
/// (status queries) take the read lock.
pub struct XreqStore {
    inner: RwLock<Xreqs>,
}

impl Default for XreqStore {
    fn default() -> Self {
        XreqStore::new()
    }
}

impl XreqStore {
    pub fn new() -> Self {
        XreqStore {
            inner: RwLock::new(Xreqs::new()),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Xreqs> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Xreqs> {
        self.inner.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::XreqKind;

    fn req(kind: XreqKind, seqnum: u64, xreqnum: u64, rate: f64) -> Xreq {
        let mut x = Xreq::new(kind);
        x.seqnum = seqnum;
        x.xreqnum = xreqnum;
        x.objid[..8].copy_from_slice(&seqnum.to_le_bytes());
        x.max_amount = 100;
        x.open_amount = 100;
        x.matching_amount = 100;
        x.net_rate_required = rate;
        x.open_rate_required = rate;
        x.matching_rate_required = rate;
        x.expire_time = u64::MAX;
        x
    }

    #[test]
    fn majors_order_best_rate_first() {
        let mut t = Xreqs::new();
        t.insert(req(XreqKind::SimpleBuy, 1, 1, 0.001));
        t.insert(req(XreqKind::SimpleBuy, 2, 2, 0.003));
        t.insert(req(XreqKind::SimpleBuy, 3, 3, 0.002));
        t.insert(req(XreqKind::SimpleSell, 4, 4, 0.001));
        let pairs = t.pair_groups(0, 10);
        assert_eq!(pairs.len(), 1);
        // Buyers scan from the highest rate they will pay.
        assert_eq!(t.majors(pairs[0], 0, 10), vec![2, 3, 1]);
        // Sellers scan from the lowest rate they will take.
        assert_eq!(t.minors(pairs[0], 0, 10), vec![4]);
    }

    #[test]
    fn pair_needs_both_sides() {
        let mut t = Xreqs::new();
        t.insert(req(XreqKind::SimpleBuy, 1, 1, 0.001));
        assert!(t.pair_groups(0, 10).is_empty());
        t.insert(req(XreqKind::SimpleSell, 2, 2, 0.001));
        assert_eq!(t.pair_groups(0, 10).len(), 1);
    }

    #[test]
    fn non_persistent_requests_are_not_scanned() {
        let mut t = Xreqs::new();
        t.insert(req(XreqKind::SimpleBuy, 1, 0, 0.001));
        t.insert(req(XreqKind::SimpleSell, 2, 2, 0.001));
        assert!(t.pair_groups(0, 10).is_empty());
        assert_eq!(t.count_pending(), 1);
        assert_eq!(t.count_persistent(), 1);
    }

    #[test]
    fn insert_replaces_same_objid() {
        let mut t = Xreqs::new();
        let mut a = req(XreqKind::SimpleBuy, 1, 0, 0.001);
        a.objid = [7u8; 32];
        t.insert(a);
        let mut b = req(XreqKind::SimpleBuy, 2, 5, 0.001);
        b.objid = [7u8; 32];
        t.insert(b);
        assert!(t.get(1).is_none());
        assert_eq!(t.get(2).unwrap().xreqnum, 5);
        assert_eq!(t.count_pending(), 0);
        assert_eq!(t.count_persistent(), 1);
    }

    #[test]
    fn select_expire_walks_earliest_first() {
        let mut t = Xreqs::new();
        let mut a = req(XreqKind::SimpleBuy, 1, 1, 0.001);
        a.expire_time = 50;
        let mut b = req(XreqKind::SimpleSell, 2, 2, 0.001);
        b.expire_time = 10;
        t.insert(a);
        t.insert(b);
        assert_eq!(t.select_expire(40).unwrap().seqnum, 2);
        t.remove(2);
        assert!(t.select_expire(40).is_none());
        assert_eq!(t.select_expire(60).unwrap().seqnum, 1);
    }

    #[test]
    fn matching_init_first_pass_consumes_recalc_next() {
        let mut t = Xreqs::new();
        let mut a = req(XreqKind::SimpleBuy, 1, 1, 0.001);
        a.recalc_time = RecalcTime::Next;
        a.open_amount = 60;
        a.matching_amount = 0;
        t.insert(a);
        t.matching_init(1000, true, 0, 10);
        let a = t.get(1).unwrap();
        assert!(a.recalc);
        assert_eq!(a.recalc_time, RecalcTime::Not);
        assert_eq!(a.matching_amount, 60);
        t.matching_init(1000, true, 0, 10);
        assert!(!t.get(1).unwrap().recalc);
    }

    #[test]
    fn matching_init_pass_recalcs_after_match() {
        let mut t = Xreqs::new();
        let mut a = req(XreqKind::SimpleBuy, 1, 1, 0.001);
        a.last_matched = 7;
        t.insert(a);
        t.matching_init(1000, false, 7, 10);
        assert!(t.get(1).unwrap().recalc);
        t.matching_init(1000, false, 8, 10);
        assert!(!t.get(1).unwrap().recalc);
    }
}
