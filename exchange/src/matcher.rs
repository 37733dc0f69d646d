use tracing::{debug, trace};

use crate::requests::Xreqs;
use crate::shutdown::ShutdownFlag;
use crate::types::{
    matching_epoch, Amount, RecalcTime, Xreq, XreqKind, XREQ_WAIT_DISCOUNT_INTERVAL,
};
use crate::XreqStore;

fn compute_elapsed(xreq_time: u64, block_time: u64) -> u64 {
    block_time.saturating_sub(xreq_time)
}

fn compute_hold(elapsed: u64, required: u64) -> u64 {
    required.saturating_sub(elapsed)
}

fn compute_net_hold(xreq: &Xreq, other: &Xreq, block_time: u64) -> u64 {
    let elapsed = compute_elapsed(xreq.blocktime, block_time);
    let hold1 = compute_hold(elapsed, xreq.hold_time);
    let hold2 = compute_hold(elapsed, other.hold_time_required);
    hold1.max(hold2)
}

/// Seconds both sides must still wait before a match between them can take
/// effect: the larger of each side's own remaining hold and the hold its
/// counterparty requires of it.
pub fn compute_match_hold(buyer: &Xreq, seller: &Xreq, block_time: u64) -> u64 {
    let hold1 = compute_net_hold(buyer, seller, block_time);
    let hold2 = compute_net_hold(seller, buyer, block_time);
    hold1.max(hold2)
}

/// Applies the wait discount to a net rate for a candidate still on hold,
/// and schedules the request's re-evaluation at the next discount boundary.
/// Buyers divide by the factor and sellers multiply, so a held candidate
/// ranks worse for both sides, less so as the hold runs down.
fn compute_discount(xreq: &mut Xreq, rate: &mut f64, hold: u64, block_time: u64, changed: &mut bool) {
    if hold <= xreq.min_wait_time || *rate == 0.0 || xreq.wait_discount == 0.0 {
        return;
    }

    let hold = hold - xreq.min_wait_time;

    let factor = (1.0 - xreq.wait_discount).powi(1 + (hold / XREQ_WAIT_DISCOUNT_INTERVAL) as i32);

    let new_rate = if xreq.is_buyer() {
        *rate / factor
    } else {
        *rate * factor
    };

    if new_rate == *rate {
        return;
    }

    let recalc_time = block_time + XREQ_WAIT_DISCOUNT_INTERVAL - (hold % XREQ_WAIT_DISCOUNT_INTERVAL);

    let sooner = match xreq.recalc_time {
        RecalcTime::Not => true,
        RecalcTime::Next => false,
        RecalcTime::At(t) => recalc_time < t,
    };
    if sooner {
        xreq.recalc_time = RecalcTime::At(recalc_time);
        *changed = true;
    }

    trace!(
        xreqnum = xreq.xreqnum,
        hold,
        factor,
        rate = *rate,
        new_rate,
        "wait discount applied"
    );

    *rate = new_rate;
}

/// Whether `other` at `(amount, net rates)` beats `me`'s current best
/// candidate. The chain of tie-breakers induces a total order: rate, then
/// the counterparty's net rate (which promotes mutual matches), then amount,
/// then the counterparty's matching amount (round-robin as amounts shrink),
/// then xreqnum (first on chain wins; definitive for persistent requests),
/// then seqnum.
pub fn compare_rates(
    me: &Xreq,
    self_net_rate: f64,
    other: &Xreq,
    other_net_rate: f64,
    amount: Amount,
) -> bool {
    if me.best.amount == 0 {
        return true;
    }

    if self_net_rate != me.best.net_rate {
        return me.is_buyer() ^ (self_net_rate > me.best.net_rate);
    }

    if other_net_rate != me.best.other_net_rate {
        return me.is_buyer() ^ (other_net_rate < me.best.other_net_rate);
    }

    if amount != me.best.amount {
        return amount > me.best.amount;
    }

    if other.matching_amount != me.best.other_matching_amount {
        return other.matching_amount > me.best.other_matching_amount;
    }

    if other.xreqnum != me.best.other_xreqnum {
        return me.best.other_xreqnum == 0 || (other.xreqnum != 0 && other.xreqnum < me.best.other_xreqnum);
    }

    other.seqnum < me.best.other_seqnum
}

fn set_match(
    amount: Amount,
    rate: f64,
    hold: bool,
    me: &mut Xreq,
    self_net_rate: f64,
    other: &Xreq,
    other_net_rate: f64,
) {
    debug_assert!(me.recalc || other.recalc);

    me.best.amount = amount;
    me.best.rate = rate;
    me.best.net_rate = self_net_rate;
    me.best.other_seqnum = other.seqnum;
    me.best.other_xreqnum = other.xreqnum;
    me.best.other_matching_amount = other.matching_amount;
    me.best.other_net_rate = other_net_rate;

    if hold {
        // The held best is cleared from the best-match slot at the next
        // round, so force a full re-evaluation then.
        me.recalc_time = RecalcTime::Next;
    }
}

/// Evaluates one buyer/seller candidate pair and records it as either side's
/// new best when it wins the comparison. Returns true when a best changed.
fn check_match(table: &mut Xreqs, buyer_seqnum: u64, seller_seqnum: u64, block_time: u64) -> bool {
    let mut buyer = match table.get(buyer_seqnum) {
        Some(req) => req.clone(),
        None => return false,
    };
    let mut seller = match table.get(seller_seqnum) {
        Some(req) => req.clone(),
        None => return false,
    };

    // Mining integrity: simple and mining buys only ever pair with simple or
    // mining sells.
    if matches!(buyer.kind, XreqKind::SimpleBuy | XreqKind::MiningBuy)
        && !matches!(seller.kind, XreqKind::SimpleSell | XreqKind::MiningSell)
    {
        return false;
    }

    debug_assert!(buyer.is_buyer());
    debug_assert!(seller.is_seller());
    debug_assert!(buyer.recalc || seller.recalc);
    debug_assert!(seller.matching_amount > 0 && seller.matching_amount <= seller.open_amount);
    debug_assert!(buyer.matching_amount > 0 && buyer.matching_amount <= buyer.open_amount);
    debug_assert!(seller.matching_rate_required <= buyer.matching_rate_required);

    let mut amount = buyer.matching_amount;
    if amount > seller.matching_amount {
        amount = seller.matching_amount;
        if buyer.amount_as_float(amount) <= buyer.base_costs {
            return false;
        }
    }

    let mut buyer_rate_req = buyer.matching_rate_required;
    if amount < buyer.matching_amount {
        buyer_rate_req = buyer.match_rate_required(amount);
        if buyer_rate_req < seller.matching_rate_required {
            return false;
        }
    }

    let mut seller_rate_req = seller.matching_rate_required;
    if amount < seller.matching_amount {
        seller_rate_req = seller.match_rate_required(amount);
        if seller_rate_req > buyer_rate_req {
            return false;
        }
    }

    debug_assert!(seller_rate_req <= buyer_rate_req);

    let match_rate = (buyer_rate_req + seller_rate_req) / 2.0;

    let mut buyer_net_rate = buyer.net_rate(amount, match_rate);
    let mut seller_net_rate = seller.net_rate(amount, match_rate);

    debug_assert!(amount > 0);
    debug_assert!(match_rate >= 0.0);
    debug_assert!(buyer_net_rate >= 0.0);
    debug_assert!(seller_net_rate >= 0.0);

    let hold = compute_match_hold(&buyer, &seller, block_time);

    if buyer.expire_time <= block_time + hold {
        return false;
    }
    if seller.expire_time <= block_time + hold {
        return false;
    }

    let mut buyer_changed = false;
    let mut seller_changed = false;

    if hold > 0 {
        compute_discount(&mut buyer, &mut buyer_net_rate, hold, block_time, &mut buyer_changed);
        compute_discount(&mut seller, &mut seller_net_rate, hold, block_time, &mut seller_changed);
    }

    let mut changed_best = false;

    if compare_rates(&buyer, buyer_net_rate, &seller, seller_net_rate, amount) {
        set_match(amount, match_rate, hold > 0, &mut buyer, buyer_net_rate, &seller, seller_net_rate);
        buyer_changed = true;
        changed_best = true;
    }

    if compare_rates(&seller, seller_net_rate, &buyer, buyer_net_rate, amount) {
        set_match(amount, match_rate, hold > 0, &mut seller, seller_net_rate, &buyer, buyer_net_rate);
        seller_changed = true;
        changed_best = true;
    }

    if buyer_changed {
        table.update(buyer);
    }
    if seller_changed {
        table.update(seller);
    }

    changed_best
}

/// Consumes a confirmed mutual match on one side: reduces the matching
/// amount (a request with an active foreign address can hold only one match,
/// so its matching amount is zeroed), records the pending-match info for the
/// epoch, and marks the request matched this pass so counterparties
/// recalculate next pass. `pending_order` is set on the sell side of an
/// actual (hold-free) match.
fn update_mutual_match(
    table: &mut Xreqs,
    seqnum: u64,
    amount: Amount,
    rate: f64,
    passnum: u64,
    block_time: u64,
    hold: u64,
    pending_order: Option<u64>,
) {
    let mut req = table
        .get(seqnum)
        .cloned()
        .expect("mutual match request disappeared");

    debug_assert!(req.xreqnum != 0);
    debug_assert!(amount > 0 && amount <= req.matching_amount);
    debug_assert!(req.matching_amount <= req.open_amount);
    debug_assert!(req.open_amount <= req.max_amount);
    debug_assert!(req.best.amount > 0 && req.best.rate >= 0.0 && req.best.net_rate >= 0.0);

    if !req.foreign_address.is_empty() {
        req.matching_amount = 0;
    } else {
        req.matching_amount -= amount;
    }
    req.matching_rate_required = req.match_rate_required(req.matching_amount);

    let epoch = matching_epoch(block_time);
    if req.pending.epoch != epoch {
        req.pending.epoch = epoch;
        req.pending.amount = amount;
        req.pending.rate = rate;
        req.pending.hold_time = hold;
    }

    if let Some(order) = pending_order {
        debug_assert_eq!(req.pending.order, 0);
        req.pending.order = order;
    }

    req.last_matched = passnum;

    table.update(req);
}

/// Pairs up requests whose best matches point at each other. Hold-free
/// mutual matches become pending actual matches with a strictly increasing
/// consumption order; held ones only consume matching amounts and are
/// re-evaluated once their discount boundary passes.
fn find_mutual_matches(
    table: &mut Xreqs,
    passnum: u64,
    next_match_index: &mut u64,
    block_time: u64,
    max_xreqnum: u64,
    shutdown: &ShutdownFlag,
) -> bool {
    let mut have_matches = false;
    let epoch = matching_epoch(block_time);

    for buyer_seqnum in table.mutual_candidates(max_xreqnum) {
        if shutdown.is_set() {
            break;
        }

        let major = match table.get(buyer_seqnum) {
            Some(req) => req.clone(),
            None => continue,
        };
        if major.best.amount == 0 {
            continue;
        }
        let minor = match table.get(major.best.other_seqnum) {
            Some(req) => req.clone(),
            None => continue,
        };

        // Mutuality with full consistency: both sides must agree on the
        // counterparty, the amount, the rate, and the matching amounts each
        // side saw when it recorded its best.
        if !minor.is_seller()
            || minor.best.amount == 0
            || minor.best.other_seqnum != major.seqnum
            || minor.best.other_xreqnum != major.xreqnum
            || major.best.other_xreqnum != minor.xreqnum
            || major.best.amount != minor.best.amount
            || major.best.rate != minor.best.rate
            || major.best.other_net_rate != minor.best.net_rate
            || minor.best.other_net_rate != major.best.net_rate
            || major.best.other_matching_amount != minor.matching_amount
            || minor.best.other_matching_amount != major.matching_amount
        {
            continue;
        }

        have_matches = true;

        debug_assert!(major.matching_rate_required <= major.net_rate_required);
        debug_assert!(major.best.rate <= major.matching_rate_required);
        debug_assert!(minor.matching_rate_required >= minor.net_rate_required);
        debug_assert!(minor.best.rate >= minor.matching_rate_required);
        debug_assert!(minor.base_asset == major.base_asset);
        debug_assert!(minor.quote_asset == major.quote_asset);
        debug_assert!(minor.foreign_asset == major.foreign_asset);

        let hold = compute_match_hold(&major, &minor, block_time);

        let order = if hold == 0 {
            debug_assert!(major.best.net_rate <= major.net_rate_required);
            debug_assert!(minor.best.net_rate >= minor.net_rate_required);
            debug_assert_eq!(minor.pending.order, 0);
            debug_assert_ne!(minor.pending.epoch, epoch);

            let order = *next_match_index;
            *next_match_index += 1;
            Some(order)
        } else {
            None
        };

        let amount = major.best.amount;
        let rate = major.best.rate;

        debug!(
            buyer = major.xreqnum,
            seller = minor.xreqnum,
            amount,
            rate,
            hold,
            "mutual match"
        );

        update_mutual_match(table, major.seqnum, amount, rate, passnum, block_time, hold, None);
        update_mutual_match(table, minor.seqnum, amount, rate, passnum, block_time, hold, order);
    }

    have_matches
}

/// Matches each linked mining-trade pair against itself once both halves are
/// persistent, still matchable, and free of holds. The linked pair carries
/// identical amounts and net rates, so the self-match lands at the midpoint
/// rate between the two sides' requirements.
fn add_mining_matches(
    table: &mut Xreqs,
    next_match_index: &mut u64,
    block_time: u64,
    max_xreqnum: u64,
    shutdown: &ShutdownFlag,
) {
    // Mining self-matches run outside the pass loop; no pass bookkeeping.
    let passnum = 0;
    let mut next_xreqnum = 1u64;

    while !shutdown.is_set() && next_xreqnum <= max_xreqnum {
        let mut major = match table.select_xreqnum(next_xreqnum, Some(XreqKind::MiningBuy)) {
            Some(req) => req,
            None => break,
        };

        next_xreqnum = major.xreqnum + 1;

        if major.xreqnum > max_xreqnum {
            break;
        }
        if major.expire_time <= block_time || major.matching_amount == 0 {
            continue;
        }

        if major.linked_seqnum == 0 {
            continue;
        }

        debug_assert_eq!(major.kind, XreqKind::MiningBuy);
        debug_assert_eq!(major.min_amount, major.max_amount);

        let minor = match table.select_seqnum(major.linked_seqnum) {
            Some(req) => req,
            None => {
                // Partner was pruned; clear the link so the pair is not
                // probed again.
                major.linked_seqnum = 0;
                table.update(major);
                continue;
            }
        };

        if minor.xreqnum > max_xreqnum
            || minor.expire_time <= block_time
            || minor.matching_amount == 0
            || minor.linked_seqnum != major.seqnum
        {
            continue;
        }

        debug_assert_eq!(minor.kind, XreqKind::MiningSell);
        debug_assert_eq!(major.max_amount, minor.max_amount);
        debug_assert_eq!(major.net_rate_required, minor.net_rate_required);

        if compute_match_hold(&major, &minor, block_time) != 0 {
            continue;
        }

        major.recalc = true;
        major.best.clear();
        let major_seqnum = major.seqnum;
        let minor_seqnum = minor.seqnum;
        table.update(major);
        let mut minor = minor;
        minor.best.clear();
        table.update(minor);

        let have_match = check_match(table, major_seqnum, minor_seqnum, block_time);
        debug_assert!(have_match);
        if !have_match {
            continue;
        }

        let major = table.get(major_seqnum).cloned().expect("mining buy vanished");
        let minor = table.get(minor_seqnum).cloned().expect("mining sell vanished");

        debug_assert_eq!(minor.pending.order, 0);
        debug_assert_ne!(minor.pending.epoch, matching_epoch(block_time));

        let order = *next_match_index;
        *next_match_index += 1;

        let amount = major.best.amount;
        let rate = major.best.rate;

        debug!(
            buyer = major.xreqnum,
            seller = minor.xreqnum,
            amount,
            rate,
            "mining trade match"
        );

        update_mutual_match(table, major_seqnum, amount, rate, passnum, block_time, 0, None);
        update_mutual_match(table, minor_seqnum, amount, rate, passnum, block_time, 0, Some(order));
    }
}

/// One full matching round against a frozen `max_xreqnum`: repeated passes
/// of best-match search and mutual-match extraction until quiescent, then
/// mining-trade self-matches, then stale pending-match cleanup. Runs on the
/// matching worker and never touches the persistent store.
pub fn match_reqs(store: &XreqStore, block_time: u64, max_xreqnum: u64, shutdown: &ShutdownFlag) {
    let mut table = store.write();
    let epoch = matching_epoch(block_time);

    debug!(epoch, block_time, max_xreqnum, "matching round start");

    let mut first_pass = true;
    let mut have_matches = true;
    let mut next_match_index = 1u64;
    let mut inner_count = 0u64;

    while !shutdown.is_set() && have_matches && inner_count < 1_000_000 {
        let prior_passnum = table.next_passnum();
        let passnum = prior_passnum + 1;

        have_matches = false;
        let mut changed_best = false;

        table.matching_init(block_time, first_pass, prior_passnum, max_xreqnum);
        first_pass = false;

        for pair in table.pair_groups(block_time, max_xreqnum) {
            for buyer_seqnum in table.majors(pair, block_time, max_xreqnum) {
                if shutdown.is_set() {
                    break;
                }
                for seller_seqnum in table.minors(pair, block_time, max_xreqnum) {
                    let (skip, rate_crossed) =
                        match (table.get(buyer_seqnum), table.get(seller_seqnum)) {
                            (Some(b), Some(s)) => (
                                !(b.recalc || s.recalc),
                                s.matching_rate_required > b.matching_rate_required,
                            ),
                            _ => (true, false),
                        };
                    if skip || rate_crossed {
                        continue;
                    }

                    inner_count += 1;
                    changed_best |= check_match(&mut table, buyer_seqnum, seller_seqnum, block_time);
                }
            }
        }

        if changed_best {
            have_matches = find_mutual_matches(
                &mut table,
                passnum,
                &mut next_match_index,
                block_time,
                max_xreqnum,
                shutdown,
            );
        }

        trace!(passnum, changed_best, have_matches, "matching pass end");
    }

    if !shutdown.is_set() {
        add_mining_matches(&mut table, &mut next_match_index, block_time, max_xreqnum, shutdown);
        table.clear_old_pending_matches(epoch, max_xreqnum);
    }

    debug!(epoch, inner_count, "matching round done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::XreqKind;

    pub(crate) fn persistent_req(
        kind: XreqKind,
        seqnum: u64,
        xreqnum: u64,
        max_amount: Amount,
        net_rate: f64,
    ) -> Xreq {
        let mut x = Xreq::new(kind);
        x.seqnum = seqnum;
        x.xreqnum = xreqnum;
        x.objid[..8].copy_from_slice(&seqnum.to_le_bytes());
        x.min_amount = 1;
        x.max_amount = max_amount;
        x.open_amount = max_amount;
        x.net_rate_required = net_rate;
        x.open_rate_required = x.match_rate_required(max_amount);
        x.expire_time = u64::MAX;
        x.recalc_time = RecalcTime::Next;
        x.blocktime = 0;
        x
    }

    fn run_round(store: &XreqStore, block_time: u64, max_xreqnum: u64) {
        let shutdown = ShutdownFlag::new();
        match_reqs(store, block_time, max_xreqnum, &shutdown);
    }

    #[test]
    fn crossing_pair_produces_pending_match() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            t.insert(persistent_req(XreqKind::SimpleBuy, 1, 1, 100, 0.002));
            t.insert(persistent_req(XreqKind::SimpleSell, 2, 2, 100, 0.001));
        }
        run_round(&store, 600, 2);
        let t = store.read();
        let (sell_seqnum, buy_seqnum) = t.next_pending_match().expect("pending match");
        assert_eq!(sell_seqnum, 2);
        assert_eq!(buy_seqnum, 1);
        let sell = t.get(2).unwrap();
        assert_eq!(sell.pending.amount, 100);
        assert_eq!(sell.pending.hold_time, 0);
        // The match rate sits midway between the two requirements.
        assert!(sell.pending.rate > 0.001 && sell.pending.rate < 0.002);
        // Open amounts are untouched until the match is made persistent.
        assert_eq!(sell.open_amount, 100);
        assert_eq!(t.get(1).unwrap().open_amount, 100);
    }

    #[test]
    fn non_crossing_rates_do_not_match() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            t.insert(persistent_req(XreqKind::SimpleBuy, 1, 1, 100, 0.001));
            t.insert(persistent_req(XreqKind::SimpleSell, 2, 2, 100, 0.002));
        }
        run_round(&store, 600, 2);
        assert!(store.read().next_pending_match().is_none());
    }

    #[test]
    fn held_match_consumes_matching_amount_only() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            let mut buy = persistent_req(XreqKind::SimpleBuy, 1, 1, 10, 0.001);
            buy.hold_time_required = 3600;
            buy.blocktime = 0;
            let mut sell = persistent_req(XreqKind::SimpleSell, 2, 2, 10, 0.001);
            sell.hold_time = 3600;
            sell.blocktime = 0;
            t.insert(buy);
            t.insert(sell);
        }
        run_round(&store, 60, 2);
        {
            let t = store.read();
            assert!(t.next_pending_match().is_none(), "held match must not be actual");
            let sell = t.get(2).unwrap();
            assert_eq!(sell.matching_amount, 0, "foreign-address-free sell consumes amount");
            assert_eq!(sell.open_amount, 10);
            assert_eq!(sell.pending.hold_time, 3600 - 60);
            assert_eq!(sell.recalc_time, RecalcTime::Next);
        }
        // Once block time passes the hold, the next round makes it actual.
        run_round(&store, 3660, 2);
        let t = store.read();
        assert!(t.next_pending_match().is_some());
        assert_eq!(t.get(2).unwrap().pending.hold_time, 0);
    }

    #[test]
    fn best_rate_buyer_wins_the_scarce_seller() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            t.insert(persistent_req(XreqKind::SimpleBuy, 1, 1, 100, 0.0015));
            t.insert(persistent_req(XreqKind::SimpleBuy, 2, 2, 100, 0.0030));
            t.insert(persistent_req(XreqKind::SimpleSell, 3, 3, 100, 0.0010));
        }
        run_round(&store, 600, 3);
        let t = store.read();
        let (_, buy_seqnum) = t.next_pending_match().unwrap();
        assert_eq!(buy_seqnum, 2, "higher-paying buyer wins");
    }

    #[test]
    fn equal_candidates_tie_break_on_lower_xreqnum() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            t.insert(persistent_req(XreqKind::SimpleBuy, 5, 7, 100, 0.002));
            t.insert(persistent_req(XreqKind::SimpleBuy, 6, 3, 100, 0.002));
            t.insert(persistent_req(XreqKind::SimpleSell, 7, 9, 100, 0.001));
        }
        run_round(&store, 600, 20);
        let t = store.read();
        let (_, buy_seqnum) = t.next_pending_match().unwrap();
        assert_eq!(t.get(buy_seqnum).unwrap().xreqnum, 3);
    }

    #[test]
    fn partial_fill_leaves_remainder_open_for_later_pass() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            t.insert(persistent_req(XreqKind::SimpleBuy, 1, 1, 100, 0.002));
            t.insert(persistent_req(XreqKind::SimpleSell, 2, 2, 30, 0.001));
            t.insert(persistent_req(XreqKind::SimpleSell, 3, 3, 30, 0.001));
        }
        run_round(&store, 600, 3);
        let t = store.read();
        // Both sellers matched against the one buyer across passes.
        let buyer = t.get(1).unwrap();
        assert_eq!(buyer.matching_amount, 40);
        assert_eq!(t.get(2).unwrap().pending.amount, 30);
        assert_eq!(t.get(3).unwrap().pending.amount, 30);
    }

    #[test]
    fn mining_pair_self_matches() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            let mut buy = persistent_req(XreqKind::MiningBuy, 1, 1, 50, 0.001);
            buy.min_amount = 50;
            buy.linked_seqnum = 2;
            let mut sell = persistent_req(XreqKind::MiningSell, 2, 2, 50, 0.001);
            sell.min_amount = 50;
            sell.linked_seqnum = 1;
            t.insert(buy);
            t.insert(sell);
        }
        run_round(&store, 600, 2);
        let t = store.read();
        let (sell_seqnum, buy_seqnum) = t.next_pending_match().unwrap();
        assert_eq!((sell_seqnum, buy_seqnum), (2, 1));
        assert_eq!(t.get(2).unwrap().pending.amount, 50);
    }

    #[test]
    fn unlinked_mining_buy_gets_link_cleared() {
        let store = XreqStore::new();
        {
            let mut t = store.write();
            let mut buy = persistent_req(XreqKind::MiningBuy, 1, 1, 50, 0.001);
            buy.min_amount = 50;
            buy.linked_seqnum = 99;
            t.insert(buy);
        }
        run_round(&store, 600, 1);
        assert_eq!(store.read().get(1).unwrap().linked_seqnum, 0);
    }
}
