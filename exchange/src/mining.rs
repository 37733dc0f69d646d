use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{
    Amount, Xreq, XreqKind, FOREIGN_BLOCKCHAIN_BCH, FOREIGN_BLOCKCHAIN_BTC,
    XCX_MATCHING_SECS_PER_EPOCH,
};
use crate::xmatch::{Xmatch, XmatchStatus};

/// Asset whose supply funds exchange-mining rewards (the native asset).
pub const MINED_ASSET: u64 = 0;

/// Total reward pool, in base units.
pub const TOTAL_TO_MINE: Amount = 2_000_000_000;

const MINING_MIN_CUTOFF_FACTOR: f64 = 0.05;
const MINING_MAX_CUTOFF_FACTOR: f64 = 2.0;

const MINING_MULTIPLIER_INC_THRESHOLD: f64 = 0.5;
const MINING_MULTIPLIER_INC_AMOUNT: f64 = 0.02;
const MINING_MULTIPLIER_MAX: f64 = 1.0;

const MINING_MULTIPLIER_DEC_THRESHOLD: f64 = 0.5;
const MINING_MULTIPLIER_DEC_MULTIPLIER: f64 = 0.98;
const MINING_MULTIPLIER_MIN: f64 = 0.01;

const MINING_MIN_CUTOFF_AMOUNT: f64 = 1.0;
const MINING_AMOUNT_MIN_MAX: f64 = 1.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MiningStats {
    pub avg_amount: f64,
    pub avg_amount_weight: f64,
    pub avg_match_rate_required: f64,
    pub avg_match_rate_required_weight: f64,
    pub avg_match_rate: f64,
    pub avg_match_rate_weight: f64,
}

/// Process-wide mining state, persisted as a single parameter row and
/// restored on startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeMiningParams {
    pub mining_period: u64,
    pub update_time_increment: u64,
    pub total_mined: Amount,
    pub total_remaining_to_mine: Amount,
    pub remaining_fraction_per_interval: f64,
    pub min_amount_per_interval: f64,
    pub max_currently_mineable_intervals: f64,
    pub last_nominal_increase: f64,
    pub currently_mineable: f64,
    pub max_currently_mineable: f64,
    pub short_decay: f64,
    pub long_decay: f64,
    pub multiplier: f64,
    pub max_fraction_per_match: f64,
    pub min_fraction_per_match: f64,
    pub stats: MiningStats,
}

impl ExchangeMiningParams {
    fn initial() -> Self {
        ExchangeMiningParams {
            mining_period: 0,
            update_time_increment: 4 * 60,
            total_mined: 0,
            total_remaining_to_mine: TOTAL_TO_MINE,
            // Pool half life of roughly three years at four-minute periods.
            remaining_fraction_per_interval: 1.7583627e-6,
            min_amount_per_interval: 100.0,
            // One hour of nominal increases may sit in the pool.
            max_currently_mineable_intervals: 15.0,
            last_nominal_increase: 0.0,
            currently_mineable: 0.0,
            max_currently_mineable: 0.0,
            // Half lives of 2 and 12 hours respectively.
            short_decay: 0.97716,
            long_decay: 0.99615659,
            multiplier: MINING_MULTIPLIER_MAX,
            max_fraction_per_match: 0.05,
            min_fraction_per_match: 0.01,
            stats: MiningStats {
                avg_amount: 500.0,
                // Seed weights so the first match doesn't reset the averages.
                avg_amount_weight: 100.0,
                avg_match_rate_required: 1.0 / 5000.0,
                avg_match_rate_required_weight: 100.0 * 500.0,
                avg_match_rate: 1.0 / 5000.0,
                avg_match_rate_weight: 0.0,
            },
        }
    }
}

fn update_weighted_average(avg: &mut f64, weight: &mut f64, amount: f64, new_weight: f64) {
    *avg = (*avg * *weight + amount) / (*weight + new_weight);
    *weight += new_weight;
}

/// Tracks the decaying pool of currently-mineable reward and awards a slice
/// of it to qualifying matches as they are recorded.
#[derive(Debug)]
pub struct ExchangeMining {
    start_time: u64,
    params: ExchangeMiningParams,
    update_counter: u64,
    saved_counter: u64,
}

impl ExchangeMining {
    /// `start_time` of zero disables mining. Any other value is rounded up
    /// to a matching-epoch boundary.
    pub fn new(start_time: u64) -> Self {
        let start_time = if start_time == 0 {
            0
        } else {
            start_time.div_ceil(XCX_MATCHING_SECS_PER_EPOCH) * XCX_MATCHING_SECS_PER_EPOCH
        };
        ExchangeMining {
            start_time,
            params: ExchangeMiningParams::initial(),
            update_counter: 0,
            saved_counter: u64::MAX,
        }
    }

    pub fn params(&self) -> &ExchangeMiningParams {
        &self.params
    }

    pub fn restore(&mut self, params: ExchangeMiningParams) {
        self.params = params;
        self.saved_counter = self.update_counter;
    }

    /// The persisted state, when it has changed since the last save.
    pub fn dirty_params(&self) -> Option<&ExchangeMiningParams> {
        (self.update_counter != self.saved_counter).then_some(&self.params)
    }

    pub fn mark_saved(&mut self) {
        self.saved_counter = self.update_counter;
    }

    /// Advances the mining period to `timestamp`, decaying the moving-average
    /// weights and replenishing the mineable pool once per elapsed period.
    /// Returns false when mining is not active at that time.
    pub fn update_time(&mut self, timestamp: u64) -> bool {
        if self.start_time == 0 || timestamp < self.start_time {
            return false;
        }

        let period = (timestamp - self.start_time) / self.params.update_time_increment + 1;
        debug_assert!(period >= self.params.mining_period);

        if period != self.params.mining_period {
            self.update_counter += 1;
        }

        while period > self.params.mining_period {
            let p = &mut self.params;
            p.mining_period += 1;

            p.stats.avg_amount_weight *= p.long_decay;
            p.stats.avg_match_rate_required_weight *= p.short_decay;
            p.stats.avg_match_rate_weight *= p.long_decay;

            let remaining = p.total_remaining_to_mine as f64;
            p.last_nominal_increase =
                (remaining * p.remaining_fraction_per_interval).max(p.min_amount_per_interval);
            p.max_currently_mineable = p.last_nominal_increase * p.max_currently_mineable_intervals;

            p.currently_mineable =
                (p.currently_mineable + p.last_nominal_increase).min(p.max_currently_mineable);

            if p.currently_mineable / p.max_currently_mineable > MINING_MULTIPLIER_INC_THRESHOLD {
                p.multiplier = (p.multiplier + MINING_MULTIPLIER_INC_AMOUNT).min(MINING_MULTIPLIER_MAX);
            }
        }

        true
    }

    /// Folds the match into the moving averages and returns the inputs for
    /// the mining-amount computation, or None when the match doesn't qualify
    /// for rate tracking (too small, too large, or degenerate).
    fn update_stats(&mut self, m: &Xmatch) -> Option<(f64, f64)> {
        let base_amount = m.base_amount as f64;
        if base_amount <= 0.0 {
            warn!(xmatchnum = m.xmatchnum, "mining stats skipping non-positive amount");
            return None;
        }

        let stats = &mut self.params.stats;
        update_weighted_average(&mut stats.avg_amount, &mut stats.avg_amount_weight, base_amount, 1.0);

        // Very small matches are not tracked; whale-sized ones are excluded
        // so they can't steer the mining parameters.
        if base_amount < stats.avg_amount * MINING_MIN_CUTOFF_FACTOR {
            return None;
        }
        if base_amount > stats.avg_amount * MINING_MAX_CUTOFF_FACTOR {
            return None;
        }

        if m.xbuy.net_rate_required <= 0.0 {
            warn!(xmatchnum = m.xmatchnum, "mining stats skipping non-positive net rate");
            return None;
        }

        let mut probe = Xreq::new(m.xbuy.kind);
        probe.base_costs = m.xbuy.base_costs;
        probe.quote_costs = m.xbuy.quote_costs;
        probe.net_rate_required = m.xbuy.net_rate_required;

        let mut buyer_rate_required = probe.match_rate_required(m.base_amount);
        if m.xbuy.kind == XreqKind::MiningBuy {
            buyer_rate_required *= 2.0;
        }
        if buyer_rate_required <= 0.0 {
            return None;
        }

        let stats = &mut self.params.stats;
        update_weighted_average(
            &mut stats.avg_match_rate_required,
            &mut stats.avg_match_rate_required_weight,
            base_amount * buyer_rate_required,
            base_amount,
        );

        Some((base_amount, buyer_rate_required))
    }

    fn compute_mining_amount(&mut self, base_amount: f64, buyer_rate_required: f64) -> f64 {
        let p = &mut self.params;

        if p.currently_mineable <= 0.0 {
            return 0.0;
        }
        // Only buyers paying over the going rate mine.
        if buyer_rate_required <= p.stats.avg_match_rate_required {
            return 0.0;
        }

        let current_frac = p.currently_mineable / p.max_currently_mineable;

        let mut mining_amount = base_amount * p.multiplier;
        let mut max_amount = p.currently_mineable * p.max_fraction_per_match;
        let min_max = (p.max_currently_mineable * p.min_fraction_per_match).max(MINING_AMOUNT_MIN_MAX);

        if max_amount < min_max {
            max_amount = min_max;
        }
        if mining_amount > max_amount {
            mining_amount = max_amount;
        }
        if mining_amount > p.currently_mineable {
            mining_amount = p.currently_mineable;
        }
        if mining_amount < MINING_MIN_CUTOFF_AMOUNT {
            return 0.0;
        }

        if current_frac < MINING_MULTIPLIER_DEC_THRESHOLD {
            p.multiplier = (p.multiplier * MINING_MULTIPLIER_DEC_MULTIPLIER).max(MINING_MULTIPLIER_MIN);
        }

        mining_amount
    }

    /// Reserves a mining reward for a newly-recorded match. Only native-base
    /// buys quoted against BCH qualify.
    pub fn set_mining_amount(&mut self, m: &mut Xmatch) {
        if self.params.total_remaining_to_mine == 0 {
            return;
        }
        if !matches!(m.xbuy.kind, XreqKind::SimpleBuy | XreqKind::MiningBuy)
            || m.xbuy.quote_asset != FOREIGN_BLOCKCHAIN_BCH
            || m.xbuy.base_asset != MINED_ASSET
        {
            return;
        }

        if !self.update_time(m.match_timestamp) {
            return;
        }

        self.update_counter += 1;

        let Some((base_amount, buyer_rate_required)) = self.update_stats(m) else {
            return;
        };

        m.mining_amount = self.compute_mining_amount(base_amount, buyer_rate_required);

        debug_assert!(m.mining_amount <= self.params.currently_mineable);
        self.params.currently_mineable -= m.mining_amount;

        debug!(
            xmatchnum = m.xmatchnum,
            mining_amount = m.mining_amount,
            currently_mineable = self.params.currently_mineable,
            "mining amount reserved"
        );
    }

    /// The integer reward actually payable at settlement, clamped to what is
    /// left to mine.
    pub fn adjusted_mining_amount(&self, m: &Xmatch) -> Amount {
        if m.mining_amount == 0.0 {
            return 0;
        }
        debug_assert_eq!(m.status, XmatchStatus::Paid);
        let amount = m.mining_amount as Amount;
        amount.min(self.params.total_remaining_to_mine)
    }

    /// Moves the paid reward from the remaining pool to the mined total.
    pub fn finalize_mining_amount(&mut self, m: &mut Xmatch, adj_mining_amount: Amount) {
        if m.mining_amount == 0.0 {
            return;
        }
        debug_assert_eq!(m.status, XmatchStatus::Paid);

        m.mining_amount = adj_mining_amount as f64;

        self.update_counter += 1;

        debug_assert!(adj_mining_amount <= self.params.total_remaining_to_mine);
        self.params.total_remaining_to_mine -= adj_mining_amount;
        self.params.total_mined += adj_mining_amount;

        if self.params.total_remaining_to_mine == 0 {
            self.params.currently_mineable = 0.0;
        }
    }

    /// Feeds the observed paid rate into the long moving average used to
    /// qualify future matches.
    pub fn update_match_stats(&mut self, m: &Xmatch, buyer_amount: Amount) {
        if !matches!(m.xbuy.kind, XreqKind::SimpleBuy | XreqKind::MiningBuy)
            || m.xbuy.quote_asset != FOREIGN_BLOCKCHAIN_BCH
            || m.xbuy.base_asset != MINED_ASSET
        {
            return;
        }
        if buyer_amount == 0 {
            return;
        }

        let base_amount = buyer_amount as f64;
        let rate = m.amount_paid / base_amount;

        let stats = &mut self.params.stats;
        update_weighted_average(
            &mut stats.avg_match_rate,
            &mut stats.avg_match_rate_weight,
            base_amount * rate,
            base_amount,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Xreq;
    use crate::xmatch::Xmatch;

    fn mineable_match(block_time: u64, amount: Amount, net_rate: f64) -> Xmatch {
        let mut buyer = Xreq::new(XreqKind::SimpleBuy);
        buyer.seqnum = 1;
        buyer.xreqnum = 1;
        buyer.quote_asset = FOREIGN_BLOCKCHAIN_BCH;
        buyer.net_rate_required = net_rate;
        buyer.max_amount = amount;
        buyer.open_amount = 0;
        buyer.payment_time = 600;
        let mut seller = Xreq::new(XreqKind::SimpleSell);
        seller.seqnum = 2;
        seller.xreqnum = 2;
        seller.quote_asset = FOREIGN_BLOCKCHAIN_BCH;
        seller.net_rate_required = net_rate;
        seller.max_amount = amount;
        seller.open_amount = 0;
        seller.payment_time = 600;
        Xmatch::new(block_time, &buyer, &seller, amount, net_rate)
    }

    #[test]
    fn pool_replenishes_once_per_period() {
        let mut mining = ExchangeMining::new(60);
        assert!(!mining.update_time(0));
        assert!(mining.update_time(60));
        let one = mining.params().currently_mineable;
        assert!(one > 0.0);
        // Same period: no further increase.
        assert!(mining.update_time(60));
        assert_eq!(mining.params().currently_mineable, one);
        // Next period adds again, up to the cap.
        assert!(mining.update_time(60 + 240));
        assert!(mining.params().currently_mineable > one);
    }

    #[test]
    fn pool_is_clamped_to_max() {
        let mut mining = ExchangeMining::new(60);
        mining.update_time(60 + 240 * 1000);
        let p = mining.params();
        assert!(p.currently_mineable <= p.max_currently_mineable);
        assert_eq!(p.currently_mineable, p.max_currently_mineable);
    }

    #[test]
    fn above_average_rate_earns_mining_amount() {
        let mut mining = ExchangeMining::new(60);
        mining.update_time(60 + 240 * 100);
        // avg rate seeded at 1/5000; pay double that on an average-sized match
        let mut m = mineable_match(60 + 240 * 100, 500, 2.0 / 5000.0);
        mining.set_mining_amount(&mut m);
        assert!(m.mining_amount > 0.0);
    }

    #[test]
    fn below_average_rate_earns_nothing() {
        let mut mining = ExchangeMining::new(60);
        mining.update_time(60 + 240 * 100);
        let mut m = mineable_match(60 + 240 * 100, 500, 0.5 / 5000.0);
        mining.set_mining_amount(&mut m);
        assert_eq!(m.mining_amount, 0.0);
    }

    #[test]
    fn oversized_match_is_excluded() {
        let mut mining = ExchangeMining::new(60);
        mining.update_time(60 + 240 * 100);
        let mut m = mineable_match(60 + 240 * 100, 1_000_000, 2.0 / 5000.0);
        mining.set_mining_amount(&mut m);
        assert_eq!(m.mining_amount, 0.0);
    }

    #[test]
    fn finalize_conserves_pool_totals() {
        let mut mining = ExchangeMining::new(60);
        mining.update_time(60 + 240 * 100);
        let mut m = mineable_match(60 + 240 * 100, 500, 2.0 / 5000.0);
        mining.set_mining_amount(&mut m);
        m.status = XmatchStatus::Paid;
        let adj = mining.adjusted_mining_amount(&m);
        mining.finalize_mining_amount(&mut m, adj);
        let p = mining.params();
        assert_eq!(p.total_mined + p.total_remaining_to_mine, TOTAL_TO_MINE);
        assert_eq!(p.total_mined, adj);
    }

    #[test]
    fn non_bch_quote_does_not_mine() {
        let mut mining = ExchangeMining::new(60);
        mining.update_time(60 + 240 * 100);
        let mut m = mineable_match(60 + 240 * 100, 500, 2.0 / 5000.0);
        m.xbuy.quote_asset = FOREIGN_BLOCKCHAIN_BTC;
        mining.set_mining_amount(&mut m);
        assert_eq!(m.mining_amount, 0.0);
    }

    #[test]
    fn dirty_params_round_trip() {
        let mut mining = ExchangeMining::new(60);
        assert!(mining.dirty_params().is_some(), "fresh state needs a first save");
        mining.mark_saved();
        assert!(mining.dirty_params().is_none());
        mining.update_time(60 + 240);
        let params = mining.dirty_params().expect("period change dirties state").clone();
        let mut restored = ExchangeMining::new(60);
        restored.restore(params.clone());
        assert_eq!(restored.params(), &params);
    }
}
