use serde::{Deserialize, Serialize};

pub type Oid = [u8; 32];
pub type Address = [u8; 32];
pub type Amount = u128;

/// Foreign-blockchain identifiers carried in `quote_asset`.
pub const FOREIGN_BLOCKCHAIN_BTC: u64 = 1;
pub const FOREIGN_BLOCKCHAIN_BCH: u64 = 2;

/// Width of one exchange matching epoch in seconds. Block timestamps are
/// rounded down to a multiple of this value for matching, expiration and
/// match settlement.
pub const XCX_MATCHING_SECS_PER_EPOCH: u64 = 60;

/// Interval at which a request's wait discount compounds while on hold.
pub const XREQ_WAIT_DISCOUNT_INTERVAL: u64 = 3600;

pub fn matching_epoch(block_time: u64) -> u64 {
    block_time / XCX_MATCHING_SECS_PER_EPOCH
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XreqKind {
    SimpleBuy,
    SimpleSell,
    MiningBuy,
    MiningSell,
    NakedBuy,
    NakedSell,
    MiningTrade,
}

impl XreqKind {
    pub fn is_buyer(self) -> bool {
        matches!(
            self,
            XreqKind::SimpleBuy | XreqKind::MiningBuy | XreqKind::NakedBuy
        )
    }

    pub fn is_seller(self) -> bool {
        matches!(
            self,
            XreqKind::SimpleSell | XreqKind::MiningSell | XreqKind::NakedSell
        )
    }

    /// Crosschain kinds settle against a foreign blockchain and carry a
    /// foreign address on the sell side.
    pub fn is_crosschain(self) -> bool {
        matches!(
            self,
            XreqKind::SimpleBuy
                | XreqKind::SimpleSell
                | XreqKind::MiningBuy
                | XreqKind::MiningSell
                | XreqKind::MiningTrade
        )
    }

    pub fn is_mining(self) -> bool {
        matches!(
            self,
            XreqKind::MiningBuy | XreqKind::MiningSell | XreqKind::MiningTrade
        )
    }

    /// Bare-msg requests stake nothing and are never refunded on expiration.
    pub fn has_bare_msg(self) -> bool {
        matches!(self, XreqKind::NakedBuy | XreqKind::NakedSell)
    }
}

/// When the matcher must re-evaluate a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecalcTime {
    /// No re-evaluation scheduled.
    #[default]
    Not,
    /// Re-evaluate at the start of the next matching round.
    Next,
    /// Re-evaluate at the first round whose block time reaches this value.
    At(u64),
}

/// Best potential match found for a request during the current pass.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BestMatch {
    pub amount: Amount,
    pub rate: f64,
    pub net_rate: f64,
    pub other_seqnum: u64,
    pub other_xreqnum: u64,
    pub other_matching_amount: Amount,
    pub other_net_rate: f64,
}

impl BestMatch {
    pub fn clear(&mut self) {
        *self = BestMatch::default();
    }
}

/// Mutual best match recorded during an epoch, visible to readers until the
/// end of the following epoch. `order` is non-zero only for actual (hold-free)
/// matches awaiting persistence.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PendingMatch {
    pub epoch: u64,
    pub amount: Amount,
    pub rate: f64,
    pub hold_time: u64,
    pub order: u64,
}

/// An open exchange request as held in the matcher's memory table.
#[derive(Clone, Debug, PartialEq)]
pub struct Xreq {
    pub kind: XreqKind,
    pub objid: Oid,
    /// Ordering id, assigned on insertion, always non-zero.
    pub seqnum: u64,
    /// Partner seqnum for a trade-split pair; zero when unlinked.
    pub linked_seqnum: u64,
    /// Persistent id; zero until the request lands in an indelible block.
    pub xreqnum: u64,
    /// Timestamp of the block that persisted the request.
    pub blocktime: u64,
    pub expire_time: u64,
    pub base_asset: u64,
    pub quote_asset: u64,
    pub foreign_asset: u64,
    pub foreign_address: String,
    pub destination: Address,
    pub min_amount: Amount,
    pub max_amount: Amount,
    pub open_amount: Amount,
    pub net_rate_required: f64,
    pub wait_discount: f64,
    pub base_costs: f64,
    pub quote_costs: f64,
    /// Percent of the match amount pledged toward payment.
    pub pledge: u8,
    pub hold_time: u64,
    pub hold_time_required: u64,
    pub min_wait_time: u64,
    pub consideration_required: u32,
    pub consideration_offered: u32,
    pub accept_time_required: u64,
    pub accept_time_offered: u64,
    pub payment_time: u64,
    pub confirmations: u32,
    pub auto_accept: bool,

    // Matcher working state.
    pub open_rate_required: f64,
    pub matching_amount: Amount,
    pub matching_rate_required: f64,
    pub recalc: bool,
    pub recalc_time: RecalcTime,
    pub last_matched: u64,
    pub best: BestMatch,
    pub pending: PendingMatch,
}

impl Xreq {
    pub fn new(kind: XreqKind) -> Self {
        Xreq {
            kind,
            objid: [0u8; 32],
            seqnum: 0,
            linked_seqnum: 0,
            xreqnum: 0,
            blocktime: 0,
            expire_time: 0,
            base_asset: 0,
            quote_asset: 0,
            foreign_asset: 0,
            foreign_address: String::new(),
            destination: [0u8; 32],
            min_amount: 0,
            max_amount: 0,
            open_amount: 0,
            net_rate_required: 0.0,
            wait_discount: 0.0,
            base_costs: 0.0,
            quote_costs: 0.0,
            pledge: 0,
            hold_time: 0,
            hold_time_required: 0,
            min_wait_time: 0,
            consideration_required: 0,
            consideration_offered: 0,
            accept_time_required: 0,
            accept_time_offered: 0,
            payment_time: 0,
            confirmations: 0,
            auto_accept: true,
            open_rate_required: 0.0,
            matching_amount: 0,
            matching_rate_required: 0.0,
            recalc: false,
            recalc_time: RecalcTime::Not,
            last_matched: 0,
            best: BestMatch::default(),
            pending: PendingMatch::default(),
        }
    }

    pub fn is_buyer(&self) -> bool {
        self.kind.is_buyer()
    }

    pub fn is_seller(&self) -> bool {
        self.kind.is_seller()
    }

    pub fn amount_as_float(&self, amount: Amount) -> f64 {
        amount as f64
    }

    /// Effective quote-per-base rate for this side after costs, at the given
    /// match amount and rate. Buyers pay their costs on top of the quoted
    /// amount; sellers absorb theirs out of it.
    pub fn net_rate(&self, amount: Amount, rate: f64) -> f64 {
        let a = self.amount_as_float(amount);
        if self.is_buyer() {
            let base = a - self.base_costs;
            if base <= 0.0 {
                return f64::MAX;
            }
            (a * rate + self.quote_costs) / base
        } else {
            let net = (a * rate - self.quote_costs) / (a + self.base_costs);
            net.max(0.0)
        }
    }

    /// The quoted rate this side requires at `amount` so that its net rate
    /// meets `net_rate_required`. Bounded by `net_rate_required` itself to
    /// absorb float rounding: a buyer's requirement never exceeds it and a
    /// seller's never falls below it.
    pub fn match_rate_required(&self, amount: Amount) -> f64 {
        let a = self.amount_as_float(amount);
        if a <= 0.0 {
            return self.net_rate_required;
        }
        if self.is_buyer() {
            let r = (self.net_rate_required * (a - self.base_costs) - self.quote_costs) / a;
            r.clamp(0.0, self.net_rate_required)
        } else {
            let r = (self.net_rate_required * (a + self.base_costs) + self.quote_costs) / a;
            r.max(self.net_rate_required)
        }
    }

    /// Splits a trade request into its buy half. The caller links seqnums and
    /// assigns the consecutive xreqnums.
    pub fn convert_trade_to_buy(&mut self) {
        debug_assert_eq!(self.kind, XreqKind::MiningTrade);
        self.kind = XreqKind::MiningBuy;
    }

    pub fn convert_trade_to_sell(&mut self) {
        debug_assert_eq!(self.kind, XreqKind::MiningTrade);
        self.kind = XreqKind::MiningSell;
        // The sell half receives foreign payments; the buy half does not.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(kind: XreqKind, net_rate: f64, base_costs: f64, quote_costs: f64) -> Xreq {
        let mut x = Xreq::new(kind);
        x.net_rate_required = net_rate;
        x.base_costs = base_costs;
        x.quote_costs = quote_costs;
        x
    }

    #[test]
    fn buyer_rate_required_is_bounded_by_net_rate() {
        let x = req(XreqKind::SimpleBuy, 0.001, 2.0, 0.0001);
        for amount in [10u128, 100, 1000, 1_000_000] {
            let r = x.match_rate_required(amount);
            assert!(r <= x.net_rate_required, "amount {amount} rate {r}");
            assert!(r >= 0.0);
        }
    }

    #[test]
    fn seller_rate_required_is_at_least_net_rate() {
        let x = req(XreqKind::SimpleSell, 0.001, 2.0, 0.0001);
        for amount in [10u128, 100, 1000, 1_000_000] {
            let r = x.match_rate_required(amount);
            assert!(r >= x.net_rate_required, "amount {amount} rate {r}");
        }
    }

    #[test]
    fn rate_required_converges_to_net_rate_for_large_amounts() {
        let buyer = req(XreqKind::SimpleBuy, 0.001, 1.0, 0.01);
        let seller = req(XreqKind::SimpleSell, 0.001, 1.0, 0.01);
        let rb = buyer.match_rate_required(1_000_000_000);
        let rs = seller.match_rate_required(1_000_000_000);
        assert!((rb - 0.001).abs() < 1e-6);
        assert!((rs - 0.001).abs() < 1e-6);
    }

    #[test]
    fn net_rate_round_trips_rate_required() {
        let seller = req(XreqKind::SimpleSell, 0.002, 3.0, 0.05);
        let amount = 5_000u128;
        let rate = seller.match_rate_required(amount);
        let net = seller.net_rate(amount, rate);
        assert!((net - seller.net_rate_required).abs() < 1e-9);
    }

    #[test]
    fn zero_amount_rate_required_falls_back_to_net_rate() {
        let buyer = req(XreqKind::SimpleBuy, 0.5, 1.0, 1.0);
        assert_eq!(buyer.match_rate_required(0), 0.5);
    }

    #[test]
    fn kind_predicates() {
        assert!(XreqKind::SimpleBuy.is_buyer());
        assert!(XreqKind::NakedSell.is_seller());
        assert!(XreqKind::MiningTrade.is_mining());
        assert!(!XreqKind::MiningTrade.is_buyer());
        assert!(XreqKind::NakedBuy.has_bare_msg());
        assert!(!XreqKind::SimpleSell.has_bare_msg());
    }
}
