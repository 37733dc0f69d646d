use serde::{Deserialize, Serialize};

use crate::types::{Address, Amount, Oid, Xreq, XreqKind};

/// Lifecycle of a persisted request, recorded alongside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum XreqDisposition {
    Open,
    MatchedPart,
    MatchedAll,
    /// Expired with the full amount unmatched.
    ExpiredAll,
    /// Expired with a matched portion and an unmatched remainder.
    ExpiredRem,
}

impl XreqDisposition {
    pub fn is_closed(self) -> bool {
        matches!(self, XreqDisposition::ExpiredAll | XreqDisposition::ExpiredRem)
    }
}

/// Persistent form of an exchange request: the wire fields plus the open
/// amount and disposition, as stored in the match-request table and embedded
/// into each match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XmatchReq {
    pub xreqnum: u64,
    pub objid: Oid,
    pub kind: XreqKind,
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
    pub expire_time: u64,
    pub disposition: XreqDisposition,
}

impl XmatchReq {
    pub fn from_xreq(x: &Xreq) -> Self {
        XmatchReq {
            xreqnum: x.xreqnum,
            objid: x.objid,
            kind: x.kind,
            base_asset: x.base_asset,
            quote_asset: x.quote_asset,
            foreign_asset: x.foreign_asset,
            foreign_address: x.foreign_address.clone(),
            destination: x.destination,
            min_amount: x.min_amount,
            max_amount: x.max_amount,
            open_amount: x.open_amount,
            net_rate_required: x.net_rate_required,
            wait_discount: x.wait_discount,
            base_costs: x.base_costs,
            quote_costs: x.quote_costs,
            pledge: x.pledge,
            hold_time: x.hold_time,
            hold_time_required: x.hold_time_required,
            min_wait_time: x.min_wait_time,
            consideration_required: x.consideration_required,
            consideration_offered: x.consideration_offered,
            accept_time_required: x.accept_time_required,
            accept_time_offered: x.accept_time_offered,
            payment_time: x.payment_time,
            confirmations: x.confirmations,
            auto_accept: x.auto_accept,
            expire_time: x.expire_time,
            disposition: if x.open_amount == 0 {
                XreqDisposition::MatchedAll
            } else if x.open_amount < x.max_amount {
                XreqDisposition::MatchedPart
            } else {
                XreqDisposition::Open
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.disposition.is_closed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum XmatchStatus {
    Matched,
    Accepted,
    PartPaidOpen,
    Paid,
    UnpaidExpired,
    PartPaidExpired,
}

impl XmatchStatus {
    /// A payment advice is honored only in these states.
    pub fn accepts_payment(self) -> bool {
        matches!(self, XmatchStatus::Accepted | XmatchStatus::PartPaidOpen)
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            XmatchStatus::Paid | XmatchStatus::UnpaidExpired | XmatchStatus::PartPaidExpired
        )
    }
}

/// A settled-or-settling pairing of one buy and one sell request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Xmatch {
    pub xmatchnum: u64,
    pub xbuy: XmatchReq,
    pub xsell: XmatchReq,
    pub status: XmatchStatus,
    pub base_amount: Amount,
    pub rate: f64,
    /// Foreign-asset amount paid so far, from payment advices.
    pub amount_paid: f64,
    /// Mining reward reserved for the buy side; finalized on full payment.
    pub mining_amount: f64,
    /// Percent of `base_amount` held as the payment pledge. Equal to the
    /// seller's pledge requirement; any excess buyer pledge reverts to the
    /// buyer at settlement.
    pub match_pledge: u8,
    pub match_timestamp: u64,
    pub accept_timestamp: u64,
    pub final_timestamp: u64,
    /// Block time after which the match expires unpaid; zero once final.
    pub next_deadline: u64,
}

impl Xmatch {
    /// Builds the persistent match record from a mutual best match. The
    /// request copies carry their post-match open amounts. When both sides
    /// auto-accept, the match starts accepted with the payment clock running;
    /// otherwise it waits for acceptance.
    pub fn new(block_time: u64, buyer: &Xreq, seller: &Xreq, amount: Amount, rate: f64) -> Self {
        let xbuy = XmatchReq::from_xreq(buyer);
        let xsell = XmatchReq::from_xreq(seller);
        let auto = buyer.auto_accept && seller.auto_accept;
        let (status, accept_timestamp, next_deadline) = if auto {
            (
                XmatchStatus::Accepted,
                block_time,
                block_time + seller.payment_time,
            )
        } else {
            (
                XmatchStatus::Matched,
                0,
                block_time + seller.accept_time_required,
            )
        };
        let match_pledge = seller.pledge;
        Xmatch {
            xmatchnum: 0,
            xbuy,
            xsell,
            status,
            base_amount: amount,
            rate,
            amount_paid: 0.0,
            mining_amount: 0.0,
            match_pledge,
            match_timestamp: block_time,
            accept_timestamp,
            final_timestamp: 0,
            next_deadline,
        }
    }

    /// Quote-asset value of the match at the agreed rate.
    pub fn quote_amount(&self) -> f64 {
        self.base_amount as f64 * self.rate
    }

    /// Foreign amount still owed by the buyer; non-positive once paid in full.
    pub fn amount_to_pay(&self) -> f64 {
        self.quote_amount() - self.amount_paid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_pair() -> (Xreq, Xreq) {
        let mut buyer = Xreq::new(XreqKind::SimpleBuy);
        buyer.seqnum = 1;
        buyer.xreqnum = 10;
        buyer.max_amount = 100;
        buyer.open_amount = 60;
        buyer.pledge = 10;
        buyer.payment_time = 900;
        let mut seller = Xreq::new(XreqKind::SimpleSell);
        seller.seqnum = 2;
        seller.xreqnum = 11;
        seller.max_amount = 40;
        seller.open_amount = 0;
        seller.pledge = 5;
        seller.payment_time = 600;
        (buyer, seller)
    }

    #[test]
    fn auto_accepted_match_starts_payment_clock() {
        let (buyer, seller) = simple_pair();
        let m = Xmatch::new(1000, &buyer, &seller, 40, 0.001);
        assert_eq!(m.status, XmatchStatus::Accepted);
        assert_eq!(m.accept_timestamp, 1000);
        assert_eq!(m.next_deadline, 1600);
        assert_eq!(m.match_pledge, 5);
    }

    #[test]
    fn non_auto_match_waits_for_acceptance() {
        let (mut buyer, mut seller) = simple_pair();
        buyer.auto_accept = false;
        seller.auto_accept = true;
        seller.accept_time_required = 300;
        let m = Xmatch::new(1000, &buyer, &seller, 40, 0.001);
        assert_eq!(m.status, XmatchStatus::Matched);
        assert_eq!(m.accept_timestamp, 0);
        assert_eq!(m.next_deadline, 1300);
    }

    #[test]
    fn dispositions_follow_open_amount() {
        let (buyer, seller) = simple_pair();
        let m = Xmatch::new(1000, &buyer, &seller, 40, 0.001);
        assert_eq!(m.xbuy.disposition, XreqDisposition::MatchedPart);
        assert_eq!(m.xsell.disposition, XreqDisposition::MatchedAll);
        assert!(!m.xbuy.is_closed());
    }

    #[test]
    fn amount_to_pay_tracks_payments() {
        let (buyer, seller) = simple_pair();
        let mut m = Xmatch::new(1000, &buyer, &seller, 40, 0.5);
        assert_eq!(m.quote_amount(), 20.0);
        m.amount_paid = 15.0;
        assert_eq!(m.amount_to_pay(), 5.0);
        assert!(m.status.accepts_payment());
    }
}
