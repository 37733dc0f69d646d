use exchange::{
    matching_epoch, Amount, RecalcTime, Xmatch, XmatchReq, XmatchStatus, Xreq, XreqDisposition,
    XreqKind, Xreqs, XCX_MATCHING_SECS_PER_EPOCH,
};
use state_store::keys::DB_KEY_XMATCHING;
use state_store::{StoreRead, StoreWriter};
use tracing::{debug, info};

use crate::error::{ChainError, ChainResult};
use crate::ledger::Ledger;
use crate::tx::Transaction;

/// Cap on persistent open requests, to bound matching time per round.
pub const XREQ_MAX_PERSISTENT_COUNT: usize = 1200;
/// Additional slack for not-yet-persistent requests.
pub const XREQ_MIN_NON_PERSISTENT_COUNT: usize = 20_000;

/// How long a matching-request copy is kept for clients past its expiry.
const XMATCHING_REQ_RETENTION_SECS: u64 = 48 * 3600;

fn update_open_amount(xreq: &mut Xreq, match_amount: Amount) {
    debug_assert!(xreq.open_amount >= match_amount);
    xreq.open_amount -= match_amount;
    xreq.open_rate_required = xreq.match_rate_required(xreq.open_amount);
    xreq.recalc_time = RecalcTime::Next;
}

fn save_xreq(table: &mut Xreqs, xreq: Xreq) {
    if xreq.open_amount > 0 {
        table.update(xreq);
    } else {
        table.remove(xreq.seqnum);
    }
}

/// The sell half of a trade split shares the trade's wire object, so its
/// table identity is derived rather than equal.
fn linked_objid(objid: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"obol.trade-sell");
    hasher.update(objid);
    *hasher.finalize().as_bytes()
}

impl Ledger {
    /// Persists a request from a newly-indelible block: assigns its xreqnum
    /// and blocktime, splitting a mining trade into a linked buy+sell pair
    /// with consecutive xreqnums.
    pub(crate) fn add_xreq(
        &self,
        writer: &mut StoreWriter<'_>,
        block_time: u64,
        mut xreq: Xreq,
    ) -> ChainResult<()> {
        xreq.xreqnum = self.nums.alloc_xreqnum();
        xreq.blocktime = block_time;

        let mut table = self.xreqs.write();
        xreq.seqnum = table.alloc_seqnum();

        if xreq.kind != XreqKind::MiningTrade {
            return self.add_one_xreq(writer, &mut table, xreq);
        }

        let mut sell = xreq.clone();
        xreq.convert_trade_to_buy();
        sell.convert_trade_to_sell();

        sell.seqnum = table.alloc_seqnum();
        sell.xreqnum = self.nums.alloc_xreqnum();
        sell.objid = linked_objid(&xreq.objid);

        xreq.linked_seqnum = sell.seqnum;
        sell.linked_seqnum = xreq.seqnum;

        self.add_one_xreq(writer, &mut table, xreq)?;
        self.add_one_xreq(writer, &mut table, sell)
    }

    fn add_one_xreq(
        &self,
        writer: &mut StoreWriter<'_>,
        table: &mut Xreqs,
        mut xreq: Xreq,
    ) -> ChainResult<()> {
        xreq.open_amount = xreq.max_amount;
        xreq.open_rate_required = xreq.match_rate_required(xreq.open_amount);
        xreq.recalc_time = RecalcTime::Next;

        debug!(
            xreqnum = xreq.xreqnum,
            seqnum = xreq.seqnum,
            kind = ?xreq.kind,
            blocktime = xreq.blocktime,
            "exchange request persisted"
        );

        let record = XmatchReq::from_xreq(&xreq);
        writer.xmatchreq_insert(&record)?;
        writer.xmatchingreq_insert(
            xreq.expire_time.saturating_add(XMATCHING_REQ_RETENTION_SECS),
            &record,
        )?;
        table.insert(xreq);
        Ok(())
    }

    /// Mirrors a not-yet-persistent request into the matcher's table so it
    /// counts toward the pending-request cap; called by the transaction
    /// validation path. Pending requests never match.
    pub fn add_pending_request(&self, tx: &Transaction) -> ChainResult<()> {
        let kind = tx
            .kind
            .xreq_kind()
            .ok_or(ChainError::InvalidTx("not an exchange request"))?;
        let payload = tx
            .xreq
            .as_ref()
            .ok_or(ChainError::InvalidTx("request transaction without request payload"))?;
        let wire = tx.to_wire()?;

        let mut xreq = payload.to_xreq(kind);
        xreq.objid = Transaction::objid(&wire, tx.kind);
        xreq.open_amount = xreq.max_amount;
        xreq.open_rate_required = xreq.match_rate_required(xreq.open_amount);
        xreq.recalc_time = RecalcTime::Next;

        let mut table = self.xreqs.write();
        xreq.seqnum = table.alloc_seqnum();

        if xreq.kind != XreqKind::MiningTrade {
            table.insert(xreq);
            return Ok(());
        }

        let mut sell = xreq.clone();
        xreq.convert_trade_to_buy();
        sell.convert_trade_to_sell();
        sell.seqnum = table.alloc_seqnum();
        sell.objid = linked_objid(&xreq.objid);
        xreq.linked_seqnum = sell.seqnum;
        sell.linked_seqnum = xreq.seqnum;
        table.insert(xreq);
        table.insert(sell);
        Ok(())
    }

    /// Removes one request from matching; if it had been persisted with an
    /// open remainder, records its disposition and refunds the remainder
    /// (buyers recover their pledge fraction, sellers the full amount).
    fn expire_xreq(
        &self,
        writer: &mut StoreWriter<'_>,
        table: &mut Xreqs,
        xreq: Xreq,
    ) -> ChainResult<()> {
        table.remove(xreq.seqnum);

        if xreq.xreqnum == 0 || xreq.open_amount == 0 {
            return Ok(());
        }

        let disposition = if xreq.open_amount < xreq.max_amount {
            XreqDisposition::ExpiredRem
        } else {
            XreqDisposition::ExpiredAll
        };
        writer.xmatchreq_update(xreq.xreqnum, disposition)?;

        if xreq.kind.has_bare_msg() {
            return Ok(());
        }

        let expire_amount = if xreq.is_buyer() {
            // Pledge amounts always round down.
            xreq.open_amount * xreq.pledge as u128 / 100
        } else {
            xreq.open_amount
        };

        debug!(
            xreqnum = xreq.xreqnum,
            disposition = ?disposition,
            expire_amount,
            "expiring request"
        );

        if expire_amount > 0 {
            self.create_tx_outputs(
                writer,
                xreq.base_asset,
                expire_amount,
                &xreq.destination,
                self.config.default_domain,
                true,
                true,
                0,
                false,
            )?;
        }

        Ok(())
    }

    /// Expires every request whose expire time has been reached at
    /// `block_time`.
    pub(crate) fn expire_xreqs(&self, writer: &mut StoreWriter<'_>, block_time: u64) -> ChainResult<()> {
        let mut table = self.xreqs.write();
        while !self.shutdown.is_set() {
            let Some(xreq) = table.select_expire(block_time) else {
                break;
            };
            debug_assert!(xreq.expire_time <= block_time);
            self.expire_xreq(writer, &mut table, xreq)?;
        }
        Ok(())
    }

    /// Bounds the request table. Pass zero closes only persistent requests
    /// that never matched and hold no pending match, stopping at requests
    /// persisted by the current block; pass one closes whatever is needed.
    /// A pruned request drags its linked trade partner with it.
    pub(crate) fn prune_xreqs(&self, writer: &mut StoreWriter<'_>, new_xreqnum: u64) -> ChainResult<()> {
        let mut table = self.xreqs.write();

        for pass in 0..2u32 {
            let mut next_xreqnum = 1u64;
            while !self.shutdown.is_set() {
                let persistent = table.count_persistent();
                let pending = table.count_pending();

                let over_persistent = persistent > XREQ_MAX_PERSISTENT_COUNT;
                if !over_persistent
                    && persistent + pending <= XREQ_MAX_PERSISTENT_COUNT + XREQ_MIN_NON_PERSISTENT_COUNT
                {
                    break;
                }

                let selected = if over_persistent {
                    table.select_xreqnum(next_xreqnum, None)
                } else {
                    table.select_pending()
                };
                let Some(xreq) = selected else {
                    break;
                };
                debug_assert_eq!(over_persistent, xreq.xreqnum != 0);
                next_xreqnum = xreq.xreqnum + 1;

                if pass == 0 && over_persistent {
                    if xreq.xreqnum >= new_xreqnum {
                        break;
                    }
                    let never_matched_and_idle =
                        xreq.open_amount == xreq.max_amount && xreq.pending.rate == 0.0;
                    if !never_matched_and_idle {
                        continue;
                    }
                }

                debug!(pass, persistent, pending, xreqnum = xreq.xreqnum, "pruning request");

                let linked_seqnum = xreq.linked_seqnum;
                self.expire_xreq(writer, &mut table, xreq)?;

                if linked_seqnum != 0 {
                    if let Some(partner) = table.select_seqnum(linked_seqnum) {
                        self.expire_xreq(writer, &mut table, partner)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Settles matches whose payment deadline passed without full payment.
    pub(crate) fn expire_matches(&self, writer: &mut StoreWriter<'_>, block_time: u64) -> ChainResult<()> {
        while !self.shutdown.is_set() {
            let Some(mut m) = writer.xmatch_select_next_deadline(block_time)? else {
                break;
            };

            debug!(xmatchnum = m.xmatchnum, status = ?m.status, "expiring match");

            m.status = match m.status {
                XmatchStatus::Matched | XmatchStatus::Accepted => XmatchStatus::UnpaidExpired,
                XmatchStatus::PartPaidOpen => XmatchStatus::PartPaidExpired,
                _ => return Err(self.fatal_error("deadline on settled match")),
            };
            m.final_timestamp = block_time;
            m.next_deadline = 0;

            let mut donation = 0u128;
            self.settle_match(writer, &mut m, &mut donation)?;
            debug_assert_eq!(donation, 0);
        }
        Ok(())
    }

    /// Consumes the matching round that just finished: turns each pending
    /// actual match into a persistent match in pending order, reducing the
    /// two sides' open amounts and closing requests that reach zero.
    pub(crate) fn make_matches_persistent(
        &self,
        writer: &mut StoreWriter<'_>,
        block_time: u64,
    ) -> ChainResult<()> {
        let mut table = self.xreqs.write();

        while !self.shutdown.is_set() {
            let Some((sell_seqnum, buy_seqnum)) = table.next_pending_match() else {
                break;
            };

            let mut minor = table
                .select_seqnum(sell_seqnum)
                .ok_or_else(|| self.fatal_error("pending match sell request missing"))?;
            let mut major = table
                .select_seqnum(buy_seqnum)
                .ok_or_else(|| self.fatal_error("pending match buy request missing"))?;

            debug_assert!(major.is_buyer());
            debug_assert!(minor.is_seller());
            debug_assert_eq!(major.seqnum, minor.best.other_seqnum);
            debug_assert_eq!(major.xreqnum, minor.best.other_xreqnum);
            debug_assert_ne!(minor.pending.order, 0);
            debug_assert_eq!(minor.pending.hold_time, 0);

            minor.pending.order = 0;

            let match_amount = minor.pending.amount;
            let match_rate = minor.pending.rate;
            debug_assert!(match_amount > 0);
            debug_assert!(match_rate > 0.0);

            update_open_amount(&mut major, match_amount);
            update_open_amount(&mut minor, match_amount);

            major.best.other_seqnum = minor.seqnum;
            major.best.amount = match_amount;
            minor.best.amount = match_amount;
            major.best.rate = match_rate;
            minor.best.rate = match_rate;

            let mut m = Xmatch::new(block_time, &major, &minor, match_amount, match_rate);
            m.xmatchnum = self.nums.alloc_xmatchnum();

            info!(
                xmatchnum = m.xmatchnum,
                buyer = m.xbuy.xreqnum,
                seller = m.xsell.xreqnum,
                amount = match_amount,
                rate = match_rate,
                "new exchange match"
            );

            if m.xsell.disposition == XreqDisposition::MatchedPart
                && !m.xsell.foreign_address.is_empty()
            {
                // An active foreign address can carry only one match; refund
                // the seller's remainder and close it.
                debug!(
                    xreqnum = m.xsell.xreqnum,
                    remainder = m.xsell.open_amount,
                    "closing single-match foreign-address sell"
                );
                self.create_tx_outputs(
                    writer,
                    m.xsell.base_asset,
                    m.xsell.open_amount,
                    &m.xsell.destination,
                    self.config.default_domain,
                    true,
                    true,
                    0,
                    false,
                )?;
                minor.open_amount = 0;
                m.xsell.open_amount = 0;
            }

            self.mining.lock().set_mining_amount(&mut m);

            writer.xmatch_insert(&m)?;
            writer.xmatchreq_insert(&m.xbuy)?;
            writer.xmatchreq_insert(&m.xsell)?;

            save_xreq(&mut table, major);
            save_xreq(&mut table, minor);
        }

        Ok(())
    }

    /// Epoch gate between the chain and the matcher. At most once per
    /// matching epoch: waits out the in-flight round, makes its matches
    /// persistent, expires and prunes requests at the rounded epoch time,
    /// freezes `max_xreqnum`, and starts the next round.
    pub(crate) fn synchronize_matching(
        &self,
        writer: &mut StoreWriter<'_>,
        level: u64,
        block_time: u64,
        new_xreqnum: u64,
    ) -> ChainResult<()> {
        let mut matching = self.matching.lock();
        if matching.worker.is_none() {
            return Ok(());
        }

        let epoch = matching_epoch(block_time);
        if epoch == matching.last_matching_epoch {
            return Ok(());
        }
        matching.last_matching_epoch = epoch;

        debug!(level, block_time, epoch, "synchronizing exchange matching");

        if matching
            .worker
            .as_ref()
            .expect("worker checked")
            .wait_idle()
            .is_err()
        {
            return Err(ChainError::Shutdown);
        }

        self.make_matches_persistent(writer, matching.matching_block_time)?;
        self.mining.lock().update_time(matching.matching_block_time);

        matching.last_matched_block_time = matching.matching_block_time;
        matching.matching_block_time = epoch * XCX_MATCHING_SECS_PER_EPOCH;

        self.expire_xreqs(writer, matching.matching_block_time)?;
        self.prune_xreqs(writer, new_xreqnum)?;

        matching.max_xreqnum = self.nums.next_xreqnum() - 1;
        writer.parameter_insert(DB_KEY_XMATCHING, 0, &matching.max_xreqnum.to_le_bytes())?;

        matching
            .worker
            .as_ref()
            .expect("worker checked")
            .start_round(matching.matching_block_time, matching.max_xreqnum)
            .map_err(|_| ChainError::Shutdown)?;

        Ok(())
    }
}
