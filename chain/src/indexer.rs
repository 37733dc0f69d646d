use exchange::{Address, Xmatch, XmatchStatus};
use state_store::{RootSelect, StoreRead, StoreWriter, TxOutputRecord};
use tracing::{debug, trace, warn};

use crate::amount::{amount_decode, amount_encode};
use crate::error::ChainResult;
use crate::ledger::Ledger;
use crate::tx::{check_create_pseudo_serialnum, Transaction, TxKind, XpayWire};

/// Amounts of the two per-block mint outputs (public supply and foundation).
const MINT_PUBLIC_AMOUNT: u128 = 40_000_000_000_000_000_000_000_000_000_000;
const MINT_FOUNDATION_AMOUNT: u128 = 9_000_000_000_000_000_000_000_000_000_000;

fn derive_commit_iv(root: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"obol.commit-iv");
    hasher.update(root);
    *hasher.finalize().as_bytes()
}

fn compute_commitment(
    commit_iv: &[u8; 32],
    dest: &Address,
    paynum: u32,
    domain: u32,
    asset: u64,
    amount_fp: u32,
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"obol.commitment");
    hasher.update(commit_iv);
    hasher.update(dest);
    hasher.update(&paynum.to_le_bytes());
    hasher.update(&domain.to_le_bytes());
    hasher.update(&asset.to_le_bytes());
    hasher.update(&amount_fp.to_le_bytes());
    *hasher.finalize().as_bytes()
}

fn compute_address(dest: &Address, blockchain_id: u64, paynum: u32) -> Address {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"obol.address");
    hasher.update(dest);
    hasher.update(&blockchain_id.to_le_bytes());
    hasher.update(&paynum.to_le_bytes());
    *hasher.finalize().as_bytes()
}

impl Ledger {
    /// Indexes every transaction of a newly-indelible block, in block-body
    /// order, and returns the block's accumulated donations. Any structural
    /// failure here is fatal: the block was accepted as valid, so its state
    /// must apply cleanly.
    pub(crate) fn index_txs(
        &self,
        writer: &mut StoreWriter<'_>,
        level: u64,
        block_time: u64,
        txs: &[Transaction],
    ) -> ChainResult<u128> {
        let mut total_donations = 0u128;

        for tx in txs {
            if self.shutdown.is_set() {
                return Err(crate::error::ChainError::Shutdown);
            }

            let root_row = writer.commit_roots_select_level(tx.param_level, RootSelect::Exact)?;
            let Some((_, _root_record)) = root_row else {
                return Err(self.fatal_error("transaction references unknown commitment root"));
            };

            if tx.check_payload().is_err() {
                return Err(self.fatal_error("malformed transaction payload in indelible block"));
            }

            let wire = tx.to_wire()?;
            let mut tx = tx.clone();
            check_create_pseudo_serialnum(&mut tx, &wire, true);

            if let Some(xreq_kind) = tx.kind.xreq_kind() {
                let payload = tx.xreq.as_ref().expect("payload checked");
                let mut xreq = payload.to_xreq(xreq_kind);
                xreq.objid = Transaction::objid(&wire, tx.kind);
                self.add_xreq(writer, block_time, xreq)
                    .map_err(|_| self.fatal_error("failed to add exchange request"))?;
            }

            let tx_commitnum = self.tree.lock().next_commitnum();

            let mut have_serialnum = false;
            for input in &tx.inputs {
                let Some(serialnum) = input.serialnum else {
                    continue;
                };
                have_serialnum = true;
                match writer.serialnum_insert(&serialnum, &input.hashkey, tx_commitnum)? {
                    state_store::InsertOutcome::Inserted => {}
                    state_store::InsertOutcome::Duplicate => {
                        return Err(self.fatal_error("duplicate serialnum in indelible block"));
                    }
                }
            }
            if !have_serialnum {
                return Err(self.fatal_error("transaction presents no serialnum"));
            }

            for output in &tx.outputs {
                let commitnum = self.append_commitment(writer, &output.commitment)?;

                let mut domain = output.domain;
                if domain == 0 {
                    domain = self.config.default_domain;
                }
                let no_encrypt = output.asset_mask == 0 && output.amount_mask == 0;
                let domain = (domain << 1) | no_encrypt as u32;

                if let Some(address) = output.address {
                    let record = TxOutputRecord {
                        domain,
                        asset_enc: output.asset_enc,
                        amount_enc: output.amount_enc,
                        param_level: tx.param_level,
                        commitnum,
                    };
                    // An output-index failure is tolerable; the commitment
                    // itself is already in the tree.
                    if let Err(err) = writer.tx_output_insert(&address, &record) {
                        warn!(%err, commitnum, "tx output index insert failed");
                    }
                }
            }

            if tx.kind == TxKind::Mint {
                self.index_mint_outputs(writer, level)?;
            }

            let mut donation = 0u128;
            if tx.kind.is_xpay() {
                let xpay = tx.xpay.as_ref().expect("payload checked");
                self.process_xpayment(writer, block_time, xpay, &mut donation)?;
            } else if tx.kind != TxKind::Mint {
                donation = amount_decode(tx.donation_fp);
            }

            total_donations += donation;
        }

        Ok(total_donations)
    }

    /// Mint transactions additionally feed the public-mint and foundation
    /// destinations, one output each per block, when destinations are
    /// configured.
    fn index_mint_outputs(&self, writer: &mut StoreWriter<'_>, level: u64) -> ChainResult<()> {
        let dests = &self.config.mint_destinations;
        if dests.is_empty() {
            return Ok(());
        }
        debug_assert_eq!(dests.len() % 2, 0);
        let half = dests.len() / 2;

        for i in 0..2usize {
            let index = (level as usize % half) + i * half;
            let dest = dests[index];
            let (amount, domain) = if i == 0 {
                (MINT_PUBLIC_AMOUNT, self.config.foundation_domain)
            } else {
                (MINT_FOUNDATION_AMOUNT, self.config.default_domain)
            };
            self.create_tx_outputs(writer, 0, amount, &dest, domain, true, true, 0, true)?;
        }
        Ok(())
    }

    /// Splits `total` into compressed-amount chunks and creates one indexed
    /// output per chunk at the current last-indelible parameter level.
    /// Returns the unrepresentable residual, which callers fold into the
    /// counterparty's amount. All calls happen in block-deterministic order.
    pub(crate) fn create_tx_outputs(
        &self,
        writer: &mut StoreWriter<'_>,
        asset: u64,
        total: u128,
        dest: &Address,
        domain: u32,
        bindex: bool,
        no_encrypt: bool,
        paynum: u32,
        one_output: bool,
    ) -> ChainResult<u128> {
        debug_assert_ne!(dest, &[0u8; 32], "destination must be set");

        let (outvalmin, outvalmax) = if asset == 0 {
            (self.config.outvalmin, self.config.outvalmax)
        } else {
            (0, crate::amount::AMOUNT_MAX_EXPONENT)
        };

        let mut total = total;
        while total > 0 && !self.shutdown.is_set() {
            let amount_fp = amount_encode(total, false, outvalmin, outvalmax);
            let amount = amount_decode(amount_fp);
            if amount == 0 {
                break;
            }

            let param_level = self.last_indelible().level;
            let root_row = writer.commit_roots_select_level(param_level, RootSelect::OrLess)?;
            let Some((_, root_record)) = root_row else {
                return Err(self.fatal_error("no commitment root available for output"));
            };
            let commit_iv = derive_commit_iv(&root_record.root);

            let commitment = compute_commitment(&commit_iv, dest, paynum, domain, asset, amount_fp);
            let commitnum = self.append_commitment(writer, &commitment)?;

            trace!(
                commitnum,
                asset,
                amount,
                domain,
                "created settlement output"
            );

            if bindex {
                let address = compute_address(dest, self.genesis.blockchain_id, paynum);
                let record = TxOutputRecord {
                    domain: (domain << 1) | no_encrypt as u32,
                    asset_enc: asset,
                    amount_enc: amount_fp,
                    param_level,
                    commitnum,
                };
                if let Err(err) = writer.tx_output_insert(&address, &record) {
                    warn!(%err, commitnum, "settlement output index insert failed");
                }
            }

            total -= amount;
            if one_output {
                break;
            }
        }

        Ok(total)
    }

    /// Applies a payment advice to its match: accumulates the foreign
    /// amount, and either keeps the match open partially paid or settles it
    /// in full. A match already final is silently ignored, since the advice
    /// may simply have raced a full payment.
    pub(crate) fn process_xpayment(
        &self,
        writer: &mut StoreWriter<'_>,
        block_time: u64,
        xpay: &XpayWire,
        donation: &mut u128,
    ) -> ChainResult<()> {
        if xpay.foreign_amount <= 0.0 {
            return Err(self.fatal_error("payment advice with non-positive amount"));
        }

        let Some(mut m) = writer.xmatch_select(xpay.xmatchnum)? else {
            return Err(self.fatal_error("payment advice names unknown match"));
        };

        if !m.status.accepts_payment() {
            debug!(
                xmatchnum = m.xmatchnum,
                status = ?m.status,
                "payment advice ignored for settled match"
            );
            return Ok(());
        }

        m.amount_paid += xpay.foreign_amount;

        debug!(
            xmatchnum = m.xmatchnum,
            amount_paid = m.amount_paid,
            to_pay = m.amount_to_pay(),
            "payment advice applied"
        );

        if m.amount_to_pay() > 0.0 {
            m.status = XmatchStatus::PartPaidOpen;
            writer.xmatch_insert(&m)?;
        } else {
            m.status = XmatchStatus::Paid;
            m.final_timestamp = block_time;
            m.next_deadline = 0;
            self.settle_match(writer, &mut m, donation)?;
        }

        Ok(())
    }

    /// Final settlement of a match: split the base amount between the two
    /// sides, distribute the pledge, deduct the buyer's settlement donation,
    /// create the payout outputs and finalize any mining reward.
    pub(crate) fn settle_match(
        &self,
        writer: &mut StoreWriter<'_>,
        m: &mut Xmatch,
        donation: &mut u128,
    ) -> ChainResult<()> {
        debug!(xmatchnum = m.xmatchnum, status = ?m.status, "settling match");

        let (match_amount, mut buyer_amount, mut seller_amount) = compute_match_split(m);

        self.mining.lock().update_match_stats(m, buyer_amount);

        let mut pledge_amount = 0u128;
        let mut adj_mining_amount = 0u128;

        if m.match_pledge != 0 {
            // Pledge amounts always round down.
            pledge_amount = match_amount * m.match_pledge as u128 / 100;

            if m.amount_paid == 0.0 {
                seller_amount += pledge_amount;
            } else if m.status == XmatchStatus::Paid {
                adj_mining_amount = self.mining.lock().adjusted_mining_amount(m);
                buyer_amount += pledge_amount + adj_mining_amount;
            } else {
                // Partial payment: the seller recovers pledge pro rata,
                // rounded up and capped; the buyer takes the rest.
                let mut seller_split = (seller_amount * m.match_pledge as u128 + 99) / 100;
                if seller_split > pledge_amount {
                    seller_split = pledge_amount;
                }
                seller_amount += seller_split;
                buyer_amount += pledge_amount - seller_split;
            }
        }

        // Any excess of the buyer's pledge over the match pledge reverts.
        if m.xbuy.pledge > m.match_pledge {
            let buyer_pledge = match_amount * m.xbuy.pledge as u128 / 100;
            debug_assert!(buyer_pledge >= pledge_amount);
            buyer_amount += buyer_pledge - pledge_amount;
        }

        if m.status == XmatchStatus::Paid {
            *donation = self.config.donation_per_xcx_pay;
        }
        if buyer_amount <= *donation {
            *donation = buyer_amount;
            buyer_amount = 0;
        } else {
            buyer_amount -= *donation;
        }

        debug!(
            xmatchnum = m.xmatchnum,
            match_amount,
            buyer_amount,
            seller_amount,
            mining = adj_mining_amount,
            donation = *donation,
            "match split computed"
        );

        let buyer_residual = self.create_tx_outputs(
            writer,
            m.xbuy.base_asset,
            buyer_amount,
            &m.xbuy.destination,
            self.config.default_domain,
            true,
            true,
            0,
            false,
        )?;

        // Any buyer residual rolls to the seller first.
        seller_amount += buyer_residual;

        let seller_residual = self.create_tx_outputs(
            writer,
            m.xsell.base_asset,
            seller_amount,
            &m.xsell.destination,
            self.config.default_domain,
            true,
            true,
            0,
            false,
        )?;

        // The residual never reached anyone; back it out of the mined total.
        if seller_residual > adj_mining_amount {
            adj_mining_amount = 0;
        } else {
            adj_mining_amount -= seller_residual;
        }

        if m.status == XmatchStatus::Paid {
            self.mining.lock().finalize_mining_amount(m, adj_mining_amount);
        }

        writer.xmatch_insert(m)?;
        Ok(())
    }
}

/// Splits the match base amount between buyer and seller. Fully paid gives
/// the buyer everything; unpaid gives the seller everything. A partial
/// payment recomputes the effective base amount so the seller's net rate is
/// unchanged; the floor divisions can lose a dust amount of base asset.
fn compute_match_split(m: &Xmatch) -> (u128, u128, u128) {
    let match_amount = m.base_amount;

    if m.status == XmatchStatus::Paid {
        return (match_amount, match_amount, 0);
    }
    if m.amount_paid <= 0.0 {
        return (match_amount, 0, match_amount);
    }

    // seller net rate = (quote - quote_costs) / (base + base_costs); solve
    // for the base amount that preserves it when quote = amount_paid.
    let base = match_amount as f64;
    let numerator = (m.amount_paid - m.xsell.quote_costs) * (base + m.xsell.base_costs);
    let denominator = base * m.rate - m.xsell.quote_costs;
    let mut net_base = numerator / denominator - m.xsell.base_costs;
    if !net_base.is_finite() || net_base <= 0.0 {
        net_base = 0.0;
    }

    let mut buyer_amount = net_base as u128;
    if buyer_amount > match_amount {
        buyer_amount = match_amount;
    }
    let seller_amount = match_amount - buyer_amount;

    (match_amount, buyer_amount, seller_amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchange::{Xreq, XreqKind};

    fn match_with(status: XmatchStatus, base_amount: u128, rate: f64, amount_paid: f64) -> Xmatch {
        let mut buyer = Xreq::new(XreqKind::SimpleBuy);
        buyer.seqnum = 1;
        buyer.xreqnum = 1;
        buyer.max_amount = base_amount;
        let mut seller = Xreq::new(XreqKind::SimpleSell);
        seller.seqnum = 2;
        seller.xreqnum = 2;
        seller.max_amount = base_amount;
        let mut m = Xmatch::new(0, &buyer, &seller, base_amount, rate);
        m.status = status;
        m.amount_paid = amount_paid;
        m
    }

    #[test]
    fn paid_match_splits_to_buyer() {
        let m = match_with(XmatchStatus::Paid, 1000, 0.5, 500.0);
        assert_eq!(compute_match_split(&m), (1000, 1000, 0));
    }

    #[test]
    fn unpaid_match_splits_to_seller() {
        let m = match_with(XmatchStatus::UnpaidExpired, 1000, 0.5, 0.0);
        assert_eq!(compute_match_split(&m), (1000, 0, 1000));
    }

    #[test]
    fn partial_payment_preserves_seller_net_rate() {
        // No costs: the split is simply proportional to the paid fraction.
        let m = match_with(XmatchStatus::PartPaidExpired, 1000, 0.5, 250.0);
        let (total, buyer, seller) = compute_match_split(&m);
        assert_eq!(total, 1000);
        assert_eq!(buyer, 500);
        assert_eq!(seller, 500);
    }

    #[test]
    fn partial_payment_with_costs_floors_the_buyer_share() {
        let mut m = match_with(XmatchStatus::PartPaidExpired, 1000, 0.5, 250.0);
        m.xsell.base_costs = 3.0;
        m.xsell.quote_costs = 1.0;
        let (total, buyer, seller) = compute_match_split(&m);
        assert_eq!(total, buyer + seller);
        // With seller costs the buyer share shrinks relative to the
        // cost-free split.
        assert!(buyer <= 500);
    }

    #[test]
    fn commitment_and_address_derivations_are_stable() {
        let iv = derive_commit_iv(&[1u8; 32]);
        let c1 = compute_commitment(&iv, &[2u8; 32], 0, 1, 0, 42);
        let c2 = compute_commitment(&iv, &[2u8; 32], 0, 1, 0, 42);
        assert_eq!(c1, c2);
        let c3 = compute_commitment(&iv, &[2u8; 32], 0, 1, 0, 43);
        assert_ne!(c1, c3);
        let a1 = compute_address(&[2u8; 32], 7, 0);
        let a2 = compute_address(&[2u8; 32], 8, 0);
        assert_ne!(a1, a2);
    }
}
