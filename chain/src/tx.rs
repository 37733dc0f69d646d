use exchange::{Address, Oid, Xreq, XreqKind};
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ChainResult};

/// Transaction kinds carried in block bodies. `Block` objects themselves are
/// not transactions and never appear here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Mint,
    TxPay,
    Move,
    XcxSimpleBuy,
    XcxSimpleSell,
    XcxMiningBuy,
    XcxMiningSell,
    XcxNakedBuy,
    XcxNakedSell,
    XcxMiningTrade,
    XcxPay,
}

impl TxKind {
    pub fn is_xreq(self) -> bool {
        self.xreq_kind().is_some()
    }

    pub fn xreq_kind(self) -> Option<XreqKind> {
        match self {
            TxKind::XcxSimpleBuy => Some(XreqKind::SimpleBuy),
            TxKind::XcxSimpleSell => Some(XreqKind::SimpleSell),
            TxKind::XcxMiningBuy => Some(XreqKind::MiningBuy),
            TxKind::XcxMiningSell => Some(XreqKind::MiningSell),
            TxKind::XcxNakedBuy => Some(XreqKind::NakedBuy),
            TxKind::XcxNakedSell => Some(XreqKind::NakedSell),
            TxKind::XcxMiningTrade => Some(XreqKind::MiningTrade),
            _ => None,
        }
    }

    pub fn is_xpay(self) -> bool {
        self == TxKind::XcxPay
    }

    /// Crosschain sell requests carry a foreign address whose uniqueness is
    /// enforced through a synthesized serialnum.
    pub fn is_crosschain_sell(self) -> bool {
        matches!(self, TxKind::XcxSimpleSell | TxKind::XcxMiningSell)
    }

    pub fn as_objtype(self) -> u32 {
        match self {
            TxKind::Mint => 1,
            TxKind::TxPay => 2,
            TxKind::Move => 3,
            TxKind::XcxSimpleBuy => 16,
            TxKind::XcxSimpleSell => 17,
            TxKind::XcxMiningBuy => 18,
            TxKind::XcxMiningSell => 19,
            TxKind::XcxNakedBuy => 20,
            TxKind::XcxNakedSell => 21,
            TxKind::XcxMiningTrade => 22,
            TxKind::XcxPay => 24,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// None for an input that proves ownership without revealing a
    /// nullifier; the indexer synthesizes one when a transaction has no
    /// serialnum-bearing input at all.
    pub serialnum: Option<[u8; 32]>,
    pub hashkey: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// None for outputs that are not address-indexed.
    pub address: Option<Address>,
    pub commitment: [u8; 32],
    pub domain: u32,
    pub asset_enc: u64,
    pub amount_enc: u32,
    pub asset_mask: u64,
    pub amount_mask: u32,
}

/// Wire payload of an exchange request transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XreqWire {
    pub expire_time: u64,
    pub base_asset: u64,
    pub quote_asset: u64,
    pub foreign_asset: u64,
    pub foreign_address: String,
    pub destination: Address,
    pub min_amount: u128,
    pub max_amount: u128,
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
}

impl XreqWire {
    pub fn to_xreq(&self, kind: XreqKind) -> Xreq {
        let mut x = Xreq::new(kind);
        x.expire_time = self.expire_time;
        x.base_asset = self.base_asset;
        x.quote_asset = self.quote_asset;
        x.foreign_asset = self.foreign_asset;
        x.foreign_address = self.foreign_address.clone();
        x.destination = self.destination;
        x.min_amount = self.min_amount;
        x.max_amount = self.max_amount;
        x.net_rate_required = self.net_rate_required;
        x.wait_discount = self.wait_discount;
        x.base_costs = self.base_costs;
        x.quote_costs = self.quote_costs;
        x.pledge = self.pledge;
        x.hold_time = self.hold_time;
        x.hold_time_required = self.hold_time_required;
        x.min_wait_time = self.min_wait_time;
        x.consideration_required = self.consideration_required;
        x.consideration_offered = self.consideration_offered;
        x.accept_time_required = self.accept_time_required;
        x.accept_time_offered = self.accept_time_offered;
        x.payment_time = self.payment_time;
        x.confirmations = self.confirmations;
        x.auto_accept = self.auto_accept;
        x
    }
}

/// Wire payload of a payment advice settling a match against a foreign
/// blockchain payment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XpayWire {
    pub xmatchnum: u64,
    pub foreign_amount: f64,
    /// Foreign-chain payment identifier; its hash becomes the synthesized
    /// serialnum so no other transaction can claim the same payment.
    pub payment_id: Vec<u8>,
}

impl XpayWire {
    pub fn payment_id_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"obol.xpay.payment-id");
        hasher.update(&self.payment_id);
        *hasher.finalize().as_bytes()
    }
}

/// A parsed transaction. The wire form is the bincode encoding; the object
/// id is the hash of the objtype tag and the wire bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxKind,
    /// Block level of the commitment root the zk-proof was built against.
    pub param_level: u64,
    /// Compressed witness-donation amount.
    pub donation_fp: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub xreq: Option<XreqWire>,
    pub xpay: Option<XpayWire>,
}

impl Transaction {
    pub fn to_wire(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> ChainResult<Self> {
        bincode::deserialize(bytes).map_err(|_| ChainError::InvalidTx("unparseable wire form"))
    }

    pub fn objid(wire: &[u8], kind: TxKind) -> Oid {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"obol.tx");
        hasher.update(&kind.as_objtype().to_le_bytes());
        hasher.update(wire);
        *hasher.finalize().as_bytes()
    }

    /// Typed-payload extraction: request kinds must carry a request payload
    /// and payment kinds a payment payload. A missing payload on a kind that
    /// requires one is a malformed transaction.
    pub fn check_payload(&self) -> ChainResult<()> {
        if self.kind.is_xreq() && self.xreq.is_none() {
            return Err(ChainError::InvalidTx("request transaction without request payload"));
        }
        if self.kind.is_xpay() && self.xpay.is_none() {
            return Err(ChainError::InvalidTx("payment advice without payment payload"));
        }
        Ok(())
    }

    pub fn has_serialnum_input(&self) -> bool {
        self.inputs.iter().any(|input| input.serialnum.is_some())
    }
}

/// Synthesizes a serialnum for transactions whose inputs present none, so
/// every transaction leaves exactly one spend mark:
/// - a payment advice spends its foreign payment id, with the hashkey bound
///   to the body so wallets can tell which transaction claimed it;
/// - a crosschain sell in validation spends its foreign address, keeping
///   active foreign addresses unique;
/// - anything else (mints included, always) spends its own body hash, so a
///   duplicate object cannot enter the chain twice.
pub fn check_create_pseudo_serialnum(tx: &mut Transaction, wire: &[u8], persistent: bool) {
    let xchain_sell = !persistent && tx.kind.is_crosschain_sell() && tx.xreq.is_some();
    let need_pseudo = xchain_sell || tx.kind == TxKind::Mint;

    if !need_pseudo && tx.has_serialnum_input() {
        return;
    }

    let objtype = tx.kind.as_objtype();

    let (serialnum, hashkey) = if xchain_sell {
        let xreq = tx.xreq.as_ref().expect("crosschain sell carries a request");
        debug_assert!(!xreq.foreign_address.is_empty());
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"obol.foreign-address");
        hasher.update(xreq.foreign_address.as_bytes());
        (*hasher.finalize().as_bytes(), [0u8; 32])
    } else if let (TxKind::XcxPay, Some(xpay)) = (tx.kind, tx.xpay.as_ref()) {
        let serialnum = xpay.payment_id_hash();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"obol.objhash");
        hasher.update(&objtype.to_le_bytes());
        hasher.update(wire);
        (serialnum, *hasher.finalize().as_bytes())
    } else {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"obol.objhash");
        hasher.update(&objtype.to_le_bytes());
        hasher.update(wire);
        (*hasher.finalize().as_bytes(), [0u8; 32])
    };

    if tx.kind == TxKind::Mint {
        // A mint's placeholder input is replaced, not extended.
        tx.inputs.pop();
    }

    tx.inputs.push(TxInput {
        serialnum: Some(serialnum),
        hashkey,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mint_tx(marker: u8) -> Transaction {
        Transaction {
            kind: TxKind::Mint,
            param_level: 0,
            donation_fp: 0,
            inputs: vec![TxInput {
                serialnum: None,
                hashkey: [0u8; 32],
            }],
            outputs: vec![TxOutput {
                address: Some([marker; 32]),
                commitment: [marker; 32],
                domain: 1,
                asset_enc: 0,
                amount_enc: 0,
                asset_mask: 0,
                amount_mask: 0,
            }],
            xreq: None,
            xpay: None,
        }
    }

    #[test]
    fn identical_mint_bodies_synthesize_identical_serialnums() {
        let mut a = mint_tx(1);
        let mut b = mint_tx(1);
        let wire_a = a.to_wire().unwrap();
        let wire_b = b.to_wire().unwrap();
        check_create_pseudo_serialnum(&mut a, &wire_a, true);
        check_create_pseudo_serialnum(&mut b, &wire_b, true);
        assert_eq!(a.inputs.len(), 1);
        assert_eq!(a.inputs[0].serialnum, b.inputs[0].serialnum);
    }

    #[test]
    fn different_mint_bodies_synthesize_different_serialnums() {
        let mut a = mint_tx(1);
        let mut b = mint_tx(2);
        let wire_a = a.to_wire().unwrap();
        let wire_b = b.to_wire().unwrap();
        check_create_pseudo_serialnum(&mut a, &wire_a, true);
        check_create_pseudo_serialnum(&mut b, &wire_b, true);
        assert_ne!(a.inputs[0].serialnum, b.inputs[0].serialnum);
    }

    #[test]
    fn serialnum_bearing_tx_is_left_alone() {
        let mut tx = mint_tx(1);
        tx.kind = TxKind::TxPay;
        tx.inputs[0].serialnum = Some([5u8; 32]);
        let wire = tx.to_wire().unwrap();
        let before = tx.inputs.clone();
        check_create_pseudo_serialnum(&mut tx, &wire, true);
        assert_eq!(tx.inputs, before);
    }

    #[test]
    fn xpay_serialnum_is_the_payment_id_hash() {
        let mut tx = mint_tx(1);
        tx.kind = TxKind::XcxPay;
        tx.inputs[0].serialnum = None;
        tx.xpay = Some(XpayWire {
            xmatchnum: 3,
            foreign_amount: 1.5,
            payment_id: b"txid:abc".to_vec(),
        });
        let wire = tx.to_wire().unwrap();
        check_create_pseudo_serialnum(&mut tx, &wire, true);
        let input = tx.inputs.last().unwrap();
        assert_eq!(input.serialnum.unwrap(), tx.xpay.as_ref().unwrap().payment_id_hash());
        assert_ne!(input.hashkey, [0u8; 32]);
    }

    #[test]
    fn payload_checks_reject_mismatches() {
        let mut tx = mint_tx(1);
        tx.kind = TxKind::XcxSimpleBuy;
        assert!(tx.check_payload().is_err());
        tx.kind = TxKind::XcxPay;
        assert!(tx.check_payload().is_err());
        tx.kind = TxKind::Mint;
        assert!(tx.check_payload().is_ok());
    }
}
