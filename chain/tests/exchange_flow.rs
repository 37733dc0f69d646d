//! End-to-end exchange scenarios: request persistence, per-epoch matching,
//! hold handling, payment settlement, expiration and pruning, all driven
//! through block confirmation on a single-witness chain.

mod common;

use chain::{Transaction, TxKind, XpayWire, XreqWire};
use common::{genesis_data, open_ledger, ChainDriver};
use exchange::{XmatchStatus, XreqDisposition};
use state_store::StoreRead;

fn xreq_wire(net_rate: f64, max_amount: u128, dest_marker: u8) -> XreqWire {
    XreqWire {
        expire_time: 100_000,
        base_asset: 0,
        quote_asset: exchange::FOREIGN_BLOCKCHAIN_BCH,
        foreign_asset: 0,
        foreign_address: String::new(),
        destination: [dest_marker; 32],
        min_amount: 1,
        max_amount,
        net_rate_required: net_rate,
        wait_discount: 0.0,
        base_costs: 0.0,
        quote_costs: 0.0,
        pledge: 10,
        hold_time: 0,
        hold_time_required: 0,
        min_wait_time: 0,
        consideration_required: 0,
        consideration_offered: 0,
        accept_time_required: 300,
        accept_time_offered: 300,
        payment_time: 600,
        confirmations: 1,
        auto_accept: true,
    }
}

fn xreq_tx(kind: TxKind, wire: XreqWire) -> Transaction {
    Transaction {
        kind,
        param_level: 0,
        donation_fp: 0,
        inputs: vec![],
        outputs: vec![],
        xreq: Some(wire),
        xpay: None,
    }
}

fn xpay_tx(xmatchnum: u64, foreign_amount: f64, payment_id: &[u8]) -> Transaction {
    Transaction {
        kind: TxKind::XcxPay,
        param_level: 0,
        donation_fp: 0,
        inputs: vec![],
        outputs: vec![],
        xreq: None,
        xpay: Some(XpayWire {
            xmatchnum,
            foreign_amount,
            payment_id: payment_id.to_vec(),
        }),
    }
}

#[test]
fn requests_match_at_the_epoch_boundary_and_settle_on_payment() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis_data(1, 1, 0);
    let ledger = open_ledger(dir.path(), &genesis);
    let mut driver = ChainDriver::from_genesis(&genesis);

    // Block 1 persists a crossing buy/sell pair.
    driver.push(
        &ledger,
        0,
        10,
        vec![
            xreq_tx(TxKind::XcxSimpleBuy, xreq_wire(0.002, 100, 7)),
            xreq_tx(TxKind::XcxSimpleSell, xreq_wire(0.001, 100, 8)),
        ],
    );
    assert!(ledger.store().xmatch_select(1).unwrap().is_none());

    // Block 2 opens the next epoch: the matching round over both requests
    // starts. Block 3 opens the one after: its result becomes persistent.
    driver.push(&ledger, 0, 70, vec![]);
    driver.push(&ledger, 0, 130, vec![]);

    let m = ledger.store().xmatch_select(1).unwrap().expect("match recorded");
    assert_eq!(m.xmatchnum, 1);
    assert_eq!(m.xbuy.xreqnum, 1);
    assert_eq!(m.xsell.xreqnum, 2);
    assert_eq!(m.base_amount, 100);
    assert!(m.rate > 0.001 && m.rate < 0.002);
    assert_eq!(m.status, XmatchStatus::Accepted);
    assert_eq!(m.match_timestamp, 60);
    assert_eq!(m.next_deadline, 660);

    // Both requests filled completely.
    for xreqnum in [1u64, 2] {
        let req = ledger.store().xmatchreq_select(xreqnum).unwrap().unwrap();
        assert_eq!(req.open_amount, 0);
        assert_eq!(req.disposition, XreqDisposition::MatchedAll);
    }

    // Full payment advice settles the match to the buyer.
    driver.push(&ledger, 0, 190, vec![xpay_tx(1, 0.2, b"pay-1")]);
    let m = ledger.store().xmatch_select(1).unwrap().unwrap();
    assert_eq!(m.status, XmatchStatus::Paid);
    assert_eq!(m.final_timestamp, 190);
    assert_eq!(m.next_deadline, 0);
    assert!(m.amount_paid >= m.quote_amount());

    // A further advice for the settled match is ignored, not an error.
    driver.push(&ledger, 0, 200, vec![xpay_tx(1, 0.1, b"pay-2")]);
    let m = ledger.store().xmatch_select(1).unwrap().unwrap();
    assert_eq!(m.status, XmatchStatus::Paid);

    ledger.shutdown();
}

#[test]
fn partial_payment_keeps_the_match_open_then_expires() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis_data(1, 1, 0);
    let ledger = open_ledger(dir.path(), &genesis);
    let mut driver = ChainDriver::from_genesis(&genesis);

    driver.push(
        &ledger,
        0,
        10,
        vec![
            xreq_tx(TxKind::XcxSimpleBuy, xreq_wire(0.002, 100, 7)),
            xreq_tx(TxKind::XcxSimpleSell, xreq_wire(0.001, 100, 8)),
        ],
    );
    driver.push(&ledger, 0, 70, vec![]);
    driver.push(&ledger, 0, 130, vec![]);

    // Pay a fraction of the quote.
    driver.push(&ledger, 0, 190, vec![xpay_tx(1, 0.05, b"pay-part")]);
    let m = ledger.store().xmatch_select(1).unwrap().unwrap();
    assert_eq!(m.status, XmatchStatus::PartPaidOpen);
    assert_eq!(m.amount_paid, 0.05);
    assert_eq!(m.next_deadline, 660);

    // Past the payment deadline the match expires partially paid.
    driver.push(&ledger, 0, 700, vec![]);
    let m = ledger.store().xmatch_select(1).unwrap().unwrap();
    assert_eq!(m.status, XmatchStatus::PartPaidExpired);
    assert_eq!(m.final_timestamp, 700);
    assert_eq!(m.next_deadline, 0);

    ledger.shutdown();
}

#[test]
fn hold_defers_the_match_until_the_hold_elapses() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis_data(1, 1, 0);
    let ledger = open_ledger(dir.path(), &genesis);
    let mut driver = ChainDriver::from_genesis(&genesis);

    let mut buy = xreq_wire(0.002, 10, 7);
    buy.hold_time_required = 3600;
    let mut sell = xreq_wire(0.001, 10, 8);
    sell.hold_time = 3600;

    driver.push(
        &ledger,
        0,
        10,
        vec![
            xreq_tx(TxKind::XcxSimpleBuy, buy),
            xreq_tx(TxKind::XcxSimpleSell, sell),
        ],
    );

    // Round over the pair runs, but the hold keeps the match pending.
    driver.push(&ledger, 0, 70, vec![]);
    driver.push(&ledger, 0, 130, vec![]);
    assert!(ledger.store().xmatch_select(1).unwrap().is_none());

    // The requests stay open while on hold.
    for xreqnum in [1u64, 2] {
        let req = ledger.store().xmatchreq_select(xreqnum).unwrap().unwrap();
        assert_eq!(req.open_amount, 10);
    }

    // Once block time passes the hold, the next round matches for real and
    // the following epoch consumes it.
    driver.push(&ledger, 0, 3720, vec![]);
    driver.push(&ledger, 0, 3780, vec![]);

    let m = ledger.store().xmatch_select(1).unwrap().expect("held match lands");
    assert_eq!(m.base_amount, 10);
    for xreqnum in [1u64, 2] {
        let req = ledger.store().xmatchreq_select(xreqnum).unwrap().unwrap();
        assert_eq!(req.open_amount, 0);
        assert_eq!(req.disposition, XreqDisposition::MatchedAll);
    }

    ledger.shutdown();
}

#[test]
fn mining_trade_splits_and_self_matches() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis_data(1, 1, 0);
    let ledger = open_ledger(dir.path(), &genesis);
    let mut driver = ChainDriver::from_genesis(&genesis);

    let mut trade = xreq_wire(0.001, 50, 9);
    trade.min_amount = 50;

    driver.push(&ledger, 0, 10, vec![xreq_tx(TxKind::XcxMiningTrade, trade)]);

    // The split persisted two linked requests with consecutive xreqnums.
    let buy = ledger.store().xmatchreq_select(1).unwrap().expect("buy half");
    let sell = ledger.store().xmatchreq_select(2).unwrap().expect("sell half");
    assert!(buy.kind.is_buyer());
    assert!(sell.kind.is_seller());
    assert_eq!(buy.max_amount, 50);
    assert_eq!(sell.max_amount, 50);

    driver.push(&ledger, 0, 70, vec![]);
    driver.push(&ledger, 0, 130, vec![]);

    let m = ledger.store().xmatch_select(1).unwrap().expect("pair matched");
    assert_eq!(m.xbuy.xreqnum, 1);
    assert_eq!(m.xsell.xreqnum, 2);
    assert_eq!(m.base_amount, 50);

    ledger.shutdown();
}

#[test]
fn expired_requests_are_closed_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis_data(1, 1, 0);
    let ledger = open_ledger(dir.path(), &genesis);
    let mut driver = ChainDriver::from_genesis(&genesis);

    let mut sell = xreq_wire(0.001, 100, 8);
    sell.expire_time = 100;

    driver.push(&ledger, 0, 10, vec![xreq_tx(TxKind::XcxSimpleSell, sell)]);
    let req = ledger.store().xmatchreq_select(1).unwrap().unwrap();
    assert_eq!(req.disposition, XreqDisposition::Open);

    // The next epoch's synchronization expires it at the rounded epoch time.
    driver.push(&ledger, 0, 130, vec![]);
    let req = ledger.store().xmatchreq_select(1).unwrap().unwrap();
    assert_eq!(req.disposition, XreqDisposition::ExpiredAll);

    // No open request with a reached expire time remains in the table.
    assert!(ledger.xreq_store().read().select_xreqnum(1, None).is_none());

    ledger.shutdown();
}

#[test]
fn replaying_the_same_blocks_reproduces_identical_state() {
    let build = |dir: &std::path::Path| {
        let genesis = genesis_data(1, 1, 0);
        let ledger = open_ledger(dir, &genesis);
        let mut driver = ChainDriver::from_genesis(&genesis);
        driver.push(
            &ledger,
            0,
            10,
            vec![
                xreq_tx(TxKind::XcxSimpleBuy, xreq_wire(0.002, 100, 7)),
                xreq_tx(TxKind::XcxSimpleSell, xreq_wire(0.001, 100, 8)),
            ],
        );
        driver.push(&ledger, 0, 70, vec![]);
        driver.push(&ledger, 0, 130, vec![]);
        driver.push(&ledger, 0, 190, vec![xpay_tx(1, 0.2, b"pay-d")]);
        ledger
    };

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let ledger_a = build(dir_a.path());
    let ledger_b = build(dir_b.path());

    for level in 0..=4u64 {
        assert_eq!(
            ledger_a.store().blockchain_select(level).unwrap(),
            ledger_b.store().blockchain_select(level).unwrap(),
            "blockchain rows diverge at level {level}"
        );
        assert_eq!(
            ledger_a
                .store()
                .commit_roots_select_level(level, state_store::RootSelect::Exact)
                .unwrap(),
            ledger_b
                .store()
                .commit_roots_select_level(level, state_store::RootSelect::Exact)
                .unwrap(),
            "commit roots diverge at level {level}"
        );
    }
    assert_eq!(
        ledger_a.store().xmatch_select(1).unwrap(),
        ledger_b.store().xmatch_select(1).unwrap()
    );

    ledger_a.shutdown();
    ledger_b.shutdown();
}
