//! Tie-break totality: the best-match comparison never leaves a request
//! stuck between two candidates it considers both worse than each other.

use exchange::{compare_rates, Amount, Xreq, XreqKind};
use proptest::prelude::*;

#[derive(Clone, Debug)]
struct Candidate {
    seqnum: u64,
    xreqnum: u64,
    matching_amount: Amount,
    net_rate: f64,
    amount: Amount,
}

fn candidate_strategy() -> impl Strategy<Value = Candidate> {
    (
        1u64..100,
        0u64..20,
        1u128..1000,
        prop::sample::select(vec![0.001f64, 0.002, 0.003]),
        1u128..1000,
    )
        .prop_map(|(seqnum, xreqnum, matching_amount, net_rate, amount)| Candidate {
            seqnum,
            xreqnum,
            matching_amount,
            net_rate,
            amount,
        })
}

fn other_req(c: &Candidate, kind: XreqKind) -> Xreq {
    let mut x = Xreq::new(kind);
    x.seqnum = c.seqnum;
    x.xreqnum = c.xreqnum;
    x.matching_amount = c.matching_amount;
    x
}

/// `me` with its best already set from candidate `b`.
fn with_best(kind: XreqKind, b: &Candidate, b_net_rate_for_me: f64) -> Xreq {
    let mut me = Xreq::new(kind);
    me.seqnum = 1000;
    me.xreqnum = 1000;
    me.best.amount = b.amount;
    me.best.rate = b_net_rate_for_me;
    me.best.net_rate = b_net_rate_for_me;
    me.best.other_seqnum = b.seqnum;
    me.best.other_xreqnum = b.xreqnum;
    me.best.other_matching_amount = b.matching_amount;
    me.best.other_net_rate = b.net_rate;
    me
}

proptest! {
    /// With the best slot holding A, candidate B either wins or loses; and
    /// whenever both orderings are evaluated, at least one direction holds,
    /// so there is always a best among any two candidates.
    #[test]
    fn comparison_is_total(
        a in candidate_strategy(),
        b in candidate_strategy(),
        my_rate_a in prop::sample::select(vec![0.001f64, 0.002, 0.003]),
        my_rate_b in prop::sample::select(vec![0.001f64, 0.002, 0.003]),
        buyer in any::<bool>(),
    ) {
        let kind = if buyer { XreqKind::SimpleBuy } else { XreqKind::SimpleSell };
        let other_kind = if buyer { XreqKind::SimpleSell } else { XreqKind::SimpleBuy };

        let me_with_a = with_best(kind, &a, my_rate_a);
        let me_with_b = with_best(kind, &b, my_rate_b);

        let b_beats_a = compare_rates(&me_with_a, my_rate_b, &other_req(&b, other_kind), b.net_rate, b.amount);
        let a_beats_b = compare_rates(&me_with_b, my_rate_a, &other_req(&a, other_kind), a.net_rate, a.amount);

        // Identical candidates compare as not-better in both directions,
        // which keeps the incumbent; that still picks a winner.
        let identical = a.seqnum == b.seqnum
            && a.xreqnum == b.xreqnum
            && a.matching_amount == b.matching_amount
            && a.amount == b.amount
            && a.net_rate == b.net_rate
            && my_rate_a == my_rate_b;

        prop_assert!(b_beats_a || a_beats_b || identical);
    }

    /// An empty best slot accepts any candidate.
    #[test]
    fn empty_best_always_accepts(a in candidate_strategy(), buyer in any::<bool>()) {
        let kind = if buyer { XreqKind::SimpleBuy } else { XreqKind::SimpleSell };
        let other_kind = if buyer { XreqKind::SimpleSell } else { XreqKind::SimpleBuy };
        let me = Xreq::new(kind);
        prop_assert!(compare_rates(&me, 0.5, &other_req(&a, other_kind), a.net_rate, a.amount));
    }
}
