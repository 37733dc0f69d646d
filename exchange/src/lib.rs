//! Exchange data model and matching engine: open-request bookkeeping, the
//! per-epoch mutual-best-match search, and the mining reward pool. Everything
//! here is in-memory; persistence flows through the chain crate's store
//! gateway.

pub mod error;
pub mod matcher;
pub mod mining;
pub mod nums;
pub mod requests;
pub mod shutdown;
pub mod types;
pub mod worker;
pub mod xmatch;

pub use error::{ExchangeError, ExchangeResult};
pub use matcher::{compare_rates, compute_match_hold, match_reqs};
pub use mining::{ExchangeMining, ExchangeMiningParams, MINED_ASSET, TOTAL_TO_MINE};
pub use nums::ExchangeNums;
pub use requests::{PairKey, XreqStore, Xreqs};
pub use shutdown::ShutdownFlag;
pub use types::{
    matching_epoch, Address, Amount, Oid, RecalcTime, Xreq, XreqKind, FOREIGN_BLOCKCHAIN_BCH,
    FOREIGN_BLOCKCHAIN_BTC, XCX_MATCHING_SECS_PER_EPOCH, XREQ_WAIT_DISCOUNT_INTERVAL,
};
pub use worker::{MatchWorker, MatcherCommand};
pub use xmatch::{Xmatch, XmatchReq, XmatchStatus, XreqDisposition};
