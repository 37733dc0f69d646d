//! The blockchain state machine: candidate blocks in, an authoritative
//! replicated ledger out, with the exchange matching engine settled in step
//! with block finality. Confirmation follows the witness quorum rule;
//! promotion of a block commits its serialnums, commitments, outputs and
//! exchange effects in one write transaction, and only then does the
//! published last-indelible pointer move.

pub mod amount;
pub mod arena;
pub mod block;
mod confirm;
pub mod error;
pub mod genesis;
pub mod history;
mod indexer;
pub mod ledger;
mod lifecycle;
pub mod tx;

pub use block::{Block, BlockAux, BlockHeader, ChainParams, BLOCK_TAG};
pub use error::{ChainError, ChainResult};
pub use genesis::{create_genesis_data_files, GenesisData, GENESIS_FILE_TAG};
pub use history::build_history_file;
pub use ledger::{LastIndelible, Ledger, LedgerConfig, SCHEMA_VERSION};
pub use lifecycle::{XREQ_MAX_PERSISTENT_COUNT, XREQ_MIN_NON_PERSISTENT_COUNT};
pub use tx::{Transaction, TxInput, TxKind, TxOutput, XpayWire, XreqWire};
