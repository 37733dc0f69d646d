//! Persistent store gateway: serialized single-writer access to the durable
//! tables (parameters, blockchain, serialnums, commitment tree and roots,
//! stealth outputs, exchange numbers, matches and requests). Writers stage a
//! write-set under a process-wide mutex; `commit` lands the whole set
//! atomically through a wal record, so derived state and the block row that
//! produced it become visible together.

pub mod error;
pub mod keys;
pub mod records;
mod store;
mod write;

pub use error::{FatalFlag, InsertOutcome, StoreError, StoreResult};
pub use records::{CommitRootRecord, SerialnumRecord, TxOutputRecord, XcxNumsRecord};
pub use store::{RootSelect, Store, StoreRead, TableId};
pub use write::StoreWriter;
