//! The update log: an append-only, rotating, timestamped log of mutations,
//! with a tailing reader for replication and restore.

pub mod common;
mod entry;
mod error;
mod reader;
mod rts;
mod writer;

pub use entry::{read_entry, ReadOutcome, UlogEntry, HEADER_LEN, MAGIC, MAGIC_NOP};
pub use error::UlogError;
pub use reader::UlogTailer;
pub use rts::RtsFile;
pub use writer::{now_micros, UpdateLog};
