//! External stores the materializer reads from and writes to
//!
//! - [`LogStore`]: the append-only message log (keyed lookups, live tail with
//!   a caught-up marker, author-scoped ranges)
//! - [`FlagStore`]: small key/value namespaces for read and subscription flags

pub mod flags;
pub mod log;

pub use flags::{FlagOp, FlagStore, SledFlagStore};
pub use log::{LogEntry, LogStore, MemoryLogStore};
