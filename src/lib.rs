//! Feedview - Incremental views over an append-only social message log
//!
//! Consumes a signed-message log (posts, contacts, votes, adverts) and keeps
//! a set of in-memory views current as messages arrive:
//!
//! - **Home**: followed authors' threads, bumped by new replies
//! - **Inbox**: replies and mentions addressed to the local identity
//! - **Votes / Follows**: reactions to the local identity's messages
//! - **Adverts**: short announcements, sampled at random
//! - **Profiles**: self and peer-assigned names, pictures, trust, aliases
//!
//! ## Architecture
//!
//! ```text
//! LogStore ──► processor ──► ViewState ──► Materializer queries
//!                 │             ▲
//!                 ▼             │
//!              EventHub     SyncBarrier (reads wait for in-flight messages)
//! ```
//!
//! Read and thread-subscription flags persist in sled; the views themselves
//! are rebuilt from the log on every start.

pub mod barrier;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod links;
pub mod lookup;
pub mod materializer;
pub mod message;
pub mod profiles;
pub mod query;
pub mod store;

mod processor;
mod view;

// Re-exports
pub use barrier::SyncBarrier;
pub use config::{Config, ViewConfig};
pub use error::{Result, ViewError};
pub use events::{EventKind, ViewEvent};
pub use index::{IndexRow, SortedIndex};
pub use lookup::{LookupCode, LookupEvent, PeerAddress, PeerConnector, PeerSession};
pub use materializer::Materializer;
pub use message::{Content, Message, MessageValue, Trust};
pub use profiles::{ActionItem, NameRank, Profile};
pub use query::{IndexCounts, IndexName, Keys, RangeBound, RangeOptions, ResolvedRow};
pub use store::{FlagOp, FlagStore, LogEntry, LogStore, MemoryLogStore, SledFlagStore};
