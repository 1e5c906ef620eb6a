//! Resilient sync engine: retry/backoff, rate limiting, pagination, media
//! deduplication, incremental resumption, and the two pipeline drivers.

pub mod aggregate;
pub mod channel;
pub mod clients;
pub mod cms;
pub mod config;
pub mod context;
pub mod dedup;
pub mod event_log;
pub mod fetch;
pub mod incremental;
pub mod lock;
pub mod media;
pub mod pagination;
pub mod rate_limit;
pub mod resolve;
pub mod result;
pub mod retry;
pub(crate) mod store;

pub use aggregate::{classify, exit_code, SubSyncOutcome};
pub use context::RunContext;
pub use fetch::ResilientFetcher;
pub use retry::RetryPolicy;
