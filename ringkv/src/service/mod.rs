pub mod admin;
pub mod context;
pub mod system;

pub use context::{
    spawn_stats_ticker, FailureDetector, Gossiper, LocalStore, NoopStats, ServerContext, Snitch,
    StatsSink,
};
