//! TaskWing: repository-scoped project memory, hybrid retrieval over it and
//! autonomous task execution driven by stop hooks.

pub mod agents;
pub mod answer;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod knowledge;
pub mod logging;
pub mod memory;
pub mod plan;
pub mod providers;
pub mod retrieval;
pub mod workspace;
pub mod write_core;
pub mod write_lock;
