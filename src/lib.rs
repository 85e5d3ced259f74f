//! SHA-256d Miner
//!
//! Block header search engine for Bitcoin-style proof of work:
//! - Midstate-resumed double SHA-256 with 16-bit early rejection
//! - Compact-bits and pool-difficulty target arithmetic
//! - Coinbase, Merkle root and header assembly from pool job notifications
//! - A software engine and a register-driven accelerator engine sharing one
//!   nonce space
//! - A coordinator that swaps jobs under the engines without tearing

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod events;
pub mod job;
pub mod stats;
pub mod target;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use coordinator::{CoordinatorState, JobCoordinator, MiningControl};
pub use error::{Error, Result};
pub use job::{JobBuilder, JobNotification, MiningJob, SessionContext};
pub use stats::{MiningStats, StatsSnapshot};
pub use target::Target;
pub use types::*;

/// Application information
pub const APP_NAME: &str = "sha256d-miner";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
