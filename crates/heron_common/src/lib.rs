//! Shared leaf crate for HeronDB: typed identifiers, the error taxonomy,
//! configuration structs, and the cooperative shutdown signal used by
//! background tasks.

pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

pub use config::{BalancerConfig, BandwidthConfig, MigrationConfig, TabletsConfig};
pub use error::{ErrorKind, HeronError, HeronResult, TabletError};
pub use shutdown::ShutdownSignal;
pub use types::{Epoch, NodeId, ShardId, TableId, TabletId, Token};
