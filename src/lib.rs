// Leader/follower consensus core for a federated directory-block chain.
// Time and storage are injected; the core never reads the wall clock or
// touches the filesystem on its own.

pub mod clock;
pub mod consensus;
pub mod ledger;
pub mod replay;
pub mod validation;

pub use consensus::config::GenesisConfig;
pub use consensus::error::{FatalError, StartError};
pub use consensus::state::{ConsensusState, QueueHandles};
