use thiserror::Error;

/// Failures reported by a storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("no multi-batch open")]
    NoBatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A block computation that cannot fail on a well-formed block.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("directory block {height} has {found} entries, expected at least 3")]
    MissingFixedEntries { height: u32, found: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid public key hex for server {0} (expected 32 bytes)")]
    BadPubkey(String),

    #[error("invalid key hex (expected 32 bytes)")]
    BadSecret,

    #[error("invalid address hex: {0}")]
    BadAddress(String),

    #[error("genesis has no federated servers")]
    NoFederatedServers,

    #[error("node key not found in federated or audit server set")]
    UnknownNode,

    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Conditions after which the node must stop rather than keep building on
/// possibly corrupted chain state.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("storage failure at height {height}: {source}")]
    Storage {
        height: u32,
        #[source]
        source: StorageError,
    },

    #[error("directory block {height} ({key_mr}) missing from storage after save")]
    MissingAfterSave { height: u32, key_mr: String },

    #[error("block integrity violated at height {height}: {source}")]
    Integrity {
        height: u32,
        #[source]
        source: BlockError,
    },

    #[error("stored chain is inconsistent: {0}")]
    Corrupt(String),

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// Failure to bring a node up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl FatalError {
    pub(crate) fn storage(height: u32) -> impl FnOnce(StorageError) -> FatalError {
        move |source| FatalError::Storage { height, source }
    }
}
