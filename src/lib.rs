pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod core;
pub mod oracle;
pub mod session;
pub mod store;
pub mod supervisor;

pub use aggregator::GiftAggregator;
pub use buffer::DurableBuffer;
pub use config::IngestorConfig;
pub use core::{IngestError, Result};
pub use oracle::UnconfiguredOracle;
pub use session::Session;
pub use store::StoreWriter;
pub use supervisor::{CredentialPool, Supervisor};
