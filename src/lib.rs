pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod recovery;
pub mod store;
pub mod sync;

pub use error::{Result, TransferError};
