pub mod entities;
mod failure_store;

pub use failure_store::{FailureClass, FailureRecord, FailureStore, StorageError, StorageResult};
