//! Utilities module for the netemu backend.

pub mod error_handling;

pub use error_handling::retry_async;
