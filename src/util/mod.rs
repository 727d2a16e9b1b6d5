//! Shared helpers (error roll-up, store retry policy).

pub mod error;
pub mod retry;

pub use error::{HaError, SerializationError};
pub use retry::{retry_store_op, RetryHandle, RetryPolicy, RetryStrategy};
