//! Shared types

pub mod error;

pub use error::{ErrorClass, GatewayError, Result};
