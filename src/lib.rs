//! Padsign gateway - fault-tolerant PDF registration
//!
//! Sits between callers and the upstream signing service and protects both
//! sides: callers get idempotent retries and fast failure when the upstream
//! is down, the upstream gets bounded concurrency and no duplicate
//! registrations.
//!
//! ## Components
//!
//! - **Store**: generic TTL map and the user state store
//! - **Guard**: circuit breaker, document locks, idempotency cache,
//!   admission queue
//! - **Upstream**: the register capability and its HTTP client
//! - **Gateway**: sequences the guards around each register request
//! - **Logging**: tracing setup and the JSONL audit trail

pub mod config;
pub mod gateway;
pub mod guard;
pub mod logging;
pub mod store;
pub mod types;
pub mod upstream;

pub use config::{Args, GatewayConfig};
pub use gateway::{GatewayStats, RegisterPdfGateway, RegisterReceipt};
pub use types::{ErrorClass, GatewayError, Result};
pub use upstream::{HttpUpstream, UpstreamCaller, UpstreamError};
