//! Protection primitives for the upstream dependency
//!
//! - **Breaker**: stops calling an upstream that keeps failing
//! - **Lock**: per-document mutual exclusion with a TTL
//! - **Idempotency**: one execution per client key, replayed results
//! - **Admission**: bounded concurrency and a bounded waiting room

pub mod admission;
pub mod breaker;
pub mod idempotency;
pub mod lock;

pub use admission::{AdmissionConfig, AdmissionQueue, AdmissionStats};
pub use breaker::{BreakerConfig, BreakerPermit, BreakerState, CircuitBreaker};
pub use idempotency::{
    request_fingerprint, Begin, IdempotencyCache, IdempotencyStats, IdempotencyTicket, InFlight,
    RecordStatus,
};
pub use lock::{DocumentLockGuard, DocumentLocks, LockToken};
