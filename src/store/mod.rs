//! In-memory expiring stores
//!
//! All state is volatile: a restart drops every lock, idempotency record and
//! user entry.

pub mod ttl_map;
pub mod users;

pub use ttl_map::{TtlEntry, TtlMap};
pub use users::{UserEntry, UserStateStore, UserStoreStats};
