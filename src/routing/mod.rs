//! # Stage: Request Routing
//!
//! ## Responsibility
//! Answer prediction requests: check the cache, resolve each member lineage
//! to the version its traffic split selects, call the members concurrently
//! through their circuit breakers, combine the answers, and record the
//! prediction for feedback.
//!
//! ## Guarantees
//! - Unknown model ids fail fast with `InvalidModel`, before any cache lookup
//! - Every routed call is tracked exactly once, cache hits and failures included
//! - A request id always maps to the same version for a given traffic split
//! - The request path never waits on the feedback store
//! - An error reaches the caller only when no member and no fallback answered
//!
//! ## NOT Responsible For
//! - Changing traffic splits (that belongs to `deployment`)
//! - Learning from outcomes (that belongs to `learning`)

pub mod monitor;
pub mod retry;
pub mod router;
pub mod table;

pub use monitor::{ModelRequestStats, RequestMonitor, RequestOutcome, TrackedRequest};
pub use retry::{RetryPolicy, RetryStrategy};
pub use router::{RequestRouter, RouterSettings};
pub use table::{RouteSpec, RoutingTable, RoutingTableHandle, TrafficSlot};
