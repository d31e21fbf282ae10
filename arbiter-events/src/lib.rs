//! ARBITER Events - Dispatch and Audit
//!
//! - `EventDispatcher`: closed domain events routed to handlers by kind and
//!   broadcast to async subscribers
//! - `AuditTrail`: append-only, hash-chained ledger behind analytics and
//!   explanation views

pub mod audit;
pub mod dispatcher;

pub use audit::{AuditSummary, AuditTrail};
pub use dispatcher::{EventDispatcher, EventHandler};
