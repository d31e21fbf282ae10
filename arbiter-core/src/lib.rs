//! ARBITER Core - Entity Types
//!
//! Pure data structures shared by the arbitration and adaptation crates.
//! This crate contains no I/O and no async code.
//!
//! - Typed identifiers and timestamps
//! - Proposals and their tagged action payloads
//! - Arbitration policies, conflicts and decisions
//! - Preference registry, adaptation policy and attempts
//! - Domain events and hash-chained audit entries
//! - Errors and configuration

mod action;
mod adaptation;
mod audit;
mod config;
mod decision;
mod enums;
mod error;
mod event;
mod identity;
mod policy;
mod preference;
mod proposal;

pub use action::*;
pub use adaptation::*;
pub use audit::*;
pub use config::*;
pub use decision::*;
pub use enums::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use policy::*;
pub use preference::*;
pub use proposal::*;
