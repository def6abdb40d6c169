//! The transaction engine.
//!
//! Every store operation (install, uninstall, update) runs as a
//! cooperative state machine over a [`transaction::Transaction`]. The
//! [`orchestrator::Orchestrator`] owns the live machines, persists
//! enough to resume them across restarts, and reports progress. The
//! [`inventory`] module is the on-disk record of installed packs and
//! their trust proofs.

pub mod error;
pub mod inventory;
pub mod machine;
pub mod orchestrator;
pub mod states;
pub mod transaction;

pub use error::{Error, Result};
