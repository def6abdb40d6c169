//! The transaction model and its persisted form.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::machine::StateId;

/// What kind of store operation a transaction performs.
///
/// Only `Install`, `Uninstall`, and `Update` carry transition sets;
/// the rest exist in the model for bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Scratch transaction with no persisted effect.
    Ephemeral,
    /// Install a pack.
    Install,
    /// Remove a pack.
    Uninstall,
    /// Update a pack in place.
    Update,
    /// Roll a pack back to its previous revision.
    Rollback,
    /// Reconfigure an installed pack.
    Configure,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ephemeral => "ephemeral",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Update => "update",
            Self::Rollback => "rollback",
            Self::Configure => "configure",
        })
    }
}

/// What a suspended transaction is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitPredicate {
    /// Not waiting.
    None,
    /// Waiting for another transaction to reach a terminal state.
    OnTransaction(u32),
    /// Waiting for the host to reboot; satisfied when the current boot
    /// id differs from the recorded one.
    OnReboot {
        /// Boot id at the time the wait was recorded.
        boot_id: String,
    },
}

/// I/O progress written by state actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Total bytes the operation will move.
    pub total_bytes: u64,
    /// Bytes moved so far.
    pub completed_bytes: u64,
    /// Last percentage reported to observers.
    pub last_reported_percent: u8,
}

impl Progress {
    /// Completion percentage, clamped to 100.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = self.completed_bytes.saturating_mul(100) / self.total_bytes;
        #[allow(clippy::cast_possible_truncation)]
        {
            pct.min(100) as u8
        }
    }
}

/// One store operation in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique id, assigned by the orchestrator.
    pub id: u32,
    /// Short human name, e.g. the pack being installed.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Operation kind.
    pub kind: TransactionKind,
    /// Current machine state.
    pub state: StateId,
    /// Active wait, if any.
    pub wait: WaitPredicate,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
    /// Last state change, seconds since the epoch.
    pub updated_at: u64,
    /// Time the transaction reached a terminal state, if it has.
    #[serde(default)]
    pub completed_at: Option<u64>,
    /// I/O progress counters.
    pub progress: Progress,
}

impl Transaction {
    /// Creates a fresh transaction in the given initial state.
    pub fn new(id: u32, name: &str, description: &str, kind: TransactionKind, state: StateId) -> Self {
        let now = unix_now();
        Self {
            id,
            name: name.to_owned(),
            description: description.to_owned(),
            kind,
            state,
            wait: WaitPredicate::None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            progress: Progress::default(),
        }
    }

    /// Records a state change; the first terminal state stamps the
    /// completion time.
    pub fn touch(&mut self, state: StateId) {
        self.state = state;
        self.updated_at = unix_now();
        if state.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(self.updated_at);
        }
    }
}

/// Seconds since the Unix epoch; zero if the clock is before it.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped_and_zero_safe() {
        let mut p = Progress::default();
        assert_eq!(p.percent(), 0);
        p.total_bytes = 200;
        p.completed_bytes = 50;
        assert_eq!(p.percent(), 25);
        p.completed_bytes = 400;
        assert_eq!(p.percent(), 100);
    }

    #[test]
    fn first_terminal_touch_stamps_completion() {
        let mut txn =
            Transaction::new(1, "hello", "install hello", TransactionKind::Install, StateId::PreCheck);
        txn.touch(StateId::Download);
        assert_eq!(txn.completed_at, None);

        txn.touch(StateId::Completed);
        let stamped = txn.completed_at;
        assert!(stamped.is_some());
        assert!(stamped.unwrap() >= txn.created_at);

        // A later touch must not move the stamp.
        txn.touch(StateId::Completed);
        assert_eq!(txn.completed_at, stamped);
    }

    #[test]
    fn persisted_form_round_trips() {
        let txn = Transaction::new(7, "hello", "install hello", TransactionKind::Install, StateId::PreCheck);
        let text = serde_json::to_string(&txn).unwrap();
        let back: Transaction = serde_json::from_str(&text).unwrap();
        assert_eq!(back, txn);
    }
}
