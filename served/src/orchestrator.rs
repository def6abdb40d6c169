//! Owns the live transactions and their machines.
//!
//! Each transaction persists to its own JSON file under the state
//! directory after every step, so a restart reinstates every
//! non-terminal machine at its last recorded state. Reboot waits are
//! resolved by comparing boot ids; the id source is injectable so tests
//! can simulate a reboot.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::machine::{Action, Event, ExecOutcome, Machine, StateId};
use crate::states;
use crate::transaction::{Transaction, TransactionKind, WaitPredicate};
use crate::{Error, Result};

/// Produces the action for a given kind and state.
///
/// The orchestrator stays agnostic of what states do; the embedder
/// wires real work in here.
pub type ActionFactory = Box<dyn Fn(TransactionKind, StateId) -> Action<Transaction>>;

/// Observer events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A transaction's reported percentage changed.
    Progress {
        /// Transaction id.
        id: u32,
        /// New percentage.
        percent: u8,
    },
    /// A transaction reached a terminal state.
    Terminal {
        /// Transaction id.
        id: u32,
        /// The terminal state.
        state: StateId,
    },
}

/// Result of one orchestrator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The machine suspended awaiting an event.
    AwaitingEvent,
    /// The transaction's wait predicate is not yet satisfied.
    Waiting,
    /// The machine reached a terminal state.
    Terminal(StateId),
}

/// One owned transaction; the machine is dropped once terminal.
struct Entry {
    /// The transaction record.
    txn: Transaction,
    /// The live machine, absent for terminal transactions.
    machine: Option<Machine<Transaction>>,
}

/// The transaction owner.
pub struct Orchestrator {
    /// State directory holding one JSON file per transaction.
    dir: PathBuf,
    /// Supplies state actions for new and resumed machines.
    actions: ActionFactory,
    /// Test hook replacing the host boot id.
    boot_id_override: Option<String>,
    /// Next transaction id.
    next_id: u32,
    /// Live and terminal transactions.
    entries: HashMap<u32, Entry>,
    /// Pending observer events.
    notifications: VecDeque<Notification>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dir", &self.dir)
            .field("transactions", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Opens the state directory and reinstates persisted transactions.
    ///
    /// Non-terminal transactions get a machine rebuilt at their last
    /// recorded state; terminal ones are kept as records only.
    pub fn open(dir: impl Into<PathBuf>, actions: ActionFactory) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        let mut next_id = 1;
        for item in fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let txn: Transaction = match serde_json::from_str(&fs::read_to_string(&path)?) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable transaction");
                    continue;
                }
            };
            next_id = next_id.max(txn.id + 1);

            let machine = if txn.state.is_terminal() {
                None
            } else {
                let kind = txn.kind;
                match states::resume_machine(kind, txn.state, |s| (actions)(kind, s)) {
                    Ok(m) => {
                        info!(id = txn.id, state = ?txn.state, "resumed transaction");
                        Some(m)
                    }
                    Err(e) => {
                        warn!(id = txn.id, error = %e, "cannot resume; marking failed");
                        None
                    }
                }
            };
            entries.insert(txn.id, Entry { txn, machine });
        }

        Ok(Self {
            dir,
            actions,
            boot_id_override: None,
            next_id,
            entries,
            notifications: VecDeque::new(),
        })
    }

    /// Replaces the host boot id source; test hook.
    pub fn set_boot_id(&mut self, boot_id: impl Into<String>) {
        self.boot_id_override = Some(boot_id.into());
    }

    /// Starts a new transaction and persists it.
    pub fn begin(
        &mut self,
        name: &str,
        description: &str,
        kind: TransactionKind,
    ) -> Result<u32> {
        let initial =
            states::initial_state(kind).ok_or_else(|| Error::NoTransitionSet(kind.to_string()))?;
        let machine = states::build_machine(kind, |s| (self.actions)(kind, s))?;

        let id = self.next_id;
        self.next_id += 1;
        let txn = Transaction::new(id, name, description, kind, initial);
        self.persist(&txn)?;
        self.entries.insert(id, Entry {
            txn,
            machine: Some(machine),
        });
        info!(id, %kind, name, "transaction started");
        Ok(id)
    }

    /// Runs the current state's action for one transaction.
    ///
    /// Honors the wait predicate first; a pending wait suspends the
    /// step without touching the machine.
    pub fn execute(&mut self, id: u32) -> Result<StepOutcome> {
        let waiting = {
            let entry = self.entries.get(&id).ok_or(Error::UnknownTransaction(id))?;
            !self.wait_satisfied(&entry.txn.wait)
        };
        if waiting {
            return Ok(StepOutcome::Waiting);
        }

        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::UnknownTransaction(id))?;
        let Some(machine) = entry.machine.as_mut() else {
            return Ok(StepOutcome::Terminal(entry.txn.state));
        };
        entry.txn.wait = WaitPredicate::None;

        let outcome = machine.execute(&mut entry.txn)?;
        let current = machine.current();
        entry.txn.touch(current);

        let percent = entry.txn.progress.percent();
        if percent != entry.txn.progress.last_reported_percent {
            entry.txn.progress.last_reported_percent = percent;
            self.notifications
                .push_back(Notification::Progress { id, percent });
        }

        let step = match outcome {
            ExecOutcome::AwaitingEvent => StepOutcome::AwaitingEvent,
            ExecOutcome::Terminal(state) => {
                entry.machine = None;
                self.notifications
                    .push_back(Notification::Terminal { id, state });
                StepOutcome::Terminal(state)
            }
        };
        let snapshot = entry.txn.clone();
        self.persist(&snapshot)?;
        Ok(step)
    }

    /// Fires an event on a transaction's machine and persists the move.
    pub fn event(&mut self, id: u32, event: Event) -> Result<StateId> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::UnknownTransaction(id))?;
        let Some(machine) = entry.machine.as_mut() else {
            return Err(Error::Terminal(entry.txn.state));
        };

        let state = machine.event(event)?;
        entry.txn.touch(state);
        if state.is_terminal() {
            entry.machine = None;
            self.notifications
                .push_back(Notification::Terminal { id, state });
        }
        let snapshot = entry.txn.clone();
        self.persist(&snapshot)?;
        Ok(state)
    }

    /// Cancels a transaction: fires `Cancel`, then drains the machine.
    ///
    /// Accepted in any non-terminal state.
    pub fn cancel(&mut self, id: u32) -> Result<StateId> {
        let state = self.event(id, Event::Cancel)?;
        // Drain whatever the cancel transition left to run.
        while !matches!(self.execute(id)?, StepOutcome::Terminal(_) | StepOutcome::Waiting) {}
        Ok(state)
    }

    /// Records a wait predicate for a suspended transaction.
    pub fn set_wait(&mut self, id: u32, wait: WaitPredicate) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(Error::UnknownTransaction(id))?;
        entry.txn.wait = wait;
        let snapshot = entry.txn.clone();
        self.persist(&snapshot)
    }

    /// Suspends a transaction until the next reboot.
    pub fn wait_on_reboot(&mut self, id: u32) -> Result<()> {
        let boot_id = self.current_boot_id().unwrap_or_default();
        self.set_wait(id, WaitPredicate::OnReboot { boot_id })
    }

    /// Whether a wait predicate is satisfied right now.
    pub fn wait_satisfied(&self, wait: &WaitPredicate) -> bool {
        match wait {
            WaitPredicate::None => true,
            WaitPredicate::OnTransaction(target) => self
                .entries
                .get(target)
                .is_none_or(|e| e.txn.state.is_terminal()),
            WaitPredicate::OnReboot { boot_id } => {
                // An unreadable current boot id keeps the wait pending.
                self.current_boot_id()
                    .is_some_and(|current| current != *boot_id)
            }
        }
    }

    /// The host boot id, or the injected override.
    pub fn current_boot_id(&self) -> Option<String> {
        if let Some(ref id) = self.boot_id_override {
            return Some(id.clone());
        }
        host_boot_id()
    }

    /// Drains pending observer events.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// A transaction record by id.
    pub fn get(&self, id: u32) -> Option<&Transaction> {
        self.entries.get(&id).map(|e| &e.txn)
    }

    /// Ids of all known transactions.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Direct mutable access to a transaction's progress counters.
    ///
    /// State actions normally write these through their context; this
    /// is for embedders driving progress externally.
    pub fn progress_mut(&mut self, id: u32) -> Result<&mut crate::transaction::Progress> {
        self.entries
            .get_mut(&id)
            .map(|e| &mut e.txn.progress)
            .ok_or(Error::UnknownTransaction(id))
    }

    /// Writes one transaction's JSON file.
    fn persist(&self, txn: &Transaction) -> Result<()> {
        let path = transaction_path(&self.dir, txn.id);
        let mut text = serde_json::to_string_pretty(txn)?;
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }
}

/// Path of a transaction's persisted record.
fn transaction_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("txn-{id}.json"))
}

/// Reads the kernel's boot id; changes exactly once per boot.
#[cfg(target_os = "linux")]
fn host_boot_id() -> Option<String> {
    fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .map(|s| s.trim().to_owned())
}

/// No portable boot id source; reboot waits stay pending.
#[cfg(not(target_os = "linux"))]
fn host_boot_id() -> Option<String> {
    None
}
