//! Static transition sets for each transaction kind.
//!
//! The tables are per-kind and disjoint on purpose: Dependencies
//! advances to `Install` in the install set but to `RemoveWrappers` in
//! the update set, so transition selection depends only on which set
//! was loaded, never on duplicate-entry ordering.

use crate::machine::{Action, Event, Machine, State, StateId};
use crate::transaction::TransactionKind;
use crate::{Error, Result};

use Event::{Cancel, Failed, Ok as EvOk, Retry, Wait};
use StateId::{
    Cancelled, Completed, Dependencies, DependenciesWait, Download, DownloadRetry, Error as StError,
    GenerateWrappers, Install, Load, Mount, PreCheck, RemoveWrappers, StartServices, StopServices,
    Uninstall, Unload, Unmount, Update, Verify,
};

/// `(state, transitions)` rows for one transaction kind.
type Table = &'static [(StateId, &'static [(Event, StateId)])];

/// The install flow: fetch, verify, place, activate.
const INSTALL: Table = &[
    (PreCheck, &[(EvOk, Download), (Failed, StError), (Cancel, Cancelled)]),
    (
        Download,
        &[
            (EvOk, Verify),
            (Retry, DownloadRetry),
            (Failed, StError),
            (Cancel, Cancelled),
        ],
    ),
    (
        DownloadRetry,
        &[(EvOk, Download), (Failed, StError), (Cancel, Cancelled)],
    ),
    (Verify, &[(EvOk, Dependencies), (Failed, StError), (Cancel, Cancelled)]),
    (
        Dependencies,
        &[
            (EvOk, Install),
            (Wait, DependenciesWait),
            (Failed, StError),
            (Cancel, Cancelled),
        ],
    ),
    (
        DependenciesWait,
        &[(EvOk, Dependencies), (Failed, StError), (Cancel, Cancelled)],
    ),
    (Install, &[(EvOk, Mount), (Failed, StError)]),
    (Mount, &[(EvOk, Load), (Failed, StError)]),
    (Load, &[(EvOk, StartServices), (Failed, StError)]),
    (StartServices, &[(EvOk, GenerateWrappers), (Failed, StError)]),
    (GenerateWrappers, &[(EvOk, Completed), (Failed, StError)]),
];

/// The uninstall flow: deactivate in reverse order, then remove.
const UNINSTALL: Table = &[
    (RemoveWrappers, &[(EvOk, StopServices), (Failed, StError)]),
    (StopServices, &[(EvOk, Unload), (Failed, StError)]),
    (Unload, &[(EvOk, Unmount), (Failed, StError)]),
    (Unmount, &[(EvOk, Uninstall), (Failed, StError)]),
    (Uninstall, &[(EvOk, Completed), (Failed, StError)]),
];

/// The update flow: fetch the new revision, deactivate the old one,
/// swap, reactivate.
const UPDATE: Table = &[
    (PreCheck, &[(EvOk, Download), (Failed, StError), (Cancel, Cancelled)]),
    (
        Download,
        &[
            (EvOk, Verify),
            (Retry, DownloadRetry),
            (Failed, StError),
            (Cancel, Cancelled),
        ],
    ),
    (
        DownloadRetry,
        &[(EvOk, Download), (Failed, StError), (Cancel, Cancelled)],
    ),
    (Verify, &[(EvOk, Dependencies), (Failed, StError), (Cancel, Cancelled)]),
    (
        Dependencies,
        &[
            (EvOk, RemoveWrappers),
            (Wait, DependenciesWait),
            (Failed, StError),
            (Cancel, Cancelled),
        ],
    ),
    (
        DependenciesWait,
        &[(EvOk, Dependencies), (Failed, StError), (Cancel, Cancelled)],
    ),
    (RemoveWrappers, &[(EvOk, StopServices), (Failed, StError)]),
    (StopServices, &[(EvOk, Unload), (Failed, StError)]),
    (Unload, &[(EvOk, Unmount), (Failed, StError)]),
    (Unmount, &[(EvOk, Update), (Failed, StError)]),
    (Update, &[(EvOk, Mount), (Failed, StError)]),
    (Mount, &[(EvOk, Load), (Failed, StError)]),
    (Load, &[(EvOk, StartServices), (Failed, StError)]),
    (StartServices, &[(EvOk, GenerateWrappers), (Failed, StError)]),
    (GenerateWrappers, &[(EvOk, Completed), (Failed, StError)]),
];

/// The transition table for a kind, when it has one.
pub fn transition_table(kind: TransactionKind) -> Option<Table> {
    match kind {
        TransactionKind::Install => Some(INSTALL),
        TransactionKind::Uninstall => Some(UNINSTALL),
        TransactionKind::Update => Some(UPDATE),
        _ => None,
    }
}

/// The entry state for a kind's table.
pub fn initial_state(kind: TransactionKind) -> Option<StateId> {
    transition_table(kind).map(|table| table[0].0)
}

/// Builds a machine for `kind`, asking `action_for` for each state's
/// action.
pub fn build_machine<C>(
    kind: TransactionKind,
    mut action_for: impl FnMut(StateId) -> Action<C>,
) -> Result<Machine<C>> {
    let table =
        transition_table(kind).ok_or_else(|| Error::NoTransitionSet(kind.to_string()))?;
    let states = table
        .iter()
        .map(|(id, transitions)| State {
            id: *id,
            action: action_for(*id),
            transitions: transitions.to_vec(),
        })
        .collect();
    Machine::new(states, table[0].0)
}

/// Rebuilds a machine for `kind` at a persisted state.
pub fn resume_machine<C>(
    kind: TransactionKind,
    current: StateId,
    mut action_for: impl FnMut(StateId) -> Action<C>,
) -> Result<Machine<C>> {
    let table =
        transition_table(kind).ok_or_else(|| Error::NoTransitionSet(kind.to_string()))?;
    let states = table
        .iter()
        .map(|(id, transitions)| State {
            id: *id,
            action: action_for(*id),
            transitions: transitions.to_vec(),
        })
        .collect();
    Machine::resume_at(states, current)
}
