//! Orchestrator behavior: persistence, waits, progress, cancellation.

use served::machine::{ActionResult, Event, StateId};
use served::orchestrator::{ActionFactory, Notification, Orchestrator, StepOutcome};
use served::transaction::{Transaction, TransactionKind, WaitPredicate};

/// Actions that always suspend, leaving transitions to the test.
fn inert_actions() -> ActionFactory {
    Box::new(|_, _| Box::new(|_: &mut Transaction| ActionResult::Continue))
}

/// Drives one transaction with Ok events until terminal.
fn drive(orchestrator: &mut Orchestrator, id: u32) -> StateId {
    loop {
        match orchestrator.execute(id).unwrap() {
            StepOutcome::Terminal(state) => return state,
            StepOutcome::AwaitingEvent => {
                orchestrator.event(id, Event::Ok).unwrap();
            }
            StepOutcome::Waiting => panic!("unexpected wait"),
        }
    }
}

#[test]
fn install_runs_to_completed() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();

    let id = orch.begin("hello", "install hello", TransactionKind::Install).unwrap();
    assert_eq!(drive(&mut orch, id), StateId::Completed);
    assert_eq!(orch.get(id).unwrap().state, StateId::Completed);

    let terminal = orch
        .take_notifications()
        .into_iter()
        .filter(|n| matches!(n, Notification::Terminal { .. }))
        .count();
    assert_eq!(terminal, 1);

    let txn = orch.get(id).unwrap();
    assert!(txn.completed_at.is_some());
    assert!(txn.completed_at.unwrap() >= txn.created_at);
}

#[test]
fn kinds_without_transition_sets_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();
    assert!(orch.begin("x", "", TransactionKind::Ephemeral).is_err());
    assert!(orch.begin("x", "", TransactionKind::Rollback).is_err());
}

#[test]
fn abort_action_lands_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let actions: ActionFactory = Box::new(|_, state| {
        Box::new(move |_: &mut Transaction| {
            if state == StateId::Verify {
                ActionResult::Abort
            } else {
                ActionResult::Continue
            }
        })
    });
    let mut orch = Orchestrator::open(dir.path(), actions).unwrap();
    let id = orch.begin("bad", "", TransactionKind::Install).unwrap();
    assert_eq!(drive(&mut orch, id), StateId::Error);
}

#[test]
fn cancel_is_accepted_mid_flight() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();
    let id = orch.begin("hello", "", TransactionKind::Install).unwrap();

    // Advance into Download, then cancel.
    orch.execute(id).unwrap();
    orch.event(id, Event::Ok).unwrap();
    orch.execute(id).unwrap();
    assert_eq!(orch.cancel(id).unwrap(), StateId::Cancelled);
    assert_eq!(orch.get(id).unwrap().state, StateId::Cancelled);
}

#[test]
fn restart_resumes_at_last_recorded_state() {
    let dir = tempfile::tempdir().unwrap();
    let id;
    {
        let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();
        id = orch.begin("hello", "", TransactionKind::Install).unwrap();
        // PreCheck, Download, then stop mid-flight.
        orch.execute(id).unwrap();
        orch.event(id, Event::Ok).unwrap();
        orch.execute(id).unwrap();
        orch.event(id, Event::Ok).unwrap();
    }

    let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();
    assert_eq!(orch.get(id).unwrap().state, StateId::Verify);
    assert_eq!(drive(&mut orch, id), StateId::Completed);
}

#[test]
fn terminal_transactions_are_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let id;
    {
        let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();
        id = orch.begin("hello", "", TransactionKind::Uninstall).unwrap();
        drive(&mut orch, id);
    }
    let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();
    assert_eq!(orch.get(id).unwrap().state, StateId::Completed);
    assert!(orch.event(id, Event::Ok).is_err());
}

#[test]
fn reboot_wait_blocks_until_boot_id_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();
    orch.set_boot_id("boot-a");

    let id = orch.begin("hello", "", TransactionKind::Install).unwrap();
    orch.wait_on_reboot(id).unwrap();
    assert_eq!(orch.execute(id).unwrap(), StepOutcome::Waiting);

    // Same boot, still pending.
    assert_eq!(orch.execute(id).unwrap(), StepOutcome::Waiting);

    orch.set_boot_id("boot-b");
    assert_eq!(orch.execute(id).unwrap(), StepOutcome::AwaitingEvent);
}

#[test]
fn transaction_wait_clears_when_target_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::open(dir.path(), inert_actions()).unwrap();

    let first = orch.begin("base", "", TransactionKind::Install).unwrap();
    let second = orch.begin("addon", "", TransactionKind::Install).unwrap();
    orch.set_wait(second, WaitPredicate::OnTransaction(first)).unwrap();

    assert_eq!(orch.execute(second).unwrap(), StepOutcome::Waiting);
    drive(&mut orch, first);
    assert_eq!(orch.execute(second).unwrap(), StepOutcome::AwaitingEvent);
}

#[test]
fn progress_notifications_fire_only_on_change() {
    let dir = tempfile::tempdir().unwrap();
    let actions: ActionFactory = Box::new(|_, state| {
        Box::new(move |txn: &mut Transaction| {
            if state == StateId::Download {
                txn.progress.total_bytes = 100;
                txn.progress.completed_bytes = 40;
            }
            ActionResult::Continue
        })
    });
    let mut orch = Orchestrator::open(dir.path(), actions).unwrap();
    let id = orch.begin("hello", "", TransactionKind::Install).unwrap();

    // PreCheck reports nothing.
    orch.execute(id).unwrap();
    assert!(orch.take_notifications().is_empty());
    orch.event(id, Event::Ok).unwrap();

    // Download moves to 40 percent; exactly one event.
    orch.execute(id).unwrap();
    assert_eq!(orch.take_notifications(), [Notification::Progress {
        id,
        percent: 40
    }]);

    // Retry re-runs Download at the same percentage; no new event.
    orch.event(id, Event::Retry).unwrap();
    orch.execute(id).unwrap();
    orch.event(id, Event::Ok).unwrap();
    orch.execute(id).unwrap();
    assert!(orch.take_notifications().is_empty());
}
