//! Custom assertion helpers for integration tests.

use lakeshare_core::PrincipalArn;
use lakeshare_core::audit::{AuditAction, MemoryAuditSink};
use lakeshare_flow::ports::memory::{Call, InMemoryAccount};
use lakeshare_flow::{GrantOutcome, GrantReport, StepAction};
use lakeshare_ledger::{GrantRecord, GrantStatus, GrantStep};

use crate::storage::StorageOp;

/// Asserts that a grant delivery ended granted and returns its report.
///
/// # Panics
///
/// Panics if the outcome is anything other than `Granted`.
pub fn assert_granted(outcome: &GrantOutcome) -> &GrantReport {
    match outcome {
        GrantOutcome::Granted(report) => report,
        other => panic!("Expected grant to complete, but outcome was {other:?}"),
    }
}

/// Asserts that a ledger record is granted with every step completed.
///
/// # Panics
///
/// Panics if the record is not granted or a step is missing.
pub fn assert_record_granted(record: &GrantRecord) {
    assert_eq!(
        record.status,
        GrantStatus::Granted,
        "Expected record {} to be granted, but status was {}",
        record.key,
        record.status
    );
    for step in GrantStep::ALL {
        assert!(
            record.completed_steps.contains(&step),
            "Granted record {} is missing step {step}",
            record.key
        );
    }
    assert!(record.failed_step.is_none(), "Granted record still carries a failed step");
}

/// Asserts that a ledger record failed at the given step.
///
/// # Panics
///
/// Panics if the record is not failed or failed elsewhere.
pub fn assert_record_failed_at(record: &GrantRecord, step: GrantStep) {
    assert_eq!(
        record.status,
        GrantStatus::Failed,
        "Expected record {} to be failed, but status was {}",
        record.key,
        record.status
    );
    assert_eq!(
        record.failed_step,
        Some(step),
        "Expected failure at {step}, but failed step was {:?}",
        record.failed_step
    );
}

/// Asserts that a redelivery performed no side effects.
///
/// # Panics
///
/// Panics if any step reports `Performed` other than the ledger record.
pub fn assert_noop(report: &GrantReport) {
    for step in &report.steps {
        if step.step == GrantStep::Record {
            continue;
        }
        assert_ne!(
            step.action,
            StepAction::Performed,
            "Expected no side effects, but step {} performed one",
            step.step
        );
    }
}

/// Asserts that each side-effecting call happened exactly once.
///
/// # Panics
///
/// Panics if any call count differs from one.
pub fn assert_called_once(account: &InMemoryAccount, calls: &[Call]) {
    for call in calls {
        assert_eq!(
            account.calls(*call),
            1,
            "Expected {} to be called once, but it was called {} times",
            call.as_str(),
            account.calls(*call)
        );
    }
}

/// Asserts that every declared administrator is present.
///
/// # Panics
///
/// Panics if an administrator is missing.
pub fn assert_admins_include(account: &InMemoryAccount, expected: &[PrincipalArn]) {
    let admins = account.admins();
    for admin in expected {
        assert!(
            admins.contains(admin),
            "Expected administrator {admin}, but admins were {admins:?}"
        );
    }
}

/// Asserts the number of audit events recorded for an action.
///
/// # Panics
///
/// Panics if the count differs.
pub fn assert_audit_count(sink: &MemoryAuditSink, action: AuditAction, expected: usize) {
    let actual = sink.find_by_action(action).len();
    assert_eq!(
        actual, expected,
        "Expected {expected} {action} audit events, found {actual}"
    );
}

/// Asserts that storage operations include specific operation/path prefix pairs.
///
/// # Panics
///
/// Panics if an expected operation is missing.
pub fn assert_storage_ops_contain(ops: &[StorageOp], expected: &[(&str, &str)]) {
    for (op_name, path_prefix) in expected {
        let found = ops
            .iter()
            .any(|op| op.name() == *op_name && op.path().starts_with(path_prefix));
        assert!(
            found,
            "Expected {op_name} operation on path starting with '{path_prefix}' not found"
        );
    }
}
