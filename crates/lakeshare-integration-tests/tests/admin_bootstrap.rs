//! Admin bootstrap: merge-only reconciliation and its effect on grants.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use lakeshare_core::audit::AuditAction;
use lakeshare_core::{ErrorClass, PrincipalArn};
use lakeshare_flow::AdminBootstrap;
use lakeshare_flow::ports::memory::{Call, InMemoryAccount};
use lakeshare_ledger::GrantStep;
use lakeshare_test_utils::fixtures::{
    self, CONSUMER_ROLE, PRODUCER_ACCOUNT, REGION, execution_role, orders, role, user,
};
use lakeshare_test_utils::{
    World, assert_admins_include, assert_audit_count, assert_record_failed_at,
    assert_record_granted,
};
use proptest::prelude::*;

#[tokio::test]
async fn missing_admin_fails_grant_until_bootstrap_runs() {
    let world = World::builder()
        .producer(PRODUCER_ACCOUNT, REGION)
        .listing("L1", PRODUCER_ACCOUNT, REGION, orders())
        .build()
        .await;
    let producer = world.producer(PRODUCER_ACCOUNT, REGION);
    let consumer = role(PRODUCER_ACCOUNT, CONSUMER_ROLE);
    producer.account.set_admins(Vec::new()).unwrap();

    let event = world.accept("L1", &consumer, &orders()).await;
    let report = world.pump().await;
    let errors = report.grant_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].class(), ErrorClass::PermissionDenied);
    assert!(errors[0].class().requires_alert());
    let record = producer.record(&consumer, &orders()).await.expect("record");
    assert_record_failed_at(&record, GrantStep::Permissions);

    let reconciled = producer
        .bootstrap()
        .reconcile(&[execution_role(PRODUCER_ACCOUNT)])
        .await
        .expect("reconcile");
    assert!(reconciled.changed());
    assert_eq!(reconciled.added, vec![execution_role(PRODUCER_ACCOUNT)]);

    world.publish(&fixtures::redelivery(&event)).await;
    assert_eq!(world.pump().await.granted(), 1);
    assert_record_granted(&producer.record(&consumer, &orders()).await.expect("record"));
}

#[tokio::test]
async fn reconcile_keeps_existing_admins_and_skips_unknown_roles() {
    let world = World::builder().producer(PRODUCER_ACCOUNT, REGION).build().await;
    let producer = world.producer(PRODUCER_ACCOUNT, REGION);
    let platform = user(PRODUCER_ACCOUNT, "platform-admin");
    producer
        .account
        .set_admins(vec![platform.clone(), execution_role(PRODUCER_ACCOUNT)])
        .unwrap();

    let ghost = role(PRODUCER_ACCOUNT, "deleted-role");
    let foreign = role("333333333333", "auditor");
    let report = producer
        .bootstrap()
        .reconcile(&[execution_role(PRODUCER_ACCOUNT), ghost.clone(), foreign.clone()])
        .await
        .expect("reconcile");

    assert_eq!(report.skipped, vec![ghost]);
    assert_eq!(report.added, vec![foreign.clone()]);
    assert_admins_include(
        &producer.account,
        &[platform, execution_role(PRODUCER_ACCOUNT), foreign],
    );
    assert_audit_count(&producer.audit, AuditAction::AdminsMerged, 2);
}

#[tokio::test]
async fn reconcile_is_a_noop_when_converged() {
    let world = World::builder().producer(PRODUCER_ACCOUNT, REGION).build().await;
    let producer = world.producer(PRODUCER_ACCOUNT, REGION);
    let writes_before = producer.account.calls(Call::PutAdmins);

    let report = producer
        .bootstrap()
        .reconcile(&[execution_role(PRODUCER_ACCOUNT)])
        .await
        .expect("reconcile");

    assert!(!report.changed());
    assert_eq!(report.attempts, 1);
    assert_eq!(producer.account.calls(Call::PutAdmins), writes_before);
    assert_audit_count(&producer.audit, AuditAction::AdminsUnchanged, 1);
}

#[tokio::test]
async fn concurrent_writer_is_remerged() {
    let world = World::builder().producer(PRODUCER_ACCOUNT, REGION).build().await;
    let producer = world.producer(PRODUCER_ACCOUNT, REGION);
    let platform = user(PRODUCER_ACCOUNT, "platform-admin");
    producer.account.set_admins(Vec::new()).unwrap();
    producer
        .account
        .clobber_admins_after_next_put(vec![platform.clone()])
        .unwrap();

    let report = producer
        .bootstrap()
        .reconcile(&[execution_role(PRODUCER_ACCOUNT)])
        .await
        .expect("reconcile");

    assert_eq!(report.writes, 2);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.added, vec![execution_role(PRODUCER_ACCOUNT)]);
    assert_admins_include(&producer.account, &[platform, execution_role(PRODUCER_ACCOUNT)]);
}

#[tokio::test]
async fn settings_write_failure_is_retryable() {
    let world = World::builder().producer(PRODUCER_ACCOUNT, REGION).build().await;
    let producer = world.producer(PRODUCER_ACCOUNT, REGION);
    producer.account.set_admins(Vec::new()).unwrap();
    producer.account.fail(Call::PutAdmins, ErrorClass::Transient, 1).unwrap();

    let err = producer
        .bootstrap()
        .reconcile(&[execution_role(PRODUCER_ACCOUNT)])
        .await
        .expect_err("put fails");
    assert!(err.class().is_retryable());
    assert!(producer.account.admins().is_empty());
}

fn pool() -> Vec<PrincipalArn> {
    vec![
        execution_role(PRODUCER_ACCOUNT),
        role(PRODUCER_ACCOUNT, CONSUMER_ROLE),
        role(PRODUCER_ACCOUNT, "missing"),
        user(PRODUCER_ACCOUNT, "alice"),
        role("333333333333", "auditor"),
    ]
}

fn pick(mask: u8) -> Vec<PrincipalArn> {
    pool()
        .into_iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, p)| p)
        .collect()
}

proptest! {
    #[test]
    fn reconcile_sequences_accumulate_the_union(
        initial in 0u8..32,
        rounds in proptest::collection::vec(0u8..32, 1..6),
    ) {
        let account = Arc::new(InMemoryAccount::new(fixtures::account(PRODUCER_ACCOUNT)));
        account.add_role(fixtures::EXECUTION_ROLE).unwrap();
        account.add_role(CONSUMER_ROLE).unwrap();
        let before = pick(initial);
        account.set_admins(before.clone()).unwrap();

        let config = fixtures::producer_config(PRODUCER_ACCOUNT, REGION);
        let bootstrap = AdminBootstrap::new(&config, account.clone(), account.clone());
        let mut expected: BTreeSet<PrincipalArn> = before.iter().cloned().collect();
        for mask in rounds {
            let declared = pick(mask);
            let report = tokio_test::block_on(bootstrap.reconcile(&declared)).unwrap();
            prop_assert!(report.skipped.iter().all(|p| p.role_name() == Some("missing")));
            // Declared local roles the directory does not know are never
            // merged, so the union excludes whatever the report skipped.
            expected.extend(declared.into_iter().filter(|p| !report.skipped.contains(p)));

            let after: BTreeSet<PrincipalArn> = account.admins().into_iter().collect();
            for skipped in &report.skipped {
                prop_assert_eq!(after.contains(skipped), before.contains(skipped));
            }
            for admin in &before {
                prop_assert!(after.contains(admin));
            }
            prop_assert_eq!(&after, &expected);
        }
    }
}
