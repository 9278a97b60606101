mod common;

use common::{Fixture, USER};
use keyward_core::*;
use keyward_deploy::DeployPaths;
use keyward_model::{Account, AccountStore, AuditAction};
use keyward_transport::{ConnectTarget, FailureKind, MemoryHost};

fn decommissioner(fx: &Fixture) -> DecommissionWorkflow {
    DecommissionWorkflow::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        fx.fleet(),
    )
}

/// Deployed account on `hostname` with `unmanaged` above the managed block
async fn deployed(fx: &Fixture, id: i64, hostname: &str, unmanaged: &str) -> (Account, MemoryHost) {
    let host = fx.reachable_host(hostname).await;
    let account = fx.account(id, hostname, 0);
    fx.assigned_key(id * 10, account.id);
    let result = DeployWorkflow::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        fx.fleet(),
    )
    .deploy(&account)
    .await;
    assert!(result.is_ok(), "{:?}", result.error);

    let content = host.authorized_keys(USER).unwrap();
    host.set_authorized_keys(USER, &format!("{unmanaged}{content}"));
    (fx.store.account(account.id).unwrap(), host)
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let fx = Fixture::new();
    let (account, host) = deployed(&fx, 1, "web1", "").await;
    let before = host.authorized_keys(USER).unwrap();
    let connections = host.connection_count();

    let result = decommissioner(&fx)
        .decommission(
            &account,
            DecommissionOptions {
                dry_run: true,
                ..DecommissionOptions::default()
            },
        )
        .await;

    assert!(result.skipped);
    assert!(result.error.is_none());
    assert!(!result.remote_cleanup_done && !result.database_delete_done);
    assert_eq!(host.authorized_keys(USER).unwrap(), before);
    assert_eq!(host.connection_count(), connections);
    assert!(fx.store.account(account.id).is_some());
    assert_eq!(fx.count(AuditAction::DecommissionDryRun), 1);
    assert_eq!(fx.count(AuditAction::DecommissionSuccess), 0);
}

#[tokio::test]
async fn test_selective_decommission_is_idempotent() {
    let fx = Fixture::new();
    // Operator's own break-glass line keeps the host reachable afterwards
    let unmanaged = format!(
        "from=\"10.0.0.0/8\" {} break-glass\nssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABmanual admin@console\n",
        fx.system.public_key
    );
    let (account, host) = deployed(&fx, 1, "web1", &unmanaged).await;
    let options = DecommissionOptions {
        keep_other_content: true,
        ..DecommissionOptions::default()
    };
    let workflow = decommissioner(&fx);

    let first = workflow.decommission(&account, options).await;
    assert!(first.error.is_none(), "{:?}", first.error);
    assert!(first.remote_cleanup_done && first.database_delete_done);
    assert_eq!(host.authorized_keys(USER).unwrap(), unmanaged);
    assert!(fx.store.account(account.id).is_none());
    assert_eq!(fx.store.assignment_count(account.id), 0);

    let second = workflow.decommission(&account, options).await;
    assert!(second.error.is_none(), "{:?}", second.error);
    assert_eq!(host.authorized_keys(USER).unwrap(), unmanaged);
    assert_eq!(fx.count(AuditAction::DecommissionSuccess), 2);
    assert_eq!(fx.count(AuditAction::DecommissionFailed), 0);
}

#[tokio::test]
async fn test_full_decommission_retires_file() {
    let fx = Fixture::new();
    let (account, host) = deployed(&fx, 1, "web1", "").await;
    let before = host.authorized_keys(USER).unwrap();

    let result = decommissioner(&fx)
        .decommission(&account, DecommissionOptions::default())
        .await;

    assert!(result.error.is_none(), "{:?}", result.error);
    assert!(host.authorized_keys(USER).is_none());
    let retired: Vec<String> = host
        .paths()
        .into_iter()
        .filter(|path| path.contains("authorized_keys.keyward-decommissioned-"))
        .collect();
    assert_eq!(retired.len(), 1);
    assert_eq!(host.file(USER, &retired[0]).unwrap(), before);
    assert!(fx.store.account(account.id).is_none());
    assert_eq!(fx.count(AuditAction::DecommissionSuccess), 1);
}

#[tokio::test]
async fn test_remote_failure_keeps_record() {
    let fx = Fixture::new();
    let (account, host) = deployed(&fx, 1, "web1", "").await;
    host.rotate_host_key().unwrap();

    let result = decommissioner(&fx)
        .decommission(&account, DecommissionOptions::default())
        .await;

    assert_eq!(
        result.error.as_ref().and_then(CoreError::kind),
        Some(FailureKind::HostKeyMismatch)
    );
    assert!(!result.database_delete_done);
    assert!(fx.store.account(account.id).is_some());
    assert_eq!(fx.count(AuditAction::DecommissionFailed), 1);
    assert_eq!(fx.count(AuditAction::DecommissionSuccess), 0);
}

#[tokio::test]
async fn test_force_deletes_despite_remote_failure() {
    let fx = Fixture::new();
    let (account, host) = deployed(&fx, 1, "web1", "").await;
    host.set_fail_connect(Some(FailureKind::ConnectionRefused));

    let result = decommissioner(&fx)
        .decommission(
            &account,
            DecommissionOptions {
                force: true,
                ..DecommissionOptions::default()
            },
        )
        .await;

    assert!(result.error.is_none());
    assert!(!result.remote_cleanup_done);
    assert!(result.database_delete_done);
    assert!(result.partial_note.is_some());
    assert!(fx.store.account(account.id).is_none());

    let entries = fx.store.audit_entries();
    let success: Vec<_> = entries
        .iter()
        .filter(|entry| entry.action == AuditAction::DecommissionSuccess)
        .collect();
    assert_eq!(success.len(), 1);
    assert!(success[0].details.contains("partial"));
    assert_eq!(fx.count(AuditAction::DecommissionFailed), 0);
}

#[tokio::test]
async fn test_skip_remote_cleanup() {
    let fx = Fixture::new();
    let (account, host) = deployed(&fx, 1, "web1", "").await;
    let before = host.authorized_keys(USER).unwrap();
    let connections = host.connection_count();

    let result = decommissioner(&fx)
        .decommission(
            &account,
            DecommissionOptions {
                skip_remote_cleanup: true,
                ..DecommissionOptions::default()
            },
        )
        .await;

    assert!(result.error.is_none());
    assert!(!result.remote_cleanup_done);
    assert!(result.database_delete_done);
    assert_eq!(host.connection_count(), connections);
    assert_eq!(host.authorized_keys(USER).unwrap(), before);
}

#[tokio::test]
async fn test_record_delete_failure_is_reported() {
    let fx = Fixture::new();
    let (account, _host) = deployed(&fx, 1, "web1", "").await;
    fx.store.set_fail_account_deletes(true);

    let result = decommissioner(&fx)
        .decommission(
            &account,
            DecommissionOptions {
                keep_other_content: true,
                ..DecommissionOptions::default()
            },
        )
        .await;

    assert!(matches!(result.error, Some(CoreError::Store(_))));
    assert!(result.remote_cleanup_done);
    assert!(!result.database_delete_done);
    assert_eq!(fx.count(AuditAction::DecommissionFailed), 1);
    assert_eq!(fx.count(AuditAction::DecommissionSuccess), 0);
}

#[tokio::test]
async fn test_fleet_dry_run_counts_skips() {
    let fx = Fixture::new();
    deployed(&fx, 1, "web1", "").await;
    deployed(&fx, 2, "web2", "").await;
    let accounts = fx.store.list_accounts().await.unwrap();

    let results = decommissioner(&fx)
        .decommission_fleet(
            accounts,
            DecommissionOptions {
                dry_run: true,
                ..DecommissionOptions::default()
            },
        )
        .await;

    let summary = BatchSummary::from_results(&results);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(fx.count(AuditAction::DecommissionDryRun), 2);
}

#[tokio::test]
async fn test_trust_host_records_and_refuses_changes() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("web1", 22).unwrap();
    let trust = HostTrust::new(fx.store.clone(), fx.transport.clone());
    let target = ConnectTarget::new("web1", 22, USER);

    let recorded = trust.trust_host(&target, false).await.unwrap();
    assert!(matches!(recorded, TrustOutcome::Recorded { .. }));

    let again = trust.trust_host(&target, false).await.unwrap();
    assert!(matches!(again, TrustOutcome::AlreadyTrusted { .. }));

    let original = host.host_key();
    let rotated = host.rotate_host_key().unwrap();
    let err = trust.trust_host(&target, false).await.unwrap_err();
    assert!(matches!(err, CoreError::HostKeyConflict { .. }));
    assert!(err.remediation_hint().is_some());

    let replaced = trust.trust_host(&target, true).await.unwrap();
    assert!(matches!(replaced, TrustOutcome::Replaced { .. }));
    assert_ne!(original, rotated);
    assert_eq!(fx.count(AuditAction::HostTrusted), 2);
}

#[tokio::test]
async fn test_trusted_host_can_be_deployed() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("web1", 22).unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", fx.system.public_key));
    let account = fx.account(1, "web1", 0);

    HostTrust::new(fx.store.clone(), fx.transport.clone())
        .trust_host(&ConnectTarget::from_account(&account), false)
        .await
        .unwrap();
    let result = DeployWorkflow::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        fx.fleet(),
    )
    .deploy(&account)
    .await;

    assert!(result.is_ok(), "{:?}", result.error);
}

#[tokio::test]
async fn test_trust_host_unreachable() {
    let fx = Fixture::new();
    let trust = HostTrust::new(fx.store.clone(), fx.transport.clone());

    let err = trust
        .trust_host(&ConnectTarget::new("nowhere", 22, USER), false)
        .await
        .unwrap_err();

    assert!(err.is_unreachable());
    assert!(fx.store.audit_entries().is_empty());
}
