mod common;

use std::time::Duration;

use chrono::Utc;
use common::{Fixture, USER};
use keyward_core::*;
use keyward_deploy::DeployPaths;
use keyward_model::{
    AccountStore, AuditAction, BootstrapSessionStore, BootstrapStatus, KnownHostStore, NewAccount,
    StoreError,
};
use keyward_transport::{FailureKind, TrustPolicy, generate_ephemeral_keypair};

fn workflow(fx: &Fixture, config: BootstrapConfig) -> BootstrapWorkflow {
    BootstrapWorkflow::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        config,
    )
}

fn reaper(fx: &Fixture) -> BootstrapReaper {
    BootstrapReaper::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        &BootstrapConfig::default(),
    )
}

fn key_data(line: &str) -> &str {
    line.split_whitespace().nth(1).unwrap()
}

#[tokio::test]
async fn test_begin_issues_ticket() {
    let fx = Fixture::new();
    let bootstrap = workflow(&fx, BootstrapConfig::default());

    let before = Utc::now();
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();

    assert_eq!(ticket.target, "deploy@db1");
    assert!(ticket.public_key.starts_with("ssh-ed25519 "));
    assert!(ticket.expires_at >= before + chrono::Duration::minutes(15));

    let session = fx.store.get_session(ticket.session_id).await.unwrap().unwrap();
    assert_eq!(session.status(), BootstrapStatus::Active);
    assert_eq!(session.temp_public_key, ticket.public_key);

    // The ticket carries no private material
    let json = serde_json::to_string(&ticket).unwrap();
    assert!(!json.contains("PRIVATE KEY"));
}

#[tokio::test]
async fn test_begin_rejects_managed_account() {
    let fx = Fixture::new();
    fx.account(1, "db1", 3);

    let err = workflow(&fx, BootstrapConfig::default())
        .begin(NewAccount::new(USER, "db1"))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Store(StoreError::Conflict(_))));
    assert!(fx.store.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bootstrap_on_configured_port() {
    let fx = Fixture::new();
    fx.account(1, "db1", 3);
    let host = fx.transport.add_host("db1", 2222).unwrap();
    let config = EngineConfig {
        transport: TransportConfig {
            default_port: 2222,
            ..TransportConfig::default()
        },
        ..EngineConfig::default()
    };
    let bootstrap = workflow(&fx, config.bootstrap.clone());

    // Same login on another port is a different account
    let ticket = bootstrap
        .begin(config.transport.new_account(USER, "db1"))
        .await
        .unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", ticket.public_key));
    let account = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap();

    assert_eq!(account.port, 2222);
    assert_eq!(
        fx.store.known_host_key("db1:2222").await.unwrap(),
        Some(host.host_key())
    );

    let again = bootstrap
        .begin(config.transport.new_account(USER, "db1"))
        .await
        .unwrap_err();
    assert!(matches!(again, CoreError::Store(StoreError::Conflict(_))));
}

#[tokio::test]
async fn test_complete_with_tofu() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("db1", 22).unwrap();
    let global = fx.public_key(20, true);
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    let manual = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABmanual admin@console\n";
    host.set_authorized_keys(USER, &format!("{manual}{}\n", ticket.public_key));

    let account = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap();

    assert_eq!(account.serial, 3);
    assert!(!account.key_hash.is_empty());
    assert_eq!(
        fx.store.get_account(account.id).await.unwrap(),
        Some(account.clone())
    );

    // The managed block replaces the whole file
    let content = host.authorized_keys(USER).unwrap();
    assert!(!content.contains(manual.trim_end()));
    assert!(content.starts_with("# keyward:begin serial=3\n"));
    assert!(content.ends_with("# keyward:end\n"));
    assert!(content.contains(&global.authorized_line()));
    assert!(!content.contains(key_data(&ticket.public_key)));
    assert_eq!(host.open_sessions(), 0);

    assert_eq!(
        fx.store.known_host_key("db1:22").await.unwrap(),
        Some(host.host_key())
    );
    assert!(fx.store.get_session(ticket.session_id).await.unwrap().is_none());
    assert_eq!(fx.count(AuditAction::BootstrapCompleted), 1);
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 0);
}

#[tokio::test]
async fn test_bootstrapped_account_is_manageable() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("db1", 22).unwrap();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", ticket.public_key));
    let account = bootstrap
        .complete(ticket.session_id, TrustPolicy::Pinned(host.host_key()))
        .await
        .unwrap();

    let audit = AuditEngine::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        fx.fleet(),
    )
    .audit(&account, AuditMode::Strict)
    .await;
    assert!(audit.error.is_none(), "{:?}", audit.error);

    let key = fx.assigned_key(10, account.id);
    let deployed = DeployWorkflow::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        fx.fleet(),
    )
    .deploy(&account)
    .await;
    assert!(deployed.is_ok(), "{:?}", deployed.error);
    assert!(host.authorized_keys(USER).unwrap().contains(&key.authorized_line()));
}

#[tokio::test]
async fn test_bootstrap_over_existing_lines_audits_clean() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("db1", 22).unwrap();
    fx.public_key(20, true);
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    host.set_authorized_keys(
        USER,
        &format!(
            "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABmanual admin@console\n{}\n",
            ticket.public_key
        ),
    );
    let account = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap();

    let audit = AuditEngine::new(
        fx.store.clone(),
        fx.transport.clone(),
        DeployPaths::default(),
        fx.fleet(),
    )
    .audit(&account, AuditMode::Strict)
    .await;

    assert!(audit.error.is_none(), "{:?}", audit.error);
    assert_eq!(fx.count(AuditAction::AuditDrift), 0);
    assert!(!fx.store.get_account(account.id).await.unwrap().unwrap().is_dirty);
}

#[tokio::test]
async fn test_verify_never_trusts_new_host() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("db1", 22).unwrap();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", ticket.public_key));

    let err = bootstrap
        .complete(ticket.session_id, TrustPolicy::Verify)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::HostKeyUnknown));
    assert!(fx.store.known_host_key("db1:22").await.unwrap().is_none());
    assert!(fx.store.list_accounts().await.unwrap().is_empty());
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 1);
}

#[tokio::test]
async fn test_pinned_mismatch_blocks() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("db1", 22).unwrap();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", ticket.public_key));
    let impostor = generate_ephemeral_keypair("impostor").unwrap().public_key;

    let err = bootstrap
        .complete(ticket.session_id, TrustPolicy::Pinned(impostor))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::HostKeyMismatch));
    assert!(fx.store.list_accounts().await.unwrap().is_empty());
    // The host was never reached, so the temporary key is still there
    assert!(host.authorized_keys(USER).unwrap().contains(key_data(&ticket.public_key)));
    let session = fx.store.get_session(ticket.session_id).await.unwrap().unwrap();
    assert_eq!(session.status(), BootstrapStatus::Orphaned);
}

#[tokio::test]
async fn test_uninstalled_temp_key_orphans_session() {
    let fx = Fixture::new();
    fx.transport.add_host("db1", 22).unwrap();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();

    let err = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::AuthenticationFailure));
    assert!(err.remediation_hint().is_some());
    assert!(fx.store.list_accounts().await.unwrap().is_empty());
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 1);

    let session = fx.store.get_session(ticket.session_id).await.unwrap().unwrap();
    assert_eq!(session.status(), BootstrapStatus::Orphaned);

    let again = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap_err();
    assert!(matches!(again, CoreError::SessionNotActive { .. }));

    // Reaping the orphan does not record the same failure twice
    let report = reaper(&fx).reap_expired(Utc::now()).await.unwrap();
    assert_eq!(report.reaped, 1);
    assert!(fx.store.list_sessions().await.unwrap().is_empty());
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 1);
}

#[tokio::test]
async fn test_failed_deploy_removes_temp_key() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("db1", 22).unwrap();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", ticket.public_key));
    host.set_rename_failures(USER, ".ssh/authorized_keys", 1);

    let err = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Deploy(_)));
    assert!(fx.store.list_accounts().await.unwrap().is_empty());
    let content = host.authorized_keys(USER).unwrap();
    assert!(!content.contains(key_data(&ticket.public_key)));
    assert!(!content.contains("# keyward:begin"));
    assert!(fx.store.get_session(ticket.session_id).await.unwrap().is_none());
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 1);
    assert_eq!(fx.count(AuditAction::BootstrapCompleted), 0);
}

#[tokio::test]
async fn test_completed_session_is_gone() {
    let fx = Fixture::new();
    let host = fx.transport.add_host("db1", 22).unwrap();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", ticket.public_key));
    bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap();

    let err = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Store(StoreError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_expired_session_is_reaped_once() {
    let fx = Fixture::new();
    let host = fx.trusted_host("db1").await;
    let config = BootstrapConfig {
        session_ttl_secs: 0,
        ..BootstrapConfig::default()
    };
    let bootstrap = workflow(&fx, config);
    let ticket = bootstrap.begin(NewAccount::new(USER, "db1")).await.unwrap();
    host.set_authorized_keys(USER, &format!("{}\n", ticket.public_key));

    let err = bootstrap
        .complete(ticket.session_id, TrustPolicy::Tofu)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SessionExpired(_)));
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 0);

    let reaper = reaper(&fx);
    let first = reaper.reap_expired(Utc::now()).await.unwrap();
    let second = reaper.reap_expired(Utc::now()).await.unwrap();

    assert_eq!(first.reaped, 1);
    assert_eq!(first.keys_removed, 1);
    assert_eq!(second.reaped, 0);
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 1);
    assert!(fx.store.list_accounts().await.unwrap().is_empty());
    assert!(fx.store.list_sessions().await.unwrap().is_empty());
    assert!(!host.authorized_keys(USER).unwrap().contains(key_data(&ticket.public_key)));
}

#[tokio::test]
async fn test_unreachable_host_does_not_block_reaping() {
    let fx = Fixture::new();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    bootstrap.begin(NewAccount::new(USER, "gone")).await.unwrap();

    let report = reaper(&fx)
        .reap_expired(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(report.reaped, 1);
    assert_eq!(report.cleanup_failed, 1);
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 1);
}

#[tokio::test]
async fn test_reaper_actor_sweeps_on_shutdown() {
    let fx = Fixture::new();
    let bootstrap = workflow(&fx, BootstrapConfig::default());
    for host in ["db1", "db2", "db3"] {
        bootstrap.begin(NewAccount::new(USER, host)).await.unwrap();
    }

    let handle = spawn_reaper(std::sync::Arc::new(reaper(&fx)), Duration::from_secs(3600));
    let periodic = handle.reap_now().await.unwrap();
    assert_eq!(periodic.reaped, 0);

    let swept = handle.shutdown().await.unwrap();

    assert_eq!(swept.reaped, 3);
    assert!(fx.store.list_sessions().await.unwrap().is_empty());
    assert_eq!(fx.count(AuditAction::BootstrapFailed), 3);
}
