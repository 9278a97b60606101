//! Bootstrap session reaper
//!
//! [`BootstrapReaper`] collects sessions that can no longer complete. It is
//! driven by [`ReaperActor`], so periodic scans and the final shutdown sweep
//! never overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kameo::actor::{ActorRef, Spawn, WeakActorRef};
use kameo::error::{ActorStopReason, SendError};
use kameo::message::{Context, Message};
use kameo::prelude::*;
use kameo_macros::Reply;
use keyward_deploy::{AtomicFileDeployer, DeployPaths};
use keyward_model::{AuditAction, AuditEntry, BootstrapSession, BootstrapStatus, Store};
use keyward_transport::{TransportFactory, TrustPolicy};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bootstrap::TempKeyCleaner;
use crate::config::BootstrapConfig;
use crate::error::CoreError;

/// Counts from one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Reply)]
pub struct ReapReport {
    /// Sessions selected for reaping
    pub candidates: usize,
    /// Sessions deleted
    pub reaped: usize,
    /// Sessions whose temporary key was removed from the host
    pub keys_removed: usize,
    /// Sessions whose remote cleanup failed (still reaped)
    pub cleanup_failed: usize,
}

/// Cleans up abandoned bootstrap sessions
pub struct BootstrapReaper {
    store: Arc<dyn Store>,
    cleaner: TempKeyCleaner,
    committing_grace: chrono::Duration,
}

impl std::fmt::Debug for BootstrapReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapReaper")
            .field("committing_grace", &self.committing_grace)
            .finish_non_exhaustive()
    }
}

impl BootstrapReaper {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn TransportFactory>,
        paths: DeployPaths,
        config: &BootstrapConfig,
    ) -> Self {
        Self {
            cleaner: TempKeyCleaner::new(
                store.clone(),
                transport,
                AtomicFileDeployer::new(paths),
            ),
            store,
            committing_grace: config.committing_grace(),
        }
    }

    /// Reap sessions that are expired, stuck committing or orphaned at `now`
    ///
    /// # Errors
    /// Returns the store error if sessions cannot be listed
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapReport, CoreError> {
        let grace = self.committing_grace;
        let sessions = self
            .store
            .list_sessions()
            .await?
            .into_iter()
            .filter(|session| session.is_reapable(now, grace))
            .collect();
        Ok(self.reap(sessions, "expired").await)
    }

    /// Reap every open session, regardless of state
    ///
    /// # Errors
    /// Returns the store error if sessions cannot be listed
    pub async fn reap_all(&self) -> Result<ReapReport, CoreError> {
        let sessions = self.store.list_sessions().await?;
        Ok(self.reap(sessions, "shutdown").await)
    }

    async fn reap(&self, sessions: Vec<BootstrapSession>, reason: &str) -> ReapReport {
        let mut report = ReapReport {
            candidates: sessions.len(),
            ..ReapReport::default()
        };
        if sessions.is_empty() {
            debug!(reason, "no bootstrap sessions to reap");
            return report;
        }

        for session in sessions {
            // Only a stored host key is trusted here; the operator is gone.
            let cleanup = self.cleaner.remove(&session, &TrustPolicy::Verify).await;
            let note = match &cleanup {
                Ok(_) => {
                    report.keys_removed += 1;
                    "temporary key removed".to_string()
                }
                Err(e) => {
                    report.cleanup_failed += 1;
                    warn!(session = %session.id, target = %session.target(), error = %e, "could not remove temporary key");
                    format!("remote cleanup failed: {e}")
                }
            };

            if let Err(e) = self.store.delete_session(session.id).await {
                error!(session = %session.id, error = %e, "could not delete reaped session");
                continue;
            }
            report.reaped += 1;

            // An orphaned session already has its BOOTSTRAP_FAILED entry from the
            // workflow that orphaned it
            if session.status() == BootstrapStatus::Orphaned {
                info!(session = %session.id, target = %session.target(), cleanup = %note, "orphaned bootstrap session reaped");
                continue;
            }

            let details = format!(
                "{}: session {} reaped ({reason}, was {}); {note}",
                session.target(),
                session.id,
                session.status()
            );
            if let Err(e) = self
                .store
                .append(AuditEntry::new(AuditAction::BootstrapFailed, details))
                .await
            {
                error!(session = %session.id, error = %e, "could not record reaped session");
            }
        }

        info!(
            reason,
            reaped = report.reaped,
            cleanup_failed = report.cleanup_failed,
            "bootstrap sessions reaped"
        );
        report
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Arguments for spawning a `ReaperActor`
pub struct ReaperActorArgs {
    pub reaper: Arc<BootstrapReaper>,
}

/// Serializes reaper passes through its mailbox
pub struct ReaperActor {
    reaper: Arc<BootstrapReaper>,
    passes: u64,
}

/// Reap sessions that are reapable at `now`
#[derive(Debug, Clone, Copy)]
pub struct ReapExpired {
    pub now: DateTime<Utc>,
}

/// Reap every open session
#[derive(Debug, Clone, Copy)]
pub struct ReapAll;

impl Actor for ReaperActor {
    type Args = ReaperActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "ReaperActor starting");
        Ok(Self {
            reaper: args.reaper,
            passes: 0,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, passes = self.passes, "ReaperActor stopping");
        Ok(())
    }
}

impl Message<ReapExpired> for ReaperActor {
    type Reply = Result<ReapReport, CoreError>;

    async fn handle(
        &mut self,
        msg: ReapExpired,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.passes += 1;
        self.reaper.reap_expired(msg.now).await
    }
}

impl Message<ReapAll> for ReaperActor {
    type Reply = Result<ReapReport, CoreError>;

    async fn handle(&mut self, _msg: ReapAll, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.passes += 1;
        self.reaper.reap_all().await
    }
}

fn flatten<M>(err: SendError<M, CoreError>) -> CoreError
where
    SendError<M, CoreError>: std::fmt::Display,
{
    match err {
        SendError::HandlerError(e) => e,
        other => CoreError::Actor(other.to_string()),
    }
}

/// Running reaper: the actor plus the timer feeding it
pub struct ReaperHandle {
    actor: ActorRef<ReaperActor>,
    ticker: JoinHandle<()>,
}

impl ReaperHandle {
    #[must_use]
    pub fn actor(&self) -> &ActorRef<ReaperActor> {
        &self.actor
    }

    /// Run one pass now
    ///
    /// # Errors
    /// Returns the pass's error or `CoreError::Actor` if the actor is gone
    pub async fn reap_now(&self) -> Result<ReapReport, CoreError> {
        self.actor
            .ask(ReapExpired { now: Utc::now() })
            .await
            .map_err(flatten)
    }

    /// Stop the timer, reap every open session and stop the actor
    ///
    /// # Errors
    /// Returns the final sweep's error; the actor is stopped either way
    pub async fn shutdown(self) -> Result<ReapReport, CoreError> {
        self.ticker.abort();
        let swept = self.actor.ask(ReapAll).await.map_err(flatten);
        if let Err(e) = self.actor.stop_gracefully().await {
            warn!(error = %e, "ReaperActor did not stop cleanly");
        }
        swept
    }
}

/// Spawn the reaper actor and a timer that asks it to scan every `every`
///
/// The first scan runs immediately.
#[must_use]
pub fn spawn_reaper(reaper: Arc<BootstrapReaper>, every: Duration) -> ReaperHandle {
    let actor = ReaperActor::spawn(ReaperActorArgs { reaper });
    let target = actor.clone();

    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match target.ask(ReapExpired { now: Utc::now() }).await {
                Ok(report) if report.reaped > 0 => {
                    debug!(reaped = report.reaped, "periodic reap finished");
                }
                Ok(_) => {}
                Err(SendError::HandlerError(e)) => warn!(error = %e, "periodic reap failed"),
                Err(e) => {
                    debug!(error = %e, "reaper actor gone, stopping timer");
                    break;
                }
            }
        }
    });

    ReaperHandle { actor, ticker }
}

/// Wait for ctrl-c (SIGINT) or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Keep the reaper running until a shutdown signal, then sweep every open session
///
/// # Errors
/// Returns the final sweep's error
pub async fn run_until_shutdown(handle: ReaperHandle) -> Result<ReapReport, CoreError> {
    shutdown_signal().await;
    info!("received shutdown signal, reaping open bootstrap sessions");
    handle.shutdown().await
}

#[cfg(test)]
mod tests {
    use keyward_model::{BootstrapSessionStore, MemoryStore, NewAccount, SecretBytes};
    use keyward_transport::MemoryTransport;

    use super::*;

    fn session(now: DateTime<Utc>, ttl_secs: i64) -> BootstrapSession {
        BootstrapSession::new(
            NewAccount::new("deploy", "web"),
            "ssh-ed25519 AAAAtemp keyward-bootstrap".to_string(),
            SecretBytes::copy_from(b"not a real key"),
            now,
            chrono::Duration::seconds(ttl_secs),
        )
    }

    fn reaper(store: &Arc<MemoryStore>) -> BootstrapReaper {
        let transport = Arc::new(MemoryTransport::new(store.clone()));
        BootstrapReaper::new(
            store.clone(),
            transport,
            DeployPaths::default(),
            &BootstrapConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_reap_expired_leaves_live_sessions() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let live = session(now, 600);
        let stale = session(now - chrono::Duration::seconds(1200), 600);
        store.insert_session(&live).await.unwrap();
        store.insert_session(&stale).await.unwrap();

        let report = reaper(&store).reap_expired(now).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.reaped, 1);
        // Unknown host: cleanup fails but the session is still reaped
        assert_eq!(report.cleanup_failed, 1);
        assert!(store.get_session(live.id).await.unwrap().is_some());
        assert!(store.get_session(stale.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reap_all_takes_everything() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store.insert_session(&session(now, 600)).await.unwrap();
        store.insert_session(&session(now, 600)).await.unwrap();

        let report = reaper(&store).reap_all().await.unwrap();

        assert_eq!(report.reaped, 2);
        assert!(store.list_sessions().await.unwrap().is_empty());
        let failed = store
            .audit_entries()
            .iter()
            .filter(|e| e.action == AuditAction::BootstrapFailed)
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_orphaned_session_is_not_recorded_twice() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut orphan = session(now, 600);
        orphan.transition(BootstrapStatus::Orphaned, now).unwrap();
        store.insert_session(&orphan).await.unwrap();

        let report = reaper(&store).reap_expired(now).await.unwrap();

        assert_eq!(report.reaped, 1);
        assert!(store.get_session(orphan.id).await.unwrap().is_none());
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn test_actor_serves_passes() {
        let store = Arc::new(MemoryStore::new());
        let stale = session(Utc::now() - chrono::Duration::seconds(1200), 600);
        store.insert_session(&stale).await.unwrap();

        let handle = spawn_reaper(Arc::new(reaper(&store)), Duration::from_secs(3600));
        // The timer's first tick may already have taken it
        let first = handle.reap_now().await.unwrap();
        assert!(first.reaped <= 1);

        let swept = handle.shutdown().await.unwrap();
        assert_eq!(swept.reaped, 0);
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
