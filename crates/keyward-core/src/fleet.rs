//! Concurrent per-account fan-out

use std::future::Future;
use std::time::Duration;

use keyward_model::Account;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::results::{BatchSummary, Outcome};

/// Runs one task per account and collects exactly one result per account
#[derive(Debug, Clone, Copy, Default)]
pub struct FleetRunner {
    task_deadline: Option<Duration>,
}

impl FleetRunner {
    #[must_use]
    pub fn new(task_deadline: Option<Duration>) -> Self {
        Self { task_deadline }
    }

    #[must_use]
    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline
    }

    /// Run `operation` for every account concurrently
    ///
    /// Results come back in input order. A panicking task and a task that
    /// misses the deadline each become an error result for that account
    /// only; siblings keep running.
    ///
    /// A task past its deadline is detached, not aborted. Dropping it at an
    /// arbitrary await could stop a deploy between parking the old file and
    /// renaming the new one into place. The transport timeouts still bound
    /// every remote step, so a detached task finishes or fails on its own.
    pub async fn run<R, F, Fut>(&self, accounts: Vec<Account>, operation: F) -> Vec<R>
    where
        R: Outcome,
        F: Fn(Account) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.run_with(accounts, operation, R::from_failure).await
    }

    /// [`Self::run`] with `on_failure` building the result for an account
    /// whose task panicked, timed out or vanished
    pub async fn run_with<R, F, Fut, E>(
        &self,
        accounts: Vec<Account>,
        operation: F,
        on_failure: E,
    ) -> Vec<R>
    where
        R: Outcome,
        F: Fn(Account) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        E: Fn(&Account, CoreError) -> R + Clone + Send + Sync + 'static,
    {
        let total = accounts.len();
        if total == 0 {
            return Vec::new();
        }

        info!(total, deadline = ?self.task_deadline, "starting fleet run");

        let (tx, mut rx) = mpsc::channel::<(usize, R)>(total);

        for (index, account) in accounts.iter().cloned().enumerate() {
            let tx = tx.clone();
            let operation = operation.clone();
            let on_failure = on_failure.clone();
            let deadline = self.task_deadline;

            tokio::spawn(async move {
                let result = supervise(account, operation, on_failure, deadline).await;
                if tx.send((index, result)).await.is_err() {
                    debug!(index, "fleet result receiver dropped");
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
        for _ in 0..total {
            match rx.recv().await {
                Some((index, result)) => slots[index] = Some(result),
                None => break,
            }
        }

        let results: Vec<R> = slots
            .into_iter()
            .zip(&accounts)
            .map(|(slot, account)| {
                slot.unwrap_or_else(|| {
                    on_failure(
                        account,
                        CoreError::TaskFailed {
                            account: account.target(),
                            reason: "task ended without a result".to_string(),
                        },
                    )
                })
            })
            .collect();

        let summary = BatchSummary::from_results(&results);
        info!(%summary, "fleet run finished");
        results
    }
}

async fn supervise<R, F, Fut, E>(
    account: Account,
    operation: F,
    on_failure: E,
    deadline: Option<Duration>,
) -> R
where
    R: Outcome,
    F: Fn(Account) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    E: Fn(&Account, CoreError) -> R,
{
    let mut handle = tokio::spawn(operation(account.clone()));

    let joined = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // Dropping the handle detaches the task
                warn!(account = %account.target(), ?deadline, "account task timed out, leaving it to finish in the background");
                return on_failure(
                    &account,
                    CoreError::Timeout {
                        account: account.target(),
                        after: deadline,
                    },
                );
            }
        },
        None => handle.await,
    };

    joined.unwrap_or_else(|e| {
        error!(account = %account.target(), error = %e, "account task panicked");
        on_failure(
            &account,
            CoreError::TaskFailed {
                account: account.target(),
                reason: e.to_string(),
            },
        )
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use keyward_model::{AccountId, NewAccount};

    use super::*;
    use crate::results::{AuditMode, AuditResult, DeployResult};

    fn accounts(n: i64) -> Vec<Account> {
        (1..=n)
            .map(|id| NewAccount::new("deploy", format!("web{id}")).into_account(AccountId(id)))
            .collect()
    }

    #[tokio::test]
    async fn test_one_result_per_account_in_order() {
        let results: Vec<DeployResult> = FleetRunner::default()
            .run(accounts(4), |account| async move {
                DeployResult::deployed(&account, 1, account.hostname.clone())
            })
            .await;

        let hosts: Vec<_> = results.iter().map(|r| r.key_hash.clone().unwrap()).collect();
        assert_eq!(hosts, vec!["web1", "web2", "web3", "web4"]);
    }

    #[tokio::test]
    async fn test_panic_becomes_error_result() {
        let results: Vec<DeployResult> = FleetRunner::default()
            .run(accounts(3), |account| async move {
                assert!(account.id != AccountId(2), "boom");
                DeployResult::deployed(&account, 1, String::new())
            })
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1].error,
            Some(CoreError::TaskFailed { .. })
        ));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_deadline_only_hits_slow_account() {
        let runner = FleetRunner::new(Some(Duration::from_millis(100)));

        let results: Vec<DeployResult> = runner
            .run(accounts(5), |account| async move {
                if account.id == AccountId(3) {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                DeployResult::deployed(&account, 1, String::new())
            })
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
        assert!(results[2].error.as_ref().unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_late_task_is_not_cancelled() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let runner = FleetRunner::new(Some(Duration::from_millis(50)));

        let results: Vec<DeployResult> = runner
            .run(accounts(1), move |account| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    flag.store(true, Ordering::SeqCst);
                    DeployResult::deployed(&account, 1, String::new())
                }
            })
            .await;

        assert!(results[0].error.as_ref().unwrap().is_timeout());
        assert!(!finished.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_builder_keeps_audit_mode() {
        let runner = FleetRunner::new(Some(Duration::from_millis(50)));

        let results: Vec<AuditResult> = runner
            .run_with(
                accounts(2),
                |account| async move {
                    if account.id == AccountId(2) {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    AuditResult::in_sync(&account, AuditMode::Serial)
                },
                |account, error| AuditResult::failed(account, AuditMode::Serial, error),
            )
            .await;

        assert!(results[0].error.is_none());
        assert_eq!(results[1].mode, AuditMode::Serial);
        assert!(results[1].error.as_ref().unwrap().is_timeout());
    }

    #[tokio::test]
    async fn test_empty_fleet() {
        let results: Vec<DeployResult> = FleetRunner::default()
            .run(Vec::new(), |account| async move {
                DeployResult::skip(&account)
            })
            .await;

        assert!(results.is_empty());
    }
}
