//! TaskRunner - 選ばれたタスクの実行と結果の反映
//!
//! # フロー
//! 1. task の handler key から handler を解決（未登録なら即 FAILED）
//! 2. 別の tokio task で handler を実行（panic / timeout を捕捉）
//! 3. mutex key をロックし（選択中のワーカーがいれば待つ）、
//!    1 トランザクションで Run の記録・状態遷移・エントリの削除 or 再投入・
//!    同じ mutex key の BLOCKED タスクの解放を行う
//!
//! handler の失敗は Run として記録され、呼び出し元には伝播しません。
//! ストアの失敗だけが `Err` になります。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::engine::Selection;
use crate::domain::{
    Payload, Result, RetryBudget, RetryPolicy, Run, RunError, RunErrorKind, TaskStatus,
};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::typed::{DynHandler, Registry};

pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: Arc<Registry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<Registry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            ids,
            clock,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the selected task and records the outcome.
    pub async fn execute(&self, selection: Selection) -> Result<Run> {
        let Selection { entry, task, .. } = selection;

        let (outcome, budget) = match self.registry.resolve(&task.handler) {
            Ok(proxy) => {
                let outcome = self.invoke(proxy.handler(), task.payload.clone()).await;
                (outcome, proxy.retries().capped(self.retry.ceiling))
            }
            Err(_) => (
                Err(RunError::new(
                    RunErrorKind::Unregistered,
                    format!("no handler registered for {}", task.handler),
                )),
                RetryBudget::Limited(0),
            ),
        };

        let now = self.clock.now();
        let run_id = self.ids.generate_run_id();
        let mut tx = self.store.begin().await?;
        // Wait out a selection that is blocking newcomers of this key, so its
        // BLOCKED rows are visible to unblock_mutex below.
        tx.lock_mutex(&entry.mutex).await?;

        let run = match outcome {
            Ok(output) => {
                let run = Run::success(run_id, task.id, output, now);
                tx.insert_run(&run).await?;
                tx.set_status(&[task.id], TaskStatus::Completed, now).await?;
                tx.delete_entries(&[entry.id]).await?;
                info!(task_id = %task.id, handler = %task.handler, "task completed");
                run
            }
            Err(error) => {
                let run = Run::failure(run_id, task.id, &error, now);
                tx.insert_run(&run).await?;

                if budget.allows(entry.retries) {
                    let not_before = self.backoff_until(entry.retries, now);
                    tx.set_status(&[task.id], TaskStatus::Retry, now).await?;
                    tx.requeue_entry(entry.id, entry.retries + 1, not_before)
                        .await?;
                    warn!(
                        task_id = %task.id,
                        handler = %task.handler,
                        retries = entry.retries + 1,
                        ?not_before,
                        %error,
                        "task failed, will retry"
                    );
                } else {
                    tx.set_status(&[task.id], TaskStatus::Failed, now).await?;
                    tx.delete_entries(&[entry.id]).await?;
                    warn!(
                        task_id = %task.id,
                        handler = %task.handler,
                        retries = entry.retries,
                        %error,
                        "task failed permanently"
                    );
                }
                run
            }
        };

        let unblocked = tx.unblock_mutex(&entry.mutex, now).await?;
        tx.commit().await?;

        if !unblocked.is_empty() {
            info!(mutex = %entry.mutex, count = unblocked.len(), "unblocked waiting tasks");
        }
        Ok(run)
    }

    async fn invoke(
        &self,
        handler: Arc<dyn DynHandler>,
        payload: Payload,
    ) -> std::result::Result<serde_json::Value, RunError> {
        let handle = tokio::spawn(async move { handler.call(payload).await });
        let abort = handle.abort_handle();

        let joined = match self.timeout {
            None => handle.await,
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(RunError::new(
                        RunErrorKind::Timeout,
                        format!("handler exceeded {limit:?}"),
                    ));
                }
            },
        };

        match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(RunError::new(
                RunErrorKind::Panic,
                panic_message(err.into_panic()),
            )),
            Err(err) => Err(RunError::new(RunErrorKind::Handler, err.to_string())),
        }
    }

    fn backoff_until(&self, retries: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.retry.next_delay(retries);
        if delay.is_zero() {
            return None;
        }
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
