//! QueueEngine - 次に実行するタスクの選択
//!
//! # フロー（1 トランザクション）
//! 1. 最も急ぐ mutex key を選ぶ（priority desc, created asc）
//! 2. key を try-lock し、その key の eligible な行を `SKIP LOCKED` で取る
//! 3. 先頭行の handler から strategy を解決し、兄弟行を処理する
//!    （FIRST/LAST: CANCELLED, UNIQUE: BLOCKED）
//! 4. 選ばれたタスクを PROGRESS にして commit
//!
//! key がロック済み、または既に実行中のタスクがあって何も選べなかった場合は、
//! 同じトランザクションのまま次の key に進みます。

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{
    ConcurrencyStrategy, QueueEntry, Result, Task, TaskId, TaskStatus,
};
use crate::ports::{Candidate, Clock, StoreTx, TaskStore};
use crate::typed::Registry;

/// What happened to a sibling of the selected entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingAction {
    /// Task CANCELLED, entry deleted.
    Cancelled,
    /// Task BLOCKED, entry kept until the selected task finishes.
    Blocked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiblingOutcome {
    pub entry: QueueEntry,
    pub action: SiblingAction,
}

/// The entry picked for execution, with its task already PROGRESS.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub entry: QueueEntry,
    pub task: Task,
    pub strategy: ConcurrencyStrategy,
    pub siblings: Vec<SiblingOutcome>,
}

impl Selection {
    pub fn mutex(&self) -> &str {
        &self.entry.mutex
    }
}

/// Outcome of applying a strategy to one mutex group.
#[derive(Debug, Default)]
struct GroupPlan {
    selected: Option<Candidate>,
    cancelled: Vec<Candidate>,
    blocked: Vec<Candidate>,
}

/// Applies `strategy` to the eligible rows of one mutex key.
///
/// `group` must be in selection order. `in_flight` tells whether the key
/// already has a PROGRESS task.
fn plan_group(
    strategy: ConcurrencyStrategy,
    mut group: Vec<Candidate>,
    in_flight: bool,
) -> GroupPlan {
    if group.is_empty() {
        return GroupPlan::default();
    }

    if in_flight && strategy.is_coordinated() {
        return match strategy {
            ConcurrencyStrategy::First => GroupPlan {
                cancelled: group,
                ..GroupPlan::default()
            },
            _ => GroupPlan {
                blocked: group,
                ..GroupPlan::default()
            },
        };
    }

    match strategy {
        ConcurrencyStrategy::Any => GroupPlan {
            selected: Some(group.swap_remove(0)),
            ..GroupPlan::default()
        },
        ConcurrencyStrategy::First => {
            let selected = group.remove(0);
            GroupPlan {
                selected: Some(selected),
                cancelled: group,
                blocked: Vec::new(),
            }
        }
        ConcurrencyStrategy::Last => {
            let top = group[0].entry.priority;
            // Rows are sorted by creation within a tier, so the newest row of
            // the top tier is the last one carrying that priority.
            let idx = group
                .iter()
                .rposition(|c| c.entry.priority == top)
                .unwrap_or(0);
            let selected = group.remove(idx);
            GroupPlan {
                selected: Some(selected),
                cancelled: group,
                blocked: Vec::new(),
            }
        }
        ConcurrencyStrategy::Unique => {
            let selected = group.remove(0);
            GroupPlan {
                selected: Some(selected),
                cancelled: Vec::new(),
                blocked: group,
            }
        }
    }
}

/// QueueEngine は eligible なエントリから 1 件を選び PROGRESS にする
pub struct QueueEngine {
    store: Arc<dyn TaskStore>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<Registry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    /// Picks the next task to run, or `None` when nothing is eligible.
    ///
    /// Sibling cancellation/blocking and the PROGRESS transition are
    /// committed together; on any store error nothing is changed.
    pub async fn select_next(&self) -> Result<Option<Selection>> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let mut skip: Vec<String> = Vec::new();

        loop {
            let Some(mutex) = tx.next_mutex(now, &skip).await? else {
                // Groups held back because of an in-flight task still need
                // their BLOCKED/CANCELLED writes persisted.
                tx.commit().await?;
                return Ok(None);
            };
            skip.push(mutex.clone());

            if !tx.try_lock_mutex(&mutex).await? {
                debug!(%mutex, "mutex held by another worker, skipping");
                continue;
            }

            let group = tx.lock_group(&mutex, now).await?;
            let Some(head) = group.first() else {
                continue;
            };

            let strategy = self
                .registry
                .resolve(&head.task.handler)
                .map(|proxy| proxy.strategy())
                .unwrap_or(ConcurrencyStrategy::Any);
            let in_flight = strategy.is_coordinated() && tx.has_in_flight(&mutex).await?;

            let plan = plan_group(strategy, group, in_flight);
            let siblings = apply_siblings(&mut *tx, &plan, now).await?;

            let Some(Candidate { entry, mut task }) = plan.selected else {
                debug!(%mutex, %strategy, held = siblings.len(), "mutex already in flight");
                continue;
            };

            tx.set_status(&[task.id], TaskStatus::Progress, now).await?;
            tx.commit().await?;

            task.status = TaskStatus::Progress;
            task.updated = now;

            info!(
                task_id = %task.id,
                handler = %task.handler,
                %mutex,
                %strategy,
                priority = entry.priority,
                retries = entry.retries,
                "task selected"
            );

            return Ok(Some(Selection {
                entry,
                task,
                strategy,
                siblings,
            }));
        }
    }
}

async fn apply_siblings(
    tx: &mut dyn StoreTx,
    plan: &GroupPlan,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<SiblingOutcome>> {
    let mut outcomes = Vec::with_capacity(plan.cancelled.len() + plan.blocked.len());

    if !plan.cancelled.is_empty() {
        let ids: Vec<TaskId> = plan.cancelled.iter().map(|c| c.task.id).collect();
        let entries: Vec<_> = plan.cancelled.iter().map(|c| c.entry.id).collect();
        tx.set_status(&ids, TaskStatus::Cancelled, now).await?;
        tx.delete_entries(&entries).await?;
        for c in &plan.cancelled {
            info!(task_id = %c.task.id, mutex = %c.entry.mutex, "sibling cancelled");
            outcomes.push(SiblingOutcome {
                entry: c.entry.clone(),
                action: SiblingAction::Cancelled,
            });
        }
    }

    if !plan.blocked.is_empty() {
        let ids: Vec<TaskId> = plan.blocked.iter().map(|c| c.task.id).collect();
        tx.set_status(&ids, TaskStatus::Blocked, now).await?;
        for c in &plan.blocked {
            debug!(task_id = %c.task.id, mutex = %c.entry.mutex, "sibling blocked");
            outcomes.push(SiblingOutcome {
                entry: c.entry.clone(),
                action: SiblingAction::Blocked,
            });
        }
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntryId, HandlerKey, NewEntry, Payload};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use crate::typed::TaskOptions;
    use crate::typed::handler::testing::EchoHandler;
    use chrono::{DateTime, Duration, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    fn candidate(id: i64, priority: i32, created: DateTime<Utc>) -> Candidate {
        let task_id = TaskId::from_ulid(Ulid::new());
        Candidate {
            entry: NewEntry {
                task_id,
                priority,
                mutex: "m".into(),
                created,
            }
            .into_entry(EntryId::new(id)),
            task: Task::new(task_id, "t", HandlerKey::new("h"), Payload::new(), created),
        }
    }

    /// Three rows in selection order: (p=5, t0), (p=5, t1), (p=1, t2).
    fn group() -> Vec<Candidate> {
        let t0 = Utc::now();
        vec![
            candidate(1, 5, t0),
            candidate(2, 5, t0 + Duration::seconds(1)),
            candidate(3, 1, t0 + Duration::seconds(2)),
        ]
    }

    fn ids(cs: &[Candidate]) -> Vec<i64> {
        cs.iter().map(|c| c.entry.id.get()).collect()
    }

    #[rstest]
    #[case::any(ConcurrencyStrategy::Any, Some(1), vec![], vec![])]
    #[case::first(ConcurrencyStrategy::First, Some(1), vec![2, 3], vec![])]
    #[case::last(ConcurrencyStrategy::Last, Some(2), vec![1, 3], vec![])]
    #[case::unique(ConcurrencyStrategy::Unique, Some(1), vec![], vec![2, 3])]
    fn plan_without_in_flight(
        #[case] strategy: ConcurrencyStrategy,
        #[case] selected: Option<i64>,
        #[case] cancelled: Vec<i64>,
        #[case] blocked: Vec<i64>,
    ) {
        let plan = plan_group(strategy, group(), false);
        assert_eq!(plan.selected.map(|c| c.entry.id.get()), selected);
        assert_eq!(ids(&plan.cancelled), cancelled);
        assert_eq!(ids(&plan.blocked), blocked);
    }

    #[rstest]
    #[case::first(ConcurrencyStrategy::First, vec![1, 2, 3], vec![])]
    #[case::last(ConcurrencyStrategy::Last, vec![], vec![1, 2, 3])]
    #[case::unique(ConcurrencyStrategy::Unique, vec![], vec![1, 2, 3])]
    fn plan_with_in_flight_selects_nothing(
        #[case] strategy: ConcurrencyStrategy,
        #[case] cancelled: Vec<i64>,
        #[case] blocked: Vec<i64>,
    ) {
        let plan = plan_group(strategy, group(), true);
        assert!(plan.selected.is_none());
        assert_eq!(ids(&plan.cancelled), cancelled);
        assert_eq!(ids(&plan.blocked), blocked);
    }

    #[test]
    fn any_ignores_in_flight() {
        let plan = plan_group(ConcurrencyStrategy::Any, group(), true);
        assert_eq!(plan.selected.map(|c| c.entry.id.get()), Some(1));
    }

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: FixedClock,
        engine: QueueEngine,
    }

    fn fixture(strategy: ConcurrencyStrategy) -> Fixture {
        let mut registry = Registry::new();
        registry.register("job", EchoHandler, TaskOptions::new().strategy(strategy));
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = FixedClock::new(Utc::now());
        let engine = QueueEngine::new(store.clone(), Arc::new(registry), Arc::new(clock.clone()));
        Fixture {
            store,
            clock,
            engine,
        }
    }

    impl Fixture {
        async fn enqueue(&self, mutex: &str, priority: i32) -> TaskId {
            let now = self.clock.now();
            let task = Task::new(
                TaskId::from_ulid(Ulid::new()),
                "job",
                HandlerKey::new("job"),
                Payload::new(),
                now,
            );
            let mut tx = self.store.begin().await.unwrap();
            tx.insert_task(&task).await.unwrap();
            tx.insert_entry(NewEntry {
                task_id: task.id,
                priority,
                mutex: mutex.into(),
                created: now,
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
            self.clock.advance(Duration::milliseconds(1));
            task.id
        }

        async fn status(&self, id: TaskId) -> TaskStatus {
            let mut tx = self.store.begin().await.unwrap();
            tx.get_task(id, false).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn empty_queue_selects_nothing() {
        let f = fixture(ConcurrencyStrategy::Any);
        assert!(f.engine.select_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_within_the_same_priority() {
        let f = fixture(ConcurrencyStrategy::Any);
        let a = f.enqueue("a", 0).await;
        let b = f.enqueue("b", 0).await;

        let first = f.engine.select_next().await.unwrap().unwrap();
        let second = f.engine.select_next().await.unwrap().unwrap();
        assert_eq!(first.task.id, a);
        assert_eq!(second.task.id, b);
        assert!(f.engine.select_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn higher_priority_key_goes_first() {
        let f = fixture(ConcurrencyStrategy::Any);
        let low = f.enqueue("low", 1).await;
        let high = f.enqueue("high", 9).await;

        let selected = f.engine.select_next().await.unwrap().unwrap();
        assert_eq!(selected.task.id, high);
        assert_eq!(selected.task.status, TaskStatus::Progress);
        assert_eq!(f.status(high).await, TaskStatus::Progress);
        assert_eq!(f.status(low).await, TaskStatus::New);
    }

    #[tokio::test]
    async fn first_cancels_later_siblings() {
        let f = fixture(ConcurrencyStrategy::First);
        let t1 = f.enqueue("k", 0).await;
        let t2 = f.enqueue("k", 0).await;
        let t3 = f.enqueue("k", 0).await;

        let selected = f.engine.select_next().await.unwrap().unwrap();
        assert_eq!(selected.task.id, t1);
        assert_eq!(selected.siblings.len(), 2);
        assert_eq!(f.status(t2).await, TaskStatus::Cancelled);
        assert_eq!(f.status(t3).await, TaskStatus::Cancelled);

        let mut tx = f.store.begin().await.unwrap();
        assert!(tx.entry_for_task(t2).await.unwrap().is_none());
        assert!(tx.entry_for_task(t3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_keeps_the_newest_entry() {
        let f = fixture(ConcurrencyStrategy::Last);
        let t1 = f.enqueue("k", 0).await;
        let t2 = f.enqueue("k", 0).await;

        let selected = f.engine.select_next().await.unwrap().unwrap();
        assert_eq!(selected.task.id, t2);
        assert_eq!(f.status(t1).await, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn unique_blocks_siblings_and_newcomers() {
        let f = fixture(ConcurrencyStrategy::Unique);
        let t1 = f.enqueue("k", 0).await;
        let t2 = f.enqueue("k", 0).await;

        let selected = f.engine.select_next().await.unwrap().unwrap();
        assert_eq!(selected.task.id, t1);
        assert_eq!(f.status(t2).await, TaskStatus::Blocked);

        // Enqueued while t1 is in flight: held back, never started.
        let t3 = f.enqueue("k", 0).await;
        assert!(f.engine.select_next().await.unwrap().is_none());
        assert_eq!(f.status(t3).await, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn in_flight_key_does_not_starve_other_keys() {
        let f = fixture(ConcurrencyStrategy::Unique);
        let busy = f.enqueue("busy", 9).await;
        f.engine.select_next().await.unwrap().unwrap();
        let _late = f.enqueue("busy", 9).await;
        let other = f.enqueue("other", 0).await;

        let selected = f.engine.select_next().await.unwrap().unwrap();
        assert_eq!(selected.task.id, other);
        assert_eq!(f.status(busy).await, TaskStatus::Progress);
    }

    #[tokio::test]
    async fn unregistered_handler_is_selected_as_any() {
        let f = fixture(ConcurrencyStrategy::Unique);
        let now = f.clock.now();
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            "ghost",
            HandlerKey::new("ghost"),
            Payload::new(),
            now,
        );
        let mut tx = f.store.begin().await.unwrap();
        tx.insert_task(&task).await.unwrap();
        tx.insert_entry(NewEntry {
            task_id: task.id,
            priority: 0,
            mutex: "ghost".into(),
            created: now,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let selected = f.engine.select_next().await.unwrap().unwrap();
        assert_eq!(selected.task.id, task.id);
        assert_eq!(selected.strategy, ConcurrencyStrategy::Any);
    }
}
