//! Group sequencing: a grouped task only runs once its predecessor is processed.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::warn;

use taskforge_core::{Task, TaskId, time};

use crate::store::{Reschedule, TaskStore, TaskStoreError};

/// Outcome of the sequencing check for a leased grouped task.
#[derive(Debug, Clone, PartialEq)]
pub enum Sequencing {
    /// Run now, feeding the predecessor's result (if any) to the processor.
    Ready { previous_result: Option<JsonValue> },
    /// An earlier task of the group is unfinished; the task was pushed back.
    Blocked {
        blocked_by: TaskId,
        until: chrono::DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct GroupSequencer<S> {
    store: S,
    group_interval: Duration,
}

impl<S: TaskStore> GroupSequencer<S> {
    pub fn new(store: S, group_interval: Duration) -> Self {
        Self {
            store,
            group_interval,
        }
    }

    /// Check `task` against its predecessor, rescheduling it when blocked.
    ///
    /// A blocked task gets its lease released and its retries cleared; waiting
    /// on a predecessor is not a failure.
    pub async fn check(&self, task: &Task, group: &str) -> Result<Sequencing, TaskStoreError> {
        let predecessor = self.store.find_predecessor(group, &task.id).await?;

        let predecessor = match predecessor {
            None => {
                return Ok(Sequencing::Ready {
                    previous_result: None,
                });
            }
            Some(p) if p.is_processed() => {
                return Ok(Sequencing::Ready {
                    previous_result: p.result,
                });
            }
            Some(p) => p,
        };

        // A parked predecessor has no meaningful start; poll again after the interval.
        let now = Utc::now();
        let base = if predecessor.is_parked() {
            now
        } else {
            now.max(predecessor.start_at)
        };
        let until = time::after(base, self.group_interval);
        let rescheduled = self
            .store
            .reschedule(
                &task.id,
                Reschedule::at(until).releasing_lease().clearing_retries(),
            )
            .await?;

        if rescheduled.is_none() {
            warn!(task_id = %task.id, group, "blocked task vanished before it could be rescheduled");
        }

        Ok(Sequencing::Blocked {
            blocked_by: predecessor.id,
            until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;
    use serde_json::json;
    use std::sync::Arc;

    fn grouped(id: &str, offset_secs: i64) -> Task {
        let created = Utc::now() - chrono::Duration::seconds(100 - offset_secs);
        Task::new(TaskId::new(id).unwrap(), "step", json!(id), created).with_group("g")
    }

    async fn setup() -> (Arc<InMemoryTaskStore>, GroupSequencer<Arc<InMemoryTaskStore>>) {
        let store = InMemoryTaskStore::arc();
        for (id, offset) in [("g1", 0), ("g2", 1)] {
            store.insert_unique(grouped(id, offset)).await.unwrap();
        }
        let sequencer = GroupSequencer::new(store.clone(), Duration::from_secs(5));
        (store, sequencer)
    }

    #[tokio::test]
    async fn first_member_is_ready_without_previous_result() {
        let (store, sequencer) = setup().await;
        let g1 = store.all().unwrap().remove(0);
        assert_eq!(
            sequencer.check(&g1, "g").await.unwrap(),
            Sequencing::Ready {
                previous_result: None
            }
        );
    }

    #[tokio::test]
    async fn successor_of_processed_member_gets_its_result() {
        let (store, sequencer) = setup().await;
        let g1 = TaskId::new("g1").unwrap();
        store.mark_processed(&g1, json!({"step": 1})).await.unwrap();

        let g2 = store.all().unwrap().remove(1);
        assert_eq!(
            sequencer.check(&g2, "g").await.unwrap(),
            Sequencing::Ready {
                previous_result: Some(json!({"step": 1}))
            }
        );
    }

    #[tokio::test]
    async fn unfinished_predecessor_blocks_and_pushes_back() {
        let (store, sequencer) = setup().await;
        let g2_id = TaskId::new("g2").unwrap();
        let g1_start = Utc::now() + chrono::Duration::minutes(10);
        store
            .update_with(&TaskId::new("g1").unwrap(), |t| t.start_at = g1_start)
            .unwrap();
        let g2 = store
            .update_with(&g2_id, |t| {
                t.retries = 3;
                t.locked_at = Utc::now();
            })
            .unwrap()
            .unwrap();

        let outcome = sequencer.check(&g2, "g").await.unwrap();
        let expected_until = g1_start + chrono::Duration::seconds(5);
        assert_eq!(
            outcome,
            Sequencing::Blocked {
                blocked_by: TaskId::new("g1").unwrap(),
                until: expected_until,
            }
        );

        let g2 = store
            .find(&crate::store::TaskFilter::by_id(g2_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(g2.start_at, expected_until);
        assert_eq!(g2.retries, 0);
        assert_eq!(g2.locked_at, chrono::DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn parked_predecessor_does_not_park_its_successor() {
        let (store, sequencer) = setup().await;
        store
            .update_with(&TaskId::new("g1").unwrap(), |t| t.start_at = Task::parked_until())
            .unwrap();
        let g2 = store.all().unwrap().remove(1);

        let Sequencing::Blocked { until, .. } = sequencer.check(&g2, "g").await.unwrap() else {
            panic!("g2 should be blocked by its parked predecessor");
        };
        assert!(until < Utc::now() + chrono::Duration::seconds(10));
        assert!(!store.all().unwrap()[1].is_parked());
    }
}
