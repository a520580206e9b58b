use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use taskforge_core::{Task, TaskId};

use super::filter::TaskFilter;
use super::r#trait::{Reschedule, TaskStore, TaskStoreError};

#[derive(Debug, Default)]
struct Records {
    /// Insertion order; ties on `created_at` are broken by position.
    tasks: Vec<Task>,
    by_id: HashMap<TaskId, usize>,
}

impl Records {
    fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let idx = *self.by_id.get(id)?;
        self.tasks.get_mut(idx)
    }

    fn reindex(&mut self) {
        self.by_id = self
            .tasks
            .iter()
            .enumerate()
            .map(|(idx, t)| (t.id.clone(), idx))
            .collect();
    }
}

/// In-memory task store.
///
/// Intended for tests/dev and single-process deployments. Every operation
/// runs under one `RwLock`, which makes leasing trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: RwLock<Records>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every record in creation order.
    pub fn all(&self) -> Result<Vec<Task>, TaskStoreError> {
        let records = self.read()?;
        let mut tasks = records.tasks.clone();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Edit a record in place (operator repair, test fixtures).
    pub fn update_with<F>(&self, id: &TaskId, edit: F) -> Result<Option<Task>, TaskStoreError>
    where
        F: FnOnce(&mut Task),
    {
        let mut records = self.write()?;
        Ok(records.get_mut(id).map(|task| {
            edit(task);
            task.clone()
        }))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Records>, TaskStoreError> {
        self.records
            .read()
            .map_err(|_| TaskStoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Records>, TaskStoreError> {
        self.records
            .write()
            .map_err(|_| TaskStoreError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_unique(&self, task: Task) -> Result<Task, TaskStoreError> {
        let mut records = self.write()?;
        if records.by_id.contains_key(&task.id) {
            return Err(TaskStoreError::DuplicateId(task.id));
        }
        let idx = records.tasks.len();
        records.by_id.insert(task.id.clone(), idx);
        records.tasks.push(task.clone());
        Ok(task)
    }

    async fn lease_next(&self, lease: Duration) -> Result<Option<Task>, TaskStoreError> {
        let mut records = self.write()?;
        let now = Utc::now();

        // Oldest eligible record; strict `<` keeps the earliest inserted on ties.
        let mut oldest: Option<usize> = None;
        for (idx, task) in records.tasks.iter().enumerate() {
            if !task.is_leasable(now, lease) {
                continue;
            }
            let older = match oldest {
                Some(best) => task.created_at < records.tasks[best].created_at,
                None => true,
            };
            if older {
                oldest = Some(idx);
            }
        }

        Ok(oldest.map(|idx| {
            let task = &mut records.tasks[idx];
            let before = task.clone();
            task.locked_at = now;
            before
        }))
    }

    async fn find_predecessor(
        &self,
        group: &str,
        successor: &TaskId,
    ) -> Result<Option<Task>, TaskStoreError> {
        let records = self.read()?;
        let Some(&succ_idx) = records.by_id.get(successor) else {
            return Ok(None);
        };
        let succ_key = (records.tasks[succ_idx].created_at, succ_idx);

        Ok(records
            .tasks
            .iter()
            .enumerate()
            .filter(|(idx, t)| {
                t.group.as_deref() == Some(group) && (t.created_at, *idx) < succ_key
            })
            .max_by_key(|(idx, t)| (t.created_at, *idx))
            .map(|(_, t)| t.clone()))
    }

    async fn mark_failed(
        &self,
        id: &TaskId,
        message: &str,
    ) -> Result<Option<Task>, TaskStoreError> {
        let mut records = self.write()?;
        Ok(records.get_mut(id).map(|task| {
            task.failed_at = Some(Utc::now());
            task.error_msg = Some(message.to_string());
            task.retries = task.retries.saturating_add(1);
            task.clone()
        }))
    }

    async fn mark_processed(
        &self,
        id: &TaskId,
        result: JsonValue,
    ) -> Result<Option<Task>, TaskStoreError> {
        let mut records = self.write()?;
        Ok(records.get_mut(id).map(|task| {
            if task.processed_at.is_none() {
                task.processed_at = Some(Utc::now());
                task.result = Some(result);
            }
            task.clone()
        }))
    }

    async fn reschedule(
        &self,
        id: &TaskId,
        reschedule: Reschedule,
    ) -> Result<Option<Task>, TaskStoreError> {
        let mut records = self.write()?;
        Ok(records.get_mut(id).map(|task| {
            reschedule.apply(task);
            task.clone()
        }))
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Option<Task>, TaskStoreError> {
        let records = self.read()?;
        Ok(records
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| filter.matches(t))
            .min_by_key(|(idx, t)| (t.created_at, *idx))
            .map(|(_, t)| t.clone()))
    }

    async fn remove(&self, filter: &TaskFilter) -> Result<u64, TaskStoreError> {
        let mut records = self.write()?;
        let before = records.tasks.len();
        records.tasks.retain(|t| !filter.matches(t));
        let removed = before - records.tasks.len();
        if removed > 0 {
            records.reindex();
        }
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> TaskId {
        TaskId::new(raw).unwrap()
    }

    fn task(raw: &str) -> Task {
        Task::new(id(raw), "test", json!({"id": raw}), Utc::now())
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryTaskStore::new();
        store.insert_unique(task("a")).await.unwrap();

        let mut clash = task("a");
        clash.name = "other".to_string();
        let err = store.insert_unique(clash).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::DuplicateId(ref dup) if dup.as_str() == "a"));

        let kept = store.find(&TaskFilter::by_id(id("a"))).await.unwrap().unwrap();
        assert_eq!(kept.name, "test");
    }

    #[tokio::test]
    async fn lease_returns_oldest_and_locks_it() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let mut newer = task("newer");
        newer.created_at = now;
        let mut older = task("older");
        older.created_at = now - chrono::Duration::seconds(10);
        store.insert_unique(newer).await.unwrap();
        store.insert_unique(older).await.unwrap();

        let lease = Duration::from_secs(60);
        let first = store.lease_next(lease).await.unwrap().unwrap();
        assert_eq!(first.id.as_str(), "older");
        assert_eq!(first.locked_at, chrono::DateTime::<Utc>::UNIX_EPOCH);

        let second = store.lease_next(lease).await.unwrap().unwrap();
        assert_eq!(second.id.as_str(), "newer");

        assert!(store.lease_next(lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn equal_timestamps_lease_in_insertion_order() {
        let store = InMemoryTaskStore::new();
        let at = Utc::now();
        for raw in ["first", "second", "third"] {
            let mut t = task(raw);
            t.created_at = at;
            store.insert_unique(t).await.unwrap();
        }

        let lease = Duration::from_secs(60);
        for expected in ["first", "second", "third"] {
            let leased = store.lease_next(lease).await.unwrap().unwrap();
            assert_eq!(leased.id.as_str(), expected);
        }
    }

    #[tokio::test]
    async fn predecessor_is_the_previous_member_of_the_group() {
        let store = InMemoryTaskStore::new();
        let at = Utc::now();
        for (raw, group) in [("g1", "g"), ("other", "h"), ("g2", "g"), ("g3", "g")] {
            let mut t = task(raw).with_group(group);
            t.created_at = at;
            store.insert_unique(t).await.unwrap();
        }

        assert!(store.find_predecessor("g", &id("g1")).await.unwrap().is_none());
        let p = store.find_predecessor("g", &id("g2")).await.unwrap().unwrap();
        assert_eq!(p.id.as_str(), "g1");
        let p = store.find_predecessor("g", &id("g3")).await.unwrap().unwrap();
        assert_eq!(p.id.as_str(), "g2");
    }

    #[tokio::test]
    async fn mark_failed_increments_retries() {
        let store = InMemoryTaskStore::new();
        store.insert_unique(task("a")).await.unwrap();

        store.mark_failed(&id("a"), "boom").await.unwrap();
        let t = store.mark_failed(&id("a"), "bang").await.unwrap().unwrap();
        assert_eq!(t.retries, 2);
        assert_eq!(t.error_msg.as_deref(), Some("bang"));
        assert!(t.failed_at.is_some());

        assert!(store.mark_failed(&id("missing"), "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let store = InMemoryTaskStore::new();
        store.insert_unique(task("a")).await.unwrap();

        let first = store.mark_processed(&id("a"), json!(1)).await.unwrap().unwrap();
        let second = store.mark_processed(&id("a"), json!(2)).await.unwrap().unwrap();
        assert_eq!(first.processed_at, second.processed_at);
        assert_eq!(second.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn reschedule_can_release_lease_and_clear_retries() {
        let store = InMemoryTaskStore::new();
        store.insert_unique(task("a")).await.unwrap();
        store.lease_next(Duration::from_secs(60)).await.unwrap();
        store.mark_failed(&id("a"), "boom").await.unwrap();

        let at = Utc::now() + chrono::Duration::minutes(3);
        let kept = store
            .reschedule(&id("a"), Reschedule::at(at).releasing_lease())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.start_at, at);
        assert_eq!(kept.locked_at, chrono::DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(kept.retries, 1);

        let cleared = store
            .reschedule(&id("a"), Reschedule::at(at).clearing_retries())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cleared.retries, 0);
    }

    #[tokio::test]
    async fn remove_deletes_matching_records_and_keeps_index_consistent() {
        let store = InMemoryTaskStore::new();
        for raw in ["a", "b", "c"] {
            store.insert_unique(task(raw)).await.unwrap();
        }

        let removed = store.remove(&TaskFilter::by_id(id("a"))).await.unwrap();
        assert_eq!(removed, 1);

        let c = store.update_with(&id("c"), |t| t.retries = 7).unwrap().unwrap();
        assert_eq!(c.retries, 7);
        assert_eq!(store.all().unwrap().len(), 2);

        assert_eq!(store.remove(&TaskFilter::all()).await.unwrap(), 2);
        assert!(store.find(&TaskFilter::all()).await.unwrap().is_none());
    }
}
