//! Dense per-scope ordering.
//!
//! Every scope (columns of a project, rows of a column) holds items whose
//! `order` values are exactly `1..=N`. Insert, move and delete each run under
//! an exclusive per-scope lock spanning the count read, the shifts and the
//! primary write. Shifts and the primary write are committed as one
//! [`WriteSet`], so a failure leaves the scope untouched.
//!
//! Scopes are independent: two scopes never contend on the same lock. The one
//! nesting is a column delete, which holds the project's column scope and then
//! the column's own row scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{BoardError, BoardResult, Entity};
use crate::model::{ItemBody, OrderedItem, ScopeKind, ScopeRef};
use crate::storage::{ScopeStore, WriteOp, WriteSet};

/// Entries are purged once the map exceeds this size...
const CLEANUP_THRESHOLD: usize = 256;
/// ...on every N-th acquisition.
const CLEANUP_INTERVAL: usize = 64;

/// Keyed async mutexes, one per scope, created on demand.
///
/// The map holds weak references; a scope's mutex lives exactly as long as
/// someone holds or waits on it.
#[derive(Default)]
pub struct ScopeLocks {
    locks: StdMutex<HashMap<ScopeRef, Weak<Mutex<()>>>>,
    acquire_counter: AtomicUsize,
}

/// Exclusive hold on one scope. Released on drop.
pub struct ScopeGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, scope: ScopeRef) -> ScopeGuard {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

            let mutex = map.get(&scope).and_then(Weak::upgrade).unwrap_or_else(|| {
                let fresh = Arc::new(Mutex::new(()));
                map.insert(scope, Arc::downgrade(&fresh));
                fresh
            });

            let tick = self.acquire_counter.fetch_add(1, Ordering::Relaxed);
            if map.len() > CLEANUP_THRESHOLD && tick % CLEANUP_INTERVAL == 0 {
                map.retain(|_, weak| weak.strong_count() > 0);
            }

            mutex
        };
        ScopeGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of live (held or awaited) scope locks.
    pub fn active_count(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Result of an order-affecting operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderOutcome {
    /// The inserted, moved or deleted item as it was committed.
    pub item: OrderedItem,
    /// The whole scope, freshly re-read after the commit.
    pub scope_items: Vec<OrderedItem>,
}

/// A committed outcome whose scope is still locked.
///
/// Anything done before dropping it (e.g. broadcasting `scope_items`) is
/// ordered with respect to the next mutation of the same scope.
pub struct Committed {
    pub outcome: OrderOutcome,
    _guard: ScopeGuard,
}

impl Committed {
    /// Release the scope and keep the outcome.
    pub fn into_outcome(self) -> OrderOutcome {
        self.outcome
    }
}

/// Serializes ordering mutations per scope on top of a [`ScopeStore`].
pub struct OrderCoordinator<S: ScopeStore + ?Sized> {
    store: Arc<S>,
    locks: ScopeLocks,
}

impl<S: ScopeStore + ?Sized> OrderCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: ScopeLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locks(&self) -> &ScopeLocks {
        &self.locks
    }

    /// Current contents of a scope, without taking its lock.
    pub fn list(&self, scope: ScopeRef) -> BoardResult<Vec<OrderedItem>> {
        Ok(self.store.load_scope(scope)?)
    }

    /// Insert `item` at `requested`, shifting items at or after it up by one.
    ///
    /// `extra` is committed in the same batch (e.g. a row's comment section).
    pub async fn insert(
        &self,
        item: OrderedItem,
        requested: i64,
        extra: WriteSet,
    ) -> BoardResult<OrderOutcome> {
        self.insert_held(item, requested, extra, || Ok(()))
            .await
            .map(Committed::into_outcome)
    }

    /// [`insert`](Self::insert) with a `check` run once the scope is held,
    /// before anything is read. An error from `check` aborts the insert.
    pub async fn insert_held<C>(
        &self,
        mut item: OrderedItem,
        requested: i64,
        extra: WriteSet,
        check: C,
    ) -> BoardResult<Committed>
    where
        C: FnOnce() -> BoardResult<()> + Send,
    {
        let scope = item.scope();
        let guard = self.locks.acquire(scope).await;
        check()?;

        let items = self.store.load_scope(scope)?;
        let count = items.len() as i64;
        if requested < 1 || requested > count + 1 {
            return Err(BoardError::OrderOutOfRange {
                scope,
                requested,
                max: count + 1,
            });
        }

        let mut writes = WriteSet::new();
        for mut existing in items.into_iter().filter(|i| i.order >= requested) {
            existing.order += 1;
            writes.push(WriteOp::PutItem(existing));
        }
        item.order = requested;
        writes.push(WriteOp::PutItem(item.clone()));
        writes.extend(extra);

        self.store.commit(writes)?;
        log::debug!("Inserted {} at {requested} in {scope}", item.id);

        Ok(Committed {
            outcome: OrderOutcome {
                item,
                scope_items: self.store.load_scope(scope)?,
            },
            _guard: guard,
        })
    }

    /// Move an item to `new_order`, rotating the items in between by one.
    ///
    /// Moving an item onto its current position writes nothing.
    pub async fn move_item(
        &self,
        scope: ScopeRef,
        id: Uuid,
        new_order: i64,
    ) -> BoardResult<OrderOutcome> {
        self.update(scope, id, Some(new_order), |_| Ok(())).await
    }

    /// Edit an item's body and optionally reposition it, under one scope hold
    /// and one batch.
    pub async fn update<F>(
        &self,
        scope: ScopeRef,
        id: Uuid,
        new_order: Option<i64>,
        edit: F,
    ) -> BoardResult<OrderOutcome>
    where
        F: FnOnce(&mut ItemBody) -> BoardResult<()> + Send,
    {
        self.update_held(scope, id, new_order, edit)
            .await
            .map(Committed::into_outcome)
    }

    /// [`update`](Self::update), keeping the scope held.
    ///
    /// `edit` runs after the position is validated; returning an error aborts
    /// before anything is written.
    pub async fn update_held<F>(
        &self,
        scope: ScopeRef,
        id: Uuid,
        new_order: Option<i64>,
        edit: F,
    ) -> BoardResult<Committed>
    where
        F: FnOnce(&mut ItemBody) -> BoardResult<()> + Send,
    {
        let guard = self.locks.acquire(scope).await;

        let items = self.store.load_scope(scope)?;
        let count = items.len() as i64;
        let current = items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| BoardError::not_found(entity_of(scope.kind), id))?;

        let target = new_order.unwrap_or(current.order);
        if target < 1 || target > count {
            return Err(BoardError::OrderOutOfRange {
                scope,
                requested: target,
                max: count,
            });
        }

        let mut updated = current.clone();
        edit(&mut updated.body)?;
        updated.order = target;

        if updated == current {
            return Ok(Committed {
                outcome: OrderOutcome {
                    item: current,
                    scope_items: items,
                },
                _guard: guard,
            });
        }

        let mut writes = WriteSet::new();
        let from = current.order;
        for mut other in items.into_iter().filter(|i| i.id != id) {
            if target > from && other.order > from && other.order <= target {
                other.order -= 1;
                writes.push(WriteOp::PutItem(other));
            } else if target < from && other.order >= target && other.order < from {
                other.order += 1;
                writes.push(WriteOp::PutItem(other));
            }
        }
        writes.push(WriteOp::PutItem(updated.clone()));

        self.store.commit(writes)?;
        if from != target {
            log::debug!("Moved {id} from {from} to {target} in {scope}");
        }

        Ok(Committed {
            outcome: OrderOutcome {
                item: updated,
                scope_items: self.store.load_scope(scope)?,
            },
            _guard: guard,
        })
    }

    /// Delete an item and close the gap it leaves.
    ///
    /// `extra` is committed in the same batch.
    pub async fn delete(
        &self,
        scope: ScopeRef,
        id: Uuid,
        extra: WriteSet,
    ) -> BoardResult<OrderOutcome> {
        self.delete_held(scope, id, extra)
            .await
            .map(Committed::into_outcome)
    }

    /// [`delete`](Self::delete), keeping the scope held.
    ///
    /// Deleting a column also holds that column's row scope until the commit,
    /// taken after the column scope. A row insert queued behind it sees the
    /// column gone.
    pub async fn delete_held(
        &self,
        scope: ScopeRef,
        id: Uuid,
        extra: WriteSet,
    ) -> BoardResult<Committed> {
        let guard = self.locks.acquire(scope).await;
        let _children = match scope.kind {
            ScopeKind::Columns => Some(self.locks.acquire(ScopeRef::rows_of(id)).await),
            ScopeKind::Rows => None,
        };

        let items = self.store.load_scope(scope)?;
        let removed = items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| BoardError::not_found(entity_of(scope.kind), id))?;

        let mut writes = WriteSet::new();
        writes.push(WriteOp::DeleteItem {
            kind: scope.kind,
            id,
        });
        for mut other in items.into_iter().filter(|i| i.order > removed.order) {
            other.order -= 1;
            writes.push(WriteOp::PutItem(other));
        }
        writes.extend(extra);

        self.store.commit(writes)?;
        log::debug!("Deleted {id} at {} from {scope}", removed.order);

        Ok(Committed {
            outcome: OrderOutcome {
                item: removed,
                scope_items: self.store.load_scope(scope)?,
            },
            _guard: guard,
        })
    }
}

fn entity_of(kind: ScopeKind) -> Entity {
    match kind {
        ScopeKind::Columns => Entity::Column,
        ScopeKind::Rows => Entity::Row,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnBody;
    use crate::storage::MemoryStore;

    fn coordinator() -> (Arc<MemoryStore>, OrderCoordinator<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), OrderCoordinator::new(store))
    }

    fn column(project: Uuid, name: &str) -> OrderedItem {
        OrderedItem::new(
            ScopeRef::columns_of(project),
            ItemBody::Column(ColumnBody {
                name: name.into(),
                label_id: None,
            }),
        )
    }

    fn orders(items: &[OrderedItem]) -> Vec<i64> {
        items.iter().map(|i| i.order).collect()
    }

    #[tokio::test]
    async fn test_insert_into_empty_scope() {
        let (_, coord) = coordinator();
        let project = Uuid::new_v4();

        let outcome = coord
            .insert(column(project, "A"), 1, WriteSet::new())
            .await
            .unwrap();
        assert_eq!(outcome.item.order, 1);
        assert_eq!(orders(&outcome.scope_items), vec![1]);
    }

    #[tokio::test]
    async fn test_insert_rejects_zero_and_gap() {
        let (store, coord) = coordinator();
        let project = Uuid::new_v4();

        for bad in [0, 2, -1] {
            let err = coord
                .insert(column(project, "A"), bad, WriteSet::new())
                .await
                .unwrap_err();
            assert!(matches!(err, BoardError::OrderOutOfRange { max: 1, .. }));
        }
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_at_front_shifts_everything() {
        let (_, coord) = coordinator();
        let project = Uuid::new_v4();
        let a = coord.insert(column(project, "A"), 1, WriteSet::new()).await.unwrap();
        let b = coord.insert(column(project, "B"), 1, WriteSet::new()).await.unwrap();

        let ids: Vec<Uuid> = b.scope_items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b.item.id, a.item.id]);
        assert_eq!(orders(&b.scope_items), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_noop_move_writes_nothing() {
        let (store, coord) = coordinator();
        let project = Uuid::new_v4();
        let a = coord.insert(column(project, "A"), 1, WriteSet::new()).await.unwrap();
        coord.insert(column(project, "B"), 2, WriteSet::new()).await.unwrap();
        let commits = store.commit_count();

        let outcome = coord
            .move_item(ScopeRef::columns_of(project), a.item.id, 1)
            .await
            .unwrap();
        assert_eq!(outcome.item.order, 1);
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_move_unknown_item_is_not_found() {
        let (_, coord) = coordinator();
        let err = coord
            .move_item(ScopeRef::rows_of(Uuid::new_v4()), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BoardError::NotFound {
                entity: Entity::Row,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_update_edit_error_aborts() {
        let (store, coord) = coordinator();
        let project = Uuid::new_v4();
        let a = coord.insert(column(project, "A"), 1, WriteSet::new()).await.unwrap();
        let commits = store.commit_count();

        let err = coord
            .update(ScopeRef::columns_of(project), a.item.id, None, |_| {
                Err(BoardError::bad_request("nope"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::BadRequest(_)));
        assert_eq!(store.commit_count(), commits);
    }

    #[tokio::test]
    async fn test_scope_locks_released_after_use() {
        let locks = ScopeLocks::new();
        let scope = ScopeRef::columns_of(Uuid::new_v4());
        {
            let _held = locks.acquire(scope).await;
            assert_eq!(locks.active_count(), 1);
        }
        assert_eq!(locks.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_check_writes_nothing() {
        let (store, coord) = coordinator();
        let project = Uuid::new_v4();

        let err = coord
            .insert_held(column(project, "A"), 1, WriteSet::new(), || {
                Err(BoardError::not_found(Entity::Project, project))
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BoardError::NotFound { entity: Entity::Project, .. }));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_committed_keeps_scope_locked() {
        let (_, coord) = coordinator();
        let project = Uuid::new_v4();
        let scope = ScopeRef::columns_of(project);

        let committed = coord
            .insert_held(column(project, "A"), 1, WriteSet::new(), || Ok(()))
            .await
            .ok()
            .unwrap();
        assert_eq!(committed.outcome.scope_items.len(), 1);

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), coord.locks().acquire(scope))
                .await;
        assert!(blocked.is_err());

        drop(committed);
        let _free = coord.locks().acquire(scope).await;
    }

    #[tokio::test]
    async fn test_column_delete_waits_for_row_scope() {
        let (_, coord) = coordinator();
        let project = Uuid::new_v4();
        let col = coord.insert(column(project, "A"), 1, WriteSet::new()).await.unwrap();

        let rows = coord.locks().acquire(ScopeRef::rows_of(col.item.id)).await;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            coord.delete(ScopeRef::columns_of(project), col.item.id, WriteSet::new()),
        )
        .await;
        assert!(pending.is_err());

        drop(rows);
        coord
            .delete(ScopeRef::columns_of(project), col.item.id, WriteSet::new())
            .await
            .unwrap();
    }
}
