//! Base entity stores.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use ctlplane_core::{Entity, QuerySpec, Queryable, StoreError, StoreResult};

/// Keyed entity storage.
///
/// Mutations return the state they replaced so a change-capturing wrapper can
/// report before/after pairs without a second read.
pub trait EntityStore<E>: Send + Sync
where
    E: Entity + Queryable + Clone,
{
    /// Insert a new entity. Fails with `DuplicateKey` if the id is taken.
    fn create(&self, entity: E) -> StoreResult<()>;

    /// Replace an existing entity, returning the previous state.
    fn update(&self, entity: E) -> StoreResult<E>;

    /// Insert or replace, returning the previous state if there was one.
    fn save(&self, entity: E) -> StoreResult<Option<E>>;

    /// Remove an entity, returning it.
    fn delete(&self, id: &E::Id) -> StoreResult<E>;

    fn find_by_id(&self, id: &E::Id) -> StoreResult<Option<E>>;

    fn query(&self, query: &QuerySpec) -> StoreResult<Vec<E>>;
}

/// In-memory entity store ordered by id.
#[derive(Debug)]
pub struct InMemoryEntityStore<E: Entity> {
    entities: RwLock<BTreeMap<E::Id, E>>,
}

impl<E: Entity> InMemoryEntityStore<E> {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Entity> Default for InMemoryEntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EntityStore<E> for InMemoryEntityStore<E>
where
    E: Entity + Queryable + Clone + Send + Sync,
    E::Id: Send + Sync,
{
    fn create(&self, entity: E) -> StoreResult<()> {
        let mut entities = self.entities.write().map_err(StoreError::lock_poisoned)?;
        if entities.contains_key(entity.id()) {
            return Err(StoreError::duplicate_key(entity.id()));
        }
        entities.insert(entity.id().clone(), entity);
        Ok(())
    }

    fn update(&self, entity: E) -> StoreResult<E> {
        let mut entities = self.entities.write().map_err(StoreError::lock_poisoned)?;
        let slot = entities
            .get_mut(entity.id())
            .ok_or_else(|| StoreError::not_found(entity.id()))?;
        Ok(std::mem::replace(slot, entity))
    }

    fn save(&self, entity: E) -> StoreResult<Option<E>> {
        let mut entities = self.entities.write().map_err(StoreError::lock_poisoned)?;
        Ok(entities.insert(entity.id().clone(), entity))
    }

    fn delete(&self, id: &E::Id) -> StoreResult<E> {
        let mut entities = self.entities.write().map_err(StoreError::lock_poisoned)?;
        entities.remove(id).ok_or_else(|| StoreError::not_found(id))
    }

    fn find_by_id(&self, id: &E::Id) -> StoreResult<Option<E>> {
        let entities = self.entities.read().map_err(StoreError::lock_poisoned)?;
        Ok(entities.get(id).cloned())
    }

    fn query(&self, query: &QuerySpec) -> StoreResult<Vec<E>> {
        let entities = self.entities.read().map_err(StoreError::lock_poisoned)?;
        Ok(query.apply(entities.values().cloned()))
    }
}

impl<E, S> EntityStore<E> for Arc<S>
where
    E: Entity + Queryable + Clone,
    S: EntityStore<E> + ?Sized,
{
    fn create(&self, entity: E) -> StoreResult<()> {
        (**self).create(entity)
    }

    fn update(&self, entity: E) -> StoreResult<E> {
        (**self).update(entity)
    }

    fn save(&self, entity: E) -> StoreResult<Option<E>> {
        (**self).save(entity)
    }

    fn delete(&self, id: &E::Id) -> StoreResult<E> {
        (**self).delete(id)
    }

    fn find_by_id(&self, id: &E::Id) -> StoreResult<Option<E>> {
        (**self).find_by_id(id)
    }

    fn query(&self, query: &QuerySpec) -> StoreResult<Vec<E>> {
        (**self).query(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctlplane_core::{Criterion, SortOrder};
    use serde_json::Value;

    #[derive(Debug, Clone, PartialEq)]
    struct Asset {
        id: String,
        owner: String,
        size: u64,
    }

    impl Entity for Asset {
        type Id = String;

        fn id(&self) -> &String {
            &self.id
        }
    }

    impl Queryable for Asset {
        fn field(&self, path: &str) -> Option<Value> {
            match path {
                "id" => Some(Value::from(self.id.clone())),
                "owner" => Some(Value::from(self.owner.clone())),
                "size" => Some(Value::from(self.size)),
                _ => None,
            }
        }
    }

    fn asset(id: &str, owner: &str, size: u64) -> Asset {
        Asset {
            id: id.into(),
            owner: owner.into(),
            size,
        }
    }

    #[test]
    fn mutations_return_replaced_state() {
        let store = InMemoryEntityStore::new();
        store.create(asset("a", "alice", 1)).unwrap();

        let previous = store.update(asset("a", "alice", 2)).unwrap();
        assert_eq!(previous.size, 1);

        assert_eq!(store.save(asset("b", "bob", 5)).unwrap(), None);
        assert_eq!(store.save(asset("b", "bob", 6)).unwrap().map(|a| a.size), Some(5));

        assert_eq!(store.delete(&"a".to_string()).unwrap().size, 2);
        assert_eq!(store.find_by_id(&"a".to_string()).unwrap(), None);
    }

    #[test]
    fn errors_on_duplicates_and_missing_ids() {
        let store = InMemoryEntityStore::new();
        store.create(asset("a", "alice", 1)).unwrap();

        assert!(matches!(store.create(asset("a", "x", 0)), Err(StoreError::DuplicateKey(_))));
        assert!(matches!(store.update(asset("zz", "x", 0)), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&"zz".to_string()), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn poisoned_store_reports_size_and_surfaces_errors() {
        let store = InMemoryEntityStore::new();
        store.create(asset("a", "alice", 1)).unwrap();

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.entities.write().unwrap();
            panic!("poison");
        }));

        assert_eq!(store.len(), 1);
        assert!(matches!(store.find_by_id(&"a".to_string()), Err(StoreError::Storage(_))));
    }

    #[test]
    fn query_filters_and_sorts() {
        let store = InMemoryEntityStore::new();
        store.create(asset("a", "alice", 3)).unwrap();
        store.create(asset("b", "bob", 1)).unwrap();
        store.create(asset("c", "alice", 2)).unwrap();

        let found = store
            .query(
                &QuerySpec::none()
                    .filter(Criterion::eq("owner", "alice"))
                    .sort_by("size", SortOrder::Asc),
            )
            .unwrap();

        let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }
}
