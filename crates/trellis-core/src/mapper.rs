//! # Entity ID Mapper
//!
//! Bidirectional map between internal ids and the native ids of each store.
//!
//! The committed map mirrors the relational `id_mapping` table and is
//! rebuilt from it on startup. New mappings are first *reserved* by a
//! [`MappingBatch`]; they become committed only when the transaction that
//! persists them commits, and are dropped otherwise.
//!
//! Two canonical names that fold to the same native id of a store are an
//! [`TrellisError::IdentityCollision`], never a silent overwrite.

use crate::storage::{IdMapping, native_id};
use crate::{InternalId, StoreKind, TrellisError, TypeLabel, validate_canonical_name};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct MappingState {
    by_native: BTreeMap<(StoreKind, String), InternalId>,
    by_internal: BTreeMap<(InternalId, StoreKind), String>,
    reserved: BTreeMap<(StoreKind, String), InternalId>,
}

impl MappingState {
    fn owner(&self, store: StoreKind, native: &str) -> Option<InternalId> {
        let key = (store, native.to_string());
        self.by_native
            .get(&key)
            .or_else(|| self.reserved.get(&key))
            .copied()
    }

    fn insert(&mut self, mapping: &IdMapping) {
        self.by_native
            .insert((mapping.store, mapping.native_id.clone()), mapping.internal_id);
        self.by_internal
            .insert((mapping.internal_id, mapping.store), mapping.native_id.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("id mapper mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// The outcome of resolving one canonical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub internal_id: InternalId,
    /// `true` when no committed mapping existed yet.
    pub created: bool,
}

pub struct IdMapper {
    state: Mutex<MappingState>,
    held: Mutex<BTreeSet<InternalId>>,
    released: Condvar,
}

impl std::fmt::Debug for IdMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdMapper")
            .field("entities", &self.len())
            .finish()
    }
}

impl Default for IdMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl IdMapper {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MappingState::default()),
            held: Mutex::new(BTreeSet::new()),
            released: Condvar::new(),
        }
    }

    /// Rebuild the committed map from persisted rows.
    #[must_use]
    pub fn from_mappings(mappings: &[IdMapping]) -> Self {
        let mapper = Self::new();
        {
            let mut state = lock(&mapper.state);
            for mapping in mappings {
                state.insert(mapping);
            }
        }
        tracing::debug!(mappings = mappings.len(), "id mapper loaded");
        mapper
    }

    /// Number of entities with a committed mapping.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state)
            .by_internal
            .keys()
            .filter(|(_, store)| *store == StoreKind::Graph)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start reserving mappings for one write.
    #[must_use]
    pub fn batch(&self) -> MappingBatch<'_> {
        MappingBatch {
            mapper: self,
            reserved: Vec::new(),
            confirmed: false,
        }
    }

    pub fn map_to_native(
        &self,
        internal_id: InternalId,
        store: StoreKind,
    ) -> Result<String, TrellisError> {
        lock(&self.state)
            .by_internal
            .get(&(internal_id, store))
            .cloned()
            .ok_or_else(|| {
                TrellisError::NotFound(format!("no {store} mapping for entity {internal_id}"))
            })
    }

    /// Look up by native id. Graph keys are case-folded first, as the
    /// store folds them.
    pub fn map_from_native(
        &self,
        native: &str,
        store: StoreKind,
    ) -> Result<InternalId, TrellisError> {
        let key = match store {
            StoreKind::Graph => native.trim().to_lowercase(),
            StoreKind::Relational => native.to_string(),
        };
        lock(&self.state)
            .by_native
            .get(&(store, key))
            .copied()
            .ok_or_else(|| TrellisError::NotFound(format!("no entity for {store} id '{native}'")))
    }

    /// Lock every id in `ids` at once, waiting until none is held elsewhere.
    ///
    /// Taking the whole set atomically means two writers that share several
    /// entities cannot deadlock on each other.
    pub fn lock_many(&self, ids: impl IntoIterator<Item = InternalId>) -> IdLockGuard<'_> {
        let ids: BTreeSet<InternalId> = ids.into_iter().collect();
        let mut held = lock(&self.held);
        while ids.iter().any(|id| held.contains(id)) {
            held = match self.released.wait(held) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        held.extend(ids.iter().copied());
        IdLockGuard { mapper: self, ids }
    }
}

/// Per-id locks held for the lifetime of the guard.
pub struct IdLockGuard<'a> {
    mapper: &'a IdMapper,
    ids: BTreeSet<InternalId>,
}

impl Drop for IdLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = lock(&self.mapper.held);
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.mapper.released.notify_all();
    }
}

/// Mappings reserved for one write. Dropping the batch without
/// [`confirm`](MappingBatch::confirm) releases them.
pub struct MappingBatch<'a> {
    mapper: &'a IdMapper,
    reserved: Vec<IdMapping>,
    confirmed: bool,
}

impl MappingBatch<'_> {
    /// Resolve a canonical name to its internal id, reserving new mappings
    /// in every store when the entity is unknown.
    pub fn resolve_or_create(
        &mut self,
        canonical_name: &str,
        entity_type: &TypeLabel,
    ) -> Result<Resolution, TrellisError> {
        validate_canonical_name(canonical_name)?;
        let internal_id = InternalId::for_entity(entity_type, canonical_name);
        let mut state = lock(&self.mapper.state);

        let mut fresh = Vec::new();
        for store in StoreKind::ALL {
            let native = native_id(store, entity_type, canonical_name);
            match state.owner(store, &native) {
                Some(existing) if existing != internal_id => {
                    tracing::warn!(%store, native_id = %native, %existing, "identity collision");
                    return Err(TrellisError::IdentityCollision {
                        store,
                        native_id: native,
                        existing,
                        requested: canonical_name.to_string(),
                    });
                }
                Some(_) => {}
                None => fresh.push(IdMapping::for_entity(store, entity_type, canonical_name)),
            }
        }

        let created = !state
            .by_internal
            .contains_key(&(internal_id, StoreKind::Graph));
        for mapping in fresh {
            state
                .reserved
                .insert((mapping.store, mapping.native_id.clone()), internal_id);
            self.reserved.push(mapping);
        }
        Ok(Resolution {
            internal_id,
            created,
        })
    }

    /// Mappings this batch must persist.
    #[must_use]
    pub fn mappings(&self) -> &[IdMapping] {
        &self.reserved
    }

    /// The write committed: promote reservations to committed mappings.
    pub fn confirm(mut self) {
        let mut state = lock(&self.mapper.state);
        for mapping in &self.reserved {
            state
                .reserved
                .remove(&(mapping.store, mapping.native_id.clone()));
            state.insert(mapping);
        }
        self.confirmed = true;
    }
}

impl Drop for MappingBatch<'_> {
    fn drop(&mut self) {
        if self.confirmed || self.reserved.is_empty() {
            return;
        }
        let mut state = lock(&self.mapper.state);
        for mapping in &self.reserved {
            state
                .reserved
                .remove(&(mapping.store, mapping.native_id.clone()));
        }
        tracing::debug!(released = self.reserved.len(), "released unconfirmed id mappings");
    }
}

// =============================================================================
// TESTS
// =============================================================================
