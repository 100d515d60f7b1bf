use super::factory::ScopedStoreFactory;
use crate::core::{Record, Result, StoreError, SyncState};
use crate::storage::{DeleteOutcome, RecordEdit, RecordStore};
use crate::sync::IdentityProvider;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

pub const GUEST_PREFIX: &str = "__guest__.";
const MAX_NAMESPACE_LEN: usize = 64;

/// Namespaces become part of file names: letters, digits and underscores,
/// starting with a letter or a single underscore.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    let Some(first) = namespace.chars().next() else {
        return Err(StoreError::InvalidKey("namespace cannot be empty".to_string()));
    };
    if !first.is_alphabetic() && first != '_' {
        return Err(StoreError::InvalidKey(format!(
            "namespace '{}' must start with a letter or underscore",
            namespace
        )));
    }
    if namespace.starts_with("__") {
        return Err(StoreError::InvalidKey(format!(
            "namespace '{}' uses the reserved '__' prefix",
            namespace
        )));
    }
    if !namespace.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidKey(format!(
            "namespace '{}' can only contain letters, numbers, and underscores",
            namespace
        )));
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(StoreError::InvalidKey(format!(
            "namespace '{}' is too long (max {} characters)",
            namespace, MAX_NAMESPACE_LEN
        )));
    }
    Ok(())
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.starts_with('.')
        || user_id.starts_with("__")
        || user_id.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
    {
        return Err(StoreError::InvalidKey(format!(
            "user id '{}' cannot be used as a store key",
            user_id
        )));
    }
    Ok(())
}

/// Key under which `user_id`'s data for `namespace` is stored. An empty user
/// id maps to the guest namespace.
pub fn scoped_key(user_id: &str, namespace: &str) -> Result<String> {
    validate_namespace(namespace)?;
    if user_id.is_empty() {
        return Ok(format!("{}{}", GUEST_PREFIX, namespace));
    }
    validate_user_id(user_id)?;
    Ok(format!("{}.{}", user_id, namespace))
}

struct ActiveScope<R: Record> {
    user_id: String,
    store: Arc<dyn RecordStore<R>>,
}

/// Routes every call to the store of the current identity.
///
/// The opened store is kept for as long as the identity stays the same. On
/// an identity change the old store's cache is dropped and the new identity's
/// store is opened before the call proceeds.
pub struct UserScopeWrapper<R: Record> {
    namespace: String,
    identity: Arc<dyn IdentityProvider>,
    factory: Arc<dyn ScopedStoreFactory<R>>,
    active: Mutex<Option<ActiveScope<R>>>,
}

impl<R: Record> UserScopeWrapper<R> {
    pub fn new(
        namespace: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
        factory: Arc<dyn ScopedStoreFactory<R>>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self {
            namespace,
            identity,
            factory,
            active: Mutex::new(None),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn current_key(&self) -> Result<String> {
        scoped_key(&self.identity.current_user_id(), &self.namespace)
    }

    fn cached_store(&self, user_id: &str) -> Result<Option<Arc<dyn RecordStore<R>>>> {
        let active = self.active.lock()?;
        Ok(active
            .as_ref()
            .filter(|scope| scope.user_id == user_id)
            .map(|scope| scope.store.clone()))
    }

    /// Store for the identity as of this call.
    pub async fn current_store(&self) -> Result<Arc<dyn RecordStore<R>>> {
        let user_id = self.identity.current_user_id();
        if let Some(store) = self.cached_store(&user_id)? {
            return Ok(store);
        }

        let key = scoped_key(&user_id, &self.namespace)?;
        let store = self.factory.open(&key, &user_id).await?;

        let mut active = self.active.lock()?;
        if let Some(previous) = active.take() {
            debug!(from = %previous.user_id, to = %user_id, "identity changed, dropping cached store");
            previous.store.invalidate_cache();
        }
        *active = Some(ActiveScope {
            user_id,
            store: store.clone(),
        });
        Ok(store)
    }

    /// Namespaces holding guest data.
    pub async fn guest_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .factory
            .list_keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(GUEST_PREFIX).map(str::to_string))
            .collect())
    }

    /// Removes guest data in every namespace. Returns how many namespaces
    /// were purged.
    pub async fn purge_guest(&self) -> Result<usize> {
        let namespaces = self.guest_keys().await?;
        for namespace in &namespaces {
            self.factory
                .purge(&format!("{}{}", GUEST_PREFIX, namespace))
                .await?;
        }
        self.forget_guest_scope()?;
        if !namespaces.is_empty() {
            info!(namespaces = namespaces.len(), "purged guest data");
        }
        Ok(namespaces.len())
    }

    fn forget_guest_scope(&self) -> Result<()> {
        let mut active = self.active.lock()?;
        if active.as_ref().is_some_and(|scope| scope.user_id.is_empty()) {
            *active = None;
        }
        Ok(())
    }

    /// Moves this namespace's guest records into the signed-in user's store,
    /// then purges the guest copy. Records whose id already exists for the
    /// user are not overwritten. Returns how many records were moved.
    pub async fn migrate_guest_data(&self) -> Result<usize> {
        let user_id = self.identity.current_user_id();
        if user_id.is_empty() {
            return Err(StoreError::OperationNotSupported(
                "guest data can only be migrated into a signed-in user's store".to_string(),
            ));
        }

        let guest_key = scoped_key("", &self.namespace)?;
        let guest = self.factory.open(&guest_key, "").await?;
        let guest_records = guest.load().await?;
        if guest_records.is_empty() {
            debug!(namespace = %self.namespace, "no guest data to migrate");
            return Ok(0);
        }

        let target = self.current_store().await?;
        let existing: HashSet<Uuid> = target.load().await?.iter().map(Record::id).collect();
        let moving: Vec<R> = guest_records
            .into_iter()
            .filter(|record| !existing.contains(&record.id()))
            .map(|mut record| {
                *record.sync_state_mut() = SyncState::default();
                record
            })
            .collect();
        let moved = moving.len();
        if moved > 0 {
            // Ids saved for the user since the load above still win
            target.merge_missing(moving).await?;
        }

        guest.invalidate_cache();
        self.factory.purge(&guest_key).await?;
        self.forget_guest_scope()?;
        info!(namespace = %self.namespace, %user_id, moved, "migrated guest data");
        Ok(moved)
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for UserScopeWrapper<R> {
    async fn load(&self) -> Result<Vec<R>> {
        self.current_store().await?.load().await
    }

    async fn save_all(&self, records: Vec<R>) -> Result<()> {
        self.current_store().await?.save_all(records).await
    }

    async fn save_one(&self, record: R) -> Result<()> {
        self.current_store().await?.save_one(record).await
    }

    async fn delete_one(&self, id: Uuid) -> Result<DeleteOutcome> {
        self.current_store().await?.delete_one(id).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.current_store().await?.clear_all().await
    }

    async fn edit_records(&self, edit: RecordEdit<R>) -> Result<Vec<R>> {
        self.current_store().await?.edit_records(edit).await
    }

    async fn merge_missing(&self, incoming: Vec<R>) -> Result<Vec<R>> {
        self.current_store().await?.merge_missing(incoming).await
    }

    fn invalidate_cache(&self) {
        let active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(scope) = active.as_ref() {
            scope.store.invalidate_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_keys() {
        assert_eq!(scoped_key("", "goals").unwrap(), "__guest__.goals");
        assert_eq!(scoped_key("alice", "goals").unwrap(), "alice.goals");
        assert!(scoped_key("alice", "").is_err());
        assert!(scoped_key("alice", "__guest__").is_err());
        assert!(scoped_key("alice", "bad/name").is_err());
        assert!(scoped_key("../etc", "goals").is_err());
        assert!(scoped_key("__guest__", "goals").is_err());
    }

    #[test]
    fn test_namespace_length() {
        assert!(validate_namespace(&"a".repeat(64)).is_ok());
        assert!(matches!(
            validate_namespace(&"a".repeat(65)),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
