use crate::core::{Record, Result, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

/// Remote document store scoped by user id.
#[async_trait]
pub trait RemoteStore<R: Record>: Send + Sync {
    async fn fetch_all(&self, user_id: &str) -> Result<Vec<R>>;

    async fn upsert(&self, user_id: &str, record: R) -> Result<()>;

    async fn delete(&self, user_id: &str, id: Uuid) -> Result<()>;
}

/// Resolves the signed-in user. An empty id means guest.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> String;
}

/// Answers whether a user's data has been fully migrated to the remote store.
#[async_trait]
pub trait MigrationStatus: Send + Sync {
    async fn is_fully_migrated(&self, user_id: &str) -> bool;
}

/// Identity that can be switched at runtime, e.g. on sign-in or sign-out.
#[derive(Debug, Default)]
pub struct SwitchableIdentity {
    user_id: RwLock<String>,
}

impl SwitchableIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(user_id.into()),
        }
    }

    pub fn guest() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: impl Into<String>) {
        let mut guard = self.user_id.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = user_id.into();
    }
}

impl IdentityProvider for SwitchableIdentity {
    fn current_user_id(&self) -> String {
        self.user_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

/// Migration status backed by an explicit set of migrated users.
#[derive(Debug, Default)]
pub struct MigratedUsers {
    users: RwLock<HashSet<String>>,
}

impl MigratedUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_migrated(&self, user_id: impl Into<String>) {
        let mut guard = self.users.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(user_id.into());
    }
}

#[async_trait]
impl MigrationStatus for MigratedUsers {
    async fn is_fully_migrated(&self, user_id: &str) -> bool {
        self.users
            .read()
            .map(|users| users.contains(user_id))
            .unwrap_or(false)
    }
}

/// Holds calls while paused.
struct CallGate {
    paused: watch::Sender<bool>,
    held: watch::Sender<usize>,
}

impl CallGate {
    fn new() -> Self {
        Self {
            paused: watch::channel(false).0,
            held: watch::channel(0).0,
        }
    }

    async fn pass(&self) {
        let mut paused = self.paused.subscribe();
        let is_paused = *paused.borrow_and_update();
        if !is_paused {
            return;
        }
        self.held.send_modify(|held| *held += 1);
        let _ = paused.wait_for(|paused| !*paused).await;
        self.held.send_modify(|held| *held -= 1);
    }
}

/// An in-memory implementation of [`RemoteStore`] for testing.
///
/// Failures can be switched on to simulate an outage, and fetches and upserts
/// can be paused to simulate a slow network. Every call is counted,
/// including failed ones.
#[derive(Clone)]
pub struct InMemoryRemoteStore<R: Record> {
    documents: Arc<Mutex<HashMap<String, BTreeMap<Uuid, R>>>>,
    gate: Arc<CallGate>,
    failing: Arc<AtomicBool>,
    fetches: Arc<AtomicU64>,
    upserts: Arc<AtomicU64>,
    deletes: Arc<AtomicU64>,
}

impl<R: Record> InMemoryRemoteStore<R> {
    pub fn new() -> Self {
        Self {
            documents: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(CallGate::new()),
            failing: Arc::new(AtomicBool::new(false)),
            fetches: Arc::new(AtomicU64::new(0)),
            upserts: Arc::new(AtomicU64::new(0)),
            deletes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Fetches and upserts issued from now on wait until [`Self::resume`].
    pub fn pause(&self) {
        self.gate.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.gate.paused.send_replace(false);
    }

    /// Waits until at least `calls` fetches or upserts are held by
    /// [`Self::pause`].
    pub async fn wait_until_held(&self, calls: usize) {
        let mut held = self.gate.held.subscribe();
        let _ = held.wait_for(|held| *held >= calls).await;
    }

    pub async fn seed(&self, user_id: &str, records: Vec<R>) {
        let mut documents = self.documents.lock().await;
        let user = documents.entry(user_id.to_string()).or_default();
        for record in records {
            user.insert(record.id(), record);
        }
    }

    pub async fn records(&self, user_id: &str) -> Vec<R> {
        let documents = self.documents.lock().await;
        documents
            .get(user_id)
            .map(|user| user.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(AtomicOrdering::SeqCst)
    }

    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(AtomicOrdering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(AtomicOrdering::SeqCst)
    }

    fn check_available(&self, action: &str) -> Result<()> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Remote(format!("{} failed: remote store unavailable", action)));
        }
        Ok(())
    }
}

impl<R: Record> Default for InMemoryRemoteStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> RemoteStore<R> for InMemoryRemoteStore<R> {
    async fn fetch_all(&self, user_id: &str) -> Result<Vec<R>> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        self.gate.pass().await;
        self.check_available("fetch")?;
        Ok(self.records(user_id).await)
    }

    async fn upsert(&self, user_id: &str, record: R) -> Result<()> {
        self.upserts.fetch_add(1, AtomicOrdering::SeqCst);
        self.gate.pass().await;
        self.check_available("upsert")?;
        let mut documents = self.documents.lock().await;
        documents
            .entry(user_id.to_string())
            .or_default()
            .insert(record.id(), record);
        Ok(())
    }

    async fn delete(&self, user_id: &str, id: Uuid) -> Result<()> {
        self.deletes.fetch_add(1, AtomicOrdering::SeqCst);
        self.check_available("delete")?;
        let mut documents = self.documents.lock().await;
        if let Some(user) = documents.get_mut(user_id) {
            user.remove(&id);
        }
        Ok(())
    }
}
