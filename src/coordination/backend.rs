//! Coordination backends: where fences, tasksets, and the singleton lock
//! live.

use crate::config::{CoordinationBackendKind, CoordinationConfig};
use crate::coordination::keys::{FencePayload, SyncKey, SyncScope, SyncTaskId};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Shared mutable coordination state for one tenant.
///
/// Fence and taskset lifetimes are linked: a fence is only set after its
/// taskset is populated, and both are deleted together by `clear_sync`.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    async fn set_fence(&self, key: &SyncKey, payload: &FencePayload) -> Result<()>;
    async fn get_fence(&self, key: &SyncKey) -> Result<Option<FencePayload>>;
    async fn fence_exists(&self, key: &SyncKey) -> Result<bool>;
    /// Every key with a live fence in this scope
    async fn list_fences(&self, scope: SyncScope) -> Result<Vec<SyncKey>>;

    async fn taskset_add(&self, key: &SyncKey, task_ids: &[SyncTaskId]) -> Result<()>;
    async fn taskset_remove(&self, key: &SyncKey, task_id: &SyncTaskId) -> Result<()>;
    async fn taskset_len(&self, key: &SyncKey) -> Result<usize>;
    async fn taskset_members(&self, key: &SyncKey) -> Result<Vec<SyncTaskId>>;

    /// Delete the fence and its taskset together
    async fn clear_sync(&self, key: &SyncKey) -> Result<()>;

    /// Try to take a named TTL lock. Returns false if another owner holds it.
    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Extend a held lock; returns false if ownership was lost.
    async fn refresh_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Release only if still the owner.
    async fn release_lock(&self, name: &str, owner: &str) -> Result<()>;
}

/// Single-process backend for tests and standalone deployments.
#[derive(Default)]
pub struct InMemoryCoordination {
    fences: DashMap<String, FencePayload>,
    tasksets: DashMap<String, HashSet<String>>,
    locks: DashMap<String, (String, Instant)>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryCoordination {
    async fn set_fence(&self, key: &SyncKey, payload: &FencePayload) -> Result<()> {
        self.fences.insert(key.fence_key(), payload.clone());
        Ok(())
    }

    async fn get_fence(&self, key: &SyncKey) -> Result<Option<FencePayload>> {
        Ok(self.fences.get(&key.fence_key()).map(|e| e.clone()))
    }

    async fn fence_exists(&self, key: &SyncKey) -> Result<bool> {
        Ok(self.fences.contains_key(&key.fence_key()))
    }

    async fn list_fences(&self, scope: SyncScope) -> Result<Vec<SyncKey>> {
        let prefix = format!("sync/{}/fence/", scope);
        self.fences
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| SyncKey::from_fence_key(e.key()))
            .collect()
    }

    async fn taskset_add(&self, key: &SyncKey, task_ids: &[SyncTaskId]) -> Result<()> {
        let mut set = self.tasksets.entry(key.taskset_key()).or_default();
        for task_id in task_ids {
            set.insert(task_id.render());
        }
        Ok(())
    }

    async fn taskset_remove(&self, key: &SyncKey, task_id: &SyncTaskId) -> Result<()> {
        if let Some(mut set) = self.tasksets.get_mut(&key.taskset_key()) {
            set.remove(&task_id.render());
        }
        Ok(())
    }

    async fn taskset_len(&self, key: &SyncKey) -> Result<usize> {
        Ok(self
            .tasksets
            .get(&key.taskset_key())
            .map(|s| s.len())
            .unwrap_or(0))
    }

    async fn taskset_members(&self, key: &SyncKey) -> Result<Vec<SyncTaskId>> {
        match self.tasksets.get(&key.taskset_key()) {
            Some(set) => set.iter().map(|raw| SyncTaskId::parse(raw)).collect(),
            None => Ok(Vec::new()),
        }
    }

    async fn clear_sync(&self, key: &SyncKey) -> Result<()> {
        self.fences.remove(&key.fence_key());
        self.tasksets.remove(&key.taskset_key());
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entry = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| (owner.to_string(), now + ttl));

        if entry.0 == owner || entry.1 <= now {
            *entry = (owner.to_string(), now + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn refresh_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        match self.locks.get_mut(name) {
            Some(mut entry) if entry.0 == owner => {
                entry.1 = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        self.locks.remove_if(name, |_, (held_by, _)| held_by == owner);
        Ok(())
    }
}

/// Redis-backed coordination, one logical namespace per tenant.
#[derive(Clone)]
pub struct RedisCoordination {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisCoordination {
    pub async fn new(redis_url: &str, tenant: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AppError::Coordination(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Coordination(format!("Failed to connect to Redis: {}", e)))?;

        // Fail at startup rather than on the first fence write
        let mut test_conn = connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut test_conn)
            .await
            .map_err(|e| AppError::Coordination(format!("Redis connection test failed: {}", e)))?;

        info!(tenant, "Initialized Redis coordination backend");

        Ok(Self {
            connection,
            key_prefix: format!("docsync:{}", tenant),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, name)
    }
}

#[async_trait]
impl CoordinationBackend for RedisCoordination {
    async fn set_fence(&self, key: &SyncKey, payload: &FencePayload) -> Result<()> {
        let mut conn = self.connection.clone();
        let value = serde_json::to_string(payload)?;
        let _: () = conn.set(self.namespaced(&key.fence_key()), value).await?;
        Ok(())
    }

    async fn get_fence(&self, key: &SyncKey) -> Result<Option<FencePayload>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.namespaced(&key.fence_key())).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn fence_exists(&self, key: &SyncKey) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(self.namespaced(&key.fence_key())).await?;
        Ok(exists)
    }

    // Cursor-based SCAN; KEYS blocks the server on large keyspaces
    async fn list_fences(&self, scope: SyncScope) -> Result<Vec<SyncKey>> {
        let mut conn = self.connection.clone();
        let pattern = self.namespaced(&SyncKey::fence_pattern(scope));

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may yield a key more than once across iterations
        keys.sort_unstable();
        keys.dedup();

        let strip = format!("{}:", self.key_prefix);
        keys.iter()
            .map(|k| SyncKey::from_fence_key(k.strip_prefix(&strip).unwrap_or(k)))
            .collect()
    }

    async fn taskset_add(&self, key: &SyncKey, task_ids: &[SyncTaskId]) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let members: Vec<String> = task_ids.iter().map(|t| t.render()).collect();
        let _: () = conn.sadd(self.namespaced(&key.taskset_key()), members).await?;
        Ok(())
    }

    async fn taskset_remove(&self, key: &SyncKey, task_id: &SyncTaskId) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .srem(self.namespaced(&key.taskset_key()), task_id.render())
            .await?;
        Ok(())
    }

    async fn taskset_len(&self, key: &SyncKey) -> Result<usize> {
        let mut conn = self.connection.clone();
        let len: usize = conn.scard(self.namespaced(&key.taskset_key())).await?;
        Ok(len)
    }

    async fn taskset_members(&self, key: &SyncKey) -> Result<Vec<SyncTaskId>> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.smembers(self.namespaced(&key.taskset_key())).await?;
        members.iter().map(|raw| SyncTaskId::parse(raw)).collect()
    }

    async fn clear_sync(&self, key: &SyncKey) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(&[
                self.namespaced(&key.fence_key()),
                self.namespaced(&key.taskset_key()),
            ])
            .await?;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(name))
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        if acquired.is_some() {
            return Ok(true);
        }
        // Re-entrant for the same owner
        let holder: Option<String> = conn.get(self.lock_key(name)).await?;
        if holder.as_deref() == Some(owner) {
            let _: () = conn
                .expire(self.lock_key(name), ttl.as_secs().max(1) as i64)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn refresh_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let holder: Option<String> = conn.get(self.lock_key(name)).await?;
        if holder.as_deref() != Some(owner) {
            return Ok(false);
        }
        let _: () = conn
            .expire(self.lock_key(name), ttl.as_secs().max(1) as i64)
            .await?;
        Ok(true)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let holder: Option<String> = conn.get(self.lock_key(name)).await?;
        if holder.as_deref() == Some(owner) {
            let _: () = conn.del(self.lock_key(name)).await?;
        }
        Ok(())
    }
}

/// One coordination backend handle per tenant, built once at startup and
/// passed where needed.
pub struct CoordinationPool {
    backends: HashMap<String, Arc<dyn CoordinationBackend>>,
}

pub const DEFAULT_TENANT: &str = "default";

impl CoordinationPool {
    pub async fn from_config(config: &CoordinationConfig) -> Result<Self> {
        let mut backends: HashMap<String, Arc<dyn CoordinationBackend>> = HashMap::new();

        let tenants = if config.tenants.is_empty() {
            vec![DEFAULT_TENANT.to_string()]
        } else {
            config.tenants.clone()
        };

        for tenant in &tenants {
            let backend: Arc<dyn CoordinationBackend> = match config.backend {
                CoordinationBackendKind::InMemory => Arc::new(InMemoryCoordination::new()),
                CoordinationBackendKind::Redis => {
                    let url = config.redis_url.as_deref().ok_or_else(|| {
                        AppError::Configuration(
                            "coordination.redis_url is required for the redis backend".to_string(),
                        )
                    })?;
                    Arc::new(RedisCoordination::new(url, tenant).await?)
                }
            };
            backends.insert(tenant.clone(), backend);
        }

        Ok(Self { backends })
    }

    pub fn for_single_backend(backend: Arc<dyn CoordinationBackend>) -> Self {
        let mut backends = HashMap::new();
        backends.insert(DEFAULT_TENANT.to_string(), backend);
        Self { backends }
    }

    pub fn tenant(&self, tenant: &str) -> Result<Arc<dyn CoordinationBackend>> {
        self.backends
            .get(tenant)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Tenant {}", tenant)))
    }

    pub fn tenants(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(|s| s.as_str())
    }
}
