//! 资源锁管理
//!
//! 以 Agent ID 标识持有者（无令牌），锁表存放在 StateManager 的 ProjectState.locks 中，
//! 因此检查点与回滚会一并覆盖锁表。
//!
//! 语义：
//! - 独占请求遇到任何未过期的锁失败；任何请求遇到他人的独占锁失败
//! - 调用方已持有该锁时视为续期（独占请求会把自己的共享锁升级为独占）
//! - 共享遇共享：授予但不登记第二持有者。这里的 shared 是「建议性、非独占」，不是带引用计数的读锁；
//!   锁表中每个资源至多一条 LockInfo，持有者始终是第一个拿到它的 Agent
//! - 已过期的锁在下一次查询/获取时即视为不存在，后台回收任务定期清理残留

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::state::{now_ms, LockInfo, LockType, StateManager};

/// 默认锁有效期：5 分钟
pub const DEFAULT_LOCK_TTL_MS: u64 = 300_000;
/// 默认回收周期：60 秒
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// 单个资源的授予判定
#[derive(Debug, Clone, PartialEq, Eq)]
enum Grant {
    New,
    Extend,
    /// 他人的共享锁与本次共享请求共存，锁表不变
    Coexist,
    Denied { holder: String },
}

fn evaluate(
    locks: &BTreeMap<String, LockInfo>,
    agent_id: &str,
    path: &str,
    lock_type: LockType,
) -> Grant {
    match locks.get(path) {
        None => Grant::New,
        Some(lock) if lock.agent_id == agent_id => Grant::Extend,
        Some(lock) if lock.conflicts_with(lock_type) => Grant::Denied {
            holder: lock.agent_id.clone(),
        },
        Some(_) => Grant::Coexist,
    }
}

/// 清除指定路径上已过期的锁，返回是否有删除
fn purge_expired(locks: &mut BTreeMap<String, LockInfo>, paths: &[String], now: i64) -> bool {
    let mut changed = false;
    for path in paths {
        if locks.get(path).is_some_and(|l| l.is_expired(now)) {
            locks.remove(path);
            changed = true;
        }
    }
    changed
}

pub struct LockManager {
    state: Arc<StateManager>,
    default_ttl_ms: u64,
}

impl LockManager {
    pub fn new(state: Arc<StateManager>, default_ttl_ms: u64) -> Self {
        Self {
            state,
            default_ttl_ms: default_ttl_ms.max(1),
        }
    }

    pub fn default_ttl_ms(&self) -> u64 {
        self.default_ttl_ms
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_grant(
        &self,
        locks: &mut BTreeMap<String, LockInfo>,
        grant: &Grant,
        agent_id: &str,
        path: &str,
        lock_type: LockType,
        operation: &str,
        ttl_ms: u64,
        now: i64,
    ) -> bool {
        let expires_at = now.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX));
        match grant {
            Grant::New => {
                locks.insert(
                    path.to_string(),
                    LockInfo {
                        resource_path: path.to_string(),
                        agent_id: agent_id.to_string(),
                        lock_type,
                        acquired_at: now,
                        expires_at,
                        operation: operation.to_string(),
                    },
                );
                true
            }
            Grant::Extend => {
                if let Some(lock) = locks.get_mut(path) {
                    lock.expires_at = expires_at;
                    lock.operation = operation.to_string();
                    if lock_type == LockType::Exclusive {
                        lock.lock_type = LockType::Exclusive;
                    }
                }
                true
            }
            Grant::Coexist | Grant::Denied { .. } => false,
        }
    }

    /// 非阻塞获取；timeout_ms 为锁有效期（None 使用默认值）
    pub async fn acquire_lock(
        &self,
        agent_id: &str,
        resource_path: &str,
        lock_type: LockType,
        operation: &str,
        timeout_ms: Option<u64>,
    ) -> bool {
        let ttl = timeout_ms.unwrap_or(self.default_ttl_ms);
        let now = now_ms();
        let paths = [resource_path.to_string()];
        let grant = self
            .state
            .modify_locks(|locks| {
                let reaped = purge_expired(locks, &paths, now);
                let grant = evaluate(locks, agent_id, resource_path, lock_type);
                let changed = self.apply_grant(
                    locks,
                    &grant,
                    agent_id,
                    resource_path,
                    lock_type,
                    operation,
                    ttl,
                    now,
                );
                (grant, reaped || changed)
            })
            .await;

        match grant {
            Grant::Denied { holder } => {
                tracing::debug!(
                    agent = agent_id,
                    resource = resource_path,
                    holder = %holder,
                    "Lock denied"
                );
                false
            }
            Grant::New => {
                tracing::debug!(agent = agent_id, resource = resource_path, ?lock_type, "Lock acquired");
                true
            }
            Grant::Extend | Grant::Coexist => true,
        }
    }

    /// 固定间隔重试获取（非指数退避）；最多尝试 1 + max_retries 次
    #[allow(clippy::too_many_arguments)]
    pub async fn acquire_lock_with_retry(
        &self,
        agent_id: &str,
        resource_path: &str,
        lock_type: LockType,
        operation: &str,
        timeout_ms: Option<u64>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> bool {
        for attempt in 0..=max_retries {
            if self
                .acquire_lock(agent_id, resource_path, lock_type, operation, timeout_ms)
                .await
            {
                return true;
            }
            if attempt < max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }
        tracing::warn!(
            agent = agent_id,
            resource = resource_path,
            retries = max_retries,
            "Lock acquisition gave up"
        );
        false
    }

    /// 全有或全无：任一资源冲突则本次一个都不授予
    pub async fn acquire_multiple_locks(
        &self,
        agent_id: &str,
        resources: &[String],
        lock_type: LockType,
        operation: &str,
    ) -> bool {
        let mut paths: Vec<String> = resources.to_vec();
        paths.sort();
        paths.dedup();
        let ttl = self.default_ttl_ms;
        let now = now_ms();

        self.state
            .modify_locks(|locks| {
                let reaped = purge_expired(locks, &paths, now);
                let grants: Vec<Grant> = paths
                    .iter()
                    .map(|p| evaluate(locks, agent_id, p, lock_type))
                    .collect();
                if let Some(Grant::Denied { holder }) =
                    grants.iter().find(|g| matches!(g, Grant::Denied { .. }))
                {
                    tracing::debug!(agent = agent_id, holder = %holder, "Multi-lock denied");
                    return (false, reaped);
                }
                let mut changed = reaped;
                for (path, grant) in paths.iter().zip(&grants) {
                    changed |= self.apply_grant(
                        locks, grant, agent_id, path, lock_type, operation, ttl, now,
                    );
                }
                (true, changed)
            })
            .await
    }

    /// 释放单个锁；仅持有者可释放
    pub async fn release_lock(&self, agent_id: &str, resource_path: &str) -> bool {
        self.state
            .modify_locks(|locks| match locks.get(resource_path) {
                Some(lock) if lock.agent_id == agent_id => {
                    locks.remove(resource_path);
                    (true, true)
                }
                _ => (false, false),
            })
            .await
    }

    /// 释放该 Agent 持有的全部锁，返回释放数量
    pub async fn release_all_locks(&self, agent_id: &str) -> usize {
        let released = self
            .state
            .modify_locks(|locks| {
                let before = locks.len();
                locks.retain(|_, lock| lock.agent_id != agent_id);
                let released = before - locks.len();
                (released, released > 0)
            })
            .await;
        if released > 0 {
            tracing::debug!(agent = agent_id, released, "Released all locks");
        }
        released
    }

    /// 续期；非持有者或锁已过期时拒绝
    pub async fn extend_lock(
        &self,
        agent_id: &str,
        resource_path: &str,
        additional_ms: Option<u64>,
    ) -> bool {
        let ttl = additional_ms.unwrap_or(self.default_ttl_ms);
        let now = now_ms();
        self.state
            .modify_locks(|locks| match locks.get_mut(resource_path) {
                Some(lock) if lock.agent_id == agent_id && !lock.is_expired(now) => {
                    lock.expires_at = now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX));
                    (true, true)
                }
                _ => (false, false),
            })
            .await
    }

    pub async fn is_locked(&self, resource_path: &str) -> bool {
        self.get_lock(resource_path).await.is_some()
    }

    /// 当前有效的锁（已过期视为不存在）
    pub async fn get_lock(&self, resource_path: &str) -> Option<LockInfo> {
        let now = now_ms();
        self.state
            .locks()
            .await
            .remove(resource_path)
            .filter(|l| !l.is_expired(now))
    }

    pub async fn locks_held_by(&self, agent_id: &str) -> Vec<LockInfo> {
        let now = now_ms();
        self.state
            .locks()
            .await
            .into_values()
            .filter(|l| l.agent_id == agent_id && !l.is_expired(now))
            .collect()
    }

    /// 清除所有已过期的锁，返回清除数量
    pub async fn reap_expired(&self) -> usize {
        let now = now_ms();
        self.state
            .modify_locks(|locks| {
                let before = locks.len();
                locks.retain(|_, lock| !lock.is_expired(now));
                let reaped = before - locks.len();
                (reaped, reaped > 0)
            })
            .await
    }

    /// 启动后台回收任务，直到 cancel 被触发
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Lock reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = manager.reap_expired().await;
                        if reaped > 0 {
                            tracing::info!(reaped, "Reaped expired locks");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(StateManager::default()), DEFAULT_LOCK_TTL_MS)
    }

    const SCENE: &str = "res://scene.tscn";

    #[tokio::test]
    async fn test_exclusive_blocks_other_agent_until_release() {
        let locks = manager();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", None).await);
        assert!(!locks.acquire_lock("agent2", SCENE, LockType::Exclusive, "edit", None).await);
        assert!(!locks.acquire_lock("agent2", SCENE, LockType::Shared, "read", None).await);

        assert!(locks.release_lock("agent1", SCENE).await);
        assert!(locks.acquire_lock("agent2", SCENE, LockType::Exclusive, "edit", None).await);
        assert_eq!(locks.get_lock(SCENE).await.unwrap().agent_id, "agent2");
    }

    #[tokio::test]
    async fn test_oversized_ttl_saturates_instead_of_expiring() {
        let locks = manager();
        assert!(
            locks
                .acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", Some(u64::MAX))
                .await
        );
        assert!(locks.is_locked(SCENE).await);
        assert_eq!(locks.get_lock(SCENE).await.unwrap().expires_at, i64::MAX);

        assert!(locks.extend_lock("agent1", SCENE, Some(u64::MAX)).await);
        assert!(locks.is_locked(SCENE).await);
        assert!(!locks.acquire_lock("agent2", SCENE, LockType::Exclusive, "edit", None).await);
    }

    #[tokio::test]
    async fn test_release_requires_holder() {
        let locks = manager();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", None).await);
        assert!(!locks.release_lock("agent2", SCENE).await);
        assert!(locks.is_locked(SCENE).await);
    }

    #[tokio::test]
    async fn test_reacquire_is_extension() {
        let locks = manager();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Shared, "read", Some(1_000)).await);
        let first = locks.get_lock(SCENE).await.unwrap();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", Some(60_000)).await);
        let second = locks.get_lock(SCENE).await.unwrap();
        assert!(second.expires_at > first.expires_at);
        assert_eq!(second.lock_type, LockType::Exclusive);
        assert_eq!(second.acquired_at, first.acquired_at);
    }

    #[tokio::test]
    async fn test_shared_locks_coexist_with_single_holder() {
        let locks = manager();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Shared, "read", None).await);
        assert!(locks.acquire_lock("agent2", SCENE, LockType::Shared, "read", None).await);
        assert_eq!(locks.get_lock(SCENE).await.unwrap().agent_id, "agent1");
        assert!(!locks.acquire_lock("agent2", SCENE, LockType::Exclusive, "edit", None).await);
    }

    #[tokio::test]
    async fn test_expired_lock_is_absent_before_reaper() {
        let locks = manager();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", Some(10)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!locks.is_locked(SCENE).await);
        assert!(locks.acquire_lock("agent2", SCENE, LockType::Exclusive, "edit", None).await);
        assert_eq!(locks.get_lock(SCENE).await.unwrap().agent_id, "agent2");
    }

    #[tokio::test]
    async fn test_extend_rejected_for_non_holder() {
        let locks = manager();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", Some(1_000)).await);
        assert!(!locks.extend_lock("agent2", SCENE, Some(60_000)).await);
        assert!(locks.extend_lock("agent1", SCENE, Some(60_000)).await);
        assert!(!locks.extend_lock("agent1", "res://other.tscn", None).await);
    }

    #[tokio::test]
    async fn test_multiple_locks_all_or_nothing() {
        let locks = manager();
        assert!(locks.acquire_lock("agent2", "res://b.tscn", LockType::Exclusive, "edit", None).await);

        let wanted = vec!["res://a.tscn".to_string(), "res://b.tscn".to_string()];
        assert!(!locks.acquire_multiple_locks("agent1", &wanted, LockType::Exclusive, "batch").await);
        assert!(!locks.is_locked("res://a.tscn").await);

        assert!(locks.release_lock("agent2", "res://b.tscn").await);
        assert!(locks.acquire_multiple_locks("agent1", &wanted, LockType::Exclusive, "batch").await);
        assert_eq!(locks.locks_held_by("agent1").await.len(), 2);
        assert_eq!(locks.release_all_locks("agent1").await, 2);
        assert!(locks.locks_held_by("agent1").await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_holder_releases() {
        let locks = Arc::new(manager());
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", None).await);

        let releaser = Arc::clone(&locks);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release_lock("agent1", SCENE).await;
        });

        assert!(
            locks
                .acquire_lock_with_retry(
                    "agent2",
                    SCENE,
                    LockType::Exclusive,
                    "edit",
                    None,
                    10,
                    Duration::from_millis(10),
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let locks = manager();
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", None).await);
        assert!(
            !locks
                .acquire_lock_with_retry(
                    "agent2",
                    SCENE,
                    LockType::Exclusive,
                    "edit",
                    None,
                    2,
                    Duration::from_millis(1),
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_reaper_removes_expired_locks() {
        let locks = Arc::new(manager());
        assert!(locks.acquire_lock("agent1", SCENE, LockType::Exclusive, "edit", Some(5)).await);
        assert!(locks.acquire_lock("agent1", "res://keep.tscn", LockType::Exclusive, "edit", None).await);

        let cancel = CancellationToken::new();
        let handle = locks.spawn_reaper(Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();
        handle.await.unwrap();

        let table = locks.state.locks().await;
        assert!(!table.contains_key(SCENE));
        assert!(table.contains_key("res://keep.tscn"));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let locks = Arc::new(manager());
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                locks
                    .acquire_lock(&format!("agent{i}"), SCENE, LockType::Exclusive, "edit", None)
                    .await
            }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }
}
