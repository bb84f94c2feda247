//! 租户/区域隔离的缓存存储
//!
//! 使用 DashMap 保存缓存项，并为每个缓存键维护一把独立的互斥锁：
//! - 读操作（contains / try_get）不加锁，只依赖 DashMap 自身的一致性
//! - 构建与替换（get_or_add / add_or_update / remove）在该键的锁内完成，
//!   保证同一个键同一时间最多只有一个工厂函数在执行
//! - 不同键之间互不阻塞
//!
//! 锁表不会淘汰条目：每个出现过的键都会保留一把锁。规则名和评估器名的
//! 数量是有界的，因此锁表大小也有上界。

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::error::{DisposeError, Result, RuleError};

/// 所有租户共享时使用的租户标识
pub const ALL_TENANTS: &str = "All_Tenants";

/// 默认区域标识
pub const DEFAULT_CULTURE: &str = "en-GB";

/// 缓存键：名称 + 租户 + 区域，三者完全相同（区分大小写）才视为同一个键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub item_name: String,
    pub tenant_id: String,
    pub culture_id: String,
}

impl CacheKey {
    pub fn new(
        item_name: impl Into<String>,
        tenant_id: impl Into<String>,
        culture_id: impl Into<String>,
    ) -> Self {
        Self {
            item_name: item_name.into(),
            tenant_id: tenant_id.into(),
            culture_id: culture_id.into(),
        }
    }

    /// 使用默认租户和区域创建缓存键
    pub fn with_defaults(item_name: impl Into<String>) -> Self {
        Self::new(item_name, ALL_TENANTS, DEFAULT_CULTURE)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.item_name, self.tenant_id, self.culture_id)
    }
}

/// 释放钩子：缓存值被替换或移除时调用
pub trait Disposable: Send + Sync {
    fn dispose(&self) -> std::result::Result<(), DisposeError>;
}

/// 缓存项
///
/// 包装一个类型擦除的值，以及可选的释放钩子。
#[derive(Clone)]
pub struct CacheItem {
    value: Arc<dyn Any + Send + Sync>,
    disposer: Option<Arc<dyn Disposable>>,
}

impl CacheItem {
    /// 创建不需要释放的缓存项
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            disposer: None,
        }
    }

    /// 创建带释放钩子的缓存项，值本身实现了 [`Disposable`]
    pub fn disposable<T: Disposable + 'static>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            value: value.clone(),
            disposer: Some(value),
        }
    }

    /// 按类型取出值
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    pub fn is_disposable(&self) -> bool {
        self.disposer.is_some()
    }

    fn dispose(&self) -> std::result::Result<(), DisposeError> {
        match &self.disposer {
            Some(disposer) => disposer.dispose(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CacheItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItem")
            .field("disposable", &self.is_disposable())
            .finish()
    }
}

/// 缓存存储
pub struct CacheStore {
    items: DashMap<CacheKey, CacheItem>,
    /// 每个键一把锁，按需创建，创建后一直保留
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    /// 获取键锁的等待上限，None 表示一直等待
    lock_timeout: Option<Duration>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            locks: DashMap::new(),
            lock_timeout: None,
        }
    }

    /// 设置获取键锁的等待上限，超时后调用方会收到 `LockTimeout`
    pub fn with_lock_timeout(lock_timeout: Option<Duration>) -> Self {
        Self {
            lock_timeout,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 当前锁表大小（只增不减）
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// 检查缓存项是否存在
    pub fn contains_item(&self, name: &str, tenant_id: &str, culture_id: &str) -> bool {
        self.items
            .contains_key(&CacheKey::new(name, tenant_id, culture_id))
    }

    /// 非阻塞读取，类型不符时返回 None
    pub fn try_get_item<T: Send + Sync + 'static>(
        &self,
        name: &str,
        tenant_id: &str,
        culture_id: &str,
    ) -> Option<Arc<T>> {
        let key = CacheKey::new(name, tenant_id, culture_id);
        let item = self.items.get(&key).map(|entry| entry.value().clone())?;
        item.downcast::<T>()
    }

    /// 获取或构建缓存项
    ///
    /// 缓存未命中时获取该键的锁，锁内再次检查后调用 `factory`，
    /// 写入缓存后释放锁。工厂失败时锁同样会被释放，缓存保持不变。
    #[instrument(skip(self, factory), fields(item_type = type_name::<T>()))]
    pub fn get_or_add_item<T, F>(
        &self,
        name: &str,
        factory: F,
        tenant_id: &str,
        culture_id: &str,
    ) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<CacheItem>,
    {
        let key = CacheKey::new(name, tenant_id, culture_id);

        if let Some(existing) = self.lookup::<T>(&key)? {
            debug!(key = %key, "缓存命中");
            return Ok(existing);
        }

        let lock = self.key_lock(&key);
        let _guard = self.acquire(&lock, &key)?;

        // 等锁期间其他调用方可能已经完成构建
        if let Some(existing) = self.lookup::<T>(&key)? {
            debug!(key = %key, "等待期间已被其他调用方构建");
            return Ok(existing);
        }

        let item = factory()?;
        let value = item
            .downcast::<T>()
            .ok_or_else(|| RuleError::CacheTypeMismatch {
                key: key.to_string(),
            })?;
        self.items.insert(key.clone(), item);

        debug!(key = %key, "缓存项已构建");
        Ok(value)
    }

    /// 新增或替换缓存项
    ///
    /// 被替换的旧值如果可释放则调用释放钩子，释放失败只记录日志，不影响更新。
    #[instrument(skip(self, item))]
    pub fn add_or_update_item(
        &self,
        name: &str,
        item: CacheItem,
        tenant_id: &str,
        culture_id: &str,
    ) -> Result<()> {
        let key = CacheKey::new(name, tenant_id, culture_id);
        let lock = self.key_lock(&key);
        let _guard = self.acquire(&lock, &key)?;

        if let Some(previous) = self.items.insert(key.clone(), item) {
            if let Err(e) = previous.dispose() {
                warn!(key = %key, error = %e, "释放被替换的缓存项失败，已忽略");
            }
            info!(key = %key, "缓存项已替换");
        } else {
            info!(key = %key, "缓存项已添加");
        }

        Ok(())
    }

    /// 移除缓存项并释放
    ///
    /// 返回是否确实移除了缓存项。释放失败时缓存项已经移除，
    /// 错误以 `DisposingRemovedItem` 返回给调用方。
    #[instrument(skip(self))]
    pub fn remove_item(&self, name: &str, tenant_id: &str, culture_id: &str) -> Result<bool> {
        let key = CacheKey::new(name, tenant_id, culture_id);
        let lock = self.key_lock(&key);
        let _guard = self.acquire(&lock, &key)?;

        let Some((_, removed)) = self.items.remove(&key) else {
            debug!(key = %key, "移除不存在的缓存项");
            return Ok(false);
        };

        removed
            .dispose()
            .map_err(|source| RuleError::DisposingRemovedItem {
                key: key.to_string(),
                source,
            })?;

        info!(key = %key, "缓存项已移除");
        Ok(true)
    }

    /// 逐键加锁移除全部缓存项并调用释放钩子，返回移除的数量
    ///
    /// 按锁表而不是缓存项遍历，正在构建的键会等构建完成后再移除。
    /// 释放失败与替换时一样只记录日志；获取锁超时的键保留不动。
    pub fn clear_and_dispose(&self) -> usize {
        let keys: Vec<CacheKey> = self.locks.iter().map(|entry| entry.key().clone()).collect();
        let mut removed = 0;

        for key in keys {
            let lock = self.key_lock(&key);
            let _guard = match self.acquire(&lock, &key) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(key = %key, error = %e, "清空时获取缓存锁失败，跳过该键");
                    continue;
                }
            };

            if let Some((_, item)) = self.items.remove(&key) {
                if let Err(e) = item.dispose() {
                    warn!(key = %key, error = %e, "释放缓存项失败，已忽略");
                }
                removed += 1;
            }
        }

        info!("已清空并释放 {} 个缓存项", removed);
        removed
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Result<Option<Arc<T>>> {
        let Some(item) = self.items.get(key).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        item.downcast::<T>()
            .map(Some)
            .ok_or_else(|| RuleError::CacheTypeMismatch {
                key: key.to_string(),
            })
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn acquire<'a>(&self, lock: &'a Mutex<()>, key: &CacheKey) -> Result<MutexGuard<'a, ()>> {
        match self.lock_timeout {
            None => Ok(lock.lock()),
            Some(timeout) => lock.try_lock_for(timeout).ok_or_else(|| {
                warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "获取缓存锁超时");
                RuleError::LockTimeout {
                    key: key.to_string(),
                }
            }),
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, mpsc};
    use std::thread;

    struct Probe {
        disposed: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Disposable for Probe {
        fn dispose(&self) -> std::result::Result<(), DisposeError> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DisposeError("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_contains_and_try_get() {
        let store = CacheStore::new();
        store
            .add_or_update_item("rule", CacheItem::new(42_u32), ALL_TENANTS, DEFAULT_CULTURE)
            .unwrap();

        assert!(store.contains_item("rule", ALL_TENANTS, DEFAULT_CULTURE));
        assert!(!store.contains_item("rule", "Tenant1", DEFAULT_CULTURE));
        assert!(!store.contains_item("rule", ALL_TENANTS, "fr-FR"));
        assert!(!store.contains_item("RULE", ALL_TENANTS, DEFAULT_CULTURE));

        let value = store.try_get_item::<u32>("rule", ALL_TENANTS, DEFAULT_CULTURE);
        assert_eq!(value.as_deref(), Some(&42));
        assert!(store
            .try_get_item::<String>("rule", ALL_TENANTS, DEFAULT_CULTURE)
            .is_none());
    }

    #[test]
    fn test_get_or_add_runs_factory_once_under_contention() {
        let store = Arc::new(CacheStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .get_or_add_item::<String, _>(
                            "evaluator",
                            || {
                                calls.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(20));
                                Ok(CacheItem::new("built".to_string()))
                            },
                            ALL_TENANTS,
                            DEFAULT_CULTURE,
                        )
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<Arc<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let store = Arc::new(CacheStore::new());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let blocked = {
            let store = store.clone();
            thread::spawn(move || {
                store
                    .get_or_add_item::<u32, _>(
                        "slow",
                        move || {
                            started_tx.send(()).unwrap();
                            release_rx.recv().unwrap();
                            Ok(CacheItem::new(1_u32))
                        },
                        ALL_TENANTS,
                        DEFAULT_CULTURE,
                    )
                    .unwrap()
            })
        };

        started_rx.recv().unwrap();
        // "slow" 的工厂仍持有锁，另一个键必须可以立即完成
        let fast = store
            .get_or_add_item::<u32, _>("fast", || Ok(CacheItem::new(2_u32)), ALL_TENANTS, DEFAULT_CULTURE)
            .unwrap();
        assert_eq!(*fast, 2);

        release_tx.send(()).unwrap();
        assert_eq!(*blocked.join().unwrap(), 1);
    }

    #[test]
    fn test_factory_failure_releases_lock() {
        let store = CacheStore::with_lock_timeout(Some(Duration::from_millis(100)));

        let result = store.get_or_add_item::<u32, _>(
            "broken",
            || {
                Err(RuleError::MissingEvaluator {
                    evaluator_name: "x".to_string(),
                    data_type: "y".to_string(),
                })
            },
            ALL_TENANTS,
            DEFAULT_CULTURE,
        );
        assert!(result.is_err());
        assert!(!store.contains_item("broken", ALL_TENANTS, DEFAULT_CULTURE));

        let value = store
            .get_or_add_item::<u32, _>("broken", || Ok(CacheItem::new(7_u32)), ALL_TENANTS, DEFAULT_CULTURE)
            .unwrap();
        assert_eq!(*value, 7);
    }

    #[test]
    fn test_get_or_add_type_mismatch() {
        let store = CacheStore::new();
        let result = store.get_or_add_item::<u32, _>(
            "typed",
            || Ok(CacheItem::new("text".to_string())),
            ALL_TENANTS,
            DEFAULT_CULTURE,
        );
        assert!(matches!(result, Err(RuleError::CacheTypeMismatch { .. })));
    }

    #[test]
    fn test_update_disposes_previous_and_swallows_errors() {
        let store = CacheStore::new();
        let disposed = Arc::new(AtomicUsize::new(0));

        store
            .add_or_update_item(
                "item",
                CacheItem::disposable(Probe {
                    disposed: disposed.clone(),
                    fail: true,
                }),
                ALL_TENANTS,
                DEFAULT_CULTURE,
            )
            .unwrap();

        store
            .add_or_update_item("item", CacheItem::new(1_u8), ALL_TENANTS, DEFAULT_CULTURE)
            .unwrap();

        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(
            store
                .try_get_item::<u8>("item", ALL_TENANTS, DEFAULT_CULTURE)
                .as_deref(),
            Some(&1)
        );
    }

    #[test]
    fn test_remove_surfaces_dispose_error() {
        let store = CacheStore::new();
        let disposed = Arc::new(AtomicUsize::new(0));
        store
            .add_or_update_item(
                "item",
                CacheItem::disposable(Probe {
                    disposed: disposed.clone(),
                    fail: true,
                }),
                "Tenant1",
                DEFAULT_CULTURE,
            )
            .unwrap();

        let err = store
            .remove_item("item", "Tenant1", DEFAULT_CULTURE)
            .unwrap_err();
        assert_eq!(err.code(), "DISPOSING_REMOVED_ITEM");
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(!store.contains_item("item", "Tenant1", DEFAULT_CULTURE));
    }

    #[test]
    fn test_remove_missing_and_success() {
        let store = CacheStore::new();
        assert!(!store.remove_item("none", ALL_TENANTS, DEFAULT_CULTURE).unwrap());

        let disposed = Arc::new(AtomicUsize::new(0));
        store
            .add_or_update_item(
                "item",
                CacheItem::disposable(Probe {
                    disposed: disposed.clone(),
                    fail: false,
                }),
                ALL_TENANTS,
                DEFAULT_CULTURE,
            )
            .unwrap();
        assert!(store.remove_item("item", ALL_TENANTS, DEFAULT_CULTURE).unwrap());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_and_dispose() {
        let store = CacheStore::new();
        let disposed = Arc::new(AtomicUsize::new(0));
        for (name, fail) in [("a", false), ("b", true)] {
            store
                .add_or_update_item(
                    name,
                    CacheItem::disposable(Probe {
                        disposed: disposed.clone(),
                        fail,
                    }),
                    ALL_TENANTS,
                    DEFAULT_CULTURE,
                )
                .unwrap();
        }
        store
            .add_or_update_item("plain", CacheItem::new(1_u8), ALL_TENANTS, DEFAULT_CULTURE)
            .unwrap();

        assert_eq!(store.clear_and_dispose(), 3);
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_waits_for_in_flight_build() {
        let store = Arc::new(CacheStore::new());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let builder = {
            let store = store.clone();
            thread::spawn(move || {
                store.get_or_add_item::<u32, _>(
                    "building",
                    move || {
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(CacheItem::new(1_u32))
                    },
                    ALL_TENANTS,
                    DEFAULT_CULTURE,
                )
            })
        };

        started_rx.recv().unwrap();
        let clearer = {
            let store = store.clone();
            thread::spawn(move || store.clear_and_dispose())
        };
        thread::sleep(Duration::from_millis(20));
        release_tx.send(()).unwrap();

        assert!(builder.join().unwrap().is_ok());
        assert_eq!(clearer.join().unwrap(), 1);
        assert!(!store.contains_item("building", ALL_TENANTS, DEFAULT_CULTURE));
    }

    #[test]
    fn test_lock_timeout() {
        let store = Arc::new(CacheStore::with_lock_timeout(Some(Duration::from_millis(50))));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = store.clone();
            thread::spawn(move || {
                store.get_or_add_item::<u32, _>(
                    "held",
                    move || {
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(CacheItem::new(1_u32))
                    },
                    ALL_TENANTS,
                    DEFAULT_CULTURE,
                )
            })
        };

        started_rx.recv().unwrap();
        let err = store
            .add_or_update_item("held", CacheItem::new(2_u32), ALL_TENANTS, DEFAULT_CULTURE)
            .unwrap_err();
        assert!(matches!(err, RuleError::LockTimeout { .. }));

        release_tx.send(()).unwrap();
        assert!(holder.join().unwrap().is_ok());
        assert_eq!(store.lock_count(), 1);
    }
}
