//! 事件聚合器
//!
//! 发布即返回（fire-and-forget）：每个订阅者在独立的 Tokio 任务中处理事件，
//! 发布方不等待处理完成，也不会收到处理器的错误或 panic。
//!
//! - 同一个处理器实例（同一个 `Arc`）重复订阅只会投递一次
//! - [`Subscription::dispose`] 取消订阅，重复调用无副作用；丢弃 `Subscription` 不会取消订阅
//! - 取消信号是协作式的：任务开始前已取消则跳过处理器，运行中的处理器自行检查
//! - 配置了类型解析函数时，额外向其请求 `EventHandler<E>` 服务，解析不到时静默跳过

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::data::Payload;
use crate::error::RuleError;
use crate::observability::metrics;
use crate::resolver::{ServiceType, TypeResolver};
use crate::results::RuleResult;

/// 事件处理器
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, event: E, cancel: CancellationToken) -> anyhow::Result<()>;
}

struct FnHandler<E, F> {
    f: F,
    _event: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for FnHandler<E, F>
where
    E: Send + 'static,
    F: Fn(E, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: E, cancel: CancellationToken) -> anyhow::Result<()> {
        (self.f)(event, cancel).await
    }
}

/// 用异步闭包构建事件处理器
pub fn handler_fn<E, F, Fut>(f: F) -> Arc<dyn EventHandler<E>>
where
    E: Send + 'static,
    F: Fn(E, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _event: PhantomData,
    })
}

/// 把事件处理器包装成类型解析函数的返回值
pub fn handler_instance<E: 'static>(handler: Arc<dyn EventHandler<E>>) -> Arc<dyn Any + Send + Sync> {
    Arc::new(handler)
}

/// 条件评估事件，租户取自评估所用的数据
#[derive(Debug, Clone)]
pub struct ConditionResultEvent {
    pub event_id: Uuid,
    pub event_type_name: String,
    pub rule_name: String,
    pub condition_name: String,
    pub is_success: bool,
    pub failure_message: String,
    /// 条件匹配到的数据，数据上下文缺失时为 None
    pub payload: Option<Payload>,
    pub tenant_id: String,
    pub exceptions: Vec<Arc<RuleError>>,
    pub created_at: DateTime<Utc>,
}

/// 规则评估事件，租户取自规则本身
#[derive(Debug, Clone)]
pub struct RuleResultEvent<T> {
    pub event_id: Uuid,
    pub event_type_name: String,
    pub rule_name: String,
    pub is_success: bool,
    pub tenant_id: String,
    pub result: Arc<RuleResult<T>>,
    pub created_at: DateTime<Utc>,
}

struct Subscriber {
    id: u64,
    /// 处理器 `Arc` 的地址，用于识别重复订阅
    address: usize,
    /// 实际类型为 `Arc<dyn EventHandler<E>>`
    handler: Arc<dyn Any + Send + Sync>,
}

struct Inner {
    subscribers: DashMap<TypeId, Vec<Subscriber>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    type_resolver: Option<TypeResolver>,
}

/// 事件聚合器，克隆后共享同一份订阅表
#[derive(Clone)]
pub struct EventAggregator {
    inner: Arc<Inner>,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EventAggregator {
    pub fn new(type_resolver: Option<TypeResolver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                tracker: TaskTracker::new(),
                type_resolver,
            }),
        }
    }

    /// 订阅事件 `E`
    pub fn subscribe<E>(&self, handler: Arc<dyn EventHandler<E>>) -> Subscription
    where
        E: Clone + Send + Sync + 'static,
    {
        let address = handler_address(&handler);
        let mut entry = self.inner.subscribers.entry(TypeId::of::<E>()).or_default();

        if entry.iter().any(|s| s.address == address) {
            debug!(event_type = type_name::<E>(), "处理器已订阅，忽略重复订阅");
            return Subscription::noop();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        entry.push(Subscriber {
            id,
            address,
            handler: Arc::new(handler),
        });
        debug!(event_type = type_name::<E>(), subscription_id = id, "新增事件订阅");

        Subscription {
            aggregator: Arc::downgrade(&self.inner),
            type_id: TypeId::of::<E>(),
            id: Some(id),
            disposed: AtomicBool::new(false),
        }
    }

    /// 当前订阅事件 `E` 的处理器数量（不含类型解析函数提供的处理器）
    pub fn subscriber_count<E: 'static>(&self) -> usize {
        self.inner
            .subscribers
            .get(&TypeId::of::<E>())
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// 发布事件，立即返回
    ///
    /// 需要在 Tokio 运行时中调用，否则事件被丢弃并记录警告。
    pub fn publish<E>(&self, event: E, cancel: CancellationToken)
    where
        E: Clone + Send + Sync + 'static,
    {
        let handlers = self.collect_handlers::<E>();
        if handlers.is_empty() {
            debug!(event_type = type_name::<E>(), "没有订阅者");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(event_type = type_name::<E>(), "当前不在 Tokio 运行时中，事件被丢弃");
            return;
        };

        for handler in handlers {
            let event = event.clone();
            let cancel = cancel.clone();
            self.inner
                .tracker
                .spawn_on(dispatch(handler, event, cancel), &runtime);
        }
    }

    /// 等待所有已发布事件处理完成
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    fn collect_handlers<E: Send + Sync + 'static>(&self) -> Vec<Arc<dyn EventHandler<E>>> {
        let mut handlers: Vec<Arc<dyn EventHandler<E>>> = self
            .inner
            .subscribers
            .get(&TypeId::of::<E>())
            .map(|entry| {
                entry
                    .iter()
                    .filter_map(|s| s.handler.downcast_ref::<Arc<dyn EventHandler<E>>>().cloned())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(resolved) = self.resolve_handler::<E>() {
            let address = handler_address(&resolved);
            if !handlers.iter().any(|h| handler_address(h) == address) {
                handlers.push(resolved);
            }
        }

        handlers
    }

    fn resolve_handler<E: Send + Sync + 'static>(&self) -> Option<Arc<dyn EventHandler<E>>> {
        let resolver = self.inner.type_resolver.as_ref()?;
        let service = ServiceType::event_handler::<E>();
        let instance = resolver(&service)?;
        match instance.downcast_ref::<Arc<dyn EventHandler<E>>>() {
            Some(handler) => Some(handler.clone()),
            None => {
                warn!(service = %service, "类型解析函数返回的不是事件处理器，已忽略");
                None
            }
        }
    }

    fn unsubscribe(inner: &Inner, type_id: TypeId, id: u64) {
        if let Some(mut entry) = inner.subscribers.get_mut(&type_id) {
            entry.retain(|s| s.id != id);
            debug!(subscription_id = id, "取消事件订阅");
        }
    }
}

impl fmt::Debug for EventAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventAggregator")
            .field("event_types", &self.inner.subscribers.len())
            .field("in_flight", &self.inner.tracker.len())
            .finish()
    }
}

async fn dispatch<E>(handler: Arc<dyn EventHandler<E>>, event: E, cancel: CancellationToken)
where
    E: Send + 'static,
{
    let event_type = type_name::<E>();
    if cancel.is_cancelled() {
        debug!(event_type, "取消信号已触发，跳过处理器");
        metrics::record_event_dispatch(event_type, "cancelled");
        return;
    }

    match AssertUnwindSafe(handler.handle(event, cancel)).catch_unwind().await {
        Ok(Ok(())) => metrics::record_event_dispatch(event_type, "handled"),
        Ok(Err(e)) => {
            warn!(event_type, error = %e, "事件处理器执行失败");
            metrics::record_event_dispatch(event_type, "failed");
        }
        Err(_) => {
            warn!(event_type, "事件处理器发生 panic");
            metrics::record_event_dispatch(event_type, "panicked");
        }
    }
}

fn handler_address<E>(handler: &Arc<dyn EventHandler<E>>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// 订阅句柄
pub struct Subscription {
    aggregator: Weak<Inner>,
    type_id: TypeId,
    /// 重复订阅返回的句柄没有 id，释放时什么也不做
    id: Option<u64>,
    disposed: AtomicBool,
}

impl Subscription {
    fn noop() -> Self {
        Self {
            aggregator: Weak::new(),
            type_id: TypeId::of::<()>(),
            id: None,
            disposed: AtomicBool::new(false),
        }
    }

    /// 是否为重复订阅返回的空句柄
    pub fn is_noop(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// 取消订阅
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(id), Some(inner)) = (self.id, self.aggregator.upgrade()) {
            EventAggregator::unsubscribe(&inner, self.type_id, id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
