//! 评估器解析
//!
//! 按 `(评估器名, 数据类型)` 解析评估器实例，顺序为：
//! 1. 依赖注入注册表：通过外部提供的类型解析函数获取实例，解析不到时继续
//! 2. 内置评估器：`predicate`、`regex`
//! 3. 静态注册的自定义评估器工厂
//! 4. 以上都没有时返回 `MissingEvaluator`
//!
//! 解析结果按 `(评估器名<数据类型>, 租户, 区域)` 缓存，重复评估复用同一实例。

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::cache::{CacheItem, CacheStore};
use crate::error::{Result, RuleError};
use crate::evaluator::{CachedEvaluator, ConditionEvaluator, PredicateEvaluator, RegexEvaluator};
use crate::models::{PREDICATE_EVALUATOR, REGEX_EVALUATOR};

/// 向类型解析函数请求的服务描述
///
/// `type_argument` 对应泛型参数：开放注册的评估器会填入数据类型，
/// 事件处理器会填入事件类型。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceType {
    pub name: String,
    pub type_argument: Option<String>,
}

impl ServiceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_argument: None,
        }
    }

    pub fn generic(name: impl Into<String>, type_argument: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_argument: Some(type_argument.into()),
        }
    }

    /// 事件 `E` 的处理器服务
    pub fn event_handler<E: 'static>() -> Self {
        Self::generic("EventHandler", type_name::<E>())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.type_argument {
            Some(arg) => write!(f, "{}<{}>", self.name, arg),
            None => f.write_str(&self.name),
        }
    }
}

/// 外部类型解析函数，找不到服务时返回 None
///
/// 评估器以 `Arc<dyn ConditionEvaluator>` 的形式放在返回值中，
/// 可用 [`evaluator_instance`] 包装。需要支持并发调用。
pub type TypeResolver =
    Arc<dyn Fn(&ServiceType) -> Option<Arc<dyn Any + Send + Sync>> + Send + Sync>;

/// 把评估器包装成类型解析函数的返回值
pub fn evaluator_instance(evaluator: Arc<dyn ConditionEvaluator>) -> Arc<dyn Any + Send + Sync> {
    Arc::new(evaluator)
}

/// 依赖注入注册
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluatorRegistration {
    /// 开放泛型：按数据类型实例化
    Open(ServiceType),
    /// 具体类型：与数据类型无关
    Closed(ServiceType),
}

impl EvaluatorRegistration {
    fn service_for(&self, data_type: &str) -> ServiceType {
        match self {
            Self::Open(service) => ServiceType::generic(&service.name, data_type),
            Self::Closed(service) => service.clone(),
        }
    }
}

/// 静态自定义评估器工厂，入参为数据类型名，不支持该类型时返回 None
pub type EvaluatorFactory =
    Arc<dyn Fn(&str) -> Option<Arc<dyn ConditionEvaluator>> + Send + Sync>;

/// 评估器解析器
pub struct EvaluatorResolver {
    type_resolver: Option<TypeResolver>,
    registrations: DashMap<String, EvaluatorRegistration>,
    factories: DashMap<String, EvaluatorFactory>,
    evaluators: CacheStore,
}

impl EvaluatorResolver {
    pub fn new(type_resolver: Option<TypeResolver>, lock_timeout: Option<Duration>) -> Self {
        Self {
            type_resolver,
            registrations: DashMap::new(),
            factories: DashMap::new(),
            evaluators: CacheStore::with_lock_timeout(lock_timeout),
        }
    }

    pub fn has_type_resolver(&self) -> bool {
        self.type_resolver.is_some()
    }

    /// 注册依赖注入评估器，同名注册会被替换
    pub fn register_for_dependency_injection(
        &self,
        evaluator_name: impl Into<String>,
        registration: EvaluatorRegistration,
    ) {
        let evaluator_name = evaluator_name.into();
        info!(evaluator = %evaluator_name, registration = ?registration, "注册依赖注入评估器");
        self.registrations.insert(evaluator_name, registration);
        self.invalidate();
    }

    /// 注册静态自定义评估器工厂，同名注册会被替换
    pub fn register_custom_evaluator(
        &self,
        evaluator_name: impl Into<String>,
        factory: EvaluatorFactory,
    ) {
        let evaluator_name = evaluator_name.into();
        info!(evaluator = %evaluator_name, "注册自定义评估器");
        self.factories.insert(evaluator_name, factory);
        self.invalidate();
    }

    /// 向类型解析函数请求服务，未配置解析函数时返回 None
    pub fn resolve_service(&self, service: &ServiceType) -> Option<Arc<dyn Any + Send + Sync>> {
        self.type_resolver.as_ref().and_then(|resolve| resolve(service))
    }

    /// 解析评估器（带缓存）
    #[instrument(skip(self))]
    pub fn resolve(
        &self,
        evaluator_name: &str,
        data_type: &str,
        tenant_id: &str,
        culture_id: &str,
    ) -> Result<Arc<dyn ConditionEvaluator>> {
        let key = format!("{}<{}>", evaluator_name, data_type);
        let cached = self.evaluators.get_or_add_item::<CachedEvaluator, _>(
            &key,
            || {
                self.build(evaluator_name, data_type)
                    .map(|evaluator| CacheItem::disposable(CachedEvaluator(evaluator)))
            },
            tenant_id,
            culture_id,
        )?;
        Ok(cached.0.clone())
    }

    /// 已缓存的评估器实例数
    pub fn cached_count(&self) -> usize {
        self.evaluators.len()
    }

    fn build(&self, evaluator_name: &str, data_type: &str) -> Result<Arc<dyn ConditionEvaluator>> {
        let registration = self
            .registrations
            .get(evaluator_name)
            .map(|entry| entry.value().clone());
        if let Some(registration) = registration {
            let service = registration.service_for(data_type);
            match self.resolve_evaluator_service(&service) {
                Some(evaluator) => {
                    debug!(service = %service, "通过依赖注入构建评估器");
                    return Ok(evaluator);
                }
                None => debug!(service = %service, "类型解析函数未返回评估器，继续查找"),
            }
        }

        if evaluator_name.eq_ignore_ascii_case(PREDICATE_EVALUATOR) {
            return Ok(Arc::new(PredicateEvaluator));
        }
        if evaluator_name.eq_ignore_ascii_case(REGEX_EVALUATOR) {
            return Ok(Arc::new(RegexEvaluator));
        }

        let factory = self
            .factories
            .get(evaluator_name)
            .map(|entry| entry.value().clone());
        if let Some(evaluator) = factory.and_then(|factory| factory(data_type)) {
            debug!(evaluator = evaluator_name, data_type, "通过自定义工厂构建评估器");
            return Ok(evaluator);
        }

        Err(RuleError::MissingEvaluator {
            evaluator_name: evaluator_name.to_string(),
            data_type: data_type.to_string(),
        })
    }

    fn resolve_evaluator_service(&self, service: &ServiceType) -> Option<Arc<dyn ConditionEvaluator>> {
        let instance = self.resolve_service(service)?;
        instance
            .downcast::<Arc<dyn ConditionEvaluator>>()
            .ok()
            .map(|evaluator| Arc::clone(&*evaluator))
    }

    /// 注册变化后释放并丢弃已缓存的评估器，下次解析时按新注册构建
    fn invalidate(&self) {
        let removed = self.evaluators.clear_and_dispose();
        if removed > 0 {
            debug!(removed, "注册变化，已释放缓存的评估器");
        }
    }
}

impl fmt::Debug for EvaluatorResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorResolver")
            .field("has_type_resolver", &self.has_type_resolver())
            .field("registrations", &self.registrations.len())
            .field("factories", &self.factories.len())
            .field("cached", &self.evaluators.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Payload;
    use crate::error::DisposeError;
    use crate::evaluator::EvaluatorOutcome;
    use crate::models::Condition;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Always(bool);

    #[async_trait]
    impl ConditionEvaluator for Always {
        async fn evaluate(
            &self,
            _condition: &Condition,
            _payload: &Payload,
            _cancel: &CancellationToken,
        ) -> Result<EvaluatorOutcome> {
            Ok(EvaluatorOutcome::from_bool(self.0))
        }
    }

    fn recording_resolver(seen: Arc<Mutex<Vec<ServiceType>>>, answer: bool) -> TypeResolver {
        Arc::new(move |service: &ServiceType| {
            seen.lock().unwrap().push(service.clone());
            answer.then(|| evaluator_instance(Arc::new(Always(true))))
        })
    }

    #[test]
    fn test_builtin_resolution_without_type_resolver() {
        let resolver = EvaluatorResolver::new(None, None);
        assert!(resolver.resolve("predicate", "Customer", "t", "c").is_ok());
        assert!(resolver.resolve("Regex", "Customer", "t", "c").is_ok());

        let err = resolver.resolve("Unknown", "Customer", "t", "c").err().unwrap();
        assert!(matches!(err, RuleError::MissingEvaluator { .. }));
    }

    #[test]
    fn test_resolution_is_cached_per_key() {
        let resolver = EvaluatorResolver::new(None, None);
        let a = resolver.resolve("predicate", "Customer", "t", "c").unwrap();
        let b = resolver.resolve("predicate", "Customer", "t", "c").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other_tenant = resolver.resolve("predicate", "Customer", "t2", "c").unwrap();
        assert!(!Arc::ptr_eq(&a, &other_tenant));
        assert_eq!(resolver.cached_count(), 2);
    }

    #[test]
    fn test_open_registration_passes_data_type() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let resolver =
            EvaluatorResolver::new(Some(recording_resolver(seen.clone(), true)), None);
        resolver.register_for_dependency_injection(
            "Credit",
            EvaluatorRegistration::Open(ServiceType::new("CreditEvaluator")),
        );

        assert!(resolver.resolve("Credit", "Customer", "t", "c").is_ok());
        assert_eq!(
            seen.lock().unwrap()[0],
            ServiceType::generic("CreditEvaluator", "Customer")
        );
    }

    #[test]
    fn test_di_falls_through_to_builtin() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let resolver =
            EvaluatorResolver::new(Some(recording_resolver(seen.clone(), false)), None);
        resolver.register_for_dependency_injection(
            "predicate",
            EvaluatorRegistration::Closed(ServiceType::new("Nothing")),
        );

        assert!(resolver.resolve("predicate", "Customer", "t", "c").is_ok());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_static_factory() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = EvaluatorResolver::new(None, None);
        let counter = calls.clone();
        resolver.register_custom_evaluator(
            "Flag",
            Arc::new(move |data_type: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                (data_type == "Customer")
                    .then(|| Arc::new(Always(false)) as Arc<dyn ConditionEvaluator>)
            }),
        );

        assert!(resolver.resolve("Flag", "Customer", "t", "c").is_ok());
        assert!(resolver.resolve("Flag", "Customer", "t", "c").is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(resolver.resolve("Flag", "Address", "t", "c").is_err());
    }

    struct Tracked(Arc<AtomicUsize>);

    #[async_trait]
    impl ConditionEvaluator for Tracked {
        async fn evaluate(
            &self,
            _condition: &Condition,
            _payload: &Payload,
            _cancel: &CancellationToken,
        ) -> Result<EvaluatorOutcome> {
            Ok(EvaluatorOutcome::success())
        }

        fn dispose(&self) -> std::result::Result<(), DisposeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_reregistration_disposes_cached_evaluators() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let resolver = EvaluatorResolver::new(None, None);
        let factory = |disposed: Arc<AtomicUsize>| -> EvaluatorFactory {
            Arc::new(move |_: &str| {
                Some(Arc::new(Tracked(disposed.clone())) as Arc<dyn ConditionEvaluator>)
            })
        };

        resolver.register_custom_evaluator("Tracked", factory(disposed.clone()));
        resolver.resolve("Tracked", "Customer", "t", "c").unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 0);

        resolver.register_custom_evaluator("Tracked", factory(disposed.clone()));
        assert_eq!(resolver.cached_count(), 0);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_invalidates_cache() {
        let resolver = EvaluatorResolver::new(None, None);
        resolver.resolve("predicate", "Customer", "t", "c").unwrap();
        assert_eq!(resolver.cached_count(), 1);
        resolver.register_custom_evaluator(
            "Flag",
            Arc::new(|_: &str| -> Option<Arc<dyn ConditionEvaluator>> { None }),
        );
        assert_eq!(resolver.cached_count(), 0);
    }
}
