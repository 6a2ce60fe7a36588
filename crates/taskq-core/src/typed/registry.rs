//! Registry - Handler の登録と解決
//!
//! handler key（文字列）から `TaskProxy`（実行ポリシー + handler）を引く表です。
//! 永続化はせず、プロセス起動時に組み立てて `Arc<Registry>` として
//! Queue Engine / Task Runner に注入します。グローバル状態は持ちません。
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::TaskArgs;
use crate::domain::{
    ConcurrencyStrategy, HandlerError, HandlerKey, Payload, RetryBudget, TaskId, TaskqError,
};

/// Execution policy applied to every task of a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub name: Option<String>,
    pub priority: i32,
    pub strategy: ConcurrencyStrategy,
    pub retries: RetryBudget,
    pub mutex: Option<String>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn strategy(mut self, strategy: ConcurrencyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Negative values mean unlimited retries.
    pub fn retries(mut self, retries: impl Into<RetryBudget>) -> Self {
        self.retries = retries.into();
        self
    }

    pub fn mutex(mut self, mutex: impl Into<String>) -> Self {
        self.mutex = Some(mutex.into());
        self
    }
}

/// A registered handler together with its execution policy.
#[derive(Clone)]
pub struct TaskProxy {
    key: HandlerKey,
    name: String,
    priority: i32,
    strategy: ConcurrencyStrategy,
    retries: RetryBudget,
    mutex: Option<String>,
    handler: Arc<dyn DynHandler>,
}

impl TaskProxy {
    fn new(key: HandlerKey, options: TaskOptions, handler: Arc<dyn DynHandler>) -> Self {
        let name = options.name.unwrap_or_else(|| key.to_string());
        Self {
            key,
            name,
            priority: options.priority,
            strategy: options.strategy,
            retries: options.retries,
            mutex: options.mutex,
            handler,
        }
    }

    pub fn key(&self) -> &HandlerKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn strategy(&self) -> ConcurrencyStrategy {
        self.strategy
    }

    pub fn retries(&self) -> RetryBudget {
        self.retries
    }

    pub fn handler(&self) -> Arc<dyn DynHandler> {
        Arc::clone(&self.handler)
    }

    /// Mutex key for a new task of this handler.
    ///
    /// Without an explicit key, coordinated strategies group by handler and
    /// ANY gives every task its own key.
    pub fn default_mutex(&self, task_id: TaskId) -> String {
        match (&self.mutex, self.strategy) {
            (Some(mutex), _) => mutex.clone(),
            (None, ConcurrencyStrategy::Any) => task_id.to_string(),
            (None, _) => self.key.to_string(),
        }
    }
}

impl fmt::Debug for TaskProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProxy")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("strategy", &self.strategy)
            .field("retries", &self.retries)
            .field("mutex", &self.mutex)
            .finish_non_exhaustive()
    }
}

/// Something `Registry::resolve` accepts: a key or an already resolved proxy.
#[derive(Debug, Clone, Copy)]
pub enum HandlerRef<'a> {
    Key(&'a str),
    Proxy(&'a TaskProxy),
}

impl<'a> From<&'a str> for HandlerRef<'a> {
    fn from(key: &'a str) -> Self {
        HandlerRef::Key(key)
    }
}

impl<'a> From<&'a HandlerKey> for HandlerRef<'a> {
    fn from(key: &'a HandlerKey) -> Self {
        HandlerRef::Key(key.as_str())
    }
}

impl<'a> From<&'a TaskProxy> for HandlerRef<'a> {
    fn from(proxy: &'a TaskProxy) -> Self {
        HandlerRef::Proxy(proxy)
    }
}

/// Registry は handler key -> TaskProxy の表
///
/// # 使用例
/// ```ignore
/// let mut registry = Registry::new();
/// registry.register_task::<SendMailArgs, _>(SendMail, TaskOptions::new().retries(3));
///
/// let proxy = registry.resolve("mail.send")?;
/// ```
#[derive(Default)]
pub struct Registry {
    proxies: HashMap<HandlerKey, TaskProxy>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `key`. Registering the same key again
    /// replaces the previous proxy.
    pub fn register<H: DynHandler + 'static>(
        &mut self,
        key: impl Into<HandlerKey>,
        handler: H,
        options: TaskOptions,
    ) -> TaskProxy {
        let key = key.into();
        let proxy = TaskProxy::new(key.clone(), options, Arc::new(handler));
        if self.proxies.insert(key, proxy.clone()).is_some() {
            tracing::debug!(key = %proxy.key, "replaced registered handler");
        }
        proxy
    }

    pub fn register_task<T: TaskArgs, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
        options: TaskOptions,
    ) -> TaskProxy {
        self.register(T::KEY, TypedHandler::<T, H>::new(handler), options)
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        key: impl Into<HandlerKey>,
        f: F,
        options: TaskOptions,
    ) -> TaskProxy
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, HandlerError>>
            + Send
            + 'static,
    {
        self.register(key, FnHandler::new(f), options)
    }

    pub fn resolve<'a>(&self, handler: impl Into<HandlerRef<'a>>) -> Result<TaskProxy, TaskqError> {
        match handler.into() {
            HandlerRef::Proxy(proxy) => Ok(proxy.clone()),
            HandlerRef::Key(key) => self
                .proxies
                .get(key)
                .cloned()
                .ok_or_else(|| TaskqError::UnregisteredTask(HandlerKey::new(key))),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.proxies.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn registered_keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<HandlerKey> = self.proxies.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.registered_keys())
            .finish()
    }
}
