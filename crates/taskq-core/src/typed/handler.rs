//! Handler trait - タスクを実行する Handler の定義
//!
//! # 二層構造
//! - `Handler<T>`: 型付き。`T: TaskArgs` を受け取り `Output` を返す
//! - `DynHandler`: object-safe。`Payload` を受け取り JSON を返す
//!
//! `TypedHandler<T, H>` が前者を後者に変換（type erasure）し、
//! レジストリは `Arc<dyn DynHandler>` だけを保持します。

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;

use super::task::TaskArgs;
use crate::domain::{HandlerError, Payload, RunError, RunErrorKind};

/// Handler は型付き引数 `T` を受け取って実行する
///
/// # 使用例
/// ```ignore
/// struct SendMail;
///
/// #[async_trait]
/// impl Handler<SendMailArgs> for SendMail {
///     type Output = ();
///
///     async fn handle(&self, args: SendMailArgs) -> Result<(), HandlerError> {
///         mailer.send(&args.to).await.map_err(|e| HandlerError::new(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: TaskArgs>: Send + Sync {
    type Output: Serialize + Send;

    async fn handle(&self, args: T) -> Result<Self::Output, HandlerError>;
}

/// Object-safe handler over raw payloads.
///
/// Errors are already classified (`Decode`, `Handler`) so the runner can
/// record them on the run as-is.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn call(&self, payload: Payload) -> Result<serde_json::Value, RunError>;
}

pub struct TypedHandler<T: TaskArgs, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskArgs, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TaskArgs, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn call(&self, payload: Payload) -> Result<serde_json::Value, RunError> {
        let args = T::from_payload(payload)
            .map_err(|e| RunError::new(RunErrorKind::Decode, format!("json decode: {e}")))?;
        let output = self
            .handler
            .handle(args)
            .await
            .map_err(|e| RunError::new(RunErrorKind::Handler, e.message()))?;
        serde_json::to_value(output)
            .map_err(|e| RunError::new(RunErrorKind::Handler, format!("json encode: {e}")))
    }
}

/// Adapts an async closure over the raw payload.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, payload: Payload) -> Result<serde_json::Value, RunError> {
        (self.f)(payload)
            .await
            .map_err(|e| RunError::new(RunErrorKind::Handler, e.message()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Handlers shared by the crate's tests.

    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AddArgs {
        pub a: i64,
        pub b: i64,
    }

    impl TaskArgs for AddArgs {
        const KEY: &'static str = "math.add";
    }

    pub struct AddHandler;

    #[async_trait]
    impl Handler<AddArgs> for AddHandler {
        type Output = i64;

        async fn handle(&self, args: AddArgs) -> Result<i64, HandlerError> {
            Ok(args.a + args.b)
        }
    }

    /// Always fails and counts how often it was called.
    #[derive(Clone, Default)]
    pub struct FailingHandler {
        pub calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl DynHandler for FailingHandler {
        async fn call(&self, _payload: Payload) -> Result<serde_json::Value, RunError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(RunError::new(RunErrorKind::Handler, format!("boom #{n}")))
        }
    }

    /// Echoes the payload back.
    pub struct EchoHandler;

    #[async_trait]
    impl DynHandler for EchoHandler {
        async fn call(&self, payload: Payload) -> Result<serde_json::Value, RunError> {
            Ok(payload.to_json())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn typed_handler_decodes_kwargs() {
        let handler = TypedHandler::<AddArgs, _>::new(AddHandler);
        let payload = Payload::new().kwarg("a", 2).kwarg("b", 40);

        let output = handler.call(payload).await.unwrap();
        assert_eq!(output, json!(42));
    }

    #[tokio::test]
    async fn typed_handler_reports_decode_errors() {
        let handler = TypedHandler::<AddArgs, _>::new(AddHandler);
        let payload = Payload::new().kwarg("a", "two");

        let err = handler.call(payload).await.unwrap_err();
        assert_eq!(err.kind, RunErrorKind::Decode);
        assert!(err.message.starts_with("json decode"));
    }

    #[tokio::test]
    async fn fn_handler_maps_errors_to_handler_kind() {
        let handler = FnHandler::new(|payload: Payload| async move {
            if payload.args.is_empty() {
                Err(HandlerError::new("need an argument"))
            } else {
                Ok(json!(payload.args.len()))
            }
        });

        assert_eq!(handler.call(Payload::new().arg(1)).await.unwrap(), json!(1));

        let err = handler.call(Payload::new()).await.unwrap_err();
        assert_eq!(err, RunError::new(RunErrorKind::Handler, "need an argument"));
    }
}
