//! TaskArgs trait - 型付き引数と handler key の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const KEY`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{HandlerKey, Payload};

/// TaskArgs は handler key と引数の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendMailArgs {
///     to: String,
/// }
///
/// impl TaskArgs for SendMailArgs {
///     const KEY: &'static str = "mail.send";
/// }
/// ```
///
/// 引数は keyword 引数（`Payload::kwargs`）として保存されます。
pub trait TaskArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable handler key stored with every task.
    const KEY: &'static str;

    fn handler_key() -> HandlerKey {
        HandlerKey::new(Self::KEY)
    }

    fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        Payload::from_kwargs(self)
    }

    /// Keyword arguments win; a single positional argument is used as-is and
    /// several positional arguments are decoded as a sequence.
    fn from_payload(payload: Payload) -> Result<Self, serde_json::Error> {
        let Payload { mut args, kwargs } = payload;
        let value = if !kwargs.is_empty() {
            serde_json::Value::Object(kwargs)
        } else if args.len() == 1 {
            args.remove(0)
        } else if args.is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::Value::Array(args)
        };
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Resize {
        width: u32,
        height: u32,
    }

    impl TaskArgs for Resize {
        const KEY: &'static str = "image.resize";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pair(i32, i32);

    impl TaskArgs for Pair {
        const KEY: &'static str = "test.pair";
    }

    #[test]
    fn args_roundtrip_through_kwargs() {
        let args = Resize {
            width: 640,
            height: 480,
        };
        let payload = args.to_payload().unwrap();
        assert_eq!(payload.kwargs["width"], json!(640));
        assert_eq!(Resize::from_payload(payload).unwrap(), args);
    }

    #[test]
    fn positional_arguments_decode_as_sequence() {
        let payload = Payload::new().arg(1).arg(2);
        assert_eq!(Pair::from_payload(payload).unwrap(), Pair(1, 2));
    }

    #[test]
    fn single_positional_object_is_used_directly() {
        let payload = Payload::new().arg(json!({ "width": 1, "height": 2 }));
        assert_eq!(
            Resize::from_payload(payload).unwrap(),
            Resize { width: 1, height: 2 }
        );
    }

    #[test]
    fn handler_key_comes_from_const() {
        assert_eq!(Resize::handler_key().as_str(), "image.resize");
    }
}
