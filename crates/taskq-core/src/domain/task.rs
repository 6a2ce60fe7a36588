//! Task record: a durable unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use super::TaskId;
use super::state::TaskStatus;

/// Stable string key that identifies a handler in the registry.
///
/// # 命名規約
/// - `{namespace}.{action}` 形式を推奨（例: `billing.charge`）
/// - ストアにはこの文字列がそのまま保存される
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerKey(String);

impl HandlerKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for HandlerKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HandlerKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for HandlerKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Positional and keyword arguments handed to a handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Builds a keyword-only payload from a serializable struct.
    pub fn from_kwargs<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(kwargs) => Ok(Self {
                args: Vec::new(),
                kwargs,
            }),
            other => Ok(Self {
                args: vec![other],
                kwargs: serde_json::Map::new(),
            }),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "args": self.args, "kwargs": self.kwargs })
    }
}

/// Task record as persisted in the `tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub handler: HandlerKey,
    pub payload: Payload,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: TaskId,
        name: impl Into<String>,
        handler: HandlerKey,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            status: TaskStatus::New,
            handler,
            payload,
            created: now,
            updated: now,
        }
    }

    /// A fresh task carrying the same work as this one.
    pub fn restarted(&self, id: TaskId, now: DateTime<Utc>) -> Self {
        Self::new(id, self.name.clone(), self.handler.clone(), self.payload.clone(), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    #[derive(Serialize)]
    struct Charge {
        account: String,
        cents: u64,
    }

    #[test]
    fn payload_from_struct_becomes_kwargs() {
        let payload = Payload::from_kwargs(&Charge {
            account: "acme".into(),
            cents: 1200,
        })
        .unwrap();

        assert!(payload.args.is_empty());
        assert_eq!(payload.kwargs["account"], json!("acme"));
        assert_eq!(payload.kwargs["cents"], json!(1200));
    }

    #[test]
    fn payload_from_scalar_becomes_single_arg() {
        let payload = Payload::from_kwargs(&42).unwrap();
        assert_eq!(payload.args, vec![json!(42)]);
        assert!(payload.kwargs.is_empty());
    }

    #[test]
    fn payload_json_shape() {
        let payload = Payload::new().arg(1).kwarg("x", "y");
        assert_eq!(payload.to_json(), json!({ "args": [1], "kwargs": { "x": "y" } }));

        let back: Payload = serde_json::from_value(payload.to_json()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn restarted_task_is_new_with_same_work() {
        let now = Utc::now();
        let original = Task {
            status: TaskStatus::Completed,
            ..Task::new(
                TaskId::from_ulid(Ulid::new()),
                "charge",
                HandlerKey::new("billing.charge"),
                Payload::new().arg(1),
                now,
            )
        };

        let fresh = original.restarted(TaskId::from_ulid(Ulid::new()), now);
        assert_ne!(fresh.id, original.id);
        assert_eq!(fresh.status, TaskStatus::New);
        assert_eq!(fresh.payload, original.payload);
        assert_eq!(fresh.handler, original.handler);
    }
}
