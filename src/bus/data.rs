//! Message payloads. A payload is a tree of plain values plus two kinds the
//! wire cannot carry directly: callables (serialized as method markers and
//! rehydrated into bus-backed stubs) and errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::error::Error;

pub const SERIALIZED_METHOD: &str = "__postrobot_method__";
pub const SERIALIZED_ERROR: &str = "__postrobot_error__";
pub const TYPE_KEY: &str = "__type__";
pub const ID_KEY: &str = "__id__";
pub const NAME_KEY: &str = "__name__";
pub const MESSAGE_KEY: &str = "__message__";
pub const STACK_KEY: &str = "__stack__";

pub type MethodFuture = BoxFuture<'static, Result<Data, Error>>;
pub type MethodFn = Arc<dyn Fn(Vec<Data>) -> MethodFuture + Send + Sync>;

/// A callable payload value. Local handles wrap a real function; remote
/// stubs wrap a bus request back to the window the marker came from.
#[derive(Clone)]
pub struct MethodHandle {
    id: String,
    name: String,
    func: MethodFn,
}

impl MethodHandle {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Data>) -> MethodFuture + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub(crate) fn with_id<F>(id: String, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Data>) -> MethodFuture + Send + Sync + 'static,
    {
        Self {
            id,
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Wrap a synchronous function.
    pub fn from_sync<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Data>) -> Result<Data, Error> + Send + Sync + 'static,
    {
        Self::new(name, move |args| {
            let result = func(args);
            Box::pin(async move { result })
        })
    }

    /// A callable that accepts anything and returns null.
    pub fn noop() -> Self {
        Self::from_sync("noop", |_| Ok(Data::Null))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn func(&self) -> MethodFn {
        Arc::clone(&self.func)
    }

    pub async fn call(&self, args: Vec<Data>) -> Result<Data, Error> {
        (self.func)(args).await
    }
}

impl PartialEq for MethodHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MethodHandle({}, {})", self.name, self.id)
    }
}

/// A message payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Data>),
    Object(BTreeMap<String, Data>),
    Method(MethodHandle),
    Error(Error),
}

impl Data {
    pub fn object<I, K>(entries: I) -> Data
    where
        I: IntoIterator<Item = (K, Data)>,
        K: Into<String>,
    {
        Data::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Data> {
        match self {
            Data::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Data::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Data::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Data]> {
        match self {
            Data::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Data>> {
        match self {
            Data::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_method(&self) -> Option<&MethodHandle> {
        match self {
            Data::Method(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null)
    }

    /// Convert to plain JSON, dropping nothing: callables and errors have no
    /// plain form, so their presence yields `None`.
    pub fn to_plain_json(&self) -> Option<serde_json::Value> {
        match self {
            Data::Null => Some(serde_json::Value::Null),
            Data::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Data::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
            Data::String(s) => Some(serde_json::Value::String(s.clone())),
            Data::Array(items) => items
                .iter()
                .map(Data::to_plain_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Data::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_plain_json()?);
                }
                Some(serde_json::Value::Object(out))
            }
            Data::Method(_) | Data::Error(_) => None,
        }
    }

    /// A stable string form of the value for memoization keys. Callables are
    /// keyed by identity.
    pub fn stable_key(&self) -> String {
        match self {
            Data::Method(m) => format!("__method__:{}", m.id()),
            Data::Error(e) => format!("__error__:{e}"),
            Data::Array(items) => {
                let inner: Vec<String> = items.iter().map(Data::stable_key).collect();
                format!("[{}]", inner.join(","))
            }
            Data::Object(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k, v.stable_key()))
                    .collect();
                format!("{{{}}}", inner.join(","))
            }
            other => other
                .to_plain_json()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        }
    }
}

impl From<serde_json::Value> for Data {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Data::Null,
            serde_json::Value::Bool(b) => Data::Bool(b),
            serde_json::Value::Number(n) => Data::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Data::String(s),
            serde_json::Value::Array(items) => {
                Data::Array(items.into_iter().map(Data::from).collect())
            }
            serde_json::Value::Object(map) => Data::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Data::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Number(value)
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Number(value as f64)
    }
}

impl From<u32> for Data {
    fn from(value: u32) -> Self {
        Data::Number(value as f64)
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::String(value.to_string())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::String(value)
    }
}

impl From<MethodHandle> for Data {
    fn from(value: MethodHandle) -> Self {
        Data::Method(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn method_handle_calls_through() {
        let doubler = MethodHandle::from_sync("double", |args| {
            let n = args
                .first()
                .and_then(Data::as_f64)
                .ok_or_else(|| Error::Validation("expected number".into()))?;
            Ok(Data::Number(n * 2.0))
        });
        let result = doubler.call(vec![Data::Number(21.0)]).await.unwrap();
        assert_eq!(result, Data::Number(42.0));
    }

    #[test]
    fn plain_json_round_trip() {
        let data = Data::object([
            ("count", Data::Number(3.0)),
            ("label", Data::String("hi".into())),
            ("nested", Data::object([("ok", Data::Bool(true))])),
        ]);
        let json = data.to_plain_json().unwrap();
        assert_eq!(Data::from(json), data);
    }

    #[test]
    fn methods_have_no_plain_form() {
        let data = Data::object([("f", Data::Method(MethodHandle::noop()))]);
        assert!(data.to_plain_json().is_none());
    }

    #[test]
    fn stable_key_distinguishes_methods_by_identity() {
        let a = Data::Method(MethodHandle::noop());
        let b = Data::Method(MethodHandle::noop());
        assert_ne!(a.stable_key(), b.stable_key());
        assert_eq!(a.stable_key(), a.stable_key());
    }
}
