//! Declarative prop definitions and normalization. A component declares its
//! props once; user-supplied values are coerced, defaulted, aliased,
//! wrapped (once/memoize/denodeify), validated, and finally rendered to URL
//! query parameters or shipped to the child.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{Data, MethodHandle};
use crate::error::Error;

const DEFAULT_GETTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropType {
    String,
    Object,
    Function,
    Boolean,
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    /// Objects flatten to dot-path query parameters.
    Default,
    /// Objects JSON-stringify into a single parameter.
    Json,
}

pub type ValidateFn = Arc<dyn Fn(&Data) -> Result<(), Error> + Send + Sync>;
pub type DecorateFn = Arc<dyn Fn(Data) -> Data + Send + Sync>;
pub type ProducerFn = Arc<dyn Fn() -> Data + Send + Sync>;
pub type QueryKeyFn = Arc<dyn Fn(&Data) -> String + Send + Sync>;

#[derive(Clone)]
pub enum DefaultValue {
    Literal(Data),
    Producer(ProducerFn),
}

impl DefaultValue {
    fn produce(&self) -> Data {
        match self {
            DefaultValue::Literal(data) => data.clone(),
            DefaultValue::Producer(f) => f(),
        }
    }
}

#[derive(Clone)]
pub enum QueryParam {
    Enabled(bool),
    /// Alternate query key.
    Name(String),
    /// Derive the query key from the value.
    Derive(QueryKeyFn),
}

/// Declarative definition of one prop.
#[derive(Clone)]
pub struct PropDefinition {
    pub prop_type: PropType,
    pub required: bool,
    pub def: Option<DefaultValue>,
    pub query_param: Option<QueryParam>,
    pub serialization: Serialization,
    pub alias: Option<String>,
    pub validate: Option<ValidateFn>,
    pub send_to_child: bool,
    pub same_domain: bool,
    pub getter: bool,
    pub timeout: Option<Duration>,
    pub memoize: bool,
    pub promisify: bool,
    pub denodeify: bool,
    pub once: bool,
    pub noop: bool,
    pub decorate: Option<DecorateFn>,
}

impl PropDefinition {
    pub fn new(prop_type: PropType) -> Self {
        Self {
            prop_type,
            required: false,
            def: None,
            query_param: None,
            serialization: Serialization::Default,
            alias: None,
            validate: None,
            send_to_child: true,
            same_domain: false,
            getter: false,
            timeout: None,
            memoize: false,
            promisify: false,
            denodeify: false,
            once: false,
            noop: false,
            decorate: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Data) -> Self {
        self.def = Some(DefaultValue::Literal(value));
        self
    }

    pub fn with_default_producer<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Data + Send + Sync + 'static,
    {
        self.def = Some(DefaultValue::Producer(Arc::new(f)));
        self
    }

    pub fn query_param(mut self) -> Self {
        self.query_param = Some(QueryParam::Enabled(true));
        self
    }

    pub fn query_param_named(mut self, key: impl Into<String>) -> Self {
        self.query_param = Some(QueryParam::Name(key.into()));
        self
    }

    pub fn serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn validate_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Data) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn not_sent_to_child(mut self) -> Self {
        self.send_to_child = false;
        self
    }

    pub fn same_domain(mut self) -> Self {
        self.same_domain = true;
        self
    }

    pub fn getter(mut self) -> Self {
        self.getter = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn memoize(mut self) -> Self {
        self.memoize = true;
        self
    }

    pub fn promisify(mut self) -> Self {
        self.promisify = true;
        self
    }

    pub fn denodeify(mut self) -> Self {
        self.denodeify = true;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn noop(mut self) -> Self {
        self.noop = true;
        self
    }

    pub fn decorate_with<F>(mut self, f: F) -> Self
    where
        F: Fn(Data) -> Data + Send + Sync + 'static,
    {
        self.decorate = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for PropDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropDefinition")
            .field("type", &self.prop_type)
            .field("required", &self.required)
            .field("getter", &self.getter)
            .field("send_to_child", &self.send_to_child)
            .field("same_domain", &self.same_domain)
            .finish()
    }
}

pub type PropDefinitions = BTreeMap<String, PropDefinition>;

#[derive(Clone, Default)]
pub struct NormalizeOptions {
    /// Accept props with no definition instead of failing.
    pub loose: bool,
    /// Child-side normalization: enforces `same_domain`.
    pub child: bool,
    /// Origin the props came from (the parent's origin, on the child side).
    pub supplied_origin: Option<String>,
    /// Origin of the window doing the normalizing.
    pub current_origin: Option<String>,
}

/// A normalized, invocable prop set.
#[derive(Clone)]
pub struct Props {
    defs: Arc<PropDefinitions>,
    values: BTreeMap<String, Data>,
}

impl Props {
    pub fn empty() -> Self {
        Self {
            defs: Arc::new(BTreeMap::new()),
            values: BTreeMap::new(),
        }
    }

    pub fn definitions(&self) -> &Arc<PropDefinitions> {
        &self.defs
    }

    pub fn get(&self, name: &str) -> Option<&Data> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Data> {
        &self.values
    }

    /// Invoke a function prop.
    pub async fn call(&self, name: &str, args: Vec<Data>) -> Result<Data, Error> {
        match self.values.get(name) {
            Some(Data::Method(method)) => method.call(args).await,
            Some(_) => Err(Error::Validation(format!("prop {name} is not a function"))),
            None => Err(Error::Validation(format!("no prop named {name}"))),
        }
    }

    /// Invoke a function prop if present; absent props are a no-op.
    pub async fn call_if_present(&self, name: &str, args: Vec<Data>) -> Result<Data, Error> {
        match self.values.get(name) {
            Some(Data::Method(method)) => method.call(args).await,
            _ => Ok(Data::Null),
        }
    }

    /// Resolve a prop's value: getters are invoked (with their timeout) and
    /// the result is checked against the declared type.
    pub async fn get_value(&self, name: &str) -> Result<Data, Error> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| Error::Validation(format!("no prop named {name}")))?;
        let value = match self.values.get(name) {
            Some(value) => value.clone(),
            None => return Ok(Data::Null),
        };
        if !def.getter {
            return Ok(value);
        }
        let method = match value {
            Data::Method(method) => method,
            other => return Ok(other),
        };
        let timeout = def.timeout.unwrap_or(DEFAULT_GETTER_TIMEOUT);
        let resolved = tokio::time::timeout(timeout, method.call(Vec::new()))
            .await
            .map_err(|_| {
                Error::MessageTimeout(format!(
                    "getter for prop {name} timed out after {}ms",
                    timeout.as_millis()
                ))
            })??;
        let coerced = coerce(name, def.prop_type, resolved)?;
        if let Some(validate) = &def.validate {
            validate(&coerced)?;
        }
        Ok(coerced)
    }

    /// The subset of props the child is allowed to see.
    pub fn child_visible(&self) -> BTreeMap<String, Data> {
        self.values
            .iter()
            .filter(|(name, _)| {
                self.defs
                    .get(name.as_str())
                    .map(|def| def.send_to_child)
                    .unwrap_or(true)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub fn to_object(&self) -> Data {
        Data::Object(self.values.clone())
    }

    /// Overlay freshly normalized values, keeping everything else.
    pub fn merge(&mut self, values: BTreeMap<String, Data>) {
        for (name, value) in values {
            self.values.insert(name, value);
        }
    }
}

impl std::fmt::Debug for Props {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.values.iter().map(|(k, v)| {
                (
                    k,
                    match v {
                        Data::Method(_) => "<function>".to_string(),
                        other => other.stable_key(),
                    },
                )
            }))
            .finish()
    }
}

/// Normalize a full prop set against its definitions.
pub fn normalize_props(
    defs: &Arc<PropDefinitions>,
    mut supplied: BTreeMap<String, Data>,
    options: &NormalizeOptions,
) -> Result<Props, Error> {
    let mut values = BTreeMap::new();

    for (name, def) in defs.iter() {
        let mut raw = supplied.remove(name);
        if raw.is_none() {
            if let Some(alias) = &def.alias {
                raw = supplied.remove(alias);
            }
        }

        // Child side: drop props restricted to the parent's own origin.
        if def.same_domain && options.child {
            let same = options.supplied_origin.is_some()
                && options.supplied_origin == options.current_origin;
            if !same && raw.is_some() {
                warn!(target = "props", prop = %name, "dropping same-domain prop from foreign origin");
                raw = None;
            }
        }

        let value = match raw {
            Some(value) => Some(normalize_value(name, def, value)?),
            None => match (&def.def, def.noop, def.prop_type) {
                (Some(default), _, _) if !def.required => {
                    Some(normalize_value(name, def, default.produce())?)
                }
                (_, true, PropType::Function) => Some(Data::Method(MethodHandle::noop())),
                _ => None,
            },
        };

        match value {
            Some(mut value) => {
                if let Some(validate) = &def.validate {
                    if !def.getter {
                        validate(&value)?;
                    }
                }
                if let Some(decorate) = &def.decorate {
                    value = decorate(value);
                }
                values.insert(name.clone(), value);
            }
            None => {
                if def.required {
                    return Err(Error::Integration(format!("prop {name} is required")));
                }
            }
        }
    }

    if !supplied.is_empty() {
        if options.loose {
            for (name, value) in supplied {
                debug!(target = "props", prop = %name, "accepting undeclared prop");
                values.insert(name, value);
            }
        } else {
            let unknown: Vec<String> = supplied.keys().cloned().collect();
            return Err(Error::Integration(format!(
                "unknown props: {}",
                unknown.join(", ")
            )));
        }
    }

    Ok(Props {
        defs: Arc::clone(defs),
        values,
    })
}

/// Normalize a partial update: only supplied keys, no defaults, no required
/// checks.
pub fn normalize_partial(
    defs: &Arc<PropDefinitions>,
    supplied: BTreeMap<String, Data>,
    options: &NormalizeOptions,
) -> Result<BTreeMap<String, Data>, Error> {
    let mut values = BTreeMap::new();
    for (name, value) in supplied {
        match defs.get(&name) {
            Some(def) => {
                if def.same_domain && options.child {
                    let same = options.supplied_origin.is_some()
                        && options.supplied_origin == options.current_origin;
                    if !same {
                        continue;
                    }
                }
                let mut value = normalize_value(&name, def, value)?;
                if let Some(validate) = &def.validate {
                    if !def.getter {
                        validate(&value)?;
                    }
                }
                if let Some(decorate) = &def.decorate {
                    value = decorate(value);
                }
                values.insert(name, value);
            }
            None if options.loose => {
                values.insert(name, value);
            }
            None => {
                return Err(Error::Integration(format!("unknown prop: {name}")));
            }
        }
    }
    Ok(values)
}

fn normalize_value(name: &str, def: &PropDefinition, value: Data) -> Result<Data, Error> {
    // Getters may be supplied as literals; wrap them into producers.
    if def.getter && def.prop_type != PropType::Function {
        return Ok(match value {
            Data::Method(method) => Data::Method(method),
            literal => {
                let literal = coerce(name, def.prop_type, literal)?;
                Data::Method(MethodHandle::from_sync(
                    format!("{name}::getter"),
                    move |_| Ok(literal.clone()),
                ))
            }
        });
    }

    let value = coerce(name, def.prop_type, value)?;
    match value {
        Data::Method(method) => {
            let mut method = method;
            if def.denodeify {
                method = denodeify(method);
            }
            // `promisify` is inherent here: every invocation already yields
            // a future.
            if def.memoize {
                method = memoize(method);
            }
            if def.once {
                method = once_wrap(method);
            }
            Ok(Data::Method(method))
        }
        other => Ok(other),
    }
}

/// Coerce a supplied value to its declared type. Numbers parse base-10.
fn coerce(name: &str, prop_type: PropType, value: Data) -> Result<Data, Error> {
    match (prop_type, value) {
        (PropType::String, Data::String(s)) => Ok(Data::String(s)),
        (PropType::String, Data::Number(n)) => Ok(Data::String(format_number(n))),
        (PropType::String, Data::Bool(b)) => Ok(Data::String(b.to_string())),
        (PropType::Number, Data::Number(n)) => Ok(Data::Number(n)),
        (PropType::Number, Data::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Data::Number)
            .map_err(|_| Error::Validation(format!("prop {name}: can not parse {s:?} as number"))),
        (PropType::Boolean, Data::Bool(b)) => Ok(Data::Bool(b)),
        (PropType::Boolean, Data::String(s)) => match s.as_str() {
            "1" | "true" => Ok(Data::Bool(true)),
            "0" | "false" | "" => Ok(Data::Bool(false)),
            other => Err(Error::Validation(format!(
                "prop {name}: can not parse {other:?} as boolean"
            ))),
        },
        (PropType::Boolean, Data::Number(n)) => Ok(Data::Bool(n != 0.0)),
        (PropType::Object, value @ Data::Object(_)) => Ok(value),
        (PropType::Object, value @ Data::Array(_)) => Ok(value),
        (PropType::Function, Data::Method(m)) => Ok(Data::Method(m)),
        (expected, got) => Err(Error::Validation(format!(
            "prop {name}: expected {expected:?}, got {got:?}"
        ))),
    }
}

/// Single-shot wrapper: the second and later calls return null without
/// invoking the underlying function.
fn once_wrap(inner: MethodHandle) -> MethodHandle {
    let used = Arc::new(AtomicBool::new(false));
    let name = inner.name().to_string();
    MethodHandle::new(name, move |args| {
        let inner = inner.clone();
        let used = Arc::clone(&used);
        Box::pin(async move {
            if used.swap(true, Ordering::SeqCst) {
                return Ok(Data::Null);
            }
            inner.call(args).await
        })
    })
}

/// Cache results by a stable key of the arguments; callables in the key are
/// replaced by an identity token.
fn memoize(inner: MethodHandle) -> MethodHandle {
    let cache: Arc<Mutex<HashMap<String, Data>>> = Arc::new(Mutex::new(HashMap::new()));
    let name = inner.name().to_string();
    MethodHandle::new(name, move |args| {
        let inner = inner.clone();
        let cache = Arc::clone(&cache);
        Box::pin(async move {
            let key = Data::Array(args.clone()).stable_key();
            if let Some(hit) = cache.lock().unwrap().get(&key).cloned() {
                return Ok(hit);
            }
            let result = inner.call(args).await?;
            cache.lock().unwrap().insert(key, result.clone());
            Ok(result)
        })
    })
}

/// Convert a node-style function (callback as last argument) into one that
/// resolves with the callback's value.
fn denodeify(inner: MethodHandle) -> MethodHandle {
    let name = inner.name().to_string();
    MethodHandle::new(name, move |mut args| {
        let inner = inner.clone();
        Box::pin(async move {
            let (tx, rx) = oneshot::channel::<Result<Data, Error>>();
            let tx = Arc::new(Mutex::new(Some(tx)));
            let callback = MethodHandle::new("callback", move |callback_args| {
                let tx = Arc::clone(&tx);
                Box::pin(async move {
                    let mut iter = callback_args.into_iter();
                    let err = iter.next().unwrap_or(Data::Null);
                    let value = iter.next().unwrap_or(Data::Null);
                    let outcome = match err {
                        Data::Null => Ok(value),
                        Data::Error(e) => Err(e),
                        other => Err(Error::remote(format!(
                            "callback error: {}",
                            other.stable_key()
                        ))),
                    };
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(outcome);
                    }
                    Ok(Data::Null)
                })
            });
            args.push(Data::Method(callback));
            inner.call(args).await?;
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::remote("node-style callback was never invoked")),
            }
        })
    })
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Render the prop set to URL query parameters. Getters are resolved,
/// functions are omitted, booleans encode as `1`/`0`, and objects either
/// dot-flatten or JSON-stringify per their declared serialization.
pub async fn props_to_query(props: &Props) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    let defs = Arc::clone(props.definitions());
    for (name, def) in defs.iter() {
        let Some(query_param) = &def.query_param else {
            continue;
        };
        if matches!(query_param, QueryParam::Enabled(false)) {
            continue;
        }
        if props.get(name).is_none() {
            continue;
        }
        let value = if def.getter {
            props.get_value(name).await?
        } else {
            props.get(name).cloned().unwrap_or(Data::Null)
        };
        if matches!(value, Data::Method(_) | Data::Null) {
            continue;
        }
        let key = match query_param {
            QueryParam::Enabled(_) => name.clone(),
            QueryParam::Name(key) => key.clone(),
            QueryParam::Derive(f) => f(&value),
        };
        match (&value, def.serialization) {
            (Data::Object(_) | Data::Array(_), Serialization::Json) => {
                let plain = value.to_plain_json().ok_or_else(|| {
                    Error::Validation(format!("prop {name} can not be JSON-serialized"))
                })?;
                pairs.push((key, plain.to_string()));
            }
            (Data::Object(map), Serialization::Default) => {
                flatten_object(&key, map, &mut pairs);
            }
            (Data::Array(_), Serialization::Default) => {
                if let Some(plain) = value.to_plain_json() {
                    pairs.push((key, plain.to_string()));
                }
            }
            (Data::Bool(b), _) => pairs.push((key, if *b { "1" } else { "0" }.to_string())),
            (Data::Number(n), _) => pairs.push((key, format_number(*n))),
            (Data::String(s), _) => pairs.push((key, s.clone())),
            _ => {}
        }
    }
    Ok(pairs)
}

fn flatten_object(prefix: &str, map: &BTreeMap<String, Data>, pairs: &mut Vec<(String, String)>) {
    for (key, value) in map {
        let path = format!("{prefix}.{key}");
        match value {
            Data::Object(inner) => flatten_object(&path, inner, pairs),
            Data::Bool(b) => pairs.push((path, if *b { "1" } else { "0" }.to_string())),
            Data::Number(n) => pairs.push((path, format_number(*n))),
            Data::String(s) => pairs.push((path, s.clone())),
            Data::Array(_) => {
                if let Some(plain) = value.to_plain_json() {
                    pairs.push((path, plain.to_string()));
                }
            }
            Data::Method(_) | Data::Error(_) | Data::Null => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn defs(entries: Vec<(&str, PropDefinition)>) -> Arc<PropDefinitions> {
        Arc::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn supplied(entries: Vec<(&str, Data)>) -> BTreeMap<String, Data> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn number_props_parse_base_10() {
        let defs = defs(vec![("count", PropDefinition::new(PropType::Number))]);
        let props = normalize_props(
            &defs,
            supplied(vec![("count", Data::String("42".into()))]),
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(props.get("count"), Some(&Data::Number(42.0)));

        let err = normalize_props(
            &defs,
            supplied(vec![("count", Data::String("abc".into()))]),
            &NormalizeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn missing_required_prop_is_an_integration_error() {
        let defs = defs(vec![(
            "token",
            PropDefinition::new(PropType::String).required(),
        )]);
        let err = normalize_props(&defs, supplied(vec![]), &NormalizeOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Integration(_)));
    }

    #[test]
    fn defaults_and_aliases_apply() {
        let defs = defs(vec![
            (
                "env",
                PropDefinition::new(PropType::String).with_default(Data::String("test".into())),
            ),
            (
                "label",
                PropDefinition::new(PropType::String).alias("text"),
            ),
        ]);
        let props = normalize_props(
            &defs,
            supplied(vec![("text", Data::String("hello".into()))]),
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(props.get("env"), Some(&Data::String("test".into())));
        assert_eq!(props.get("label"), Some(&Data::String("hello".into())));
    }

    #[test]
    fn unknown_props_fail_unless_loose() {
        let defs = defs(vec![]);
        let err = normalize_props(
            &defs,
            supplied(vec![("mystery", Data::Bool(true))]),
            &NormalizeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Integration(_)));

        let props = normalize_props(
            &defs,
            supplied(vec![("mystery", Data::Bool(true))]),
            &NormalizeOptions {
                loose: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(props.get("mystery"), Some(&Data::Bool(true)));
    }

    #[tokio::test]
    async fn once_props_only_fire_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = MethodHandle::from_sync("onThing", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Data::Number(1.0))
        });
        let defs = defs(vec![(
            "onThing",
            PropDefinition::new(PropType::Function).once(),
        )]);
        let props = normalize_props(
            &defs,
            supplied(vec![("onThing", Data::Method(handler))]),
            &NormalizeOptions::default(),
        )
        .unwrap();

        assert_eq!(
            props.call("onThing", vec![]).await.unwrap(),
            Data::Number(1.0)
        );
        assert_eq!(props.call("onThing", vec![]).await.unwrap(), Data::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memoized_props_cache_by_arguments() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = MethodHandle::from_sync("compute", move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(args.into_iter().next().unwrap_or(Data::Null))
        });
        let defs = defs(vec![(
            "compute",
            PropDefinition::new(PropType::Function).memoize(),
        )]);
        let props = normalize_props(
            &defs,
            supplied(vec![("compute", Data::Method(handler))]),
            &NormalizeOptions::default(),
        )
        .unwrap();

        props.call("compute", vec![Data::Number(1.0)]).await.unwrap();
        props.call("compute", vec![Data::Number(1.0)]).await.unwrap();
        props.call("compute", vec![Data::Number(2.0)]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn denodeified_props_resolve_through_the_callback() {
        let node_style = MethodHandle::new("fetchThing", |args| {
            Box::pin(async move {
                let callback = args
                    .last()
                    .and_then(Data::as_method)
                    .cloned()
                    .expect("callback appended");
                callback
                    .call(vec![Data::Null, Data::String("payload".into())])
                    .await?;
                Ok(Data::Null)
            })
        });
        let defs = defs(vec![(
            "fetchThing",
            PropDefinition::new(PropType::Function).denodeify(),
        )]);
        let props = normalize_props(
            &defs,
            supplied(vec![("fetchThing", Data::Method(node_style))]),
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(
            props.call("fetchThing", vec![]).await.unwrap(),
            Data::String("payload".into())
        );
    }

    #[tokio::test]
    async fn getters_resolve_and_type_check() {
        let defs = defs(vec![(
            "token",
            PropDefinition::new(PropType::String).getter(),
        )]);
        let props = normalize_props(
            &defs,
            supplied(vec![("token", Data::String("literal".into()))]),
            &NormalizeOptions::default(),
        )
        .unwrap();
        // Literal getters are wrapped into producers.
        assert!(props.get("token").unwrap().as_method().is_some());
        assert_eq!(
            props.get_value("token").await.unwrap(),
            Data::String("literal".into())
        );
    }

    #[test]
    fn same_domain_props_are_dropped_for_foreign_origins() {
        let defs = defs(vec![(
            "secret",
            PropDefinition::new(PropType::String).same_domain(),
        )]);
        let props = normalize_props(
            &defs,
            supplied(vec![("secret", Data::String("s".into()))]),
            &NormalizeOptions {
                child: true,
                supplied_origin: Some("https://a.example".into()),
                current_origin: Some("https://b.example".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(props.get("secret").is_none());

        let props = normalize_props(
            &defs,
            supplied(vec![("secret", Data::String("s".into()))]),
            &NormalizeOptions {
                child: true,
                supplied_origin: Some("https://a.example".into()),
                current_origin: Some("https://a.example".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(props.get("secret"), Some(&Data::String("s".into())));
    }

    #[tokio::test]
    async fn query_serialization_flattens_and_stringifies() {
        let defs = defs(vec![
            (
                "style",
                PropDefinition::new(PropType::Object).query_param(),
            ),
            (
                "meta",
                PropDefinition::new(PropType::Object)
                    .query_param()
                    .serialization(Serialization::Json),
            ),
            (
                "active",
                PropDefinition::new(PropType::Boolean).query_param(),
            ),
            (
                "onLoad",
                PropDefinition::new(PropType::Function).query_param(),
            ),
            (
                "label",
                PropDefinition::new(PropType::String).query_param_named("l"),
            ),
        ]);
        let props = normalize_props(
            &defs,
            supplied(vec![
                (
                    "style",
                    Data::object([("color", Data::from("red")), ("size", Data::from(4i64))]),
                ),
                ("meta", Data::object([("a", Data::from(1i64))])),
                ("active", Data::Bool(true)),
                ("onLoad", Data::Method(MethodHandle::noop())),
                ("label", Data::from("hi")),
            ]),
            &NormalizeOptions::default(),
        )
        .unwrap();

        let pairs = props_to_query(&props).await.unwrap();
        let lookup: HashMap<String, String> = pairs.into_iter().collect();
        assert_eq!(lookup.get("style.color").map(String::as_str), Some("red"));
        assert_eq!(lookup.get("style.size").map(String::as_str), Some("4"));
        assert_eq!(lookup.get("meta").map(String::as_str), Some("{\"a\":1.0}"));
        assert_eq!(lookup.get("active").map(String::as_str), Some("1"));
        assert_eq!(lookup.get("l").map(String::as_str), Some("hi"));
        assert!(!lookup.contains_key("onLoad"));
    }
}
