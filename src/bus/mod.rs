//! The cross-origin message bus: a request/ack/response protocol over
//! `postMessage` with typed listeners keyed by `(name, window, origin)`,
//! correlated responses, method-handle serialization, a ready handshake, and
//! per-window cleanup.

pub mod data;
pub mod frame;
pub mod listeners;
mod receive;
mod send;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::win::identity::{get_ancestor, get_domain, DomainPattern};
use crate::win::{WeakWindow, WindowHandle};

pub use data::{Data, MethodFn, MethodHandle};
pub use listeners::{ErrorHandlerFn, ListenerEntry, ListenerFn, MessageEvent};
pub use send::{SendOptions, Timeout};

use data::{ID_KEY, MESSAGE_KEY, NAME_KEY, SERIALIZED_ERROR, SERIALIZED_METHOD, STACK_KEY, TYPE_KEY};
use listeners::{ListenerTable, WindowKeyedMap};

/// Process-wide slot holding the bus tables, attached to the window object.
pub const BUS_SLOT: &str = "__postRobot__";

/// Built-in message names.
pub const MESSAGE_NAME_METHOD: &str = "postrobot_method";
pub const MESSAGE_NAME_READY: &str = "postrobot_ready";

pub(crate) const ARGS_KEY: &str = "__args__";
pub(crate) const RESULT_KEY: &str = "__result__";

/// Default deadline for the ready handshake.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct RegisteredMethod {
    pub name: String,
    pub domain: DomainPattern,
    /// When set, only this window may invoke the method.
    pub peer: Option<WeakWindow>,
    pub func: MethodFn,
}

pub(crate) struct ResponseEntry {
    pub peer: WindowHandle,
    pub domain: DomainPattern,
    pub name: String,
    pub ack: bool,
    pub responder: Option<oneshot::Sender<Result<Data, Error>>>,
}

#[derive(Default)]
struct ReadyCell {
    origin: Option<String>,
    waiters: Vec<oneshot::Sender<()>>,
}

pub(crate) struct BusState {
    pub config: RuntimeConfig,
    pub listeners: Mutex<ListenerTable>,
    pub responses: Mutex<HashMap<String, ResponseEntry>>,
    pub methods: Mutex<HashMap<String, RegisteredMethod>>,
    ready: Mutex<WindowKeyedMap<ReadyCell>>,
    pub received: Mutex<VecDeque<String>>,
    pub bridges: Mutex<Vec<(String, WindowHandle)>>,
    pub enabled: AtomicBool,
}

/// Handle to the bus instance bound to one window. Cheap to clone; all
/// clones share the window's `__postRobot__` slot.
#[derive(Clone)]
pub struct Bus {
    pub(crate) win: WindowHandle,
    pub(crate) state: Arc<BusState>,
}

/// Scope a payload's methods are serialized under: who may call them, and
/// from which origin.
pub(crate) struct MethodScope {
    pub peer: Option<WindowHandle>,
    pub domain: DomainPattern,
}

/// Registration options for [`Bus::on`].
#[derive(Default)]
pub struct ListenOptions {
    /// Windows the listener is keyed to; empty registers the window
    /// wildcard. Multiple windows register the product.
    pub windows: Vec<WindowHandle>,
    /// Origin pattern; `None` registers the domain wildcard. Use
    /// [`DomainPattern::Any`] for lists.
    pub domain: Option<DomainPattern>,
    pub once: bool,
    pub error_handler: Option<ErrorHandlerFn>,
}

impl ListenOptions {
    pub fn for_window(win: &WindowHandle, domain: DomainPattern) -> Self {
        Self {
            windows: vec![win.clone()],
            domain: Some(domain),
            ..Default::default()
        }
    }
}

/// Cancellation handle for a registered listener. Cancelling restores the
/// table to its pre-registration state for that key.
pub struct ListenerHandle {
    state: Weak<BusState>,
    name: String,
    windows: Vec<WeakWindow>,
    wildcard_window: bool,
    domain: DomainPattern,
}

impl ListenerHandle {
    pub fn cancel(&self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut table = state.listeners.lock().unwrap();
        if self.wildcard_window {
            table.remove(&self.name, None, &self.domain);
        }
        for weak in &self.windows {
            if let Some(win) = weak.upgrade() {
                table.remove(&self.name, Some(&win), &self.domain);
            }
        }
    }
}

impl Bus {
    /// Attach the bus to a window, idempotently: if the window already
    /// carries a `__postRobot__` slot the existing instance is returned.
    pub fn attach(win: &WindowHandle) -> Bus {
        Self::attach_with_config(win, RuntimeConfig::default())
    }

    pub fn attach_with_config(win: &WindowHandle, config: RuntimeConfig) -> Bus {
        if let Some(existing) = win.get_global(BUS_SLOT) {
            if let Ok(state) = existing.downcast::<BusState>() {
                return Bus {
                    win: win.clone(),
                    state,
                };
            }
        }

        let state = Arc::new(BusState {
            config,
            listeners: Mutex::new(ListenerTable::new()),
            responses: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            ready: Mutex::new(WindowKeyedMap::new()),
            received: Mutex::new(VecDeque::new()),
            bridges: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        });
        win.set_global(BUS_SLOT, state.clone());
        let bus = Bus {
            win: win.clone(),
            state,
        };

        match win.subscribe_messages() {
            Some(rx) => receive::spawn_receive_loop(bus.clone(), rx),
            None => warn!(target = "bus", "window message queue already taken"),
        }
        bus.install_builtin_listeners();
        bus.say_ready();
        bus
    }

    pub fn window(&self) -> &WindowHandle {
        &self.win
    }

    /// The origin this bus instance speaks as.
    pub fn domain(&self) -> String {
        get_domain(&self.win).unwrap_or_else(|_| "null".to_string())
    }

    /// Stop processing incoming messages.
    pub fn disable(&self) {
        self.state.enabled.store(false, Ordering::SeqCst);
    }

    fn install_builtin_listeners(&self) {
        let weak_state = Arc::downgrade(&self.state);
        let weak_win = self.win.downgrade();

        // Ready handshake: note the peer, nothing else.
        let ready_state = weak_state.clone();
        self.on(MESSAGE_NAME_READY, ListenOptions::default(), move |event| {
            if let Some(state) = ready_state.upgrade() {
                BusState::mark_ready(&state, &event.source, &event.origin);
            }
            async { Ok(Data::Null) }
        })
        .expect("fresh bus state cannot have a ready listener");

        // Method dispatch: dereference a serialized method call.
        self.on(MESSAGE_NAME_METHOD, ListenOptions::default(), move |event| {
            let state = weak_state.upgrade();
            let win = weak_win.upgrade();
            async move {
                let (state, _win) = match (state, win) {
                    (Some(state), Some(win)) => (state, win),
                    _ => return Err(Error::remote("message bus is gone")),
                };
                let id = event
                    .data
                    .get(ID_KEY)
                    .and_then(Data::as_str)
                    .ok_or_else(|| Error::remote("method call missing id"))?;
                let args = event
                    .data
                    .get(ARGS_KEY)
                    .and_then(Data::as_array)
                    .map(<[Data]>::to_vec)
                    .unwrap_or_default();

                let (func, domain, peer) = {
                    let methods = state.methods.lock().unwrap();
                    let method = methods.get(id).ok_or_else(|| {
                        Error::remote(format!("no method registered with id {id}"))
                    })?;
                    (
                        Arc::clone(&method.func),
                        method.domain.clone(),
                        method.peer.clone(),
                    )
                };
                if !domain.matches(&event.origin) {
                    return Err(Error::remote(format!(
                        "method call not allowed from origin {}",
                        event.origin
                    )));
                }
                if let Some(peer) = peer {
                    let allowed = peer
                        .upgrade()
                        .map(|expected| expected.ptr_eq(&event.source))
                        .unwrap_or(false);
                    if !allowed {
                        return Err(Error::remote("method call from unexpected window"));
                    }
                }
                let result = func(args).await?;
                Ok(Data::object([(RESULT_KEY, result)]))
            }
        })
        .expect("fresh bus state cannot have a method listener");
    }

    /// Announce ourselves to the ancestor window, if any.
    fn say_ready(&self) {
        let Some(ancestor) = get_ancestor(&self.win) else {
            return;
        };
        let bus = self.clone();
        tokio::spawn(async move {
            let result = bus
                .send(
                    &ancestor,
                    MESSAGE_NAME_READY,
                    Data::Null,
                    SendOptions {
                        domain: Some(DomainPattern::Wildcard),
                        fire_and_forget: true,
                        ..Default::default()
                    },
                )
                .await;
            if let Err(err) = result {
                debug!(target = "bus", error = %err, "ready announcement not delivered");
            }
        });
    }

    /// Register a listener for `name`. Fails if an identical `(name, window,
    /// domain)` key is already registered.
    pub fn on<F, Fut>(
        &self,
        name: &str,
        options: ListenOptions,
        handler: F,
    ) -> Result<ListenerHandle, Error>
    where
        F: Fn(MessageEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Data, Error>> + Send + 'static,
    {
        let listener: ListenerFn = Arc::new(move |event| Box::pin(handler(event)));
        let entry = Arc::new(ListenerEntry {
            handler: listener,
            once: options.once,
            error_handler: options.error_handler,
        });
        let domain = options.domain.unwrap_or(DomainPattern::Wildcard);

        let mut table = self.state.listeners.lock().unwrap();
        if options.windows.is_empty() {
            table.add(name, None, &domain, entry)?;
        } else {
            for win in &options.windows {
                table.add(name, Some(win), &domain, Arc::clone(&entry))?;
            }
        }
        Ok(ListenerHandle {
            state: Arc::downgrade(&self.state),
            name: name.to_string(),
            windows: options.windows.iter().map(WindowHandle::downgrade).collect(),
            wildcard_window: options.windows.is_empty(),
            domain,
        })
    }

    /// Alias for [`Bus::on`], matching the public façade.
    pub fn listen<F, Fut>(
        &self,
        name: &str,
        options: ListenOptions,
        handler: F,
    ) -> Result<ListenerHandle, Error>
    where
        F: Fn(MessageEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Data, Error>> + Send + 'static,
    {
        self.on(name, options, handler)
    }

    /// Wait for a single message named `name`, then unregister.
    pub async fn once(&self, name: &str, mut options: ListenOptions) -> Result<MessageEvent, Error> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        options.once = true;
        let handle = self.on(name, options, move |event| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(event);
            }
            async { Ok(Data::Null) }
        })?;
        match rx.await {
            Ok(event) => Ok(event),
            Err(_) => {
                handle.cancel();
                Err(Error::Fatal(format!("listener for {name} went away")))
            }
        }
    }

    /// Send a request to the window's ancestor.
    pub async fn send_to_parent(
        &self,
        name: &str,
        data: Data,
        options: SendOptions,
    ) -> Result<Data, Error> {
        let ancestor = get_ancestor(&self.win)
            .ok_or_else(|| Error::Integration("window has no parent to message".into()))?;
        self.send(&ancestor, name, data, options).await
    }

    /// A client bound to one peer window and origin pattern.
    pub fn client(&self, peer: &WindowHandle, domain: DomainPattern) -> BusClient {
        BusClient {
            bus: self.clone(),
            peer: peer.clone(),
            domain,
        }
    }

    /// Register a same-origin bridge frame that relays to `domain`.
    pub fn register_bridge(&self, domain: impl Into<String>, bridge: &WindowHandle) {
        self.state
            .bridges
            .lock()
            .unwrap()
            .push((domain.into(), bridge.clone()));
    }

    /// Note that a window has the runtime loaded (a READY arrived, or any
    /// frame was received from it).
    pub(crate) fn mark_window_ready(&self, win: &WindowHandle, origin: &str) {
        BusState::mark_ready(&self.state, win, origin);
    }

    /// Wait until the given window announces READY, up to `timeout`.
    pub async fn await_ready(&self, win: &WindowHandle, timeout: Duration) -> Result<(), Error> {
        let rx = {
            let mut ready = self.state.ready.lock().unwrap();
            let cell = ready.get_or_insert_with(win, ReadyCell::default);
            if cell.origin.is_some() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            cell.waiters.push(tx);
            rx
        };
        tokio::select! {
            result = rx => match result {
                Ok(()) => Ok(()),
                Err(_) => Err(Error::WindowClosed("window went away before ready".into())),
            },
            _ = tokio::time::sleep(timeout) => Err(Error::MessageTimeout(format!(
                "window not ready after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Reject every pending request directed at `win` and drop its method
    /// handles, ready state, and listener entries.
    pub fn clean_up_window(&self, win: &WindowHandle) {
        let rejected: Vec<ResponseEntry> = {
            let mut responses = self.state.responses.lock().unwrap();
            let keys: Vec<String> = responses
                .iter()
                .filter(|(_, entry)| entry.peer.ptr_eq(win))
                .map(|(hash, _)| hash.clone())
                .collect();
            keys.into_iter()
                .filter_map(|hash| responses.remove(&hash))
                .collect()
        };
        for mut entry in rejected {
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(Err(Error::WindowClosed(format!(
                    "window closed during request {}",
                    entry.name
                ))));
            }
        }

        self.state.methods.lock().unwrap().retain(|_, method| match &method.peer {
            // Unscoped methods are owned by a controller's cleanup registry.
            None => true,
            Some(weak) => match weak.upgrade() {
                Some(peer) => !peer.ptr_eq(win),
                None => false,
            },
        });

        self.state.ready.lock().unwrap().remove(win);

        {
            let mut table = self.state.listeners.lock().unwrap();
            table.remove_window(win);
            table.sweep();
        }

        self.state
            .bridges
            .lock()
            .unwrap()
            .retain(|(_, bridge)| !bridge.ptr_eq(win) && !bridge.is_closed());
    }

    /// Remove serialized-method registrations by id; used by controllers
    /// tearing down props that were serialized before the child existed.
    pub(crate) fn remove_methods(&self, ids: &[String]) {
        let mut methods = self.state.methods.lock().unwrap();
        for id in ids {
            methods.remove(id);
        }
    }

    /// Replace payload callables and errors with wire markers, registering
    /// each callable under the given scope. Ids of newly registered methods
    /// are appended to `ids` so callers can unregister them later.
    pub(crate) fn serialize_data(
        &self,
        scope: &MethodScope,
        data: &Data,
        ids: &mut Vec<String>,
    ) -> serde_json::Value {
        match data {
            Data::Null => serde_json::Value::Null,
            Data::Bool(b) => serde_json::Value::Bool(*b),
            Data::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Data::String(s) => serde_json::Value::String(s.clone()),
            Data::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| self.serialize_data(scope, item, ids))
                    .collect(),
            ),
            Data::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), self.serialize_data(scope, value, ids));
                }
                serde_json::Value::Object(out)
            }
            Data::Method(method) => {
                self.state.methods.lock().unwrap().insert(
                    method.id().to_string(),
                    RegisteredMethod {
                        name: method.name().to_string(),
                        domain: scope.domain.clone(),
                        peer: scope.peer.as_ref().map(WindowHandle::downgrade),
                        func: method.func(),
                    },
                );
                ids.push(method.id().to_string());
                serde_json::json!({
                    TYPE_KEY: SERIALIZED_METHOD,
                    ID_KEY: method.id(),
                    NAME_KEY: method.name(),
                })
            }
            Data::Error(err) => {
                let stack = match err {
                    Error::Remote { stack, .. } => stack.clone(),
                    _ => None,
                };
                serde_json::json!({
                    TYPE_KEY: SERIALIZED_ERROR,
                    MESSAGE_KEY: err.to_string(),
                    STACK_KEY: stack,
                })
            }
        }
    }

    /// Rehydrate a wire payload: method markers become stubs that issue a
    /// METHOD request back to `source`, error markers become local errors.
    pub(crate) fn deserialize_data(
        &self,
        source: &WindowHandle,
        origin: &str,
        value: &serde_json::Value,
    ) -> Data {
        if let Some(map) = value.as_object() {
            match map.get(TYPE_KEY).and_then(serde_json::Value::as_str) {
                Some(SERIALIZED_METHOD) => {
                    let id = map
                        .get(ID_KEY)
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let method_name = map
                        .get(NAME_KEY)
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("method")
                        .to_string();
                    return Data::Method(self.method_stub(source, origin, id, method_name));
                }
                Some(SERIALIZED_ERROR) => {
                    let message = map
                        .get(MESSAGE_KEY)
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("remote error")
                        .to_string();
                    let stack = map
                        .get(STACK_KEY)
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string);
                    return Data::Error(Error::Remote { message, stack });
                }
                _ => {}
            }
            let mut out = std::collections::BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), self.deserialize_data(source, origin, item));
            }
            return Data::Object(out);
        }
        if let Some(items) = value.as_array() {
            return Data::Array(
                items
                    .iter()
                    .map(|item| self.deserialize_data(source, origin, item))
                    .collect(),
            );
        }
        Data::from(value.clone())
    }

    /// Build a stub that forwards invocations to the method's home window.
    /// Method calls run under user control, so the request timeout is
    /// unbounded.
    fn method_stub(
        &self,
        source: &WindowHandle,
        origin: &str,
        id: String,
        method_name: String,
    ) -> MethodHandle {
        let bus = self.clone();
        let source = source.clone();
        let origin = origin.to_string();
        let stub_id = id.clone();
        MethodHandle::with_id(stub_id, method_name.clone(), move |args| {
            let bus = bus.clone();
            let source = source.clone();
            let origin = origin.clone();
            let id = id.clone();
            let method_name = method_name.clone();
            Box::pin(async move {
                let response = bus
                    .send(
                        &source,
                        MESSAGE_NAME_METHOD,
                        Data::object([
                            (ID_KEY, Data::String(id)),
                            (NAME_KEY, Data::String(method_name)),
                            (ARGS_KEY, Data::Array(args)),
                        ]),
                        SendOptions {
                            domain: Some(DomainPattern::Literal(origin)),
                            timeout: Timeout::Never,
                            fire_and_forget: false,
                        },
                    )
                    .await?;
                Ok(response.get(RESULT_KEY).cloned().unwrap_or(Data::Null))
            })
        })
    }
}

impl BusState {
    fn mark_ready(state: &Arc<BusState>, win: &WindowHandle, origin: &str) {
        let waiters = {
            let mut ready = state.ready.lock().unwrap();
            let cell = ready.get_or_insert_with(win, ReadyCell::default);
            if cell.origin.is_some() {
                return;
            }
            cell.origin = Some(origin.to_string());
            std::mem::take(&mut cell.waiters)
        };
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}

/// A sender bound to one peer and origin pattern.
#[derive(Clone)]
pub struct BusClient {
    bus: Bus,
    peer: WindowHandle,
    domain: DomainPattern,
}

impl BusClient {
    pub async fn send(&self, name: &str, data: Data) -> Result<Data, Error> {
        self.bus
            .send(
                &self.peer,
                name,
                data,
                SendOptions {
                    domain: Some(self.domain.clone()),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn send_with(
        &self,
        name: &str,
        data: Data,
        options: SendOptions,
    ) -> Result<Data, Error> {
        let mut options = options;
        options.domain.get_or_insert_with(|| self.domain.clone());
        self.bus.send(&self.peer, name, data, options).await
    }
}
