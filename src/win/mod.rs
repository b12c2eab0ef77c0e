//! In-process window substrate: a headless analogue of the browser
//! facilities the component core relies on: window identity, frame trees,
//! `postMessage` delivery, per-window global slots, and navigation with page
//! scripts standing in for a document's `<script>` tags.
//!
//! A [`WindowHandle`] is the engine's view of a window. The runtime itself
//! only touches foreign windows through the [`identity`] utilities and the
//! message bus; same-origin policy is enforced where it matters: message
//! targeting, event origins, and global-slot discovery.

pub mod dom;
pub mod identity;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::Error;
use dom::Document;

pub use dom::{ElementHandle, ReadyState};

/// A `message` event as delivered to a window's queue.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub data: String,
    /// The origin the event reports. `"null"` for opaque origins (`file:`,
    /// `mock:` and other non-http schemes), matching what browsers populate.
    pub origin: String,
    pub source: WindowHandle,
}

/// Boot callback run when a window navigates to a matching URL; the stand-in
/// for the scripts a real document would load.
pub type PageScript = Arc<dyn Fn(WindowHandle) + Send + Sync>;

type UnloadHook = Arc<dyn Fn() + Send + Sync>;

struct BrowserInner {
    popups_enabled: Mutex<bool>,
    pages: Mutex<Vec<(String, PageScript)>>,
    windows: Mutex<Vec<WindowHandle>>,
}

/// Owns top-level windows and page scripts.
#[derive(Clone)]
pub struct Browser {
    inner: Arc<BrowserInner>,
}

impl Browser {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrowserInner {
                popups_enabled: Mutex::new(true),
                pages: Mutex::new(Vec::new()),
                windows: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_popups_enabled(&self, enabled: bool) {
        *self.inner.popups_enabled.lock().unwrap() = enabled;
    }

    /// Register a boot script for every navigation whose URL starts with
    /// `url_prefix`.
    pub fn register_page<F>(&self, url_prefix: impl Into<String>, script: F)
    where
        F: Fn(WindowHandle) + Send + Sync + 'static,
    {
        self.inner
            .pages
            .lock()
            .unwrap()
            .push((url_prefix.into(), Arc::new(script)));
    }

    fn page_for(&self, url: &Url) -> Option<PageScript> {
        let url = url.as_str();
        let pages = self.inner.pages.lock().unwrap();
        pages
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, script)| Arc::clone(script))
    }

    /// Open a top-level window, optionally navigating it.
    pub fn open_window(&self, url: Option<Url>) -> WindowHandle {
        let win = WindowHandle::new(self);
        self.inner.windows.lock().unwrap().push(win.clone());
        if let Some(url) = url {
            win.navigate(url);
        }
        win
    }

    /// Open a popup on behalf of `opener`. Fails when popups are blocked.
    pub fn open_popup(&self, opener: &WindowHandle, name: &str) -> Result<WindowHandle, Error> {
        if !*self.inner.popups_enabled.lock().unwrap() {
            return Err(Error::PopupOpen("popup blocked by browser".into()));
        }
        let win = WindowHandle::new(self);
        {
            let mut state = win.inner.state.lock().unwrap();
            state.name = name.to_string();
            state.opener = Some(opener.downgrade());
        }
        self.inner.windows.lock().unwrap().push(win.clone());
        Ok(win)
    }

    pub fn windows(&self) -> Vec<WindowHandle> {
        self.inner.windows.lock().unwrap().clone()
    }

    fn downgrade(&self) -> Weak<BrowserInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Default for Browser {
    fn default() -> Self {
        Self::new()
    }
}

struct WindowState {
    name: String,
    location: Option<Url>,
    mock_domain: Option<String>,
    parent: Option<WeakWindow>,
    opener: Option<WeakWindow>,
    frames: Vec<WindowHandle>,
    closed: bool,
    document: Document,
    globals: HashMap<String, Arc<dyn Any + Send + Sync>>,
    message_tx: Option<UnboundedSender<PostedMessage>>,
    unload_hooks: Vec<UnloadHook>,
}

struct WindowInner {
    id: Uuid,
    browser: Weak<BrowserInner>,
    state: Mutex<WindowState>,
}

/// Cheap-clone handle to a window. Identity is pointer identity.
#[derive(Clone)]
pub struct WindowHandle {
    inner: Arc<WindowInner>,
}

/// Non-owning window reference for weak-keyed tables.
#[derive(Clone)]
pub struct WeakWindow(Weak<WindowInner>);

impl WeakWindow {
    pub fn upgrade(&self) -> Option<WindowHandle> {
        self.0.upgrade().map(|inner| WindowHandle { inner })
    }
}

impl std::fmt::Debug for WeakWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.upgrade() {
            Some(win) => write!(f, "WeakWindow({})", win.id()),
            None => write!(f, "WeakWindow(dropped)"),
        }
    }
}

impl PartialEq for WindowHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl std::fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Window")
            .field("id", &self.inner.id)
            .field("name", &state.name)
            .field("location", &state.location.as_ref().map(Url::as_str))
            .field("closed", &state.closed)
            .finish()
    }
}

/// Kind of window the sender is, as reported in wire frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Popup,
    Iframe,
    TopLevel,
}

impl WindowHandle {
    fn new(browser: &Browser) -> Self {
        Self {
            inner: Arc::new(WindowInner {
                id: Uuid::new_v4(),
                browser: browser.downgrade(),
                state: Mutex::new(WindowState {
                    name: String::new(),
                    location: None,
                    mock_domain: None,
                    parent: None,
                    opener: None,
                    frames: Vec::new(),
                    closed: false,
                    document: Document::new(),
                    globals: HashMap::new(),
                    message_tx: None,
                    unload_hooks: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &WindowHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakWindow {
        WeakWindow(Arc::downgrade(&self.inner))
    }

    pub fn browser(&self) -> Option<Browser> {
        self.inner.browser.upgrade().map(|inner| Browser { inner })
    }

    pub fn same_browser(&self, other: &WindowHandle) -> bool {
        Weak::ptr_eq(&self.inner.browser, &other.inner.browser)
    }

    pub fn name(&self) -> String {
        self.inner.state.lock().unwrap().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.state.lock().unwrap().name = name.into();
    }

    pub fn location(&self) -> Option<Url> {
        self.inner.state.lock().unwrap().location.clone()
    }

    pub fn set_mock_domain(&self, domain: impl Into<String>) {
        self.inner.state.lock().unwrap().mock_domain = Some(domain.into());
    }

    pub fn mock_domain(&self) -> Option<String> {
        self.inner.state.lock().unwrap().mock_domain.clone()
    }

    pub fn parent(&self) -> Option<WindowHandle> {
        let state = self.inner.state.lock().unwrap();
        state.parent.as_ref().and_then(WeakWindow::upgrade)
    }

    pub fn opener(&self) -> Option<WindowHandle> {
        let state = self.inner.state.lock().unwrap();
        state.opener.as_ref().and_then(WeakWindow::upgrade)
    }

    /// The root of this window's frame tree.
    pub fn top(&self) -> WindowHandle {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn frames(&self) -> Vec<WindowHandle> {
        self.inner.state.lock().unwrap().frames.clone()
    }

    pub fn document(&self) -> Document {
        self.inner.state.lock().unwrap().document.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.browser.strong_count() == 0 || self.inner.state.lock().unwrap().closed
    }

    pub fn kind(&self) -> WindowKind {
        let state = self.inner.state.lock().unwrap();
        if state.opener.is_some() {
            WindowKind::Popup
        } else if state.parent.is_some() {
            WindowKind::Iframe
        } else {
            WindowKind::TopLevel
        }
    }

    /// The window's serialized origin, inherited from the parent or opener
    /// for `about:blank` windows.
    pub(crate) fn raw_origin(&self) -> Option<String> {
        let location = {
            let state = self.inner.state.lock().unwrap();
            state.location.clone()
        };
        match location {
            Some(url) => Some(origin_of_url(&url)),
            None => {
                if let Some(parent) = self.parent() {
                    parent.raw_origin()
                } else if let Some(opener) = self.opener() {
                    opener.raw_origin()
                } else {
                    None
                }
            }
        }
    }

    /// The origin a `message` event from this window would report.
    fn event_origin(&self) -> String {
        match self.location() {
            Some(url) if matches!(url.scheme(), "http" | "https") => origin_of_url(&url),
            Some(_) => "null".to_string(),
            None => self.raw_origin().unwrap_or_else(|| "null".to_string()),
        }
    }

    /// Create a sub-frame of this window, attached to `container`.
    pub fn open_frame(&self, name: &str, container: &ElementHandle) -> WindowHandle {
        let browser = Browser {
            inner: self
                .inner
                .browser
                .upgrade()
                .expect("browser dropped while opening frame"),
        };
        let frame = WindowHandle::new(&browser);
        {
            let mut state = frame.inner.state.lock().unwrap();
            state.name = name.to_string();
            state.parent = Some(self.downgrade());
        }
        self.inner.state.lock().unwrap().frames.push(frame.clone());
        container.attach_frame(&frame);
        frame
    }

    /// Navigate the window: replace the document, reset globals (a new
    /// realm), then run the matching page script.
    pub fn navigate(&self, url: Url) {
        let script = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.location = Some(url.clone());
            state.document = Document::new();
            state.globals.clear();
            state.message_tx = None;
            self.browser().and_then(|b| b.page_for(&url))
        };
        debug!(target = "win", window = %self.inner.id, url = %url, "navigate");
        if let Some(script) = script {
            script(self.clone());
        }
    }

    /// Close the window: run unload hooks, close descendant frames, mark
    /// closed. Idempotent.
    pub fn close(&self) {
        let (hooks, frames) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.message_tx = None;
            (state.unload_hooks.clone(), state.frames.clone())
        };
        debug!(target = "win", window = %self.inner.id, "closing window");
        for hook in hooks {
            hook();
        }
        for frame in frames {
            frame.close();
        }
    }

    pub fn on_unload<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .unwrap()
            .unload_hooks
            .push(Arc::new(hook));
    }

    /// Deliver a message to this window's queue, honoring the target-origin
    /// restriction. Errors describe why delivery was refused, for strategy
    /// diagnostics.
    pub fn post_message(
        &self,
        data: String,
        target_origin: &str,
        source: &WindowHandle,
    ) -> Result<(), String> {
        if self.is_closed() {
            return Err("window is closed".to_string());
        }
        if !source.same_browser(self) {
            return Err("window belongs to a different browser".to_string());
        }
        if target_origin != "*" {
            let actual = self.raw_origin().unwrap_or_else(|| "null".to_string());
            if actual != target_origin {
                return Err(format!(
                    "target origin {target_origin} does not match recipient origin {actual}"
                ));
            }
        }
        let message = PostedMessage {
            data,
            origin: source.event_origin(),
            source: source.clone(),
        };
        let tx = {
            let state = self.inner.state.lock().unwrap();
            state.message_tx.clone()
        };
        match tx {
            Some(tx) => {
                // A dropped receiver means the page's runtime is gone; the
                // message goes to the void like an unhandled browser event.
                let _ = tx.send(message);
            }
            None => {
                debug!(target = "win", window = %self.inner.id, "message dropped: no listener");
            }
        }
        Ok(())
    }

    /// Take the window's message queue. Returns `None` if something already
    /// subscribed; a window has at most one runtime.
    pub fn subscribe_messages(&self) -> Option<UnboundedReceiver<PostedMessage>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.message_tx.is_some() {
            return None;
        }
        let (tx, rx) = unbounded_channel();
        state.message_tx = Some(tx);
        Some(rx)
    }

    pub(crate) fn get_global(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.state.lock().unwrap().globals.get(key).cloned()
    }

    pub(crate) fn set_global(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.inner
            .state
            .lock()
            .unwrap()
            .globals
            .insert(key.to_string(), value);
    }

    /// Idempotently create the global slot under `key`.
    pub(crate) fn ensure_global<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(existing) = state.globals.get(key) {
            if let Ok(typed) = Arc::clone(existing).downcast::<T>() {
                return typed;
            }
        }
        let created = Arc::new(init());
        state
            .globals
            .insert(key.to_string(), created.clone() as Arc<dyn Any + Send + Sync>);
        created
    }
}

/// Serialize a URL's origin the way the runtime compares domains:
/// `scheme://host[:port]`, with `file:` collapsing to `file://`.
pub fn origin_of_url(url: &Url) -> String {
    if url.scheme() == "file" {
        return "file://".to_string();
    }
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}
