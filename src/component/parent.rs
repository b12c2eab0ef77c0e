//! The parent-side controller for one component instance: opens the child
//! context, stamps its window name, builds the URL, attaches listeners,
//! watches for close, and owns the cleanup registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::bus::{Bus, Data, ListenOptions, MethodHandle, MethodScope, SendOptions};
use crate::error::Error;
use crate::name::{build_child_window_name, ParentRef, PropRef, WindowNamePayload};
use crate::props::{normalize_partial, normalize_props, props_to_query, NormalizeOptions, Props};
use crate::task::{CleanupRegistry, Settled};
use crate::templates::{
    default_component_template, default_container_template, TemplateContext,
};
use crate::timers::{safe_interval, safe_timeout, SafeTask};
use crate::win::identity::{get_domain, is_window_closed, match_domain, DomainPattern};
use crate::win::{ElementHandle, ReadyState, WindowHandle};

use super::{Component, RenderContext, XcState};

pub(crate) const MSG_INIT: &str = "xcomponent_init";
pub(crate) const MSG_CLOSE: &str = "xcomponent_close";
pub(crate) const MSG_RESIZE: &str = "xcomponent_resize";
pub(crate) const MSG_HIDE: &str = "xcomponent_hide";
pub(crate) const MSG_SHOW: &str = "xcomponent_show";
pub(crate) const MSG_ERROR: &str = "xcomponent_error";
pub(crate) const MSG_DELEGATE_PREFIX: &str = "delegate_";

const CLOSE_POLL: Duration = Duration::from_millis(50);
const ELEMENT_POLL: Duration = Duration::from_millis(50);

/// Why an instance closed, as reported to `onClose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ParentCall,
    ChildCall,
    CloseDetected,
    UserClosed,
    ParentCloseDetected,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ParentCall => "parent_call",
            CloseReason::ChildCall => "child_call",
            CloseReason::CloseDetected => "close_detected",
            CloseReason::UserClosed => "user_closed",
            CloseReason::ParentCloseDetected => "parent_close_detected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentStatus {
    Constructed,
    Rendering,
    Initialized,
    Closing,
    Destroyed,
}

/// Methods the child exported during init.
#[derive(Clone)]
pub struct ChildExports {
    pub update_props: MethodHandle,
    pub close: MethodHandle,
}

/// Overrides tunneled from a sibling frame hosting the render.
#[derive(Clone)]
pub(crate) struct DelegateLink {
    pub target: WindowHandle,
    pub overrides: BTreeMap<String, MethodHandle>,
}

impl DelegateLink {
    fn get(&self, op: &str) -> Option<MethodHandle> {
        self.overrides.get(op).cloned()
    }
}

struct ParentState {
    status: ParentStatus,
    props: Props,
    child: Option<WindowHandle>,
    child_domain: Option<String>,
    child_exports: Option<ChildExports>,
    container: Option<ElementHandle>,
    loading_el: Option<ElementHandle>,
    handled_errors: Vec<String>,
    load_timeout: Option<SafeTask>,
    close_watcher: Option<SafeTask>,
    delegate: Option<DelegateLink>,
    on_close_fired: bool,
    window_name: Option<String>,
}

pub(crate) struct ParentInner {
    component: Component,
    win: WindowHandle,
    bus: Bus,
    uid: String,
    context: RenderContext,
    on_init: Settled<Result<(), Error>>,
    clean: CleanupRegistry,
    state: Mutex<ParentState>,
}

/// The mutable per-instance controller on the parent side.
#[derive(Clone)]
pub struct ParentController {
    inner: Arc<ParentInner>,
}

impl std::fmt::Debug for ParentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentController")
            .field("uid", &self.inner.uid)
            .finish_non_exhaustive()
    }
}

impl ParentController {
    pub(crate) fn new(
        component: Component,
        context: RenderContext,
        props: BTreeMap<String, Data>,
    ) -> Result<Self, Error> {
        let win = component.window().clone();
        let current_origin = get_domain(&win).ok();
        let normalized = normalize_props(
            &Arc::new(component.options().props.clone()),
            props,
            &NormalizeOptions {
                loose: component.options().loose_props,
                child: false,
                supplied_origin: current_origin.clone(),
                current_origin,
            },
        )?;

        Ok(Self {
            inner: Arc::new(ParentInner {
                bus: component.bus().clone(),
                win,
                uid: format!("uid_{}", Uuid::new_v4().simple()),
                context,
                on_init: Settled::new(),
                clean: CleanupRegistry::new(),
                state: Mutex::new(ParentState {
                    status: ParentStatus::Constructed,
                    props: normalized,
                    child: None,
                    child_domain: None,
                    child_exports: None,
                    container: None,
                    loading_el: None,
                    handled_errors: Vec::new(),
                    load_timeout: None,
                    close_watcher: None,
                    delegate: None,
                    on_close_fired: false,
                    window_name: None,
                }),
                component,
            }),
        })
    }

    pub fn uid(&self) -> String {
        self.inner.uid.clone()
    }

    pub fn context(&self) -> RenderContext {
        self.inner.context
    }

    pub fn props(&self) -> Props {
        self.inner.state.lock().unwrap().props.clone()
    }

    /// The child window handle, present between open and destroy.
    pub fn child_window(&self) -> Option<WindowHandle> {
        self.inner.state.lock().unwrap().child.clone()
    }

    /// The stamped child window name, available once the render opened the
    /// child context.
    pub fn window_name(&self) -> Option<String> {
        self.inner.state.lock().unwrap().window_name.clone()
    }

    /// The resolved child origin.
    pub fn child_domain(&self) -> Option<String> {
        self.inner.state.lock().unwrap().child_domain.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().unwrap().status == ParentStatus::Destroyed
    }

    /// Wait until the child completes its init round-trip (or the instance
    /// fails).
    pub async fn wait_init(&self) -> Result<(), Error> {
        self.inner.on_init.wait().await
    }

    /// Render into this window.
    pub async fn render(&self, element: Option<&str>) -> Result<(), Error> {
        let element = element.map(str::to_string);
        match self.render_pipeline(element).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Render with the DOM work delegated to the runtime loaded in `target`.
    pub async fn render_to(&self, target: &WindowHandle, element: Option<&str>) -> Result<(), Error> {
        if target.ptr_eq(&self.inner.win) {
            return self.render(element).await;
        }
        if self.inner.context != RenderContext::Iframe {
            return Err(Error::Integration(
                "render delegation only applies to the sub-frame context".into(),
            ));
        }
        let element = element.map(str::to_string);
        let result = async {
            self.acquire_delegate(target).await?;
            self.render_pipeline(element).await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Ask the runtime in `target` for a set of operation overrides.
    async fn acquire_delegate(&self, target: &WindowHandle) -> Result<(), Error> {
        let message = format!("{}{}", MSG_DELEGATE_PREFIX, self.inner.component.name());
        let response = self
            .inner
            .bus
            .send(
                target,
                &message,
                Data::object([
                    ("uid", Data::String(self.inner.uid.clone())),
                    ("context", Data::String(self.inner.context.as_str().into())),
                ]),
                SendOptions::default(),
            )
            .await?;

        let overrides = response
            .get("overrides")
            .and_then(Data::as_object)
            .ok_or_else(|| Error::Render("delegate response carried no overrides".into()))?
            .iter()
            .filter_map(|(op, value)| value.as_method().map(|m| (op.clone(), m.clone())))
            .collect::<BTreeMap<String, MethodHandle>>();

        debug!(
            target = "component",
            uid = %self.inner.uid,
            ops = overrides.len(),
            "render delegated"
        );
        if let Some(destroy) = overrides.get("destroy_container").cloned() {
            self.inner
                .clean
                .register("delegateDestroyContainer", move || {
                    Box::pin(async move {
                        let _ = destroy.call(vec![]).await;
                    })
                });
        }
        self.inner.state.lock().unwrap().delegate = Some(DelegateLink {
            target: target.clone(),
            overrides,
        });
        Ok(())
    }

    fn delegate_override(&self, op: &str) -> Option<MethodHandle> {
        if !super::delegate::DELEGATED_OPS.contains(&op) {
            return None;
        }
        let state = self.inner.state.lock().unwrap();
        state.delegate.as_ref().and_then(|link| link.get(op))
    }

    /// The render pipeline: every named step of the open → listen → load →
    /// timeout sequence, advancing as dependencies permit.
    async fn render_pipeline(&self, element: Option<String>) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.status != ParentStatus::Constructed {
                return Err(Error::Integration(
                    "component instance can only be rendered once".into(),
                ));
            }
            state.status = ParentStatus::Rendering;
        }

        // Security gate before any window is opened.
        let parent_domain = get_domain(&self.inner.win)?;
        if !match_domain(
            &self.inner.component.options().allowed_parent_domains,
            &parent_domain,
        ) {
            return Err(Error::Render(format!(
                "domain {parent_domain} is not allowed to render {}",
                self.inner.component.tag()
            )));
        }

        // The load timeout starts counting before any slow step can stall.
        self.run_timeout();

        let props = self.props();
        props.call_if_present("onRender", vec![]).await?;

        // getDomain
        let env = props
            .get("env")
            .and_then(Data::as_str)
            .map(str::to_string);
        let url_override = match props.get("url") {
            Some(Data::String(url)) => Some(url.clone()),
            _ => None,
        };
        let child_domain = self
            .inner
            .component
            .get_domain(url_override.as_deref(), env.as_deref())?;
        self.inner.state.lock().unwrap().child_domain = Some(child_domain.clone());

        // elementReady + openContainer (local or delegated)
        self.open_container(element).await?;

        // open
        let window_name = self.build_window_name(&child_domain)?;
        let child = self.open(&window_name).await?;

        // openBridge
        self.open_bridge(&child_domain)?;

        // listen before the child can possibly load.
        self.listen(&child, &child_domain)?;

        // watchForClose + parent unload
        self.watch_for_close(&child);

        // showContainer / createComponentTemplate / showComponent have no
        // ordering dependency between them.
        crate::task::run_named(vec![
            ("showContainer", Box::pin(self.show_container())),
            (
                "createComponentTemplate",
                Box::pin(self.create_component_template()),
            ),
            ("showComponent", Box::pin(self.show_component())),
        ])
        .await?;

        // buildUrl + loadUrl
        let url = self.build_url(url_override, env.as_deref(), &props).await?;
        self.load_url(&child, &url).await?;

        info!(
            target = "component",
            tag = %self.inner.component.tag(),
            uid = %self.inner.uid,
            url = %url,
            "component rendered"
        );
        Ok(())
    }

    /// Decide the parent/render-parent references and the prop transport,
    /// then stamp the descriptor into a window name.
    fn build_window_name(&self, child_domain: &str) -> Result<String, Error> {
        let win = &self.inner.win;
        let parent_domain = get_domain(win)?;
        let delegated = self.inner.state.lock().unwrap().delegate.is_some();

        let parent_ref = if !delegated {
            ParentRef::DirectParent
        } else {
            // The child needs a name to find us from a foreign frame tree.
            if win.name().is_empty() {
                win.set_name(format!("xcomponent_parent_{}", self.inner.uid));
            }
            ParentRef::Name(win.name())
        };

        let render_parent_ref = if !delegated {
            ParentRef::DirectParent
        } else {
            let target = {
                let state = self.inner.state.lock().unwrap();
                state.delegate.as_ref().map(|link| link.target.clone())
            };
            if let Some(target) = target {
                XcState::of(win)
                    .windows
                    .lock()
                    .unwrap()
                    .insert(self.inner.uid.clone(), target);
            }
            ParentRef::ParentUid
        };

        // Same-origin children read their props straight out of the name;
        // everyone else gets a uid key into our props map.
        let child_props = {
            let state = self.inner.state.lock().unwrap();
            state.props.child_visible()
        };
        let scope = MethodScope {
            peer: None,
            domain: DomainPattern::Literal(child_domain.to_string()),
        };
        let mut method_ids = Vec::new();
        let serialized =
            self.inner
                .bus
                .serialize_data(&scope, &Data::Object(child_props), &mut method_ids);

        let props_ref = if child_domain == parent_domain {
            PropRef::Raw { value: serialized }
        } else {
            XcState::of(win)
                .props
                .lock()
                .unwrap()
                .insert(self.inner.uid.clone(), serialized);
            PropRef::Uid
        };

        {
            let bus = self.inner.bus.clone();
            let uid = self.inner.uid.clone();
            let win = win.clone();
            self.inner.clean.register_sync("nameProps", move || {
                bus.remove_methods(&method_ids);
                let state = XcState::of(&win);
                state.props.lock().unwrap().remove(&uid);
                state.windows.lock().unwrap().remove(&uid);
            });
        }

        let payload = WindowNamePayload {
            name: self.inner.component.name(),
            version: self.inner.component.version(),
            tag: self.inner.component.tag(),
            id: Uuid::new_v4().to_string(),
            domain: parent_domain,
            parent: parent_ref,
            render_parent: render_parent_ref,
            uid: self.inner.uid.clone(),
            props: props_ref,
        };
        let name = build_child_window_name(&payload)?;
        self.inner.state.lock().unwrap().window_name = Some(name.clone());
        Ok(name)
    }

    /// Poll for the target node, then render the container template into it.
    async fn open_container(&self, element: Option<String>) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("open_container") {
            op.call(vec![element.map(Data::String).unwrap_or(Data::Null)])
                .await?;
            return Ok(());
        }
        if self.inner.context == RenderContext::Popup {
            return Ok(());
        }

        let target = self.element_ready(element).await?;
        let options = self.inner.component.options();
        let template = options
            .container_template
            .clone()
            .unwrap_or_else(default_container_template);
        let container = template(&self.template_context())?;
        container.set_visible(false);

        if options.sandbox_container {
            // The sandbox wraps the container in its own frame element whose
            // document is written open → body → close.
            let sandbox = ElementHandle::new("iframe")
                .with_class(format!("xcomponent-sandbox-{}", self.inner.component.tag()));
            sandbox.append_child(&container);
            target.append_child(&sandbox);
        } else {
            target.append_child(&container);
        }

        {
            let container_for_cleanup = container.clone();
            let target_for_cleanup = target.clone();
            self.inner.clean.register_sync("destroyContainer", move || {
                container_for_cleanup.detach();
                target_for_cleanup.remove_child(&container_for_cleanup);
            });
        }
        self.inner.state.lock().unwrap().container = Some(container);
        Ok(())
    }

    async fn element_ready(&self, element: Option<String>) -> Result<ElementHandle, Error> {
        let document = self.inner.win.document();
        let Some(id) = element else {
            return Ok(document.body());
        };
        loop {
            if let Some(el) = document.get_element_by_id(&id) {
                return Ok(el);
            }
            if document.ready_state() == ReadyState::Complete {
                return Err(Error::Integration(format!(
                    "element {id} not found in document"
                )));
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }

    /// Open the child context, a sub-frame attached to the container or a
    /// popup, carrying the stamped window name.
    async fn open(&self, window_name: &str) -> Result<WindowHandle, Error> {
        let child = if let Some(op) = self.delegate_override("open") {
            op.call(vec![Data::String(window_name.to_string())]).await?;
            let target = {
                let state = self.inner.state.lock().unwrap();
                state
                    .delegate
                    .as_ref()
                    .map(|link| link.target.clone())
                    .ok_or_else(|| Error::Fatal("delegate link vanished during open".into()))?
            };
            crate::win::identity::find_frame_by_name(&target, window_name, &self.inner.win)
                .ok_or_else(|| {
                    Error::Render("delegate opened no frame with the stamped name".into())
                })?
        } else {
            match self.inner.context {
                RenderContext::Iframe => {
                    let container = {
                        let state = self.inner.state.lock().unwrap();
                        state.container.clone().ok_or_else(|| {
                            Error::Fatal("container must be open before the frame".into())
                        })?
                    };
                    self.inner.win.open_frame(window_name, &container)
                }
                RenderContext::Popup => {
                    let browser = self
                        .inner
                        .win
                        .browser()
                        .ok_or_else(|| Error::Fatal("browser is gone".into()))?;
                    browser.open_popup(&self.inner.win, window_name)?
                }
            }
        };

        self.inner.state.lock().unwrap().child = Some(child.clone());
        {
            let bus = self.inner.bus.clone();
            let weak_child = child.downgrade();
            self.inner.clean.register_sync("destroyWindow", move || {
                if let Some(child) = weak_child.upgrade() {
                    child.close();
                    bus.clean_up_window(&child);
                }
            });
        }
        Ok(child)
    }

    fn open_bridge(&self, child_domain: &str) -> Result<(), Error> {
        let Some(bridge_url) = self.inner.component.options().bridge_url.clone() else {
            return Ok(());
        };
        let url = Url::parse(&bridge_url)
            .map_err(|err| Error::Integration(format!("invalid bridge url: {err}")))?;
        let bridge = self.inner.win.open_frame(
            &format!("xcomponent_bridge_{}", self.inner.uid),
            &self.inner.win.document().body(),
        );
        bridge.navigate(url);
        // linkDomain: the relay now serves the child's origin.
        self.inner.bus.register_bridge(child_domain, &bridge);
        let weak_bridge = bridge.downgrade();
        self.inner.clean.register_sync("destroyBridge", move || {
            if let Some(bridge) = weak_bridge.upgrade() {
                bridge.close();
            }
        });
        Ok(())
    }

    /// Attach the parent-side message set for this child.
    fn listen(&self, child: &WindowHandle, child_domain: &str) -> Result<(), Error> {
        let domain = DomainPattern::Literal(child_domain.to_string());
        let weak = Arc::downgrade(&self.inner);

        let handles = vec![
            self.inner.bus.on(
                MSG_INIT,
                ListenOptions::for_window(child, domain.clone()),
                {
                    let weak = weak.clone();
                    move |event| {
                        let weak = weak.clone();
                        async move {
                            let controller = upgrade(&weak)?;
                            controller.handle_init(event.data).await
                        }
                    }
                },
            )?,
            self.inner.bus.on(
                MSG_CLOSE,
                ListenOptions::for_window(child, domain.clone()),
                {
                    let weak = weak.clone();
                    move |_event| {
                        let weak = weak.clone();
                        async move {
                            let controller = upgrade(&weak)?;
                            controller.close(CloseReason::ChildCall).await;
                            Ok(Data::Null)
                        }
                    }
                },
            )?,
            self.inner.bus.on(
                MSG_RESIZE,
                ListenOptions::for_window(child, domain.clone()),
                {
                    let weak = weak.clone();
                    move |event| {
                        let weak = weak.clone();
                        async move {
                            let controller = upgrade(&weak)?;
                            let width = event.data.get("width").and_then(Data::as_f64);
                            let height = event.data.get("height").and_then(Data::as_f64);
                            controller.handle_child_resize(width, height).await?;
                            Ok(Data::Null)
                        }
                    }
                },
            )?,
            self.inner.bus.on(
                MSG_HIDE,
                ListenOptions::for_window(child, domain.clone()),
                {
                    let weak = weak.clone();
                    move |_event| {
                        let weak = weak.clone();
                        async move {
                            let controller = upgrade(&weak)?;
                            controller.hide().await?;
                            Ok(Data::Null)
                        }
                    }
                },
            )?,
            self.inner.bus.on(
                MSG_SHOW,
                ListenOptions::for_window(child, domain.clone()),
                {
                    let weak = weak.clone();
                    move |_event| {
                        let weak = weak.clone();
                        async move {
                            let controller = upgrade(&weak)?;
                            controller.show().await?;
                            Ok(Data::Null)
                        }
                    }
                },
            )?,
            self.inner.bus.on(
                MSG_ERROR,
                ListenOptions::for_window(child, domain),
                {
                    let weak = weak.clone();
                    move |event| {
                        let weak = weak.clone();
                        async move {
                            let controller = upgrade(&weak)?;
                            let err = match event.data.get("error") {
                                Some(Data::Error(err)) => err.clone(),
                                Some(other) => Error::remote(other.stable_key()),
                                None => Error::remote("child reported an unspecified error"),
                            };
                            let _ = controller.error(err).await;
                            Ok(Data::Null)
                        }
                    }
                },
            )?,
        ];

        for handle in handles {
            self.inner
                .clean
                .register_sync("listener", move || handle.cancel());
        }
        Ok(())
    }

    async fn handle_init(&self, data: Data) -> Result<Data, Error> {
        let exports = data
            .get("exports")
            .ok_or_else(|| Error::remote("init carried no exports"))?;
        let update_props = exports
            .get("updateProps")
            .and_then(Data::as_method)
            .cloned()
            .ok_or_else(|| Error::remote("init exports missing updateProps"))?;
        let close = exports
            .get("close")
            .and_then(Data::as_method)
            .cloned()
            .ok_or_else(|| Error::remote("init exports missing close"))?;

        let child_props = {
            let mut state = self.inner.state.lock().unwrap();
            state.child_exports = Some(ChildExports {
                update_props,
                close,
            });
            state.status = ParentStatus::Initialized;
            state.load_timeout = None;
            // The loading interstitial has served its purpose.
            if let Some(loading) = state.loading_el.take() {
                loading.detach();
            }
            state.props.child_visible()
        };
        self.inner.on_init.settle(Ok(()));
        info!(target = "component", uid = %self.inner.uid, "component initialized");

        Ok(Data::object([
            ("props", Data::Object(child_props)),
            (
                "context",
                Data::String(self.inner.context.as_str().to_string()),
            ),
        ]))
    }

    /// Poll the child for disappearance and tear the instance down when the
    /// parent page unloads.
    fn watch_for_close(&self, child: &WindowHandle) {
        let weak = Arc::downgrade(&self.inner);
        let child_for_watch = child.clone();
        let watcher = safe_interval(CLOSE_POLL, move || {
            if !is_window_closed(&child_for_watch) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let controller = ParentController { inner };
                tokio::spawn(async move {
                    controller.handle_detected_close().await;
                });
            }
        });
        self.inner.state.lock().unwrap().close_watcher = Some(watcher);

        let weak = Arc::downgrade(&self.inner);
        self.inner.win.on_unload(move || {
            if let Some(inner) = weak.upgrade() {
                let controller = ParentController { inner };
                tokio::spawn(async move {
                    controller.destroy().await;
                });
            }
        });
    }

    async fn handle_detected_close(&self) {
        if !self.inner.on_init.is_settled() {
            self.inner.on_init.settle(Err(Error::WindowClosed(
                "window closed during init".into(),
            )));
        }
        self.close(CloseReason::CloseDetected).await;
    }

    /// Compute the final child URL: base + env + prop query + the component
    /// marker + a cache buster when the URL collides with our own location.
    async fn build_url(
        &self,
        url_override: Option<String>,
        env: Option<&str>,
        props: &Props,
    ) -> Result<Url, Error> {
        let base = match url_override {
            Some(url) => url,
            None => match props.definitions().get("url").map(|def| def.getter) {
                Some(true) => match props.get_value("url").await? {
                    Data::String(url) => url,
                    _ => self.inner.component.get_url(env)?,
                },
                _ => self.inner.component.get_url(env)?,
            },
        };
        let mut url = Url::parse(&base)
            .map_err(|err| Error::Integration(format!("invalid component url {base}: {err}")))?;

        let pairs = props_to_query(props).await?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in &pairs {
                query.append_pair(key, value);
            }
            query.append_pair(super::XCOMPONENT_QUERY_MARKER, "1");
        }

        if let Some(current) = self.inner.win.location() {
            let mut stripped = url.clone();
            stripped.set_fragment(None);
            let mut current = current;
            current.set_fragment(None);
            if stripped == current {
                url.query_pairs_mut()
                    .append_pair("cb", &Uuid::new_v4().simple().to_string());
            }
        }
        Ok(url)
    }

    async fn load_url(&self, child: &WindowHandle, url: &Url) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("load_url") {
            op.call(vec![Data::String(url.to_string())]).await?;
            return Ok(());
        }
        child.navigate(url.clone());
        Ok(())
    }

    /// Start the load timeout when the instance declared one.
    fn run_timeout(&self) {
        let timeout_ms = {
            let state = self.inner.state.lock().unwrap();
            state
                .props
                .get("timeout")
                .and_then(Data::as_f64)
                .unwrap_or(0.0)
        };
        if timeout_ms <= 0.0 {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let task = safe_timeout(Duration::from_millis(timeout_ms as u64), move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let controller = ParentController { inner };
            tokio::spawn(async move {
                controller.handle_load_timeout(timeout_ms as u64).await;
            });
        });
        self.inner.state.lock().unwrap().load_timeout = Some(task);
    }

    async fn handle_load_timeout(&self, timeout_ms: u64) {
        if self.inner.on_init.is_settled() {
            return;
        }
        let err = Error::MessageTimeout(format!(
            "component load timed out after {timeout_ms}ms"
        ));
        warn!(target = "component", uid = %self.inner.uid, "load timeout");
        self.inner.on_init.settle(Err(err.clone()));

        let props = self.props();
        if props.get("onTimeout").is_some() {
            if let Err(hook_err) = props
                .call_if_present("onTimeout", vec![Data::Error(err)])
                .await
            {
                warn!(target = "component", error = %hook_err, "onTimeout hook failed");
            }
            self.destroy().await;
        } else {
            let _ = self.error(err).await;
        }
    }

    async fn show_container(&self) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("show_container") {
            op.call(vec![]).await?;
            return Ok(());
        }
        if let Some(container) = self.container() {
            container.set_visible(true);
        }
        Ok(())
    }

    async fn create_component_template(&self) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("create_component_template") {
            op.call(vec![]).await?;
            return Ok(());
        }
        let Some(container) = self.container() else {
            return Ok(());
        };
        let template = self
            .inner
            .component
            .options()
            .component_template
            .clone()
            .unwrap_or_else(default_component_template);
        let loading = template(&self.template_context())?;
        container.append_child(&loading);
        self.inner.state.lock().unwrap().loading_el = Some(loading);
        Ok(())
    }

    async fn show_component(&self) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("show_component") {
            op.call(vec![]).await?;
            return Ok(());
        }
        Ok(())
    }

    fn template_context(&self) -> TemplateContext {
        TemplateContext {
            tag: self.inner.component.tag(),
            uid: self.inner.uid.clone(),
            context: self.inner.context,
            dimensions: self.inner.component.options().dimensions,
        }
    }

    fn container(&self) -> Option<ElementHandle> {
        self.inner.state.lock().unwrap().container.clone()
    }

    /// Push a partial prop update to the child.
    pub async fn update_props(&self, partial: BTreeMap<String, Data>) -> Result<(), Error> {
        self.wait_init().await?;
        let defs = {
            let state = self.inner.state.lock().unwrap();
            Arc::clone(state.props.definitions())
        };
        let current_origin = get_domain(&self.inner.win).ok();
        let normalized = normalize_partial(
            &defs,
            partial,
            &NormalizeOptions {
                loose: self.inner.component.options().loose_props,
                child: false,
                supplied_origin: current_origin.clone(),
                current_origin,
            },
        )?;

        let (update, child_update) = {
            let mut state = self.inner.state.lock().unwrap();
            state.props.merge(normalized.clone());
            let child_update: BTreeMap<String, Data> = normalized
                .into_iter()
                .filter(|(name, _)| {
                    state
                        .props
                        .definitions()
                        .get(name)
                        .map(|def| def.send_to_child)
                        .unwrap_or(true)
                })
                .collect();
            (state.child_exports.clone(), child_update)
        };
        let exports =
            update.ok_or_else(|| Error::Fatal("initialized instance lost its exports".into()))?;
        exports
            .update_props
            .call(vec![Data::Object(child_update)])
            .await?;
        Ok(())
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("resize") {
            op.call(vec![Data::from(width), Data::from(height)]).await?;
            return Ok(());
        }
        if let Some(container) = self.container() {
            container.set_dimensions(width, height);
        }
        Ok(())
    }

    async fn handle_child_resize(&self, width: Option<f64>, height: Option<f64>) -> Result<(), Error> {
        if !self.inner.component.options().auto_resize {
            debug!(target = "component", uid = %self.inner.uid, "resize ignored: auto_resize off");
            return Ok(());
        }
        let current = self
            .container()
            .and_then(|el| el.dimensions())
            .unwrap_or((0, 0));
        let width = width.map(|w| w as u32).unwrap_or(current.0);
        let height = height.map(|h| h as u32).unwrap_or(current.1);
        self.resize(width, height).await
    }

    pub async fn show(&self) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("show") {
            op.call(vec![]).await?;
            return Ok(());
        }
        if let Some(container) = self.container() {
            container.set_visible(true);
        }
        Ok(())
    }

    pub async fn hide(&self) -> Result<(), Error> {
        if let Some(op) = self.delegate_override("hide") {
            op.call(vec![]).await?;
            return Ok(());
        }
        if let Some(container) = self.container() {
            container.set_visible(false);
        }
        Ok(())
    }

    /// Close the instance. Idempotent; `onClose` fires at most once no
    /// matter which path got here first.
    pub async fn close(&self, reason: CloseReason) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.on_close_fired {
                return;
            }
            state.on_close_fired = true;
            state.status = ParentStatus::Closing;
        }
        info!(
            target = "component",
            uid = %self.inner.uid,
            reason = reason.as_str(),
            "closing component"
        );

        let props = self.props();
        if let Err(err) = props
            .call_if_present("onClose", vec![Data::String(reason.as_str().to_string())])
            .await
        {
            warn!(target = "component", error = %err, "onClose hook failed");
        }

        let (child, exports) = {
            let mut state = self.inner.state.lock().unwrap();
            state.load_timeout = None;
            state.close_watcher = None;
            (state.child.clone(), state.child_exports.clone())
        };

        // Component close and container close proceed together.
        let component_close = async {
            if reason != CloseReason::ChildCall {
                if let (Some(child), Some(exports)) = (&child, &exports) {
                    if !is_window_closed(child) {
                        let result = exports.close.call(vec![]).await;
                        if let Err(err) = result {
                            debug!(target = "component", error = %err, "child close call failed");
                        }
                    }
                }
            }
            if let Some(child) = &child {
                child.close();
                self.inner.bus.clean_up_window(child);
            }
        };
        let container_close = async {
            if let Some(container) = self.container() {
                container.set_visible(false);
            }
        };
        tokio::join!(component_close, container_close);

        self.destroy().await;
    }

    /// Run every cleanup task and drop per-instance state.
    pub async fn destroy(&self) {
        self.inner.clean.run_all().await;
        let mut state = self.inner.state.lock().unwrap();
        state.child = None;
        state.child_exports = None;
        state.container = None;
        state.loading_el = None;
        state.load_timeout = None;
        state.close_watcher = None;
        state.status = ParentStatus::Destroyed;
    }

    /// Route an error: deduplicated, then to `onError` if supplied, else
    /// back to the caller.
    pub async fn error(&self, err: Error) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            let key = err.to_string();
            if state.handled_errors.contains(&key) {
                return Ok(());
            }
            state.handled_errors.push(key);
        }
        self.inner.on_init.settle(Err(err.clone()));

        let props = self.props();
        let has_handler = props.get("onError").is_some();
        if has_handler {
            if let Err(hook_err) = props
                .call_if_present("onError", vec![Data::Error(err.clone())])
                .await
            {
                warn!(target = "component", error = %hook_err, "onError hook failed");
            }
            self.destroy().await;
            Ok(())
        } else {
            self.destroy().await;
            Err(err)
        }
    }

    /// Fail the instance from the render pipeline.
    async fn fail(&self, err: Error) {
        let _ = self.error(err).await;
    }
}

fn upgrade(weak: &Weak<ParentInner>) -> Result<ParentController, Error> {
    weak.upgrade()
        .map(|inner| ParentController { inner })
        .ok_or_else(|| Error::remote("component instance is gone"))
}
