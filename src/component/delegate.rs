//! Render delegation: when a parent in another window cannot host the child
//! itself, the descriptor here builds a delegate controller that owns the
//! local DOM work and hands the caller a narrow table of operation
//! overrides, tunneled as method handles.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::bus::{Data, MessageEvent, MethodHandle};
use crate::error::Error;
use crate::templates::{
    default_component_template, default_container_template, TemplateContext,
};
use crate::timers::{safe_interval, SafeTask};
use crate::win::identity::is_window_closed;
use crate::win::{ElementHandle, WindowHandle};

use super::{Component, RenderContext};

/// Operations a delegating parent tunnels instead of running locally. Every
/// entry is sub-frame-only; anything else stays CALL_ORIGINAL.
pub(crate) const DELEGATED_OPS: &[&str] = &[
    "open",
    "open_container",
    "show_container",
    "create_component_template",
    "show_component",
    "show",
    "hide",
    "resize",
    "load_url",
    "destroy_container",
];

const SOURCE_CLOSE_POLL: Duration = Duration::from_millis(50);

/// Service a `delegate_<name>` request: validate the caller, build the
/// delegate controller, and return its override bundle.
pub(crate) async fn handle_delegate_request(
    component: Component,
    event: MessageEvent,
) -> Result<Data, Error> {
    let uid = event
        .data
        .get("uid")
        .and_then(Data::as_str)
        .ok_or_else(|| Error::remote("delegate request carried no uid"))?
        .to_string();
    let context = event
        .data
        .get("context")
        .and_then(Data::as_str)
        .and_then(RenderContext::from_str)
        .ok_or_else(|| Error::remote("delegate request carried no context"))?;
    if context != RenderContext::Iframe {
        return Err(Error::remote(
            "render delegation only applies to the sub-frame context",
        ));
    }

    info!(
        target = "component",
        tag = %component.tag(),
        uid = %uid,
        origin = %event.origin,
        "hosting delegated render"
    );
    let delegate = DelegateController::new(component, event.source.clone(), uid, context);
    Ok(Data::object([("overrides", delegate.overrides())]))
}

struct DelegateState {
    container: Option<ElementHandle>,
    loading_el: Option<ElementHandle>,
    child: Option<WindowHandle>,
    source_watcher: Option<SafeTask>,
}

struct DelegateInner {
    component: Component,
    win: WindowHandle,
    source: WindowHandle,
    uid: String,
    context: RenderContext,
    state: Mutex<DelegateState>,
}

/// Hosts the DOM half of a render driven from another window. Lives as long
/// as the caller holds our override handles; `cleanUpWindow` on the caller
/// drops them, and us.
#[derive(Clone)]
pub(crate) struct DelegateController {
    inner: Arc<DelegateInner>,
}

impl DelegateController {
    fn new(
        component: Component,
        source: WindowHandle,
        uid: String,
        context: RenderContext,
    ) -> Self {
        let win = component.window().clone();
        let controller = Self {
            inner: Arc::new(DelegateInner {
                component,
                win,
                source,
                uid,
                context,
                state: Mutex::new(DelegateState {
                    container: None,
                    loading_el: None,
                    child: None,
                    source_watcher: None,
                }),
            }),
        };
        controller.watch_source();
        controller
    }

    /// If the delegating window goes away, tear the local render down.
    fn watch_source(&self) {
        let weak = Arc::downgrade(&self.inner);
        let source = self.inner.source.clone();
        let watcher = safe_interval(SOURCE_CLOSE_POLL, move || {
            if !is_window_closed(&source) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                debug!(target = "component", "delegating window gone; tearing down");
                DelegateController { inner }.teardown();
            }
        });
        self.inner.state.lock().unwrap().source_watcher = Some(watcher);
    }

    fn teardown(&self) {
        let (container, child, watcher) = {
            let mut state = self.inner.state.lock().unwrap();
            (
                state.container.take(),
                state.child.take(),
                state.source_watcher.take(),
            )
        };
        if let Some(watcher) = watcher {
            watcher.cancel();
        }
        if let Some(child) = child {
            child.close();
        }
        if let Some(container) = container {
            container.detach();
            self.inner.win.document().body().remove_child(&container);
        }
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

    fn op_open_container(&self, element: Option<String>) -> Result<(), Error> {
        let document = self.inner.win.document();
        let target = match element {
            Some(id) => document
                .get_element_by_id(&id)
                .ok_or_else(|| Error::Integration(format!("element {id} not found")))?,
            None => document.body(),
        };
        let template = self
            .inner
            .component
            .options()
            .container_template
            .clone()
            .unwrap_or_else(default_container_template);
        let container = template(&self.template_context())?;
        container.set_visible(false);
        target.append_child(&container);
        self.inner.state.lock().unwrap().container = Some(container);
        Ok(())
    }

    fn op_open(&self, window_name: &str) -> Result<(), Error> {
        let container = self
            .container()
            .ok_or_else(|| Error::Fatal("container must be open before the frame".into()))?;
        let child = self.inner.win.open_frame(window_name, &container);
        self.inner.state.lock().unwrap().child = Some(child);
        Ok(())
    }

    fn op_load_url(&self, url: &str) -> Result<(), Error> {
        let url = url::Url::parse(url)
            .map_err(|err| Error::Integration(format!("invalid delegated url: {err}")))?;
        let child = {
            let state = self.inner.state.lock().unwrap();
            state
                .child
                .clone()
                .ok_or_else(|| Error::Fatal("no frame open to load".into()))?
        };
        child.navigate(url);
        Ok(())
    }

    fn op_create_component_template(&self) -> Result<(), Error> {
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

    fn op_set_visible(&self, visible: bool) {
        if let Some(container) = self.container() {
            container.set_visible(visible);
        }
    }

    fn op_resize(&self, width: u32, height: u32) {
        if let Some(container) = self.container() {
            container.set_dimensions(width, height);
        }
    }

    fn op_destroy_container(&self) {
        self.teardown();
    }

    /// The override bundle handed back to the delegating parent.
    fn overrides(&self) -> Data {
        let mut entries: Vec<(&'static str, Data)> = Vec::new();

        let controller = self.clone();
        entries.push((
            "open_container",
            Data::Method(MethodHandle::from_sync("open_container", move |args| {
                let element = args
                    .first()
                    .and_then(Data::as_str)
                    .map(str::to_string);
                controller.op_open_container(element)?;
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "open",
            Data::Method(MethodHandle::from_sync("open", move |args| {
                let name = args
                    .first()
                    .and_then(Data::as_str)
                    .ok_or_else(|| Error::remote("open requires a window name"))?;
                controller.op_open(name)?;
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "load_url",
            Data::Method(MethodHandle::from_sync("load_url", move |args| {
                let url = args
                    .first()
                    .and_then(Data::as_str)
                    .ok_or_else(|| Error::remote("load_url requires a url"))?;
                controller.op_load_url(url)?;
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "show_container",
            Data::Method(MethodHandle::from_sync("show_container", move |_| {
                controller.op_set_visible(true);
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "create_component_template",
            Data::Method(MethodHandle::from_sync(
                "create_component_template",
                move |_| {
                    controller.op_create_component_template()?;
                    Ok(Data::Null)
                },
            )),
        ));

        let controller = self.clone();
        entries.push((
            "show_component",
            Data::Method(MethodHandle::from_sync("show_component", move |_| {
                let mut state = controller.inner.state.lock().unwrap();
                if let Some(loading) = state.loading_el.take() {
                    loading.detach();
                }
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "show",
            Data::Method(MethodHandle::from_sync("show", move |_| {
                controller.op_set_visible(true);
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "hide",
            Data::Method(MethodHandle::from_sync("hide", move |_| {
                controller.op_set_visible(false);
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "resize",
            Data::Method(MethodHandle::from_sync("resize", move |args| {
                let width = args.first().and_then(Data::as_f64).unwrap_or(0.0) as u32;
                let height = args.get(1).and_then(Data::as_f64).unwrap_or(0.0) as u32;
                controller.op_resize(width, height);
                Ok(Data::Null)
            })),
        ));

        let controller = self.clone();
        entries.push((
            "destroy_container",
            Data::Method(MethodHandle::from_sync("destroy_container", move |_| {
                controller.op_destroy_container();
                Ok(Data::Null)
            })),
        ));

        // CALL_ORIGINAL informational overrides.
        let component = self.inner.component.clone();
        entries.push((
            "get_domain",
            Data::Method(MethodHandle::from_sync("get_domain", move |_| {
                component
                    .get_domain(None, None)
                    .map(Data::String)
            })),
        ));

        Data::object(entries)
    }
}
