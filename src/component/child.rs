//! The child-side controller: decodes the window-name descriptor, recovers
//! props, reports ready to the parent, services prop updates, auto-resizes,
//! and dies with its parent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{Bus, Data, MethodHandle, SendOptions};
use crate::error::Error;
use crate::name::{decode_child_window_name, ParentRef, PropRef, WindowNamePayload};
use crate::props::{normalize_partial, normalize_props, NormalizeOptions, Props};
use crate::timers::{safe_interval, SafeTask};
use crate::win::identity::{
    find_frame_by_name, get_ancestor, get_domain, is_window_closed, match_domain, DomainPattern,
};
use crate::win::WindowHandle;

use super::parent::{MSG_CLOSE, MSG_ERROR, MSG_HIDE, MSG_INIT, MSG_RESIZE, MSG_SHOW};
use super::{Component, RenderContext, XcState};

const PARENT_CLOSE_POLL: Duration = Duration::from_millis(50);
const RESIZE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildStatus {
    Constructed,
    RecoveredProps,
    Ready,
    Live,
    Destroyed,
}

pub type PropsHandlerFn = Arc<dyn Fn(&Props) + Send + Sync>;

struct ChildState {
    status: ChildStatus,
    props: Props,
    context: RenderContext,
    on_props: Vec<PropsHandlerFn>,
    watchers: Vec<SafeTask>,
}

pub(crate) struct ChildInner {
    component: Component,
    win: WindowHandle,
    bus: Bus,
    payload: WindowNamePayload,
    parent_win: WindowHandle,
    render_parent: WindowHandle,
    parent_domain: String,
    state: Mutex<ChildState>,
}

/// The mutable per-instance controller on the child side.
#[derive(Clone)]
pub struct ChildController {
    inner: Arc<ChildInner>,
}

impl ChildController {
    /// Bind a child controller to the current window: decode the name,
    /// validate origins, recover props, and run the init exchange.
    pub(crate) async fn bootstrap(component: Component) -> Result<ChildController, Error> {
        let win = component.window().clone();
        let bus = component.bus().clone();

        let payload = decode_child_window_name(&win.name()).ok_or_else(|| {
            Error::Integration(format!(
                "window is not a child context of {}",
                component.tag()
            ))
        })?;
        if payload.tag != component.tag() {
            return Err(Error::Integration(format!(
                "window name is for component {}, not {}",
                payload.tag,
                component.tag()
            )));
        }

        let parent_domain = payload.domain.clone();
        if !match_domain(
            &component.options().allowed_parent_domains,
            &parent_domain,
        ) {
            return Err(Error::Render(format!(
                "parent domain {parent_domain} is not allowed for {}",
                component.tag()
            )));
        }

        let parent_win = resolve_parent_ref(&win, &payload.parent, None)?;
        let render_parent = resolve_parent_ref(
            &win,
            &payload.render_parent,
            Some((&parent_win, payload.uid.as_str())),
        )?;

        let supplied = recover_props(&bus, &win, &parent_win, &parent_domain, &payload)?;
        let props = normalize_props(
            &Arc::new(component.options().props.clone()),
            supplied,
            &NormalizeOptions {
                loose: component.options().loose_props,
                child: true,
                supplied_origin: Some(parent_domain.clone()),
                current_origin: get_domain(&win).ok(),
            },
        )?;
        debug!(target = "component", tag = %component.tag(), "child props recovered");

        let controller = ChildController {
            inner: Arc::new(ChildInner {
                bus,
                win,
                payload,
                parent_win,
                render_parent,
                parent_domain,
                state: Mutex::new(ChildState {
                    status: ChildStatus::Constructed,
                    props,
                    context: component.options().default_context,
                    on_props: Vec::new(),
                    watchers: Vec::new(),
                }),
                component,
            }),
        };
        controller.inner.state.lock().unwrap().status = ChildStatus::RecoveredProps;

        controller.send_init().await?;
        controller.watch_parent();
        if controller.inner.component.options().auto_resize {
            controller.watch_dimensions();
        }
        Ok(controller)
    }

    /// Send the init request, carrying our exports; the response holds the
    /// authoritative context and prop set.
    async fn send_init(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.status = ChildStatus::Ready;
        }

        let weak = Arc::downgrade(&self.inner);
        let update_props = MethodHandle::new("updateProps", move |args| {
            let weak = weak.clone();
            Box::pin(async move {
                let controller = upgrade(&weak)?;
                let partial = match args.into_iter().next() {
                    Some(Data::Object(map)) => map,
                    _ => BTreeMap::new(),
                };
                controller.handle_update_props(partial)?;
                Ok(Data::Null)
            })
        });
        let weak = Arc::downgrade(&self.inner);
        let close = MethodHandle::new("close", move |_args| {
            let weak = weak.clone();
            Box::pin(async move {
                let controller = upgrade(&weak)?;
                controller.destroy();
                Ok(Data::Null)
            })
        });

        let response = self
            .inner
            .bus
            .send(
                &self.inner.parent_win,
                MSG_INIT,
                Data::object([(
                    "exports",
                    Data::object([
                        ("updateProps", Data::Method(update_props)),
                        ("close", Data::Method(close)),
                    ]),
                )]),
                SendOptions {
                    domain: Some(DomainPattern::Literal(self.inner.parent_domain.clone())),
                    ..Default::default()
                },
            )
            .await?;

        let context = response
            .get("context")
            .and_then(Data::as_str)
            .and_then(RenderContext::from_str);
        let merged = match response.get("props") {
            Some(Data::Object(map)) => Some(map.clone()),
            _ => None,
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(context) = context {
                state.context = context;
            }
            if let Some(merged) = merged {
                // The response props win over anything recovered from the
                // window name.
                let normalized = normalize_partial(
                    state.props.definitions(),
                    merged,
                    &NormalizeOptions {
                        loose: self.inner.component.options().loose_props,
                        child: true,
                        supplied_origin: Some(self.inner.parent_domain.clone()),
                        current_origin: get_domain(&self.inner.win).ok(),
                    },
                )?;
                state.props.merge(normalized);
            }
            state.status = ChildStatus::Live;
        }
        info!(target = "component", tag = %self.inner.component.tag(), "child live");
        Ok(())
    }

    fn handle_update_props(&self, partial: BTreeMap<String, Data>) -> Result<(), Error> {
        let normalized = {
            let state = self.inner.state.lock().unwrap();
            normalize_partial(
                state.props.definitions(),
                partial,
                &NormalizeOptions {
                    loose: self.inner.component.options().loose_props,
                    child: true,
                    supplied_origin: Some(self.inner.parent_domain.clone()),
                    current_origin: get_domain(&self.inner.win).ok(),
                },
            )?
        };
        let (props, handlers) = {
            let mut state = self.inner.state.lock().unwrap();
            state.props.merge(normalized);
            (state.props.clone(), state.on_props.clone())
        };
        for handler in handlers {
            handler(&props);
        }
        Ok(())
    }

    /// Self-destruct when the window that rendered us goes away.
    fn watch_parent(&self) {
        let weak = Arc::downgrade(&self.inner);
        let render_parent = self.inner.render_parent.clone();
        let parent = self.inner.parent_win.clone();
        let watcher = safe_interval(PARENT_CLOSE_POLL, move || {
            if !is_window_closed(&render_parent) && !is_window_closed(&parent) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                debug!(target = "component", "parent window gone; destroying child");
                let controller = ChildController { inner };
                controller.destroy();
            }
        });
        self.inner.state.lock().unwrap().watchers.push(watcher);
    }

    /// Track our own document size and push resize messages, debounced to
    /// the poll interval.
    fn watch_dimensions(&self) {
        let weak = Arc::downgrade(&self.inner);
        let body = self.inner.win.document().body();
        let last = Arc::new(Mutex::new(body.dimensions()));
        let watcher = safe_interval(RESIZE_POLL, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let current = inner.win.document().body().dimensions();
            let changed = {
                let mut last = last.lock().unwrap();
                if *last == current {
                    false
                } else {
                    *last = current;
                    true
                }
            };
            let Some((width, height)) = (if changed { current } else { None }) else {
                return;
            };
            let controller = ChildController { inner };
            tokio::spawn(async move {
                if let Err(err) = controller.resize(width, height).await {
                    warn!(target = "component", error = %err, "auto-resize failed");
                }
            });
        });
        self.inner.state.lock().unwrap().watchers.push(watcher);
    }

    pub fn props(&self) -> Props {
        self.inner.state.lock().unwrap().props.clone()
    }

    pub fn context(&self) -> RenderContext {
        self.inner.state.lock().unwrap().context
    }

    pub fn uid(&self) -> String {
        self.inner.payload.uid.clone()
    }

    pub fn parent_window(&self) -> WindowHandle {
        self.inner.parent_win.clone()
    }

    /// Register a handler fired after every prop update.
    pub fn on_props<F>(&self, handler: F)
    where
        F: Fn(&Props) + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .unwrap()
            .on_props
            .push(Arc::new(handler));
    }

    fn parent_options(&self) -> SendOptions {
        SendOptions {
            domain: Some(DomainPattern::Literal(self.inner.parent_domain.clone())),
            ..Default::default()
        }
    }

    /// Ask the parent to close this instance. Fire-and-forget: the parent
    /// tears our window down while handling it, so no response can arrive.
    pub async fn close(&self) -> Result<(), Error> {
        let mut options = self.parent_options();
        options.fire_and_forget = true;
        self.inner
            .bus
            .send(&self.inner.parent_win, MSG_CLOSE, Data::Null, options)
            .await?;
        Ok(())
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<(), Error> {
        self.inner
            .bus
            .send(
                &self.inner.parent_win,
                MSG_RESIZE,
                Data::object([("width", Data::from(width)), ("height", Data::from(height))]),
                self.parent_options(),
            )
            .await?;
        Ok(())
    }

    pub async fn hide(&self) -> Result<(), Error> {
        self.inner
            .bus
            .send(
                &self.inner.parent_win,
                MSG_HIDE,
                Data::Null,
                self.parent_options(),
            )
            .await?;
        Ok(())
    }

    pub async fn show(&self) -> Result<(), Error> {
        self.inner
            .bus
            .send(
                &self.inner.parent_win,
                MSG_SHOW,
                Data::Null,
                self.parent_options(),
            )
            .await?;
        Ok(())
    }

    /// Report a fatal child-side error to the parent.
    pub async fn error(&self, err: Error) -> Result<(), Error> {
        self.inner
            .bus
            .send(
                &self.inner.parent_win,
                MSG_ERROR,
                Data::object([("error", Data::Error(err))]),
                self.parent_options(),
            )
            .await?;
        Ok(())
    }

    /// Tear the child down: cancel watchers and close our own window.
    pub fn destroy(&self) {
        let watchers = {
            let mut state = self.inner.state.lock().unwrap();
            if state.status == ChildStatus::Destroyed {
                return;
            }
            state.status = ChildStatus::Destroyed;
            std::mem::take(&mut state.watchers)
        };
        for watcher in watchers {
            watcher.cancel();
        }
        self.inner.win.close();
    }
}

/// Resolve a parent reference from the descriptor against the live frame
/// tree.
fn resolve_parent_ref(
    win: &WindowHandle,
    parent_ref: &ParentRef,
    uid_source: Option<(&WindowHandle, &str)>,
) -> Result<WindowHandle, Error> {
    match parent_ref {
        ParentRef::DirectParent => get_ancestor(win)
            .ok_or_else(|| Error::Fatal("child window has no ancestor".into())),
        ParentRef::ParentParent => {
            let ancestor = get_ancestor(win)
                .ok_or_else(|| Error::Fatal("child window has no ancestor".into()))?;
            get_ancestor(&ancestor)
                .ok_or_else(|| Error::Fatal("sandbox frame has no outer parent".into()))
        }
        ParentRef::Name(name) => {
            let ancestor = get_ancestor(win)
                .ok_or_else(|| Error::Fatal("child window has no ancestor".into()))?;
            if ancestor.name() == *name {
                return Ok(ancestor);
            }
            let top = ancestor.top();
            if top.name() == *name {
                return Ok(top);
            }
            find_frame_by_name(&top, name, win).ok_or_else(|| {
                Error::Fatal(format!("no frame named {name} in the ancestor tree"))
            })
        }
        ParentRef::ParentUid => {
            let (parent_win, uid) = uid_source.ok_or_else(|| {
                Error::Fatal("uid-addressed reference is only valid for the render parent".into())
            })?;
            XcState::of(parent_win)
                .windows
                .lock()
                .unwrap()
                .get(uid)
                .cloned()
                .ok_or_else(|| {
                    Error::Fatal(format!("no render window registered for uid {uid}"))
                })
        }
    }
}

/// Pull the initial props out of the descriptor: inline for RAW, a lookup
/// on the parent's process-wide map for UID.
fn recover_props(
    bus: &Bus,
    _win: &WindowHandle,
    parent_win: &WindowHandle,
    parent_domain: &str,
    payload: &WindowNamePayload,
) -> Result<BTreeMap<String, Data>, Error> {
    let value = match &payload.props {
        PropRef::Raw { value } => value.clone(),
        PropRef::Uid => {
            if parent_domain.starts_with("file:") {
                return Err(Error::Fatal(
                    "can not recover props from a file:// parent".into(),
                ));
            }
            let state = XcState::peek(parent_win).ok_or_else(|| {
                Error::Fatal("parent window carries no component state".into())
            })?;
            let props_guard = state.props.lock().unwrap();
            let found = props_guard.get(&payload.uid).cloned();
            drop(props_guard);
            found.ok_or_else(|| {
                Error::Fatal(format!("no props registered for uid {}", payload.uid))
            })?
        }
    };
    match bus.deserialize_data(parent_win, parent_domain, &value) {
        Data::Object(map) => Ok(map),
        Data::Null => Ok(BTreeMap::new()),
        other => Err(Error::Fatal(format!(
            "recovered props are not an object: {}",
            other.stable_key()
        ))),
    }
}

fn upgrade(weak: &Weak<ChildInner>) -> Result<ChildController, Error> {
    weak.upgrade()
        .map(|inner| ChildController { inner })
        .ok_or_else(|| Error::remote("child controller is gone"))
}
