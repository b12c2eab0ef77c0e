//! Component descriptors: immutable registration of a component kind, the
//! per-window registry, and role dispatch: a window that carries a matching
//! child-window name gets a child controller bound to it at registration
//! time.

pub mod child;
pub(crate) mod delegate;
pub mod parent;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::bus::{Bus, Data, ListenOptions};
use crate::config::{LogLevel, RuntimeConfig, SendStrategy};
use crate::error::Error;
use crate::name::decode_child_window_name;
use crate::props::PropDefinitions;
use crate::task::Settled;
use crate::templates::{ComponentTemplateFn, ContainerTemplateFn, Dimensions};
use crate::win::identity::DomainPattern;
use crate::win::{origin_of_url, WindowHandle};

pub use child::ChildController;
pub use parent::{CloseReason, ParentController};

/// Process-wide slot for the component registry and the cross-window
/// props/windows maps.
pub const XCOMPONENT_SLOT: &str = "__XCOMPONENT__";

/// Marker query parameter appended to every child URL.
pub const XCOMPONENT_QUERY_MARKER: &str = "XC";

/// Which kind of child context an instance renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderContext {
    Iframe,
    Popup,
}

impl RenderContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderContext::Iframe => "iframe",
            RenderContext::Popup => "popup",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "iframe" => Some(RenderContext::Iframe),
            "popup" => Some(RenderContext::Popup),
            _ => None,
        }
    }
}

/// Which contexts a component permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contexts {
    pub iframe: bool,
    pub popup: bool,
}

impl Default for Contexts {
    fn default() -> Self {
        Self {
            iframe: true,
            popup: true,
        }
    }
}

impl Contexts {
    pub fn allows(&self, context: RenderContext) -> bool {
        match context {
            RenderContext::Iframe => self.iframe,
            RenderContext::Popup => self.popup,
        }
    }
}

/// A component URL: one for every environment, or a single literal.
#[derive(Debug, Clone)]
pub enum UrlConfig {
    Single(String),
    Env(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
pub enum DomainConfig {
    Single(String),
    Env(BTreeMap<String, String>),
}

pub type OptionsValidateFn = Arc<dyn Fn(&ComponentOptions) -> Result<(), Error> + Send + Sync>;

/// Registration options for a component kind. Immutable once registered.
#[derive(Clone)]
pub struct ComponentOptions {
    /// Kebab-case identifier, unique per page.
    pub tag: String,
    /// Alphanumeric name; defaults to the tag with dashes replaced.
    pub name: Option<String>,
    pub version: String,
    pub url: UrlConfig,
    pub default_env: Option<String>,
    pub domain: Option<DomainConfig>,
    pub bridge_url: Option<String>,
    pub bridge_domain: Option<String>,
    pub allowed_parent_domains: DomainPattern,
    pub contexts: Contexts,
    pub default_context: RenderContext,
    pub dimensions: Option<Dimensions>,
    pub scrolling: bool,
    pub auto_resize: bool,
    pub container_template: Option<ContainerTemplateFn>,
    pub component_template: Option<ComponentTemplateFn>,
    pub sandbox_container: bool,
    pub props: PropDefinitions,
    /// Accept props with no definition.
    pub loose_props: bool,
    pub default_log_level: LogLevel,
    pub validate: Option<OptionsValidateFn>,
    pub config: RuntimeConfig,
}

impl ComponentOptions {
    pub fn new(tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            name: None,
            version: "1.0.0".to_string(),
            url: UrlConfig::Single(url.into()),
            default_env: None,
            domain: None,
            bridge_url: None,
            bridge_domain: None,
            allowed_parent_domains: DomainPattern::Wildcard,
            contexts: Contexts::default(),
            default_context: RenderContext::Iframe,
            dimensions: None,
            scrolling: false,
            auto_resize: false,
            container_template: None,
            component_template: None,
            sandbox_container: false,
            props: BTreeMap::new(),
            loose_props: false,
            default_log_level: LogLevel::default(),
            validate: None,
            config: RuntimeConfig::default(),
        }
    }

    /// The component's bus/message name: the tag with dashes replaced.
    pub fn resolved_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.tag.replace('-', "_"))
    }
}

/// The `__XCOMPONENT__` slot: component registry, child bindings, and the
/// uid-addressed props/windows maps used for cross-window lookups.
pub(crate) struct XcState {
    components: Mutex<HashMap<String, Component>>,
    child_bindings: Mutex<HashMap<String, Settled<Result<ChildController, Error>>>>,
    /// uid → serialized props, read by the child for UID prop recovery. The
    /// values are already-serialized JSON; method markers inside only
    /// dereference through origin-checked bus calls, which is why this one
    /// map tolerates a cross-origin read.
    pub props: Mutex<HashMap<String, serde_json::Value>>,
    /// uid → render window, for `PARENT_UID` references.
    pub windows: Mutex<HashMap<String, WindowHandle>>,
}

impl XcState {
    fn new() -> Self {
        Self {
            components: Mutex::new(HashMap::new()),
            child_bindings: Mutex::new(HashMap::new()),
            props: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotently create the slot on `win`.
    pub fn of(win: &WindowHandle) -> Arc<XcState> {
        win.ensure_global(XCOMPONENT_SLOT, XcState::new)
    }

    pub fn peek(win: &WindowHandle) -> Option<Arc<XcState>> {
        win.get_global(XCOMPONENT_SLOT)
            .and_then(|any| any.downcast::<XcState>().ok())
    }
}

struct ComponentInner {
    options: ComponentOptions,
    win: WindowHandle,
    bus: Bus,
}

/// An immutable registered component kind, bound to the window that
/// registered it.
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

impl Component {
    /// Validate and register a component on `win`. If the window itself is a
    /// child context of this tag, a child controller is bound immediately.
    pub fn register(win: &WindowHandle, options: ComponentOptions) -> Result<Component, Error> {
        validate_options(&options)?;
        if let Some(custom) = &options.validate {
            custom(&options)?;
        }

        // A configured relay enables the bridge transport on this window.
        let mut config = options.config.clone();
        if options.bridge_url.is_some() && !config.strategies.contains(&SendStrategy::Bridge) {
            config.strategies.push(SendStrategy::Bridge);
        }
        let bus = Bus::attach_with_config(win, config);
        let component = Component {
            inner: Arc::new(ComponentInner {
                options,
                win: win.clone(),
                bus,
            }),
        };

        let state = XcState::of(win);
        {
            let mut components = state.components.lock().unwrap();
            if components.contains_key(&component.tag()) {
                return Err(Error::Integration(format!(
                    "component {} already registered in this window",
                    component.tag()
                )));
            }
            components.insert(component.tag(), component.clone());
        }
        info!(target = "component", tag = %component.tag(), "component registered");

        component.install_delegate_listener();
        component.dispatch_child_role(&state);

        Ok(component)
    }

    pub fn tag(&self) -> String {
        self.inner.options.tag.clone()
    }

    pub fn name(&self) -> String {
        self.inner.options.resolved_name()
    }

    pub fn version(&self) -> String {
        self.inner.options.version.clone()
    }

    pub fn options(&self) -> &ComponentOptions {
        &self.inner.options
    }

    pub fn window(&self) -> &WindowHandle {
        &self.inner.win
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Look a registered component up by tag.
    pub fn get_by_tag(win: &WindowHandle, tag: &str) -> Option<Component> {
        XcState::peek(win).and_then(|state| state.components.lock().unwrap().get(tag).cloned())
    }

    /// The URL the child loads for `env` (or the default environment).
    pub fn get_url(&self, env: Option<&str>) -> Result<String, Error> {
        match &self.inner.options.url {
            UrlConfig::Single(url) => Ok(url.clone()),
            UrlConfig::Env(map) => {
                let env_key = env
                    .map(str::to_string)
                    .or_else(|| self.inner.options.default_env.clone())
                    .ok_or_else(|| {
                        Error::Integration(format!(
                            "component {} has per-env urls but no env was selected",
                            self.tag()
                        ))
                    })?;
                map.get(&env_key).cloned().ok_or_else(|| {
                    Error::Integration(format!(
                        "component {} has no url for env {env_key}",
                        self.tag()
                    ))
                })
            }
        }
    }

    /// Resolve the child domain, in priority order: a supplied URL matching
    /// one of the declared domain variants, then the declared domain (per
    /// env when it is a table), then the origin of the resolved or literal
    /// URL.
    pub fn get_domain(&self, url: Option<&str>, env: Option<&str>) -> Result<String, Error> {
        if let (Some(url), Some(domain_config)) = (url, &self.inner.options.domain) {
            if let Ok(url_origin) = origin_of(url) {
                match domain_config {
                    DomainConfig::Single(domain) if *domain == url_origin => {
                        return Ok(domain.clone());
                    }
                    DomainConfig::Env(map) => {
                        if let Some(domain) = map.values().find(|domain| **domain == url_origin) {
                            return Ok(domain.clone());
                        }
                    }
                    DomainConfig::Single(_) => {}
                }
            }
        }
        if let Some(DomainConfig::Single(domain)) = &self.inner.options.domain {
            return Ok(domain.clone());
        }
        let env_key = env
            .map(str::to_string)
            .or_else(|| self.inner.options.default_env.clone());
        if let (Some(DomainConfig::Env(map)), Some(env_key)) =
            (&self.inner.options.domain, env_key.as_deref())
        {
            if let Some(domain) = map.get(env_key) {
                return Ok(domain.clone());
            }
        }
        if let Some(url) = url {
            return origin_of(url);
        }
        let resolved = self.get_url(env_key.as_deref())?;
        origin_of(&resolved)
    }

    /// Build a parent controller for one instance without rendering it.
    pub fn init(&self, props: BTreeMap<String, Data>) -> Result<ParentController, Error> {
        ParentController::new(
            self.clone(),
            self.inner.options.default_context,
            props,
        )
    }

    fn init_in_context(
        &self,
        context: RenderContext,
        props: BTreeMap<String, Data>,
    ) -> Result<ParentController, Error> {
        if !self.inner.options.contexts.allows(context) {
            return Err(Error::Integration(format!(
                "component {} does not allow the {} context",
                self.tag(),
                context.as_str()
            )));
        }
        ParentController::new(self.clone(), context, props)
    }

    /// Render an instance into this window.
    pub async fn render(
        &self,
        props: BTreeMap<String, Data>,
        element: Option<&str>,
    ) -> Result<ParentController, Error> {
        let controller = self.init_in_context(self.inner.options.default_context, props)?;
        controller.render(element).await?;
        Ok(controller)
    }

    /// Render, forcing the sub-frame context.
    pub async fn render_iframe(
        &self,
        props: BTreeMap<String, Data>,
        element: Option<&str>,
    ) -> Result<ParentController, Error> {
        let controller = self.init_in_context(RenderContext::Iframe, props)?;
        controller.render(element).await?;
        Ok(controller)
    }

    /// Render, forcing the popup context.
    pub async fn render_popup(
        &self,
        props: BTreeMap<String, Data>,
    ) -> Result<ParentController, Error> {
        let controller = self.init_in_context(RenderContext::Popup, props)?;
        controller.render(None).await?;
        Ok(controller)
    }

    /// Render into another window by delegating the DOM work to the runtime
    /// loaded there.
    pub async fn render_to(
        &self,
        target: &WindowHandle,
        props: BTreeMap<String, Data>,
        element: Option<&str>,
    ) -> Result<ParentController, Error> {
        let controller = self.init_in_context(self.inner.options.default_context, props)?;
        controller.render_to(target, element).await?;
        Ok(controller)
    }

    /// The child controller bound to this window, waiting for the binding
    /// that registration kicked off. Fails when the window is not a child
    /// context of this tag.
    pub async fn attach(&self) -> Result<ChildController, Error> {
        let binding = {
            let state = XcState::of(&self.inner.win);
            let bindings = state.child_bindings.lock().unwrap();
            bindings.get(&self.tag()).cloned()
        };
        match binding {
            Some(cell) => cell.wait().await,
            None => Err(Error::Integration(format!(
                "window is not a child context of {}",
                self.tag()
            ))),
        }
    }

    /// The message name delegate requests arrive under.
    pub(crate) fn delegate_message_name(&self) -> String {
        format!("delegate_{}", self.name())
    }

    fn install_delegate_listener(&self) {
        // Only callers from the component's own domain may delegate.
        let allowed = match self.get_domain(None, None) {
            Ok(domain) => DomainPattern::Literal(domain),
            Err(err) => {
                warn!(
                    target = "component",
                    tag = %self.tag(),
                    error = %err,
                    "cannot resolve component domain; delegate requests open to any origin"
                );
                DomainPattern::Wildcard
            }
        };
        let component = self.clone();
        let result = self.inner.bus.on(
            &self.delegate_message_name(),
            ListenOptions {
                domain: Some(allowed),
                ..Default::default()
            },
            move |event| {
                let component = component.clone();
                async move { delegate::handle_delegate_request(component, event).await }
            },
        );
        if let Err(err) = result {
            error!(target = "component", tag = %self.tag(), error = %err, "delegate listener not installed");
        }
    }

    /// If this window's name marks it as a child of this tag, bind a child
    /// controller to the well-known slot.
    fn dispatch_child_role(&self, state: &Arc<XcState>) {
        let Some(decoded) = decode_child_window_name(&self.inner.win.name()) else {
            return;
        };
        if decoded.tag != self.tag() {
            return;
        }
        let cell: Settled<Result<ChildController, Error>> = Settled::new();
        state
            .child_bindings
            .lock()
            .unwrap()
            .insert(self.tag(), cell.clone());

        let component = self.clone();
        tokio::spawn(async move {
            let result = ChildController::bootstrap(component.clone()).await;
            if let Err(err) = &result {
                error!(
                    target = "component",
                    tag = %component.tag(),
                    error = %err,
                    "child controller failed to bind"
                );
            }
            cell.settle(result);
        });
    }
}

fn origin_of(url: &str) -> Result<String, Error> {
    url::Url::parse(url)
        .map(|parsed| origin_of_url(&parsed))
        .map_err(|err| Error::Fatal(format!("can not determine domain of {url}: {err}")))
}

fn validate_options(options: &ComponentOptions) -> Result<(), Error> {
    if options.tag.is_empty()
        || !options.tag.chars().next().unwrap().is_ascii_lowercase()
        || !options
            .tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        || options.tag.ends_with('-')
        || options.tag.contains("--")
    {
        return Err(Error::Integration(format!(
            "invalid component tag: {:?} (expected kebab-case)",
            options.tag
        )));
    }

    let name = options.resolved_name();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Integration(format!(
            "invalid component name: {name:?}"
        )));
    }

    if options.version.is_empty()
        || !options
            .version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.')
    {
        return Err(Error::Integration(format!(
            "invalid component version: {:?}",
            options.version
        )));
    }

    match &options.url {
        UrlConfig::Single(url) if url.is_empty() => {
            return Err(Error::Integration("component url must not be empty".into()));
        }
        UrlConfig::Env(map) => {
            if map.is_empty() {
                return Err(Error::Integration(
                    "component env url table must not be empty".into(),
                ));
            }
            if let Some(default_env) = &options.default_env {
                if !map.contains_key(default_env) {
                    return Err(Error::Integration(format!(
                        "default env {default_env} missing from url table"
                    )));
                }
            }
        }
        UrlConfig::Single(_) => {}
    }

    if !options.contexts.iframe && !options.contexts.popup {
        return Err(Error::Integration(
            "component must allow at least one context".into(),
        ));
    }
    if !options.contexts.allows(options.default_context) {
        return Err(Error::Integration(format!(
            "default context {} is not in the allowed contexts",
            options.default_context.as_str()
        )));
    }

    for (prop_name, def) in &options.props {
        if def.required && def.def.is_some() {
            return Err(Error::Integration(format!(
                "prop {prop_name} can not be both required and have a default"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{PropDefinition, PropType};
    use crate::win::Browser;
    use url::Url;

    fn parent_window() -> WindowHandle {
        Browser::new().open_window(Some(Url::parse("https://a.example/page").unwrap()))
    }

    #[tokio::test]
    async fn register_validates_tag_shape() {
        let win = parent_window();
        for bad in ["", "Demo", "demo--comp", "demo-", "demo_comp"] {
            let options = ComponentOptions::new(bad, "https://b.example/x.html");
            assert!(
                matches!(Component::register(&win, options), Err(Error::Integration(_))),
                "tag {bad:?} should be rejected"
            );
        }
        let options = ComponentOptions::new("demo-comp", "https://b.example/x.html");
        Component::register(&win, options).unwrap();
    }

    #[tokio::test]
    async fn duplicate_tags_are_rejected() {
        let win = parent_window();
        Component::register(
            &win,
            ComponentOptions::new("demo-comp", "https://b.example/x.html"),
        )
        .unwrap();
        assert!(matches!(
            Component::register(
                &win,
                ComponentOptions::new("demo-comp", "https://b.example/x.html"),
            ),
            Err(Error::Integration(_))
        ));
        assert!(Component::get_by_tag(&win, "demo-comp").is_some());
    }

    #[tokio::test]
    async fn required_prop_with_default_is_rejected() {
        let win = parent_window();
        let mut options = ComponentOptions::new("demo-comp", "https://b.example/x.html");
        options.props.insert(
            "token".into(),
            PropDefinition::new(PropType::String)
                .required()
                .with_default(Data::String("x".into())),
        );
        assert!(matches!(
            Component::register(&win, options),
            Err(Error::Integration(_))
        ));
    }

    #[tokio::test]
    async fn domain_resolution_chain() {
        let win = parent_window();
        let mut options = ComponentOptions::new("demo-comp", "https://b.example/x.html");
        options.default_env = None;
        let component = Component::register(&win, options).unwrap();
        // No declared domain: fall back to the url's origin.
        assert_eq!(
            component.get_domain(None, None).unwrap(),
            "https://b.example"
        );
        assert_eq!(
            component
                .get_domain(Some("https://c.example/other"), None)
                .unwrap(),
            "https://c.example"
        );

        let win2 = parent_window();
        let mut options = ComponentOptions::new("env-comp", "https://b.example/x.html");
        options.domain = Some(DomainConfig::Single("https://declared.example".into()));
        let component = Component::register(&win2, options).unwrap();
        assert_eq!(
            component.get_domain(None, None).unwrap(),
            "https://declared.example"
        );
    }

    #[tokio::test]
    async fn url_matching_a_declared_domain_variant_wins_over_env() {
        let win = parent_window();
        let mut options = ComponentOptions::new("env-domain-comp", "https://prod.example/x.html");
        let mut domains = BTreeMap::new();
        domains.insert("prod".to_string(), "https://prod.example".to_string());
        domains.insert("staging".to_string(), "https://staging.example".to_string());
        options.domain = Some(DomainConfig::Env(domains));
        options.default_env = Some("prod".into());
        let component = Component::register(&win, options).unwrap();

        // A url matching the staging variant beats the selected env.
        assert_eq!(
            component
                .get_domain(Some("https://staging.example/x"), Some("prod"))
                .unwrap(),
            "https://staging.example"
        );
        // Without a url the env table decides.
        assert_eq!(
            component.get_domain(None, Some("staging")).unwrap(),
            "https://staging.example"
        );
        assert_eq!(
            component.get_domain(None, None).unwrap(),
            "https://prod.example"
        );
        // A url outside every declared variant falls through to the env
        // table.
        assert_eq!(
            component
                .get_domain(Some("https://elsewhere.example/x"), None)
                .unwrap(),
            "https://prod.example"
        );
    }

    #[tokio::test]
    async fn env_url_table_requires_selected_env() {
        let win = parent_window();
        let mut options = ComponentOptions::new("env-comp", "unused");
        let mut urls = BTreeMap::new();
        urls.insert("test".to_string(), "https://test.example/x".to_string());
        urls.insert("live".to_string(), "https://live.example/x".to_string());
        options.url = UrlConfig::Env(urls);
        options.default_env = Some("test".into());
        let component = Component::register(&win, options).unwrap();
        assert_eq!(
            component.get_url(None).unwrap(),
            "https://test.example/x"
        );
        assert_eq!(
            component.get_url(Some("live")).unwrap(),
            "https://live.example/x"
        );
        assert!(component.get_url(Some("missing")).is_err());
    }

    #[tokio::test]
    async fn attach_outside_child_context_fails() {
        let win = parent_window();
        let component = Component::register(
            &win,
            ComponentOptions::new("demo-comp", "https://b.example/x.html"),
        )
        .unwrap();
        assert!(matches!(
            component.attach().await,
            Err(Error::Integration(_))
        ));
    }
}
