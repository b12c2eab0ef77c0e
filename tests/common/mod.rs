#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use xcomponent::{
    Browser, ComponentOptions, Data, ElementHandle, PropDefinition, PropType, WindowHandle,
};

pub const PARENT_URL: &str = "https://a.example/page";
pub const CHILD_URL: &str = "https://b.example/x.html";

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The component definition both sides load, the way a real page and its
/// child document would include the same component script.
pub fn demo_options() -> ComponentOptions {
    let mut options = ComponentOptions::new("demo-comp", CHILD_URL);
    options
        .props
        .insert("onClose".into(), PropDefinition::new(PropType::Function));
    options
        .props
        .insert("onSubmit".into(), PropDefinition::new(PropType::Function));
    options
        .props
        .insert("onTimeout".into(), PropDefinition::new(PropType::Function));
    options
        .props
        .insert("onError".into(), PropDefinition::new(PropType::Function));
    options.props.insert(
        "label".into(),
        PropDefinition::new(PropType::String).query_param(),
    );
    options.props.insert(
        "secret".into(),
        PropDefinition::new(PropType::String).not_sent_to_child(),
    );
    options
        .props
        .insert("timeout".into(), PropDefinition::new(PropType::Number));
    options
}

pub fn props(entries: Vec<(&str, Data)>) -> BTreeMap<String, Data> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub fn parent_window(browser: &Browser) -> WindowHandle {
    browser.open_window(Some(url::Url::parse(PARENT_URL).unwrap()))
}

/// Depth-first search for an element by class name.
pub fn find_by_class(root: &ElementHandle, class: &str) -> Option<ElementHandle> {
    if root.class_name().as_deref() == Some(class) {
        return Some(root.clone());
    }
    for child in root.children() {
        if let Some(found) = find_by_class(&child, class) {
            return Some(found);
        }
    }
    None
}

pub async fn within<T, F>(duration_ms: u64, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_millis(duration_ms), fut)
        .await
        .expect("operation did not settle in time")
}
