//! Lifecycle edges: load timeout, close detection during init, popup
//! blocking, and close/destroy idempotence.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use xcomponent::{
    Browser, CloseReason, Component, ComponentOptions, Data, Error, MethodHandle, PropDefinition,
    PropType,
};

#[tokio::test]
async fn load_timeout_fires_once_and_destroys_the_instance() {
    common::init_tracing();
    let browser = Browser::new();
    let parent = common::parent_window(&browser);

    // A url getter that never resolves stands in for a buildUrl that hangs.
    let mut options = ComponentOptions::new("slow-comp", common::CHILD_URL);
    options.props.insert(
        "url".into(),
        PropDefinition::new(PropType::String)
            .getter()
            .with_timeout(Duration::from_millis(400)),
    );
    options
        .props
        .insert("timeout".into(), PropDefinition::new(PropType::Number));
    options
        .props
        .insert("onTimeout".into(), PropDefinition::new(PropType::Function));
    let component = Component::register(&parent, options).unwrap();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&timeouts);
    let on_timeout = MethodHandle::from_sync("onTimeout", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Data::Null)
    });
    let hanging_url = MethodHandle::new("url", |_| {
        Box::pin(async { std::future::pending::<Result<Data, Error>>().await })
    });

    let controller = component
        .init(common::props(vec![
            ("timeout", Data::from(100i64)),
            ("onTimeout", Data::Method(on_timeout)),
            ("url", Data::Method(hanging_url)),
        ]))
        .unwrap();

    let render_controller = controller.clone();
    let render = tokio::spawn(async move { render_controller.render(None).await });

    let err = common::within(5_000, controller.wait_init())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageTimeout(_)), "got {err:?}");
    assert!(err.to_string().contains("load timed out"));

    // The render pipeline itself surfaces an error once the getter gives up.
    let render_result = common::within(5_000, render).await.unwrap();
    assert!(render_result.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert!(controller.is_destroyed());
    assert!(controller.child_window().is_none());
}

#[tokio::test]
async fn popup_closed_before_init_rejects_and_reports_close_detected() {
    common::init_tracing();
    let browser = Browser::new();
    let parent = common::parent_window(&browser);
    let component = Component::register(&parent, common::demo_options()).unwrap();
    // No page is registered for the child URL, so the popup never loads the
    // runtime and init can not complete.

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_close = MethodHandle::from_sync("onClose", move |args| {
        let reason = args
            .first()
            .and_then(Data::as_str)
            .unwrap_or("unknown")
            .to_string();
        let _ = tx.send(reason);
        Ok(Data::Null)
    });

    let controller = component
        .render_popup(common::props(vec![("onClose", Data::Method(on_close))]))
        .await
        .unwrap();

    let popup = controller.child_window().expect("popup opened");
    // The user closes the popup before the child ever reports in.
    popup.close();

    let err = common::within(5_000, controller.wait_init())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WindowClosed(_)), "got {err:?}");
    assert!(err.to_string().contains("during init"));

    let reason = common::within(5_000, rx.recv()).await.expect("close reason");
    assert_eq!(reason, CloseReason::CloseDetected.as_str());

    // Close settles into a destroyed instance with no window handle left.
    common::within(5_000, async {
        while !controller.is_destroyed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(controller.child_window().is_none());
}

#[tokio::test]
async fn blocked_popups_surface_popup_open_error() {
    common::init_tracing();
    let browser = Browser::new();
    browser.set_popups_enabled(false);
    let parent = common::parent_window(&browser);
    let component = Component::register(&parent, common::demo_options()).unwrap();

    let err = component
        .render_popup(common::props(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PopupOpen(_)), "got {err:?}");
}

#[tokio::test]
async fn close_is_idempotent_and_fires_on_close_once() {
    common::init_tracing();
    let browser = Browser::new();
    browser.register_page(common::CHILD_URL, move |win| {
        Component::register(&win, common::demo_options()).expect("child register");
    });

    let parent = common::parent_window(&browser);
    let component = Component::register(&parent, common::demo_options()).unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let on_close = MethodHandle::from_sync("onClose", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Data::Null)
    });

    let controller = component
        .render(
            common::props(vec![("onClose", Data::Method(on_close))]),
            None,
        )
        .await
        .unwrap();
    common::within(5_000, controller.wait_init()).await.unwrap();

    let child = controller.child_window().expect("child window");
    common::within(5_000, controller.close(CloseReason::ParentCall)).await;
    common::within(5_000, controller.close(CloseReason::ParentCall)).await;
    controller.destroy().await;

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(child.is_closed());
    assert!(controller.is_destroyed());
    assert!(controller.child_window().is_none());

    // The container is hidden and detached from the document.
    assert!(common::find_by_class(
        &parent.document().body(),
        "xcomponent-container-demo-comp"
    )
    .is_none());
}

#[tokio::test]
async fn contexts_allowlist_is_enforced() {
    common::init_tracing();
    let browser = Browser::new();
    let parent = common::parent_window(&browser);

    let mut options = common::demo_options();
    options.contexts.popup = false;
    let component = Component::register(&parent, options).unwrap();

    let err = component
        .render_popup(common::props(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Integration(_)), "got {err:?}");
}
