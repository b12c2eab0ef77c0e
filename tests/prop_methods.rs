//! Cross-origin prop method calls: a function the parent passes as a prop
//! is recovered by the child through the uid-addressed props map and
//! invoked over the message bus.

mod common;

use tokio::sync::mpsc;
use xcomponent::{Browser, Component, Data, Error, MethodHandle};

#[tokio::test]
async fn child_invokes_parent_function_prop_over_the_bus() {
    common::init_tracing();
    let browser = Browser::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<Data, Error>>();

    browser.register_page(common::CHILD_URL, move |win| {
        let component =
            Component::register(&win, common::demo_options()).expect("child register");
        let tx = tx.clone();
        tokio::spawn(async move {
            let child = component.attach().await.expect("child attach");
            let result = child.props().call("onSubmit", vec![Data::Number(21.0)]).await;
            let _ = tx.send(result);
        });
    });

    let parent = common::parent_window(&browser);
    let component = Component::register(&parent, common::demo_options()).unwrap();

    let on_submit = MethodHandle::from_sync("onSubmit", |args| {
        let x = args
            .first()
            .and_then(Data::as_f64)
            .ok_or_else(|| Error::Validation("expected a number".into()))?;
        Ok(Data::Number(x * 2.0))
    });

    let controller = component
        .render(
            common::props(vec![("onSubmit", Data::Method(on_submit))]),
            None,
        )
        .await
        .unwrap();
    common::within(5_000, controller.wait_init()).await.unwrap();

    // Parent and child origins differ, so the props traveled by uid lookup,
    // not inline in the window name.
    let child = controller.child_window().expect("child window");
    let payload =
        xcomponent::name::decode_child_window_name(&child.name()).expect("component name");
    assert_eq!(payload.props, xcomponent::name::PropRef::Uid);

    let result = common::within(5_000, rx.recv())
        .await
        .expect("child call result")
        .expect("onSubmit succeeded");
    assert_eq!(result, Data::Number(42.0));
}

#[tokio::test]
async fn remote_errors_rehydrate_on_the_caller_side() {
    common::init_tracing();
    let browser = Browser::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<Data, Error>>();

    browser.register_page(common::CHILD_URL, move |win| {
        let component =
            Component::register(&win, common::demo_options()).expect("child register");
        let tx = tx.clone();
        tokio::spawn(async move {
            let child = component.attach().await.expect("child attach");
            let result = child.props().call("onSubmit", vec![]).await;
            let _ = tx.send(result);
        });
    });

    let parent = common::parent_window(&browser);
    let component = Component::register(&parent, common::demo_options()).unwrap();

    let on_submit = MethodHandle::from_sync("onSubmit", |_| {
        Err(Error::Validation("refused by parent".into()))
    });

    let controller = component
        .render(
            common::props(vec![("onSubmit", Data::Method(on_submit))]),
            None,
        )
        .await
        .unwrap();
    common::within(5_000, controller.wait_init()).await.unwrap();

    let err = common::within(5_000, rx.recv())
        .await
        .expect("child call result")
        .unwrap_err();
    match err {
        Error::Remote { message, .. } => assert!(message.contains("refused by parent")),
        other => panic!("expected a remote error, got {other:?}"),
    }
}
