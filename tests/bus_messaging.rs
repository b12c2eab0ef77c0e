//! Bus-level protocol tests: request/response, shadowing, timeouts,
//! method handles, and per-window cleanup.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xcomponent::{
    Browser, Bus, Data, DomainPattern, Error, ListenOptions, MethodHandle, RuntimeConfig,
    SendOptions, SendStrategy, WindowHandle,
};

fn two_windows() -> (Browser, WindowHandle, WindowHandle) {
    common::init_tracing();
    let browser = Browser::new();
    let a = browser.open_window(Some(url::Url::parse("https://a.example/").unwrap()));
    let b = browser.open_window(Some(url::Url::parse("https://b.example/").unwrap()));
    (browser, a, b)
}

#[tokio::test]
async fn request_response_round_trip() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    bus_b
        .on("greet", ListenOptions::default(), |event| async move {
            let who = event.data.as_str().unwrap_or("nobody").to_string();
            Ok(Data::String(format!("hello {who}")))
        })
        .unwrap();

    let response = common::within(
        2_000,
        bus_a.send(&b, "greet", Data::from("a"), SendOptions::default()),
    )
    .await
    .unwrap();
    assert_eq!(response, Data::String("hello a".into()));
}

#[tokio::test]
async fn missing_listener_returns_remote_error() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let _bus_b = Bus::attach(&b);

    let err = common::within(
        2_000,
        bus_a.send(&b, "nothing_here", Data::Null, SendOptions::default()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Remote { .. }), "got {err:?}");
}

#[tokio::test]
async fn unattached_peer_times_out_on_ack() {
    let (_browser, a, b) = two_windows();
    let config = RuntimeConfig {
        ack_timeout: Duration::from_millis(150),
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let bus_a = Bus::attach_with_config(&a, config);
    // b never loads the runtime.

    let err = common::within(
        2_000,
        bus_a.send(&b, "greet", Data::Null, SendOptions::default()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::MessageTimeout(_)), "got {err:?}");
}

#[tokio::test]
async fn fire_and_forget_settles_immediately_but_still_delivers() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    bus_b
        .on("notify", ListenOptions::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Data::Null) }
        })
        .unwrap();

    let result = bus_a
        .send(
            &b,
            "notify",
            Data::Null,
            SendOptions {
                fire_and_forget: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, Data::Null);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn specific_listener_shadows_wildcard_end_to_end() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    bus_b
        .on("which", ListenOptions::default(), |_| async {
            Ok(Data::from("wildcard"))
        })
        .unwrap();
    bus_b
        .on(
            "which",
            ListenOptions::for_window(&a, DomainPattern::literal("https://a.example")),
            |_| async { Ok(Data::from("specific")) },
        )
        .unwrap();

    let response = common::within(
        2_000,
        bus_a.send(&b, "which", Data::Null, SendOptions::default()),
    )
    .await
    .unwrap();
    assert_eq!(response, Data::String("specific".into()));
}

#[tokio::test]
async fn method_handles_invoke_across_the_bus() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    // b's handler invokes the callable a sent along.
    bus_b
        .on("calc", ListenOptions::default(), |event| async move {
            let callback = event
                .data
                .get("callback")
                .and_then(Data::as_method)
                .cloned()
                .ok_or_else(|| Error::remote("no callback"))?;
            callback.call(vec![Data::Number(21.0)]).await
        })
        .unwrap();

    let doubler = MethodHandle::from_sync("double", |args| {
        let n = args
            .first()
            .and_then(Data::as_f64)
            .ok_or_else(|| Error::Validation("expected a number".into()))?;
        Ok(Data::Number(n * 2.0))
    });

    let response = common::within(
        2_000,
        bus_a.send(
            &b,
            "calc",
            Data::object([("callback", Data::Method(doubler))]),
            SendOptions::default(),
        ),
    )
    .await
    .unwrap();
    assert_eq!(response, Data::Number(42.0));
}

#[tokio::test]
async fn once_listeners_unregister_after_first_message() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    bus_b
        .on(
            "single",
            ListenOptions {
                once: true,
                ..Default::default()
            },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Data::Null) }
            },
        )
        .unwrap();

    common::within(
        2_000,
        bus_a.send(&b, "single", Data::Null, SendOptions::default()),
    )
    .await
    .unwrap();
    let err = common::within(
        2_000,
        bus_a.send(&b, "single", Data::Null, SendOptions::default()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clean_up_window_rejects_pending_requests() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    // Handler stalls so the request stays pending.
    bus_b
        .on("stall", ListenOptions::default(), |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Data::Null)
        })
        .unwrap();

    let pending = {
        let bus_a = bus_a.clone();
        let b = b.clone();
        tokio::spawn(async move {
            bus_a
                .send(&b, "stall", Data::Null, SendOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    bus_a.clean_up_window(&b);

    let err = common::within(2_000, pending).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::WindowClosed(_)), "got {err:?}");
}

#[tokio::test]
async fn closing_the_peer_fails_inflight_requests() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    bus_b
        .on("stall", ListenOptions::default(), |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Data::Null)
        })
        .unwrap();

    let pending = {
        let bus_a = bus_a.clone();
        let b = b.clone();
        tokio::spawn(async move {
            bus_a
                .send(&b, "stall", Data::Null, SendOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    b.close();

    let err = common::within(2_000, pending).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::WindowClosed(_)), "got {err:?}");
}

#[tokio::test]
async fn bridge_strategy_delivers_when_it_is_the_only_transport() {
    let (_browser, a, b) = two_windows();
    let config = RuntimeConfig {
        strategies: vec![SendStrategy::Bridge],
        ..Default::default()
    };
    let bus_a = Bus::attach_with_config(&a, config);
    let bus_b = Bus::attach(&b);
    bus_b
        .on("greet", ListenOptions::default(), |_| async {
            Ok(Data::from("hello"))
        })
        .unwrap();

    let options = SendOptions {
        domain: Some(DomainPattern::literal("https://b.example")),
        ..Default::default()
    };

    // With no relay registered the send has no transport at all.
    let err = bus_a
        .send(&b, "greet", Data::Null, options.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "got {err:?}");

    let relay = a.open_frame("relay", &a.document().body());
    bus_a.register_bridge("https://b.example", &relay);

    let response = common::within(2_000, bus_a.send(&b, "greet", Data::Null, options))
        .await
        .unwrap();
    assert_eq!(response, Data::String("hello".into()));
}

#[tokio::test]
async fn registered_bridge_is_a_fallback_when_the_direct_gate_refuses() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    bus_b
        .on("notify", ListenOptions::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Data::Null) }
        })
        .unwrap();

    // Addressing a domain the peer does not report defeats direct delivery.
    let options = SendOptions {
        domain: Some(DomainPattern::literal("https://relay.example")),
        fire_and_forget: true,
        ..Default::default()
    };
    let err = bus_a
        .send(&b, "notify", Data::Null, options.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "got {err:?}");

    let relay = a.open_frame("relay", &a.document().body());
    bus_a.register_bridge("https://relay.example", &relay);

    bus_a.send(&b, "notify", Data::Null, options).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn frames_announce_ready_to_their_ancestor() {
    common::init_tracing();
    let browser = Browser::new();
    let top = browser.open_window(Some(url::Url::parse("https://a.example/").unwrap()));
    let bus_top = Bus::attach(&top);

    let frame = top.open_frame("inner", &top.document().body());
    frame.navigate(url::Url::parse("https://a.example/inner").unwrap());
    let _bus_frame = Bus::attach(&frame);

    common::within(2_000, bus_top.await_ready(&frame, Duration::from_secs(1)))
        .await
        .unwrap();
}

#[tokio::test]
async fn send_to_parent_reaches_the_ancestor() {
    common::init_tracing();
    let browser = Browser::new();
    let top = browser.open_window(Some(url::Url::parse("https://a.example/").unwrap()));
    let bus_top = Bus::attach(&top);
    bus_top
        .on("ping", ListenOptions::default(), |_| async {
            Ok(Data::from("pong"))
        })
        .unwrap();

    let frame = top.open_frame("inner", &top.document().body());
    frame.navigate(url::Url::parse("https://a.example/inner").unwrap());
    let bus_frame = Bus::attach(&frame);

    let response = common::within(
        2_000,
        bus_frame.send_to_parent("ping", Data::Null, SendOptions::default()),
    )
    .await
    .unwrap();
    assert_eq!(response, Data::String("pong".into()));
}

#[tokio::test]
async fn client_binds_peer_and_domain() {
    let (_browser, a, b) = two_windows();
    let bus_a = Bus::attach(&a);
    let bus_b = Bus::attach(&b);

    bus_b
        .on("echo", ListenOptions::default(), |event| async move {
            Ok(event.data)
        })
        .unwrap();

    let client = bus_a.client(&b, DomainPattern::literal("https://b.example"));
    let response = common::within(2_000, client.send("echo", Data::from("x")))
        .await
        .unwrap();
    assert_eq!(response, Data::String("x".into()));

    // A client bound to the wrong origin never delivers.
    let bad = bus_a.client(&b, DomainPattern::literal("https://wrong.example"));
    let err = common::within(2_000, bad.send("echo", Data::from("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "got {err:?}");
}
