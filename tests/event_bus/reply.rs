//! Reply-to-reply conversations through `Message::observe_reply`.

use std::time::Duration;

use futures::StreamExt;
use rx_eventbus::bus::InMemoryBus;
use rx_eventbus::{BusConfig, RxBus};
use serde_json::json;

use crate::support::init_tracing;

#[tokio::test]
async fn reply_to_reply() {
    init_tracing();
    let rx = RxBus::new(InMemoryBus::new());
    let mut chat = rx.register_handler("chat").subscribe();

    let server = tokio::spawn(async move {
        let hello = chat.next().await.unwrap().unwrap();
        assert_eq!(hello.body(), &json!("hello1"));

        let second = hello.observe_reply("goodday1").subscribe().next().await.unwrap().unwrap();
        assert_eq!(second.body(), &json!("hello2"));
        second.reply("goodday2");
    });

    let first = rx.send("chat", "hello1").subscribe().next().await.unwrap().unwrap();
    assert_eq!(first.body(), &json!("goodday1"));

    let replies: Vec<_> = first.observe_reply("hello2").subscribe().collect().await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].as_ref().unwrap().body(), &json!("goodday2"));
    server.await.unwrap();
}

#[tokio::test]
async fn observe_reply_is_memoized() {
    let rx = RxBus::new(InMemoryBus::new());
    let mut chat = rx.register_handler("chat").subscribe();

    tokio::spawn(async move {
        let hello = chat.next().await.unwrap().unwrap();
        let followup = hello.observe_reply("first").subscribe().next().await.unwrap().unwrap();
        followup.reply("second");
    });

    let first = rx.send("chat", "hello").subscribe().next().await.unwrap().unwrap();
    let followup = first.observe_reply("again");

    let a: Vec<_> = followup.subscribe().collect().await;
    let b: Vec<_> = followup.subscribe().collect().await;
    assert_eq!(a[0].as_ref().unwrap().body(), &json!("second"));
    assert_eq!(b[0].as_ref().unwrap().body(), &json!("second"));
}

#[tokio::test(start_paused = true)]
async fn unanswered_reply_times_out() {
    let rx = RxBus::new(InMemoryBus::new());
    let mut chat = rx.register_handler("chat").subscribe();

    let server = tokio::spawn(async move {
        let hello = chat.next().await.unwrap().unwrap();
        hello
            .observe_reply_with_timeout("pong", Duration::from_millis(200))
            .subscribe()
            .collect::<Vec<_>>()
            .await
    });

    // Take the reply but never answer it.
    let pong = rx.send("chat", "ping").subscribe().next().await.unwrap().unwrap();
    assert_eq!(pong.body(), &json!("pong"));

    let outcome = server.await.unwrap();
    assert_eq!(outcome.len(), 1);
    assert!(outcome[0].as_ref().unwrap_err().is_timeout());
}

#[tokio::test(start_paused = true)]
async fn default_timeout_comes_from_config() {
    let config = BusConfig::from_json(r#"{ "default_timeout_ms": 300 }"#).unwrap();
    let rx = RxBus::with_config(InMemoryBus::new(), config);
    let mut chat = rx.register_handler("chat").subscribe();

    let server = tokio::spawn(async move {
        let hello = chat.next().await.unwrap().unwrap();
        assert_eq!(hello.default_timeout(), Duration::from_millis(300));
        let started = tokio::time::Instant::now();
        let outcome: Vec<_> = hello.observe_reply("pong").subscribe().collect().await;
        (started.elapsed(), outcome)
    });

    let _pong = rx.send("chat", "ping").subscribe().next().await.unwrap().unwrap();

    let (elapsed, outcome) = server.await.unwrap();
    assert!(outcome[0].as_ref().unwrap_err().is_timeout());
    assert!(elapsed >= Duration::from_millis(300));
}
