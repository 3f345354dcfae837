//! Handler streams: registration, fan-out, unregister on cancel.

use std::time::Duration;

use futures::StreamExt;
use rx_eventbus::bus::{EventBus, InMemoryBus};
use rx_eventbus::{Completion, FireMode, RxBus};
use serde_json::json;

use crate::support::{counting_bus, init_tracing};

#[tokio::test]
async fn handler_stream_sees_every_message() {
    let rx = RxBus::new(InMemoryBus::new());
    let handlers = rx.register_handler("inbox");
    assert_eq!(handlers.mode(), FireMode::MultiFire);
    let mut inbox = handlers.subscribe();

    for n in 0..3 {
        rx.inner().send("inbox", json!(n), None);
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(inbox.next().await.unwrap().unwrap().body().clone());
    }
    assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(inbox.completion(), Completion::Unfired);
}

#[tokio::test]
async fn publish_reaches_both_subscribers() {
    let rx = RxBus::new(InMemoryBus::new());
    let handlers = rx.register_handler("news");
    let mut first = handlers.subscribe();
    let mut second = handlers.subscribe();
    assert_eq!(rx.inner().handler_count("news"), 2);

    rx.publish("news", "shout!");

    assert_eq!(first.next().await.unwrap().unwrap().body(), &json!("shout!"));
    assert_eq!(second.next().await.unwrap().unwrap().body(), &json!("shout!"));
}

#[tokio::test]
async fn unsubscribe_unregisters_the_handler() {
    init_tracing();
    let rx = counting_bus();
    let mut inbox = rx.register_handler("foo").subscribe();
    assert_eq!(rx.inner().inner().handler_count("foo"), 1);

    inbox.cancel();
    assert_eq!(rx.inner().unregistered(), 1);
    assert_eq!(rx.inner().inner().handler_count("foo"), 0);

    let replies: Vec<_> = rx.send("foo", "ping").subscribe().collect().await;
    assert_eq!(replies.len(), 1);
    assert!(replies[0].as_ref().unwrap_err().is_no_handlers());
}

#[tokio::test]
async fn dropping_the_subscription_unregisters() {
    let rx = counting_bus();
    {
        let _inbox = rx.register_handler("foo").subscribe();
        assert_eq!(rx.inner().inner().handler_count("foo"), 1);
    }
    assert_eq!(rx.inner().unregistered(), 1);
    assert_eq!(rx.inner().inner().handler_count("foo"), 0);
}

#[tokio::test]
async fn local_handler_is_registered_locally() {
    let rx = RxBus::new(InMemoryBus::new());
    let mut local = rx.register_local_handler("local").subscribe();
    assert_eq!(rx.inner().handler_count("local"), 1);

    rx.publish("local", 7);
    assert_eq!(local.next().await.unwrap().unwrap().body(), &json!(7));

    local.cancel();
    assert_eq!(rx.inner().handler_count("local"), 0);
}

#[tokio::test]
async fn late_messages_never_reach_a_cancelled_stream() {
    let rx = RxBus::new(InMemoryBus::new());
    let mut inbox = rx.register_handler("inbox").subscribe();
    let _other = rx.register_handler("inbox").subscribe();

    inbox.cancel();
    rx.publish("inbox", "after");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(inbox.next().await.is_none());
    assert!(inbox.is_cancelled());
}
