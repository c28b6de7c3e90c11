//! End-to-end service flows over the in-process substrate

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use plume_engine::{
    DeliveryMode, EngineConfig, Event, TopicConfig, TopicService,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config() -> EngineConfig {
    EngineConfig {
        shard_id: 3,
        replica_id: 1,
        topic: TopicConfig {
            delivery: DeliveryMode::Sync,
            abandonment_timeout: None,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn subscribe_returns_an_activated_handle() {
    init_logging();
    let (service, _machine) = TopicService::in_memory(config()).await.unwrap();

    let handle = service.subscribe().await.unwrap();
    assert!(handle.subscription.is_started());
    assert!(!handle.subscription.is_listening());
}

#[tokio::test]
async fn published_messages_arrive_in_order_with_increasing_ids() {
    init_logging();
    let (service, _machine) = TopicService::in_memory(config()).await.unwrap();

    let (_, rx) = service.tail(CancellationToken::new()).await.unwrap();

    for body in ["A", "B", "C"] {
        service
            .publish(serde_json::json!({ "body": body }))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let ev = rx.recv_async().await.unwrap();
        assert_eq!(ev.name, "publish-message");
        seen.push((ev.id, ev.data["body"].as_str().unwrap().to_string()));
    }
    assert_eq!(
        seen,
        vec![
            (1, "A".to_string()),
            (2, "B".to_string()),
            (3, "C".to_string())
        ]
    );
}

#[tokio::test]
async fn publish_without_subscribers_still_persists() {
    init_logging();
    let (service, _machine) = TopicService::in_memory(config()).await.unwrap();

    let id = service
        .publish(serde_json::json!({ "body": "nobody listening" }))
        .await
        .unwrap();
    assert_eq!(id, 1);

    let events: Vec<Event> = service
        .events(Default::default())
        .await
        .unwrap()
        .collect::<Result<_, _>>()
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["body"], "nobody listening");
}

#[tokio::test]
async fn metadata_reflects_applied_work() {
    init_logging();
    let (service, _machine) = TopicService::in_memory(config()).await.unwrap();

    let _handle = service.subscribe().await.unwrap();
    service.publish(serde_json::json!({ "n": 1 })).await.unwrap();
    service.publish(serde_json::json!({ "n": 2 })).await.unwrap();

    let meta = service.metadata().await.unwrap();
    assert_eq!(meta.shard_id, 3);
    assert_eq!(meta.replica_id, 1);
    // One activation entry plus two publishes
    assert_eq!(meta.applied_index, 3);
    assert_eq!(meta.event_seq, 2);
    assert_eq!(meta.subscriptions, 1);
}

#[tokio::test]
async fn cancelling_a_tail_delivers_the_exit_sentinel() {
    init_logging();
    let exit = Event {
        id: 0,
        name: "subscription-closed".to_string(),
        version: 1,
        data: serde_json::json!({}),
        timestamp_ms: 0,
    };
    let mut cfg = config();
    cfg.topic.exit_event = Some(exit.clone());

    let (service, _machine) = TopicService::in_memory(cfg).await.unwrap();

    let cancel = CancellationToken::new();
    let (_, rx) = service.tail(cancel.clone()).await.unwrap();

    service
        .publish(serde_json::json!({ "body": "last words" }))
        .await
        .unwrap();
    cancel.cancel();

    assert_eq!(rx.recv_async().await.unwrap().data["body"], "last words");
    assert_eq!(rx.recv_async().await.unwrap(), exit);
}

#[tokio::test]
async fn event_history_supports_ranges() {
    init_logging();
    let (service, _machine) = TopicService::in_memory(config()).await.unwrap();

    for n in 1..=5 {
        service.publish(serde_json::json!({ "n": n })).await.unwrap();
    }

    let ids: Vec<u64> = service
        .events(plume_engine::EventFilter {
            start: Some(2),
            end: Some(5),
            ..Default::default()
        })
        .await
        .unwrap()
        .map(|ev| ev.unwrap().id)
        .collect()
        .await;
    assert_eq!(ids, vec![2, 3, 4]);
}
