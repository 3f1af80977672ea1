
use chrono::{Duration as ChronoDuration, Utc};
use hookwork::{
    DeliveryPool, DeliveryStatus, DeliveryWorker, EndpointRegistry, EndpointUpdate,
    EventDispatcher, HookworkConfig, NewEndpoint, RetryScheduler, WebhookEvent, WebhookStore,
    client::{HEADER_EVENT, HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP},
    rate_limit::window_start,
    signature,
    store::memory::InMemoryStore,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use test_utils::{spawn_receiver, spawn_slow_receiver, wait_for_delivery};
use uuid::Uuid;

struct Engine {
    store: Arc<InMemoryStore>,
    registry: EndpointRegistry,
    dispatcher: EventDispatcher,
    scheduler: RetryScheduler,
    pool: DeliveryPool,
}

fn engine(config: HookworkConfig) -> Engine {
    let store = Arc::new(InMemoryStore::new());
    let worker = Arc::new(DeliveryWorker::new(store.clone(), &config));
    let pool = DeliveryPool::start(worker, &config);
    Engine {
        registry: EndpointRegistry::new(store.clone(), &config),
        dispatcher: EventDispatcher::new(store.clone(), pool.clone(), &config),
        scheduler: RetryScheduler::new(store.clone(), pool.clone(), &config),
        store,
        pool,
    }
}

#[tokio::test]
async fn test_dispatch_creates_one_delivery_per_subscribed_endpoint() {
    let engine = engine(HookworkConfig::default());
    let tenant = Uuid::new_v4();
    let (url, receiver) = spawn_receiver(vec![]);

    for _ in 0..4 {
        engine
            .registry
            .create(tenant, NewEndpoint::new(&url, vec![WebhookEvent::OrderCreated]))
            .await
            .unwrap();
    }
    engine
        .registry
        .create(tenant, NewEndpoint::new(&url, vec![WebhookEvent::OrderCreated]).inactive())
        .await
        .unwrap();
    engine
        .registry
        .create(tenant, NewEndpoint::new(&url, vec![WebhookEvent::ShipmentCreated]))
        .await
        .unwrap();

    let summary = engine
        .dispatcher
        .dispatch(tenant, WebhookEvent::OrderCreated, Uuid::new_v4(), &json!({"order_id": 1}))
        .await
        .unwrap();
    assert_eq!(summary.created(), 4);

    for id in &summary.deliveries {
        let delivered = wait_for_delivery(&engine.store, tenant, *id, |d| {
            d.status == DeliveryStatus::Delivered
        })
        .await;
        assert_eq!(delivered.attempt_count, 1);
        assert!(delivered.delivered_at.is_some());
    }
    assert_eq!(receiver.count(), 4);
    engine.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_attempts_back_off_until_delivered() {
    let engine = engine(HookworkConfig::default());
    let tenant = Uuid::new_v4();
    let (url, receiver) = spawn_receiver(vec![500, 500, 200]);
    let endpoint = engine
        .registry
        .create(
            tenant,
            NewEndpoint::new(&url, vec![WebhookEvent::OrderCreated]).with_max_retries(3),
        )
        .await
        .unwrap();

    let summary = engine
        .dispatcher
        .dispatch(tenant, WebhookEvent::OrderCreated, Uuid::new_v4(), &json!({"order_id": "ord_1"}))
        .await
        .unwrap();
    let id = summary.deliveries[0];

    let first = wait_for_delivery(&engine.store, tenant, id, |d| {
        d.status == DeliveryStatus::Failed && d.attempt_count == 1
    })
    .await;
    assert_eq!(first.response_status, Some(500));
    assert!(first.error_message.as_deref().unwrap().starts_with("HTTP 500"));
    let first_retry = first.next_retry_at.unwrap();
    assert_eq!(first_retry - first.updated_at, ChronoDuration::minutes(1));

    // not due yet
    assert_eq!(engine.scheduler.sweep().await.retried, 0);

    assert_eq!(engine.scheduler.sweep_at(first_retry).await.retried, 1);
    let second = wait_for_delivery(&engine.store, tenant, id, |d| {
        d.status == DeliveryStatus::Failed && d.attempt_count == 2
    })
    .await;
    let second_retry = second.next_retry_at.unwrap();
    assert_eq!(second_retry - second.updated_at, ChronoDuration::minutes(4));

    assert_eq!(engine.scheduler.sweep_at(second_retry).await.retried, 1);
    let done = wait_for_delivery(&engine.store, tenant, id, |d| {
        d.status == DeliveryStatus::Delivered
    })
    .await;
    assert_eq!(done.attempt_count, 3);
    assert_eq!(done.max_attempts, 3);
    assert_eq!(done.response_status, Some(200));
    assert!(done.next_retry_at.is_none());
    assert!(done.error_message.is_none());

    // every attempt is signed with the endpoint secret and carries the same delivery id
    let requests = receiver.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.header(HEADER_EVENT), "order.created");
        assert_eq!(request.header(HEADER_ID), id.to_string());
        assert_eq!(request.header("content-type"), "application/json");
        assert_eq!(request.header("user-agent"), "Webhook-Service/1.0");
        assert!(request.header(HEADER_TIMESTAMP).parse::<i64>().is_ok());
        assert!(signature::verify(
            request.body.as_bytes(),
            request.header(HEADER_SIGNATURE),
            &endpoint.secret
        ));
        assert_eq!(request.body, r#"{"order_id":"ord_1"}"#);
    }

    let endpoint = engine.registry.get(tenant, endpoint.id).await.unwrap();
    assert_eq!(endpoint.failure_count, 0);
    assert_eq!(endpoint.last_status, Some(200));
    engine.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_is_a_retryable_failure() {
    let engine = engine(HookworkConfig::default());
    let tenant = Uuid::new_v4();
    let url = spawn_slow_receiver(Duration::from_secs(3));
    engine
        .registry
        .create(
            tenant,
            NewEndpoint::new(&url, vec![WebhookEvent::InventoryLow]).with_timeout_secs(1),
        )
        .await
        .unwrap();

    let summary = engine
        .dispatcher
        .dispatch(tenant, WebhookEvent::InventoryLow, Uuid::new_v4(), &json!({"sku": "A1"}))
        .await
        .unwrap();
    let failed = wait_for_delivery(&engine.store, tenant, summary.deliveries[0], |d| {
        d.status == DeliveryStatus::Failed
    })
    .await;

    assert!(failed.response_status.is_none());
    assert!(failed.error_message.as_deref().unwrap().contains("timed out"));
    assert!(failed.next_retry_at.is_some());
    engine.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_chronically_failing_endpoint_is_excluded() {
    let engine = engine(HookworkConfig::default());
    let tenant = Uuid::new_v4();
    let (failing_url, _) = spawn_receiver(vec![500; 32]);
    let (healthy_url, healthy) = spawn_receiver(vec![]);

    let failing = engine
        .registry
        .create(
            tenant,
            NewEndpoint::new(&failing_url, vec![WebhookEvent::OrderCreated]).with_max_retries(1),
        )
        .await
        .unwrap();
    engine
        .registry
        .create(tenant, NewEndpoint::new(&healthy_url, vec![WebhookEvent::OrderCreated]))
        .await
        .unwrap();

    for _ in 0..10 {
        let summary = engine
            .dispatcher
            .dispatch(tenant, WebhookEvent::OrderCreated, Uuid::new_v4(), &json!({}))
            .await
            .unwrap();
        assert_eq!(summary.created(), 2);
        for id in summary.deliveries {
            wait_for_delivery(&engine.store, tenant, id, |d| d.is_terminal()).await;
        }
    }

    let tripped = engine.registry.get(tenant, failing.id).await.unwrap();
    assert_eq!(tripped.failure_count, 10);
    assert!(tripped.active);

    // new events keep flowing to the healthy endpoint only
    let summary = engine
        .dispatcher
        .dispatch(tenant, WebhookEvent::OrderCreated, Uuid::new_v4(), &json!({}))
        .await
        .unwrap();
    assert_eq!(summary.created(), 1);
    let delivery = engine
        .store
        .get_delivery(tenant, summary.deliveries[0])
        .await
        .unwrap()
        .unwrap();
    assert_ne!(delivery.endpoint_id, failing.id);
    wait_for_delivery(&engine.store, tenant, delivery.id, |d| d.is_terminal()).await;
    assert_eq!(healthy.count(), 11);

    // re-enabling closes the circuit
    engine
        .registry
        .update(
            tenant,
            failing.id,
            EndpointUpdate {
                active: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let summary = engine
        .dispatcher
        .dispatch(tenant, WebhookEvent::OrderCreated, Uuid::new_v4(), &json!({}))
        .await
        .unwrap();
    assert_eq!(summary.created(), 2);
    engine.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rate_limit_blocks_at_dispatch_and_resets_next_window() {
    let engine = engine(HookworkConfig::default().with_requests_per_hour(3));
    let tenant = Uuid::new_v4();
    let (url, _) = spawn_receiver(vec![]);
    let endpoint = engine
        .registry
        .create(tenant, NewEndpoint::new(&url, vec![WebhookEvent::ProductUpdated]))
        .await
        .unwrap();

    let now = window_start(Utc::now()) + ChronoDuration::minutes(10);
    for _ in 0..3 {
        let summary = engine
            .dispatcher
            .dispatch_at(tenant, WebhookEvent::ProductUpdated, Uuid::new_v4(), &json!({}), now)
            .await
            .unwrap();
        assert_eq!(summary.created(), 1);
    }

    let blocked = engine
        .dispatcher
        .dispatch_at(tenant, WebhookEvent::ProductUpdated, Uuid::new_v4(), &json!({}), now)
        .await
        .unwrap();
    assert_eq!(blocked.created(), 0);
    assert_eq!(blocked.rate_limited, 1);

    let next_hour = now + ChronoDuration::hours(1);
    let after = engine
        .dispatcher
        .dispatch_at(tenant, WebhookEvent::ProductUpdated, Uuid::new_v4(), &json!({}), next_hour)
        .await
        .unwrap();
    assert_eq!(after.created(), 1);

    let counter = engine
        .store
        .get_rate_limit(tenant, endpoint.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counter.request_count, 1);
    assert_eq!(counter.window_start, window_start(next_hour));
    engine.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deleting_endpoint_abandons_pending_retries() {
    let engine = engine(HookworkConfig::default());
    let tenant = Uuid::new_v4();
    let (url, receiver) = spawn_receiver(vec![503; 5]);
    let endpoint = engine
        .registry
        .create(tenant, NewEndpoint::new(&url, vec![WebhookEvent::CustomerCreated]))
        .await
        .unwrap();

    let summary = engine
        .dispatcher
        .dispatch(tenant, WebhookEvent::CustomerCreated, Uuid::new_v4(), &json!({}))
        .await
        .unwrap();
    let failed = wait_for_delivery(&engine.store, tenant, summary.deliveries[0], |d| {
        d.status == DeliveryStatus::Failed
    })
    .await;

    engine.registry.delete(tenant, endpoint.id).await.unwrap();
    let report = engine
        .scheduler
        .sweep_at(failed.next_retry_at.unwrap() + ChronoDuration::minutes(1))
        .await;
    assert_eq!(report.retried, 0);
    engine.pool.shutdown().await.unwrap();

    assert_eq!(receiver.count(), 1);
    let history = engine.store.get_delivery(tenant, failed.id).await.unwrap().unwrap();
    assert_eq!(history.attempt_count, 1);
}

#[tokio::test]
async fn test_endpoint_test_send_reports_without_recording_delivery() {
    let engine = engine(HookworkConfig::default());
    let tenant = Uuid::new_v4();
    let (url, receiver) = spawn_receiver(vec![200, 404]);
    let endpoint = engine
        .registry
        .create(tenant, NewEndpoint::new(&url, vec![WebhookEvent::OrderCreated]))
        .await
        .unwrap();

    let ok = engine.registry.test(tenant, endpoint.id).await.unwrap();
    assert!(ok.success);
    assert_eq!(ok.status_code, Some(200));
    assert!(ok.response_time_ms >= 0);
    assert!(ok.error.is_none());

    let not_found = engine.registry.test(tenant, endpoint.id).await.unwrap();
    assert!(!not_found.success);
    assert_eq!(not_found.status_code, Some(404));
    assert!(not_found.error.unwrap().starts_with("HTTP 404"));

    assert_eq!(engine.store.delivery_count().await, 0);

    let request = &receiver.requests()[0];
    assert_eq!(request.header(HEADER_EVENT), "test");
    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["event"], "test");
    assert_eq!(body["endpoint_id"], endpoint.id.to_string());
    assert!(signature::verify(
        request.body.as_bytes(),
        request.header(HEADER_SIGNATURE),
        &endpoint.secret
    ));

    // a failed test send does not count towards the circuit breaker
    let endpoint = engine.registry.get(tenant, endpoint.id).await.unwrap();
    assert_eq!(endpoint.failure_count, 0);
    assert_eq!(endpoint.last_status, Some(404));
    engine.pool.shutdown().await.unwrap();
}
