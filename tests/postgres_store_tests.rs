
use chrono::{Duration, Utc};
use hookwork::{
    DeliveryQuery, DeliveryStatus, InboundRequest, NewEndpoint, WebhookDelivery, WebhookEndpoint,
    WebhookEvent, WebhookIncoming, WebhookStore,
    delivery::AttemptOutcome,
    store::HealthUpdate,
};
use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

fn endpoint(tenant_id: Uuid, events: Vec<WebhookEvent>) -> WebhookEndpoint {
    WebhookEndpoint::from_request(
        tenant_id,
        NewEndpoint::new("https://tenant.example.com/hooks", events)
            .with_max_retries(3)
            .with_timeout_secs(10),
    )
    .unwrap()
}

fn failure(next_retry_at: chrono::DateTime<Utc>) -> AttemptOutcome {
    AttemptOutcome {
        success: false,
        request_url: "https://tenant.example.com/hooks".to_string(),
        request_headers: BTreeMap::new(),
        response_status: Some(502),
        response_headers: BTreeMap::new(),
        response_body: Some("bad gateway".to_string()),
        response_time_ms: 12,
        error_message: Some("HTTP 502: bad gateway".to_string()),
        next_retry_at: Some(next_retry_at),
    }
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_endpoint_lifecycle() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let mut ep = endpoint(tenant, vec![WebhookEvent::OrderCreated, WebhookEvent::OrderUpdated]);
    store.insert_endpoint(&ep).await.unwrap();

    let loaded = store.get_endpoint(tenant, ep.id).await.unwrap().unwrap();
    assert_eq!(loaded.url, ep.url);
    assert_eq!(loaded.events, ep.events);
    assert_eq!(loaded.secret, ep.secret);
    assert_eq!(loaded.max_retries, 3);

    // other tenants cannot see it
    assert!(store.get_endpoint(Uuid::new_v4(), ep.id).await.unwrap().is_none());

    ep.description = Some("orders".to_string());
    assert!(store.update_endpoint(&ep, false).await.unwrap());
    assert_eq!(store.list_endpoints(tenant).await.unwrap().len(), 1);

    assert!(store.delete_endpoint(tenant, ep.id).await.unwrap());
    assert!(!store.delete_endpoint(tenant, ep.id).await.unwrap());
    assert!(store.get_endpoint(tenant, ep.id).await.unwrap().is_none());
    assert!(store.list_endpoints(tenant).await.unwrap().is_empty());
    assert!(!store.update_endpoint(&ep, false).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_subscription_respects_circuit_breaker() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let healthy = endpoint(tenant, vec![WebhookEvent::InventoryLow]);
    let failing = endpoint(tenant, vec![WebhookEvent::InventoryLow]);
    store.insert_endpoint(&healthy).await.unwrap();
    store.insert_endpoint(&failing).await.unwrap();

    for _ in 0..3 {
        store
            .record_endpoint_attempt(tenant, failing.id, Some(500), HealthUpdate::Exhausted, Utc::now())
            .await
            .unwrap();
    }

    let found = store
        .find_subscribed_endpoints(tenant, WebhookEvent::InventoryLow, 3)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, healthy.id);

    // an edit based on a stale read keeps the recorded failures
    let mut stale = failing.clone();
    stale.description = Some("edited".to_string());
    assert!(store.update_endpoint(&stale, false).await.unwrap());
    assert_eq!(
        store.get_endpoint(tenant, failing.id).await.unwrap().unwrap().failure_count,
        3
    );
    assert!(store.update_endpoint(&stale, true).await.unwrap());
    assert_eq!(
        store.get_endpoint(tenant, failing.id).await.unwrap().unwrap().failure_count,
        0
    );

    store
        .record_endpoint_attempt(tenant, failing.id, Some(200), HealthUpdate::Succeeded, Utc::now())
        .await
        .unwrap();
    let reset = store.get_endpoint(tenant, failing.id).await.unwrap().unwrap();
    assert_eq!(reset.failure_count, 0);
    assert_eq!(reset.last_status, Some(200));
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_attempt_claim_is_exclusive() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let ep = endpoint(tenant, vec![WebhookEvent::OrderCompleted]);
    store.insert_endpoint(&ep).await.unwrap();
    let delivery = WebhookDelivery::new(&ep, WebhookEvent::OrderCompleted, Uuid::new_v4(), "{}".into());
    store.insert_delivery(&delivery).await.unwrap();

    let claims = concurrent_claims(store.clone(), tenant, delivery.id).await;
    assert_eq!(claims, 1);

    let claimed = store.get_delivery(tenant, delivery.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, DeliveryStatus::Delivering);
    assert_eq!(claimed.attempt_count, 1);
}

async fn concurrent_claims(
    store: Arc<hookwork::store::postgres::PostgresStore>,
    tenant: Uuid,
    delivery_id: Uuid,
) -> usize {
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.begin_attempt(tenant, delivery_id, Utc::now()).await.unwrap()
        }));
    }
    let mut claims = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claims += 1;
        }
    }
    claims
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_failed_attempt_becomes_due_retry() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let ep = endpoint(tenant, vec![WebhookEvent::CustomerUpdated]);
    store.insert_endpoint(&ep).await.unwrap();
    let delivery =
        WebhookDelivery::new(&ep, WebhookEvent::CustomerUpdated, Uuid::new_v4(), "{}".into());
    store.insert_delivery(&delivery).await.unwrap();

    let now = Utc::now();
    store.begin_attempt(tenant, delivery.id, now).await.unwrap().unwrap();
    let failed = store
        .complete_attempt(tenant, delivery.id, &failure(now + Duration::minutes(1)), now)
        .await
        .unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(failed.response_status, Some(502));

    let mine = |rows: Vec<WebhookDelivery>| rows.into_iter().filter(|d| d.tenant_id == tenant).count();
    assert_eq!(mine(store.due_retries(now, 100).await.unwrap()), 0);
    assert_eq!(
        mine(store.due_retries(now + Duration::minutes(2), 100).await.unwrap()),
        1
    );

    // deleted endpoints drop out of the sweep
    store.delete_endpoint(tenant, ep.id).await.unwrap();
    assert_eq!(
        mine(store.due_retries(now + Duration::minutes(2), 100).await.unwrap()),
        0
    );

    let history = store
        .list_deliveries(tenant, ep.id, DeliveryQuery::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_stuck_attempts_expire() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let ep = endpoint(tenant, vec![WebhookEvent::OrderCreated]);
    store.insert_endpoint(&ep).await.unwrap();
    let delivery = WebhookDelivery::new(&ep, WebhookEvent::OrderCreated, Uuid::new_v4(), "{}".into());
    store.insert_delivery(&delivery).await.unwrap();

    let now = Utc::now();
    store
        .begin_attempt(tenant, delivery.id, now - Duration::hours(2))
        .await
        .unwrap()
        .unwrap();

    let mine = |rows: Vec<WebhookDelivery>| -> Vec<WebhookDelivery> {
        rows.into_iter().filter(|d| d.tenant_id == tenant).collect()
    };
    let expired = mine(
        store
            .expire_stale_attempts(now - Duration::hours(1), now, 1000)
            .await
            .unwrap(),
    );
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, DeliveryStatus::Failed);
    assert_eq!(expired[0].attempt_count, 1);
    assert!(expired[0].next_retry_at.is_some());
    assert_eq!(mine(store.due_retries(now, 1000).await.unwrap()).len(), 1);

    // already failed, not expired twice
    let again = mine(
        store
            .expire_stale_attempts(now - Duration::hours(1), now, 1000)
            .await
            .unwrap(),
    );
    assert!(again.is_empty());
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_rate_limit_never_exceeds_limit() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let ep = endpoint(tenant, vec![WebhookEvent::ProductCreated]);
    store.insert_endpoint(&ep).await.unwrap();

    let now = Utc::now();
    let endpoint_id = ep.id;
    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.try_acquire_rate_limit(tenant, endpoint_id, 5, now).await.unwrap()
        }));
    }
    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 5);

    let counter = store.get_rate_limit(tenant, ep.id).await.unwrap().unwrap();
    assert_eq!(counter.request_count, 5);

    // the next hour starts from zero
    assert!(store
        .try_acquire_rate_limit(tenant, ep.id, 5, now + Duration::hours(1))
        .await
        .unwrap());
    let counter = store.get_rate_limit(tenant, ep.id).await.unwrap().unwrap();
    assert_eq!(counter.request_count, 1);
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_incoming_dedup_and_processing() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let request = InboundRequest::new(r#"{"id":"evt_pg"}"#).with_header("User-Agent", "Stripe/1.0");
    let external = Some(format!("evt_{}", Uuid::new_v4()));

    let rejected =
        WebhookIncoming::from_request(tenant, "stripe", &request, external.clone(), None, false);
    let first =
        WebhookIncoming::from_request(tenant, "stripe", &request, external.clone(), None, true);
    let second =
        WebhookIncoming::from_request(tenant, "stripe", &request, external.clone(), None, true);

    assert!(store.insert_incoming(&rejected).await.unwrap());
    assert!(store.insert_incoming(&first).await.unwrap());
    assert!(!store.insert_incoming(&second).await.unwrap());
    assert!(store.get_incoming(tenant, second.id).await.unwrap().is_none());

    let later = Utc::now() + Duration::minutes(10);
    let pending: Vec<_> = store
        .unprocessed_incoming(later, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.tenant_id == tenant)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first.id);

    assert!(store
        .mark_incoming_processed(tenant, first.id, None, Utc::now())
        .await
        .unwrap());
    assert!(!store
        .mark_incoming_processed(tenant, first.id, None, Utc::now())
        .await
        .unwrap());

    let row = store.get_incoming(tenant, first.id).await.unwrap().unwrap();
    assert!(row.is_processed);
    assert!(row.processed_at.is_some());
    assert_eq!(row.user_agent.as_deref(), Some("Stripe/1.0"));
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_incoming_claims_and_raw_body() {
    let store = test_utils::setup_postgres_store().await;
    let tenant = Uuid::new_v4();
    let raw = vec![b'{', 0xff, 0x00, b'}'];
    let row = WebhookIncoming::from_request(
        tenant,
        "carrier",
        &InboundRequest::new(raw.clone()),
        None,
        None,
        true,
    );
    assert!(store.insert_incoming(&row).await.unwrap());
    assert_eq!(store.get_incoming(tenant, row.id).await.unwrap().unwrap().body, raw);

    let now = Utc::now();
    let lease = Duration::minutes(30);
    let claimed = store
        .claim_incoming(tenant, row.id, now, now - lease)
        .await
        .unwrap()
        .unwrap();
    assert!(claimed.processing_started_at.is_some());

    let soon = now + Duration::minutes(5);
    assert!(store.claim_incoming(tenant, row.id, soon, soon - lease).await.unwrap().is_none());

    let late = now + Duration::hours(1);
    assert!(store.claim_incoming(tenant, row.id, late, late - lease).await.unwrap().is_some());
}
