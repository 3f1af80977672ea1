use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hookwork::{
    DeliveryPool, DeliveryWorker, HookworkConfig, HookworkError, IncomingWebhookProcessor,
    InboundRequest, IncomingId, ProviderConfig, ProviderRegistry, ReceiveOutcome,
    RetryScheduler, WebhookIncoming, WebhookStore,
    inbound::{
        PaymentActions, PaymentUpdate, ProviderHandler, ShipmentActions, ShipmentUpdate,
        StripeProvider,
    },
    signature,
    store::memory::InMemoryStore,
};
use serde_json::json;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

#[derive(Default)]
struct Recorder {
    payments: Mutex<Vec<(String, PaymentUpdate)>>,
    shipments: Mutex<Vec<ShipmentUpdate>>,
}

impl Recorder {
    fn payments(&self) -> Vec<(String, PaymentUpdate)> {
        self.payments.lock().unwrap().clone()
    }

    fn shipments(&self) -> Vec<ShipmentUpdate> {
        self.shipments.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentActions for Recorder {
    async fn payment_succeeded(&self, _tenant_id: Uuid, update: PaymentUpdate) -> hookwork::Result<()> {
        self.payments.lock().unwrap().push(("succeeded".into(), update));
        Ok(())
    }

    async fn payment_failed(&self, _tenant_id: Uuid, update: PaymentUpdate) -> hookwork::Result<()> {
        self.payments.lock().unwrap().push(("failed".into(), update));
        Ok(())
    }

    async fn payment_refunded(&self, _tenant_id: Uuid, update: PaymentUpdate) -> hookwork::Result<()> {
        self.payments.lock().unwrap().push(("refunded".into(), update));
        Ok(())
    }
}

#[async_trait]
impl ShipmentActions for Recorder {
    async fn shipment_status_changed(
        &self,
        _tenant_id: Uuid,
        update: ShipmentUpdate,
    ) -> hookwork::Result<()> {
        self.shipments.lock().unwrap().push(update);
        Ok(())
    }
}

const STRIPE_SECRET: &str = "whsec_stripe_test";
const CARRIER_SECRET: &str = "carrier_secret";

fn setup() -> (Arc<InMemoryStore>, Arc<Recorder>, IncomingWebhookProcessor) {
    let config = HookworkConfig::default()
        .with_provider("stripe", ProviderConfig::stripe(STRIPE_SECRET))
        .with_provider(
            "shipfast",
            ProviderConfig::hmac_header(CARRIER_SECRET, "X-ShipFast-Signature", "event.id"),
        );
    let store = Arc::new(InMemoryStore::new());
    let recorder = Arc::new(Recorder::default());
    let providers =
        ProviderRegistry::from_config(&config.providers, recorder.clone(), recorder.clone())
            .unwrap();
    let processor = IncomingWebhookProcessor::new(store.clone(), providers);
    (store, recorder, processor)
}

fn stripe_request(body: &str) -> InboundRequest {
    let header = StripeProvider::sign(STRIPE_SECRET, Utc::now().timestamp(), body.as_bytes());
    InboundRequest::new(body)
        .with_header("Stripe-Signature", &header)
        .with_header("User-Agent", "Stripe/1.0")
        .with_source_ip("203.0.113.7")
}

async fn wait_processed(store: &InMemoryStore, tenant_id: Uuid, id: IncomingId) -> WebhookIncoming {
    for _ in 0..200 {
        if let Some(row) = store.get_incoming(tenant_id, id).await.unwrap() {
            if row.is_processed {
                return row;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("inbound webhook {} was never processed", id);
}

fn accepted_id(outcome: ReceiveOutcome) -> IncomingId {
    match outcome {
        ReceiveOutcome::Accepted { incoming_id } => incoming_id,
        other => panic!("expected accepted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_payment_succeeded_reaches_domain_once() {
    let (store, recorder, processor) = setup();
    let tenant = Uuid::new_v4();
    let body = json!({
        "id": "evt_100",
        "type": "payment_intent.succeeded",
        "data": {"object": {"id": "pi_100", "amount_received": 4200, "currency": "eur"}}
    })
    .to_string();

    let id = accepted_id(
        processor
            .receive(tenant, "stripe", stripe_request(&body))
            .await
            .unwrap(),
    );
    let row = wait_processed(&store, tenant, id).await;
    assert!(row.is_verified);
    assert!(row.processing_error.is_none());
    assert_eq!(row.external_event_id.as_deref(), Some("evt_100"));
    assert_eq!(row.source_ip.as_deref(), Some("203.0.113.7"));
    assert_eq!(row.user_agent.as_deref(), Some("Stripe/1.0"));
    assert_eq!(row.body, body.as_bytes());

    // the gateway retries the same event
    let again = processor
        .receive(tenant, "stripe", stripe_request(&body))
        .await
        .unwrap();
    assert_eq!(
        again,
        ReceiveOutcome::Duplicate {
            external_event_id: "evt_100".to_string()
        }
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let payments = recorder.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].0, "succeeded");
    assert_eq!(payments[0].1.provider_reference, "pi_100");
    assert_eq!(payments[0].1.amount, Some(4200));
    assert_eq!(payments[0].1.currency.as_deref(), Some("eur"));
    assert_eq!(store.incoming_count().await, 1);
}

#[tokio::test]
async fn test_refund_and_failure_route_to_payment_actions() {
    let (store, recorder, processor) = setup();
    let tenant = Uuid::new_v4();

    let failed = json!({
        "id": "evt_1",
        "type": "payment_intent.payment_failed",
        "data": {"object": {
            "id": "pi_1",
            "amount": 900,
            "last_payment_error": {"message": "card declined"}
        }}
    })
    .to_string();
    let refunded = json!({
        "id": "evt_2",
        "type": "charge.refunded",
        "data": {"object": {"id": "ch_2", "payment_intent": "pi_2", "amount_refunded": 300}}
    })
    .to_string();

    let first = accepted_id(processor.receive(tenant, "stripe", stripe_request(&failed)).await.unwrap());
    wait_processed(&store, tenant, first).await;
    let second =
        accepted_id(processor.receive(tenant, "stripe", stripe_request(&refunded)).await.unwrap());
    wait_processed(&store, tenant, second).await;

    let payments = recorder.payments();
    assert_eq!(payments[0].0, "failed");
    assert_eq!(payments[0].1.reason.as_deref(), Some("card declined"));
    assert_eq!(payments[1].0, "refunded");
    assert_eq!(payments[1].1.provider_reference, "pi_2");
    assert_eq!(payments[1].1.amount, Some(300));
}

#[tokio::test]
async fn test_bad_signature_is_stored_unverified_and_never_handled() {
    let (store, recorder, processor) = setup();
    let tenant = Uuid::new_v4();
    let body = json!({
        "id": "evt_bad",
        "type": "payment_intent.succeeded",
        "data": {"object": {"id": "pi_bad", "amount": 1}}
    })
    .to_string();
    let header = StripeProvider::sign("whsec_wrong", Utc::now().timestamp(), body.as_bytes());
    let request = InboundRequest::new(body.as_str()).with_header("Stripe-Signature", &header);

    let err = processor.receive(tenant, "stripe", request).await.unwrap_err();
    assert!(matches!(err, HookworkError::SignatureInvalid { .. }));

    // stale timestamps fail too, even when correctly signed
    let stale = StripeProvider::sign(
        STRIPE_SECRET,
        (Utc::now() - ChronoDuration::minutes(10)).timestamp(),
        body.as_bytes(),
    );
    let request = InboundRequest::new(body.as_str()).with_header("Stripe-Signature", &stale);
    assert!(processor.receive(tenant, "stripe", request).await.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.payments().is_empty());
    assert_eq!(store.incoming_count().await, 2);

    // a correctly signed delivery of the same event is still accepted
    let id = accepted_id(processor.receive(tenant, "stripe", stripe_request(&body)).await.unwrap());
    wait_processed(&store, tenant, id).await;
    assert_eq!(recorder.payments().len(), 1);
}

#[tokio::test]
async fn test_carrier_callback_with_header_hmac() {
    let (store, recorder, processor) = setup();
    let tenant = Uuid::new_v4();
    let body = json!({
        "event": {"id": "sf_evt_9"},
        "data": {"tracking_number": "1Z999", "status": "in_transit", "occurred_at": "2024-05-01T10:00:00Z"}
    })
    .to_string();
    let request = InboundRequest::new(body.as_str()).with_header(
        "X-ShipFast-Signature",
        &format!("sha256={}", signature::sign(body.as_bytes(), CARRIER_SECRET)),
    );

    let id = accepted_id(processor.receive(tenant, "shipfast", request).await.unwrap());
    let row = wait_processed(&store, tenant, id).await;
    assert_eq!(row.external_event_id.as_deref(), Some("sf_evt_9"));

    let shipments = recorder.shipments();
    assert_eq!(
        shipments,
        vec![ShipmentUpdate {
            incoming_id: id,
            carrier: "shipfast".to_string(),
            tracking_number: "1Z999".to_string(),
            status: "in_transit".to_string(),
            occurred_at: Some("2024-05-01T10:00:00Z".to_string()),
        }]
    );
}

#[tokio::test]
async fn test_handler_failure_is_recorded_on_the_row() {
    let (store, recorder, processor) = setup();
    let tenant = Uuid::new_v4();
    let body = json!({"event": {"id": "sf_evt_10"}, "status": "delivered"}).to_string();
    let request = InboundRequest::new(body.as_str()).with_header(
        "X-ShipFast-Signature",
        &signature::sign(body.as_bytes(), CARRIER_SECRET),
    );

    let id = accepted_id(processor.receive(tenant, "shipfast", request).await.unwrap());
    let row = wait_processed(&store, tenant, id).await;
    assert!(row.processing_error.unwrap().contains("tracking_number"));
    assert!(recorder.shipments().is_empty());
}

#[tokio::test]
async fn test_unknown_provider_stores_nothing() {
    let (store, _, processor) = setup();
    let err = processor
        .receive(Uuid::new_v4(), "paypal", InboundRequest::new("{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, HookworkError::UnknownProvider { ref provider } if provider == "paypal"));
    assert_eq!(store.incoming_count().await, 0);
}

#[tokio::test]
async fn test_scheduler_redrives_verified_rows_left_unprocessed() {
    let (store, recorder, processor) = setup();
    let tenant = Uuid::new_v4();
    let body = json!({
        "id": "evt_crash",
        "type": "payment_intent.succeeded",
        "data": {"object": {"id": "pi_crash", "amount": 50}}
    })
    .to_string();

    // stored as if the process died before the handler ran
    let orphan = WebhookIncoming::from_request(
        tenant,
        "stripe",
        &stripe_request(&body),
        Some("evt_crash".to_string()),
        None,
        true,
    );
    assert!(store.insert_incoming(&orphan).await.unwrap());

    let config = HookworkConfig::default();
    let worker = Arc::new(DeliveryWorker::new(store.clone(), &config));
    let pool = DeliveryPool::start(worker, &config);
    let scheduler =
        RetryScheduler::new(store.clone(), pool.clone(), &config).with_incoming(processor);

    // still inside the recovery grace
    assert_eq!(scheduler.sweep().await.redriven_incoming, 0);

    let report = scheduler.sweep_at(Utc::now() + ChronoDuration::minutes(10)).await;
    assert_eq!(report.redriven_incoming, 1);
    let row = store.get_incoming(tenant, orphan.id).await.unwrap().unwrap();
    assert!(row.is_processed);
    assert_eq!(recorder.payments().len(), 1);

    // nothing left to re-drive
    let report = scheduler.sweep_at(Utc::now() + ChronoDuration::minutes(10)).await;
    assert_eq!(report.redriven_incoming, 0);
    pool.shutdown().await.unwrap();
}

/// Accepts everything and takes a while to apply it.
#[derive(Default)]
struct SlowProvider {
    handled: AtomicUsize,
}

#[async_trait]
impl ProviderHandler for SlowProvider {
    fn verify(&self, _request: &InboundRequest, _now: DateTime<Utc>) -> hookwork::Result<()> {
        Ok(())
    }

    fn signature(&self, _request: &InboundRequest) -> Option<String> {
        None
    }

    fn external_id(&self, _body: &[u8]) -> Option<String> {
        None
    }

    async fn handle(&self, _incoming: &WebhookIncoming) -> hookwork::Result<()> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_sweep_does_not_rerun_handler_in_flight() {
    let store = Arc::new(InMemoryStore::new());
    let slow = Arc::new(SlowProvider::default());
    let processor = IncomingWebhookProcessor::new(
        store.clone(),
        ProviderRegistry::new().register("slow", slow.clone()),
    );
    let config = HookworkConfig::default();
    let worker = Arc::new(DeliveryWorker::new(store.clone(), &config));
    let pool = DeliveryPool::start(worker, &config);
    let scheduler = RetryScheduler::new(store.clone(), pool.clone(), &config)
        .with_incoming(processor.clone());

    let tenant = Uuid::new_v4();
    let id = accepted_id(
        processor
            .receive(tenant, "slow", InboundRequest::new("{}"))
            .await
            .unwrap(),
    );
    // the background run has claimed the row and is inside the handler
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = scheduler.sweep_at(Utc::now() + ChronoDuration::minutes(10)).await;
    assert_eq!(report.redriven_incoming, 0);

    let row = wait_processed(&store, tenant, id).await;
    assert!(row.processing_started_at.is_some());
    assert_eq!(slow.handled.load(Ordering::SeqCst), 1);

    let report = scheduler.sweep_at(Utc::now() + ChronoDuration::minutes(10)).await;
    assert_eq!(report.redriven_incoming, 0);
    assert_eq!(slow.handled.load(Ordering::SeqCst), 1);
    pool.shutdown().await.unwrap();
}
