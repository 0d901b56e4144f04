#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};

use ticketing_payments::config::AppConfig;
use ticketing_payments::database::memory_store::MemoryStore;
use ticketing_payments::dtos::payment_dtos::{InitiatePaymentRequest, InitiatePaymentResponse};
use ticketing_payments::errors::{AppError, Result};
use ticketing_payments::models::event::Event;
use ticketing_payments::models::mpesa_callback::PaymentCallback;
use ticketing_payments::models::user::{Claims, Role};
use ticketing_payments::services::clock::Clock;
use ticketing_payments::services::gateway::{
    ChargeAccepted, ChargeRequest, GatewayQuery, PaymentGateway,
};
use ticketing_payments::state::{AppState, Stores};

pub const EVENT_ID: &str = "evt-sauti-sol";
pub const UNIT_PRICE: i64 = 1500;
pub const JWT_SECRET: &str = "test-secret";
pub const PHONE: &str = "0712345678";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 18, 0, 0).unwrap()
}

/// Clock the test moves by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Mutex::new(start_time()),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap();
        *now = *now + chrono::Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Wall time that follows tokio's paused clock, so sleeps and deadlines agree.
pub struct PausedClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl PausedClock {
    pub fn new() -> Self {
        PausedClock {
            origin: start_time(),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap();
        self.origin + elapsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeScript {
    Accept,
    RateLimited,
    Unavailable,
    RejectPhone,
}

#[derive(Debug, Clone)]
pub enum QueryScript {
    Answer(GatewayQuery),
    Fail,
    Hang(Duration),
}

/// Scripted gateway that counts calls.
pub struct FakeGateway {
    charge_script: Mutex<ChargeScript>,
    query_script: Mutex<QueryScript>,
    next_reference: AtomicUsize,
    pub charges: AtomicUsize,
    pub queries: AtomicUsize,
    pub last_charge: Mutex<Option<ChargeRequest>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        FakeGateway {
            charge_script: Mutex::new(ChargeScript::Accept),
            query_script: Mutex::new(QueryScript::Answer(GatewayQuery::Processing)),
            next_reference: AtomicUsize::new(1),
            charges: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            last_charge: Mutex::new(None),
        }
    }

    pub fn script_charge(&self, script: ChargeScript) {
        *self.charge_script.lock().unwrap() = script;
    }

    pub fn script_query(&self, script: QueryScript) {
        *self.query_script.lock().unwrap() = script;
    }

    pub fn answer_query(&self, result_code: i32, result_description: &str) {
        self.script_query(QueryScript::Answer(GatewayQuery::Completed {
            result_code,
            result_description: result_description.to_string(),
        }));
    }

    pub fn charge_count(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeAccepted> {
        self.charges.fetch_add(1, Ordering::SeqCst);
        *self.last_charge.lock().unwrap() = Some(request);

        let script = *self.charge_script.lock().unwrap();
        match script {
            ChargeScript::Accept => {
                let n = self.next_reference.fetch_add(1, Ordering::SeqCst);
                Ok(ChargeAccepted {
                    checkout_reference: format!("ws_CO_14032026180000{:04}", n),
                    merchant_request_id: Some(format!("29115-{}", n)),
                    customer_message: Some("Success. Request accepted for processing".into()),
                })
            }
            ChargeScript::RateLimited => Err(AppError::RateLimited),
            ChargeScript::Unavailable => Err(AppError::gateway("connection reset")),
            ChargeScript::RejectPhone => Err(AppError::InvalidPhoneNumber(
                "Bad Request - Invalid PhoneNumber".into(),
            )),
        }
    }

    async fn query_status(&self, _checkout_reference: &str) -> Result<GatewayQuery> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let script = self.query_script.lock().unwrap().clone();
        match script {
            QueryScript::Answer(answer) => Ok(answer),
            QueryScript::Fail => Err(AppError::gateway("query failed")),
            QueryScript::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(GatewayQuery::Processing)
            }
        }
    }
}

pub fn test_config() -> AppConfig {
    let vars: HashMap<&str, &str> = [("JWT_SECRET", JWT_SECRET)].into_iter().collect();
    AppConfig::from_lookup(move |key| vars.get(key).map(|v| v.to_string())).unwrap()
}

pub fn event(remaining_tickets: i64) -> Event {
    Event {
        event_id: EVENT_ID.to_string(),
        title: "Sauti Sol Live at Uhuru Gardens".to_string(),
        unit_price: UNIT_PRICE,
        currency: "KES".to_string(),
        remaining_tickets,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub state: AppState,
}

impl Harness {
    pub async fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_inventory(clock, 100).await
    }

    pub async fn with_inventory(clock: Arc<dyn Clock>, remaining_tickets: i64) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.upsert_event(event(remaining_tickets)).await;
        let gateway = Arc::new(FakeGateway::new());

        let state = AppState::new(
            &test_config(),
            Stores::shared(store.clone(), "memory"),
            Some(gateway.clone() as Arc<dyn PaymentGateway>),
            clock,
        );

        Harness {
            store,
            gateway,
            state,
        }
    }

    pub async fn without_gateway(clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.upsert_event(event(100)).await;
        let state = AppState::new(
            &test_config(),
            Stores::shared(store.clone(), "memory"),
            None,
            clock,
        );

        Harness {
            store,
            gateway: Arc::new(FakeGateway::new()),
            state,
        }
    }

    pub async fn initiate(&self, buyer_id: &str, quantity: u32) -> Result<InitiatePaymentResponse> {
        self.state
            .payments
            .initiate(buyer_id, purchase(quantity))
            .await
    }

    pub async fn remaining_tickets(&self) -> i64 {
        use ticketing_payments::database::TicketStore;
        self.store.event(EVENT_ID).await.unwrap().remaining_tickets
    }
}

pub fn purchase(quantity: u32) -> InitiatePaymentRequest {
    InitiatePaymentRequest {
        event_id: EVENT_ID.to_string(),
        quantity,
        phone_number: PHONE.to_string(),
    }
}

pub fn callback(checkout_reference: &str, result_code: i32, description: &str) -> PaymentCallback {
    PaymentCallback {
        checkout_reference: checkout_reference.to_string(),
        result_code,
        result_description: description.to_string(),
        provider_receipt_id: if result_code == 0 {
            Some("SCE7XK2M4P".to_string())
        } else {
            None
        },
    }
}

pub fn success(checkout_reference: &str) -> PaymentCallback {
    callback(
        checkout_reference,
        0,
        "The service request is processed successfully.",
    )
}

pub fn cancelled(checkout_reference: &str) -> PaymentCallback {
    callback(checkout_reference, 1032, "Request cancelled by user")
}

pub fn bearer(buyer_id: &str, role: Role) -> String {
    let claims = Claims {
        sub: buyer_id.to_string(),
        username: format!("{}-name", buyer_id),
        role,
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_ref()),
    )
    .unwrap();
    format!("Bearer {}", token)
}
