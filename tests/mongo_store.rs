//! Runs against a live MongoDB replica set. Set DATABASE_URL and pass
//! `--ignored` to include these.

mod common;

use std::sync::Arc;

use mongodb::Client;

use common::*;
use ticketing_payments::database::mongo_store::MongoStore;
use ticketing_payments::database::TicketStore;
use ticketing_payments::models::event::Event;
use ticketing_payments::models::payment_transaction::PaymentState;
use ticketing_payments::services::clock::Clock;
use ticketing_payments::services::gateway::PaymentGateway;
use ticketing_payments::state::{AppState, Stores};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn callback_racing_poll_issues_one_ticket_in_mongo() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return;
    };
    let client = Client::with_uri_str(&url).await.unwrap();
    let db = client.database(&format!("ticketing_test_{}", uuid::Uuid::new_v4().simple()));

    db.collection::<Event>("events").insert_one(event(1)).await.unwrap();
    let store = Arc::new(MongoStore::new(client, db.clone()));
    store.ensure_indexes().await.unwrap();

    let clock = Arc::new(ManualClock::new());
    let gateway = Arc::new(FakeGateway::new());
    let state = AppState::new(
        &test_config(),
        Stores::shared(store.clone(), "mongodb"),
        Some(gateway.clone() as Arc<dyn PaymentGateway>),
        clock.clone() as Arc<dyn Clock>,
    );

    let started = state.payments.initiate("buyer-1", purchase(1)).await.unwrap();
    gateway.answer_query(0, "The service request is processed successfully.");
    clock.advance_secs(40);

    let reference = started.checkout_reference.clone();
    let (handled, polled) = tokio::join!(
        state.reconciler.handle(success(&reference)),
        state.poller.get_status(&reference),
    );
    handled.unwrap();
    polled.unwrap();

    let status = state.poller.get_status(&reference).await.unwrap();
    let remaining = store.event(EVENT_ID).await.unwrap().remaining_tickets;
    let tickets = db
        .collection::<mongodb::bson::Document>("tickets")
        .count_documents(mongodb::bson::doc! { "checkout_reference": &reference })
        .await
        .unwrap();
    db.drop().await.unwrap();

    assert_eq!(status.state, PaymentState::Succeeded);
    assert!(status.ticket_id.is_some());
    assert_eq!(remaining, 0);
    assert_eq!(tickets, 1);
}
