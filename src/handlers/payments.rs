// handlers/payments.rs
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::dtos::payment_dtos::{InitiatePaymentRequest, InitiatePaymentResponse};
use crate::errors::Result;
use crate::middleware::auth::require_admin;
use crate::models::mpesa_callback::{CallbackPayload, PaymentCallback};
use crate::models::payment_transaction::{LedgerQuery, LedgerStats, PaymentStatus};
use crate::models::user::Claims;
use crate::state::AppState;

pub async fn initiate_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<Json<InitiatePaymentResponse>> {
    let response = state.payments.initiate(claims.buyer_id(), request).await?;
    Ok(Json(response))
}

pub async fn payment_status(
    State(state): State<AppState>,
    Path(checkout_reference): Path<String>,
) -> Result<Json<PaymentStatus>> {
    let status = state.poller.get_status(&checkout_reference).await?;
    Ok(Json(status))
}

/// Provider callback. Always acknowledged with `ResultCode: 0` so Daraja
/// stops retrying; anything we could not apply is in the logs and audit trail.
pub async fn mpesa_callback(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let ack = Json(json!({
        "ResultCode": 0,
        "ResultDesc": "Success"
    }));

    let callback: PaymentCallback = match serde_json::from_slice::<CallbackPayload>(&body) {
        Ok(payload) => payload.into(),
        Err(e) => {
            warn!(
                "Unparseable M-Pesa callback ({}): {}",
                e,
                String::from_utf8_lossy(&body)
            );
            return ack;
        }
    };

    info!(
        "📥 M-Pesa callback for {}: {} - {}",
        callback.checkout_reference, callback.result_code, callback.result_description
    );

    let reference = callback.checkout_reference.clone();
    match state.reconciler.handle(callback).await {
        Ok(Some(reconciled)) => info!(
            "Callback for {} settled as {} ({:?})",
            reference, reconciled.transaction.state, reconciled.effect
        ),
        Ok(None) => {}
        Err(e) => error!("❌ Failed to process callback for {}: {}", reference, e),
    }

    ack
}

pub async fn my_tickets(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse> {
    let tickets = state.tickets.tickets_for_buyer(claims.buyer_id()).await?;
    Ok(Json(json!({
        "success": true,
        "count": tickets.len(),
        "tickets": tickets,
    })))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<LedgerQuery>,
) -> Result<impl IntoResponse> {
    require_admin(&claims)?;

    let transactions = state.ledger.list(&query).await?;
    Ok(Json(json!({
        "success": true,
        "count": transactions.len(),
        "transactions": transactions,
    })))
}

pub async fn payment_stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<LedgerStats>> {
    require_admin(&claims)?;
    Ok(Json(state.ledger.stats().await?))
}

pub async fn payments_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "payments",
        "gateway": state.payments.has_gateway(),
        "store": state.store_kind,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
