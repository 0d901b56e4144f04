use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::payments::{
    initiate_payment, list_transactions, mpesa_callback, my_tickets, payment_stats,
    payment_status, payments_health,
};
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn payment_routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/initiate", post(initiate_payment))
        .route("/tickets", get(my_tickets))
        // Admin only; role checked in the handlers
        .route("/transactions", get(list_transactions))
        .route("/stats", get(payment_stats))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        .route("/health", get(payments_health))
        // Called by Safaricom, no bearer token
        .route("/callback", post(mpesa_callback))
        .route("/status/:checkout_reference", get(payment_status))
        .merge(protected)
}
