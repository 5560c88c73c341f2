use axum::{
    middleware as axum_middleware,
    routing::{delete, get, patch, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::auth::middleware::{auth_middleware, require_admin};
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/products", get(handlers::products::list_products))
        .route("/products/:product_id", get(handlers::products::get_product))
        .route("/users", post(handlers::users::create_user))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route(
            "/payments/webhook/mercadopago",
            post(handlers::webhooks::mercadopago_webhook),
        )
        .route("/checkout/guest", post(handlers::checkout::guest_checkout));

    // Buyer routes (bearer access token)
    let protected_routes = Router::new()
        .route("/orders/draft", get(handlers::orders::get_or_create_draft))
        .route(
            "/orders/draft/items",
            post(handlers::orders::add_item_to_draft),
        )
        .route(
            "/orders/draft/items/:item_id",
            delete(handlers::orders::remove_item_from_draft),
        )
        .route(
            "/orders/:order_id/status",
            patch(handlers::orders::update_order_status),
        )
        .route("/orders/:order_id", get(handlers::orders::get_order))
        .route("/orders/:order_id/pay", post(handlers::orders::pay_order))
        .route(
            "/orders/:order_id/payments",
            post(handlers::orders::create_order_payment).get(handlers::orders::list_order_payments),
        )
        .route("/payments/:payment_id", get(handlers::payments::get_payment))
        .route("/turns", post(handlers::turns::create_turn))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Admin routes (bearer access token + is_admin claim)
    let admin_routes = Router::new()
        .route("/products", post(handlers::products::create_product))
        .route(
            "/products/:product_id",
            put(handlers::products::update_product)
                .patch(handlers::products::patch_product)
                .delete(handlers::products::delete_product),
        )
        .route(
            "/products/:product_id/variants",
            post(handlers::products::add_variant),
        )
        .route(
            "/discounts",
            get(handlers::discounts::list_discounts).post(handlers::discounts::create_discount),
        )
        .route(
            "/discounts/:discount_id",
            patch(handlers::discounts::update_discount)
                .delete(handlers::discounts::delete_discount),
        )
        .route("/users/search", get(handlers::users::search_users))
        .route("/users/resolve", post(handlers::users::resolve_user))
        .route(
            "/orders/manual/submitted",
            post(handlers::checkout::create_manual_order),
        )
        .route(
            "/admin/stock-reservations/expire",
            post(handlers::admin::expire_stock_reservations),
        )
        .layer(axum_middleware::from_fn(require_admin))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
}
