//! Product catalog handlers: public reads, admin CRUD.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    CreateProductRequest, CreateVariantRequest, ListProductsQuery, PatchProductRequest,
    UpdateProductRequest,
};
use crate::services::catalog::CatalogService;
use crate::utils::response::{data, data_with_meta};
use crate::AppState;

/// GET /products
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListProductsQuery>,
) -> Result<Json<Value>> {
    let products = CatalogService::list_products(&state.db.pool, &query).await?;
    Ok(data_with_meta(
        products,
        json!({
            "filters": {
                "min_price": query.min_price,
                "max_price": query.max_price,
                "category": query.category,
                "sort_by": query.sort_by,
                "sort_order": query.sort_order,
            }
        }),
    ))
}

/// GET /products/:product_id
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
) -> Result<Json<Value>> {
    let product = CatalogService::get_product(&state.db.pool, product_id).await?;
    Ok(data(product))
}

/// POST /products (admin)
pub async fn create_product(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProductRequest>,
) -> Result<Json<Value>> {
    let product = CatalogService::create_product(&state.db.pool, req).await?;
    Ok(data(product))
}

/// PUT /products/:product_id (admin)
pub async fn update_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
    Json(req): Json<UpdateProductRequest>,
) -> Result<Json<Value>> {
    let product = CatalogService::update_product(&state.db.pool, product_id, req).await?;
    Ok(data(product))
}

/// PATCH /products/:product_id (admin)
pub async fn patch_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
    Json(req): Json<PatchProductRequest>,
) -> Result<Json<Value>> {
    let product = CatalogService::patch_product(&state.db.pool, product_id, req).await?;
    Ok(data(product))
}

/// DELETE /products/:product_id (admin)
pub async fn delete_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
) -> Result<Json<Value>> {
    let product = CatalogService::delete_product(&state.db.pool, product_id).await?;
    Ok(data(product))
}

/// POST /products/:product_id/variants (admin)
pub async fn add_variant(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
    Json(req): Json<CreateVariantRequest>,
) -> Result<Json<Value>> {
    let variant = CatalogService::add_variant(&state.db.pool, product_id, req).await?;
    Ok(data(variant))
}
