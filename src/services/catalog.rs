//! Catalog reads and admin product CRUD.
//!
//! `min_var_price` aggregates MIN(price) over every variant of a product,
//! active or not, and stays null for a product without variants. Price
//! filters and price sorting apply to that aggregate.

use sqlx::{PgConnection, PgPool};

use crate::error::{is_foreign_key_violation, is_unique_violation, Error, Result};
use crate::models::{
    CreateProductRequest, CreateVariantRequest, ListProductsQuery, PatchProductRequest,
    ProductDetailResponse, ProductSortBy, ProductSummary, ProductVariant, SortOrder,
    UpdateProductRequest,
};
use rust_decimal::Decimal;

const SUMMARY_SELECT: &str = "SELECT p.id, p.name, p.description, p.category_id, c.name AS category, \
     MIN(v.price) AS min_var_price \
     FROM products p \
     JOIN categories c ON c.id = p.category_id \
     LEFT JOIN product_variants v ON v.product_id = p.id";

pub struct CatalogService;

impl CatalogService {
    pub async fn list_products(
        pool: &PgPool,
        query: &ListProductsQuery,
    ) -> Result<Vec<ProductSummary>> {
        let order_by = match (query.sort_by, query.sort_order.unwrap_or(SortOrder::Asc)) {
            (None, _) => "p.id ASC",
            (Some(ProductSortBy::Name), SortOrder::Asc) => "p.name ASC, p.id ASC",
            (Some(ProductSortBy::Name), SortOrder::Desc) => "p.name DESC, p.id ASC",
            (Some(ProductSortBy::Price), SortOrder::Asc) => {
                "MIN(v.price) ASC NULLS LAST, p.id ASC"
            }
            (Some(ProductSortBy::Price), SortOrder::Desc) => {
                "MIN(v.price) DESC NULLS LAST, p.id ASC"
            }
        };

        // Sort target varies; built like the teacher's dynamic table queries.
        let sql = format!(
            "{SUMMARY_SELECT} \
             WHERE ($1::text IS NULL OR c.name = $1) \
             GROUP BY p.id, p.name, p.description, p.category_id, c.name \
             HAVING ($2::numeric IS NULL OR MIN(v.price) >= $2) \
                AND ($3::numeric IS NULL OR MIN(v.price) <= $3) \
             ORDER BY {order_by}"
        );

        let products = sqlx::query_as::<_, ProductSummary>(&sql)
            .bind(query.category.as_deref().map(str::trim))
            .bind(query.min_price)
            .bind(query.max_price)
            .fetch_all(pool)
            .await?;
        Ok(products)
    }

    pub async fn get_product(pool: &PgPool, product_id: i64) -> Result<ProductDetailResponse> {
        let mut conn = pool.acquire().await?;
        Self::get_product_detail(&mut conn, product_id).await
    }

    async fn get_product_detail(
        conn: &mut PgConnection,
        product_id: i64,
    ) -> Result<ProductDetailResponse> {
        let sql = format!(
            "{SUMMARY_SELECT} WHERE p.id = $1 \
             GROUP BY p.id, p.name, p.description, p.category_id, c.name"
        );
        let summary = sqlx::query_as::<_, ProductSummary>(&sql)
            .bind(product_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::not_found("product not found"))?;

        let variants = sqlx::query_as::<_, ProductVariant>(
            "SELECT id, product_id, sku, size, color, price, stock, is_active
             FROM product_variants
             WHERE product_id = $1 AND is_active = TRUE
             ORDER BY id ASC",
        )
        .bind(product_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(ProductDetailResponse {
            id: summary.id,
            name: summary.name,
            description: summary.description,
            category_id: summary.category_id,
            category: summary.category,
            min_var_price: summary.min_var_price,
            variants,
        })
    }

    /// A variant is purchasable only while it is active and its parent
    /// product still exists.
    pub async fn get_active_variant(
        conn: &mut PgConnection,
        variant_id: i64,
    ) -> Result<ProductVariant> {
        sqlx::query_as::<_, ProductVariant>(
            "SELECT v.id, v.product_id, v.sku, v.size, v.color, v.price, v.stock, v.is_active
             FROM product_variants v
             JOIN products p ON p.id = v.product_id
             WHERE v.id = $1 AND v.is_active = TRUE",
        )
        .bind(variant_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("variant not found"))
    }

    async fn resolve_category_id(conn: &mut PgConnection, name: &str) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("category is required"));
        }
        if let Some(id) =
            sqlx::query_scalar::<_, i64>("SELECT id FROM categories WHERE name = $1")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?
        {
            return Ok(id);
        }
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO categories (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id",
        )
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    fn validate_variant(req: &CreateVariantRequest) -> Result<()> {
        if req.sku.trim().is_empty() {
            return Err(Error::validation("sku is required"));
        }
        if req.price < Decimal::ZERO {
            return Err(Error::validation("price cannot be negative"));
        }
        if req.stock < 0 {
            return Err(Error::validation("stock cannot be negative"));
        }
        Ok(())
    }

    pub async fn create_product(
        pool: &PgPool,
        req: CreateProductRequest,
    ) -> Result<ProductDetailResponse> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("name is required"));
        }
        for variant in &req.variants {
            Self::validate_variant(variant)?;
        }

        let mut tx = pool.begin().await?;
        let category_id = Self::resolve_category_id(&mut tx, &req.category).await?;

        let product_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO products (name, description, category_id) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&name)
        .bind(req.description.as_deref().map(str::trim))
        .bind(category_id)
        .fetch_one(&mut *tx)
        .await?;

        for variant in &req.variants {
            Self::insert_variant(&mut tx, product_id, variant).await?;
        }

        let detail = Self::get_product_detail(&mut tx, product_id).await?;
        tx.commit().await?;
        Ok(detail)
    }

    async fn insert_variant(
        conn: &mut PgConnection,
        product_id: i64,
        req: &CreateVariantRequest,
    ) -> Result<ProductVariant> {
        sqlx::query_as::<_, ProductVariant>(
            "INSERT INTO product_variants (product_id, sku, size, color, price, stock, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, product_id, sku, size, color, price, stock, is_active",
        )
        .bind(product_id)
        .bind(req.sku.trim())
        .bind(req.size.as_deref().map(str::trim))
        .bind(req.color.as_deref().map(str::trim))
        .bind(req.price)
        .bind(req.stock)
        .bind(req.is_active)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::conflict("sku already exists")
            } else {
                e.into()
            }
        })
    }

    pub async fn add_variant(
        pool: &PgPool,
        product_id: i64,
        req: CreateVariantRequest,
    ) -> Result<ProductVariant> {
        Self::validate_variant(&req)?;
        let mut tx = pool.begin().await?;
        let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM products WHERE id = $1")
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(Error::not_found("product not found"));
        }
        let variant = Self::insert_variant(&mut tx, product_id, &req).await?;
        tx.commit().await?;
        Ok(variant)
    }

    pub async fn update_product(
        pool: &PgPool,
        product_id: i64,
        req: UpdateProductRequest,
    ) -> Result<ProductDetailResponse> {
        Self::patch_product(
            pool,
            product_id,
            PatchProductRequest {
                name: Some(req.name),
                description: req.description,
                category: Some(req.category),
            },
        )
        .await
    }

    pub async fn patch_product(
        pool: &PgPool,
        product_id: i64,
        req: PatchProductRequest,
    ) -> Result<ProductDetailResponse> {
        if req.is_empty() {
            return Err(Error::validation("at least one field is required"));
        }

        let mut tx = pool.begin().await?;
        let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM products WHERE id = $1 FOR UPDATE")
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_none() {
            return Err(Error::not_found("product not found"));
        }

        if let Some(name) = &req.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::validation("name is required"));
            }
            sqlx::query("UPDATE products SET name = $1 WHERE id = $2")
                .bind(name)
                .bind(product_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(description) = &req.description {
            sqlx::query("UPDATE products SET description = $1 WHERE id = $2")
                .bind(description.trim())
                .bind(product_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(category) = &req.category {
            let category_id = Self::resolve_category_id(&mut tx, category).await?;
            sqlx::query("UPDATE products SET category_id = $1 WHERE id = $2")
                .bind(category_id)
                .bind(product_id)
                .execute(&mut *tx)
                .await?;
        }

        let detail = Self::get_product_detail(&mut tx, product_id).await?;
        tx.commit().await?;
        Ok(detail)
    }

    /// Hard delete. Products referenced by order items are protected by
    /// `ON DELETE RESTRICT` and surface as a conflict.
    pub async fn delete_product(pool: &PgPool, product_id: i64) -> Result<ProductDetailResponse> {
        let mut tx = pool.begin().await?;
        let detail = Self::get_product_detail(&mut tx, product_id).await?;

        sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(product_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    Error::conflict("product is referenced by existing orders")
                } else {
                    Error::from(e)
                }
            })?;

        tx.commit().await?;
        Ok(detail)
    }
}
