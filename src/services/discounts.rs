//! Discount CRUD and payload validation. The pricing rules themselves live
//! in `services::pricing`.

use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

use crate::error::{Error, Result};
use crate::models::{
    CreateDiscountRequest, Discount, DiscountRow, DiscountScope, DiscountType,
    UpdateDiscountRequest,
};

pub struct DiscountService;

fn validate_payload(
    discount_type: DiscountType,
    scope: DiscountScope,
    value: Decimal,
    scope_value: Option<&str>,
    product_ids: &[i64],
) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(Error::validation("discount value must be greater than 0"));
    }
    if discount_type == DiscountType::Percent && value > Decimal::from(100) {
        return Err(Error::validation("percent discount cannot exceed 100"));
    }

    let has_scope_value = scope_value.map(|v| !v.trim().is_empty()).unwrap_or(false);
    match scope {
        DiscountScope::All => {
            if has_scope_value {
                return Err(Error::validation("scope_value must be null for all scope"));
            }
        }
        DiscountScope::Category | DiscountScope::Product => {
            if !has_scope_value {
                return Err(Error::validation(
                    "scope_value is required for category/product scope",
                ));
            }
        }
        DiscountScope::ProductList => {
            if has_scope_value {
                return Err(Error::validation(
                    "scope_value must be null for product_list scope",
                ));
            }
            if product_ids.is_empty() {
                return Err(Error::validation(
                    "product_ids is required for product_list scope",
                ));
            }
        }
    }
    Ok(())
}

async fn load_product_ids(conn: &mut PgConnection, discount_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT product_id FROM discount_products WHERE discount_id = $1 ORDER BY product_id ASC",
    )
    .bind(discount_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

async fn assert_products_exist(conn: &mut PgConnection, product_ids: &[i64]) -> Result<()> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM products WHERE id = ANY($1)",
    )
    .bind(product_ids)
    .fetch_one(&mut *conn)
    .await?;

    let unique_count = {
        let mut ids = product_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        ids.len() as i64
    };
    if found != unique_count {
        return Err(Error::validation("product_ids contains unknown products"));
    }
    Ok(())
}

async fn replace_product_list(
    conn: &mut PgConnection,
    discount_id: i64,
    product_ids: &[i64],
) -> Result<()> {
    sqlx::query("DELETE FROM discount_products WHERE discount_id = $1")
        .bind(discount_id)
        .execute(&mut *conn)
        .await?;

    let mut ids = product_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    for product_id in ids {
        sqlx::query(
            "INSERT INTO discount_products (discount_id, product_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(discount_id)
        .bind(product_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

impl DiscountService {
    /// All discounts with their product lists, ordered by id. Used both by
    /// the admin listing and by order repricing.
    pub async fn list(conn: &mut PgConnection) -> Result<Vec<Discount>> {
        let rows = sqlx::query_as::<_, DiscountRow>(
            "SELECT id, name, discount_type, value, scope, scope_value, is_active, starts_at, ends_at
             FROM discounts ORDER BY id ASC",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut discounts = Vec::with_capacity(rows.len());
        for row in rows {
            let product_ids = if row.scope == DiscountScope::ProductList {
                load_product_ids(conn, row.id).await?
            } else {
                Vec::new()
            };
            discounts.push(Discount::from_row(row, product_ids));
        }
        Ok(discounts)
    }

    pub async fn list_all(pool: &PgPool) -> Result<Vec<Discount>> {
        let mut conn = pool.acquire().await?;
        Self::list(&mut conn).await
    }

    pub async fn get(conn: &mut PgConnection, discount_id: i64) -> Result<Discount> {
        let row = sqlx::query_as::<_, DiscountRow>(
            "SELECT id, name, discount_type, value, scope, scope_value, is_active, starts_at, ends_at
             FROM discounts WHERE id = $1",
        )
        .bind(discount_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("discount not found"))?;

        let product_ids = load_product_ids(conn, row.id).await?;
        Ok(Discount::from_row(row, product_ids))
    }

    pub async fn create(pool: &PgPool, req: CreateDiscountRequest) -> Result<Discount> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("name is required"));
        }
        let scope_value = req
            .scope_value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        validate_payload(
            req.discount_type,
            req.scope,
            req.value,
            scope_value.as_deref(),
            &req.product_ids,
        )?;

        let mut tx = pool.begin().await?;
        if req.scope == DiscountScope::ProductList {
            assert_products_exist(&mut tx, &req.product_ids).await?;
        }

        let discount_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO discounts (name, discount_type, value, scope, scope_value, is_active, starts_at, ends_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(&name)
        .bind(req.discount_type)
        .bind(req.value)
        .bind(req.scope)
        .bind(&scope_value)
        .bind(req.is_active)
        .bind(req.starts_at)
        .bind(req.ends_at)
        .fetch_one(&mut *tx)
        .await?;

        if req.scope == DiscountScope::ProductList {
            replace_product_list(&mut tx, discount_id, &req.product_ids).await?;
        }

        let discount = Self::get(&mut tx, discount_id).await?;
        tx.commit().await?;
        Ok(discount)
    }

    pub async fn update(
        pool: &PgPool,
        discount_id: i64,
        req: UpdateDiscountRequest,
    ) -> Result<Discount> {
        let mut tx = pool.begin().await?;
        let current = Self::get(&mut tx, discount_id).await?;

        let name = req
            .name
            .map(|n| n.trim().to_string())
            .unwrap_or(current.name);
        let discount_type = req.discount_type.unwrap_or(current.discount_type);
        let value = req.value.unwrap_or(current.value);
        let scope = req.scope.unwrap_or(current.scope);
        let scope_value = match req.scope_value {
            Some(v) => {
                let trimmed = v.trim().to_string();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed)
                }
            }
            // Changing scope away from category/product drops the stale value.
            None if req.scope.is_some() && scope != current.scope => None,
            None => current.scope_value,
        };
        let is_active = req.is_active.unwrap_or(current.is_active);
        let starts_at = req.starts_at.or(current.starts_at);
        let ends_at = req.ends_at.or(current.ends_at);
        let product_ids = req.product_ids.unwrap_or(current.product_ids);

        if name.is_empty() {
            return Err(Error::validation("name is required"));
        }
        validate_payload(
            discount_type,
            scope,
            value,
            scope_value.as_deref(),
            &product_ids,
        )?;

        if scope == DiscountScope::ProductList {
            assert_products_exist(&mut tx, &product_ids).await?;
        }

        sqlx::query(
            "UPDATE discounts
             SET name = $1, discount_type = $2, value = $3, scope = $4, scope_value = $5,
                 is_active = $6, starts_at = $7, ends_at = $8
             WHERE id = $9",
        )
        .bind(&name)
        .bind(discount_type)
        .bind(value)
        .bind(scope)
        .bind(&scope_value)
        .bind(is_active)
        .bind(starts_at)
        .bind(ends_at)
        .bind(discount_id)
        .execute(&mut *tx)
        .await?;

        if scope == DiscountScope::ProductList {
            replace_product_list(&mut tx, discount_id, &product_ids).await?;
        } else {
            sqlx::query("DELETE FROM discount_products WHERE discount_id = $1")
                .bind(discount_id)
                .execute(&mut *tx)
                .await?;
        }

        let discount = Self::get(&mut tx, discount_id).await?;
        tx.commit().await?;
        Ok(discount)
    }

    /// Hard delete; historical order items keep their figures via
    /// `ON DELETE SET NULL`.
    pub async fn delete(pool: &PgPool, discount_id: i64) -> Result<Discount> {
        let mut tx = pool.begin().await?;
        let discount = Self::get(&mut tx, discount_id).await?;
        sqlx::query("DELETE FROM discounts WHERE id = $1")
            .bind(discount_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(discount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_value_bounds() {
        assert!(validate_payload(DiscountType::Percent, DiscountScope::All, dec!(0), None, &[]).is_err());
        assert!(validate_payload(DiscountType::Fixed, DiscountScope::All, dec!(-5), None, &[]).is_err());
        assert!(validate_payload(DiscountType::Percent, DiscountScope::All, dec!(101), None, &[]).is_err());
        assert!(validate_payload(DiscountType::Percent, DiscountScope::All, dec!(100), None, &[]).is_ok());
        assert!(validate_payload(DiscountType::Fixed, DiscountScope::All, dec!(101), None, &[]).is_ok());
    }

    #[test]
    fn test_scope_value_rules() {
        assert!(
            validate_payload(DiscountType::Fixed, DiscountScope::All, dec!(5), Some("x"), &[]).is_err()
        );
        assert!(
            validate_payload(DiscountType::Fixed, DiscountScope::Category, dec!(5), None, &[]).is_err()
        );
        assert!(
            validate_payload(DiscountType::Fixed, DiscountScope::Product, dec!(5), Some(" "), &[])
                .is_err()
        );
        assert!(
            validate_payload(DiscountType::Fixed, DiscountScope::Category, dec!(5), Some("cat"), &[])
                .is_ok()
        );
    }

    #[test]
    fn test_product_list_rules() {
        assert!(validate_payload(
            DiscountType::Fixed,
            DiscountScope::ProductList,
            dec!(5),
            Some("x"),
            &[1]
        )
        .is_err());
        assert!(validate_payload(
            DiscountType::Fixed,
            DiscountScope::ProductList,
            dec!(5),
            None,
            &[]
        )
        .is_err());
        assert!(validate_payload(
            DiscountType::Fixed,
            DiscountScope::ProductList,
            dec!(5),
            None,
            &[1, 2]
        )
        .is_ok());
    }
}
