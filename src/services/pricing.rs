//! Pure pricing rules: discount validity, scope matching, per-line discount
//! selection and order totals. No database access; the order service feeds
//! this module rows it has already loaded and locked.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::models::{Discount, DiscountScope, DiscountType};

/// The product facts pricing needs: id plus its category name.
#[derive(Debug, Clone)]
pub struct PricingProduct {
    pub id: i64,
    pub category: String,
}

/// Result of pricing a single order line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePricing {
    pub discount_id: Option<i64>,
    pub discount_amount: Decimal,
    pub final_unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub total_amount: Decimal,
}

pub fn is_valid_at(discount: &Discount, now: DateTime<Utc>) -> bool {
    if !discount.is_active {
        return false;
    }
    if let Some(starts_at) = discount.starts_at {
        if now < starts_at {
            return false;
        }
    }
    if let Some(ends_at) = discount.ends_at {
        if now > ends_at {
            return false;
        }
    }
    true
}

fn scope_matches(discount: &Discount, product: &PricingProduct) -> bool {
    match discount.scope {
        DiscountScope::All => true,
        DiscountScope::Category => discount
            .scope_value
            .as_deref()
            .map(|value| value.trim() == product.category)
            .unwrap_or(false),
        DiscountScope::Product => discount
            .scope_value
            .as_deref()
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map(|id| id == product.id)
            .unwrap_or(false),
        DiscountScope::ProductList => discount.product_ids.contains(&product.id),
    }
}

/// Discounts valid at `now` whose scope covers `product`.
pub fn applicable_to<'a>(
    product: &PricingProduct,
    discounts: &'a [Discount],
    now: DateTime<Utc>,
) -> Vec<&'a Discount> {
    discounts
        .iter()
        .filter(|discount| is_valid_at(discount, now) && scope_matches(discount, product))
        .collect()
}

/// Per-unit discount amount, clamped to `[0, unit_price]`.
pub fn line_discount(unit_price: Decimal, discount: &Discount) -> Decimal {
    if unit_price <= Decimal::ZERO || discount.value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let amount = match discount.discount_type {
        DiscountType::Percent => unit_price * discount.value / Decimal::from(100),
        DiscountType::Fixed => discount.value,
    };
    amount.max(Decimal::ZERO).min(unit_price)
}

/// The discount producing the largest positive amount for this unit price;
/// ties resolve to the lowest discount id.
pub fn best_discount_for<'a>(
    unit_price: Decimal,
    discounts: &[&'a Discount],
) -> Option<&'a Discount> {
    let mut candidates: Vec<&Discount> = discounts.to_vec();
    candidates.sort_by_key(|d| d.id);

    let mut best: Option<&Discount> = None;
    let mut best_amount = Decimal::ZERO;
    for discount in candidates {
        let amount = line_discount(unit_price, discount);
        if amount > best_amount {
            best = Some(discount);
            best_amount = amount;
        }
    }
    best
}

pub fn recompute_line(
    unit_price: Decimal,
    quantity: i32,
    discount: Option<&Discount>,
) -> Result<LinePricing> {
    if quantity <= 0 {
        return Err(Error::validation("quantity must be greater than 0"));
    }

    let (discount_id, discount_amount) = match discount {
        Some(discount) => (Some(discount.id), line_discount(unit_price, discount)),
        None => (None, Decimal::ZERO),
    };
    let final_unit_price = (unit_price - discount_amount).max(Decimal::ZERO);

    Ok(LinePricing {
        discount_id,
        discount_amount,
        final_unit_price,
        line_total: final_unit_price * Decimal::from(quantity),
    })
}

/// `(unit_price, quantity, discount_amount, line_total)` per item.
pub fn recompute_order_totals(lines: &[(Decimal, i32, Decimal, Decimal)]) -> OrderTotals {
    let mut totals = OrderTotals::default();
    for (unit_price, quantity, discount_amount, line_total) in lines {
        let qty = Decimal::from(*quantity);
        totals.subtotal += *unit_price * qty;
        totals.discount_total += *discount_amount * qty;
        totals.total_amount += *line_total;
    }
    totals
}

pub fn validate_order_pricing_before_submit(item_count: usize, total_amount: Decimal) -> Result<()> {
    if item_count == 0 {
        return Err(Error::validation("cannot submit an empty order"));
    }
    if total_amount < Decimal::ZERO {
        return Err(Error::validation("order total cannot be negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn discount(id: i64, discount_type: DiscountType, value: Decimal, scope: DiscountScope) -> Discount {
        Discount {
            id,
            name: format!("d{id}"),
            discount_type,
            value,
            scope,
            scope_value: None,
            is_active: true,
            starts_at: None,
            ends_at: None,
            product_ids: vec![],
        }
    }

    fn product() -> PricingProduct {
        PricingProduct {
            id: 10,
            category: "electronics".to_string(),
        }
    }

    #[test]
    fn test_percent_and_fixed_line_discount() {
        let percent = discount(1, DiscountType::Percent, dec!(10), DiscountScope::All);
        assert_eq!(line_discount(dec!(100), &percent), dec!(10));

        let fixed = discount(2, DiscountType::Fixed, dec!(15), DiscountScope::All);
        assert_eq!(line_discount(dec!(100), &fixed), dec!(15));
    }

    #[test]
    fn test_line_discount_clamps_to_unit_price() {
        let fixed = discount(1, DiscountType::Fixed, dec!(150), DiscountScope::All);
        assert_eq!(line_discount(dec!(100), &fixed), dec!(100));
        assert_eq!(line_discount(dec!(0), &fixed), dec!(0));
    }

    #[test]
    fn test_best_discount_picks_largest_amount() {
        let small = discount(1, DiscountType::Percent, dec!(5), DiscountScope::All);
        let large = discount(2, DiscountType::Fixed, dec!(20), DiscountScope::All);
        let best = best_discount_for(dec!(100), &[&small, &large]).unwrap();
        assert_eq!(best.id, 2);
    }

    #[test]
    fn test_best_discount_tie_breaks_on_lowest_id() {
        let a = discount(7, DiscountType::Fixed, dec!(10), DiscountScope::All);
        let b = discount(3, DiscountType::Percent, dec!(10), DiscountScope::All);
        // Both produce 10 on a 100 unit price.
        let best = best_discount_for(dec!(100), &[&a, &b]).unwrap();
        assert_eq!(best.id, 3);
    }

    #[test]
    fn test_best_discount_ignores_zero_amounts() {
        let zero = discount(1, DiscountType::Percent, dec!(10), DiscountScope::All);
        assert!(best_discount_for(dec!(0), &[&zero]).is_none());
        assert!(best_discount_for(dec!(100), &[]).is_none());
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let mut d = discount(1, DiscountType::Percent, dec!(10), DiscountScope::All);
        assert!(is_valid_at(&d, now));

        d.is_active = false;
        assert!(!is_valid_at(&d, now));

        d.is_active = true;
        d.starts_at = Some(now + Duration::hours(1));
        assert!(!is_valid_at(&d, now));

        d.starts_at = Some(now - Duration::hours(1));
        d.ends_at = Some(now - Duration::minutes(1));
        assert!(!is_valid_at(&d, now));

        d.ends_at = Some(now + Duration::hours(1));
        assert!(is_valid_at(&d, now));
    }

    #[test]
    fn test_scope_matching() {
        let now = Utc::now();
        let all = discount(1, DiscountType::Percent, dec!(10), DiscountScope::All);

        let mut category = discount(2, DiscountType::Percent, dec!(10), DiscountScope::Category);
        category.scope_value = Some("electronics".to_string());

        let mut other_category = category.clone();
        other_category.id = 3;
        other_category.scope_value = Some("furniture".to_string());

        let mut by_product = discount(4, DiscountType::Percent, dec!(10), DiscountScope::Product);
        by_product.scope_value = Some("10".to_string());

        let mut by_list = discount(5, DiscountType::Percent, dec!(10), DiscountScope::ProductList);
        by_list.product_ids = vec![9, 10, 11];

        let mut other_list = by_list.clone();
        other_list.id = 6;
        other_list.product_ids = vec![1, 2];

        let discounts = vec![all, category, other_category, by_product, by_list, other_list];
        let applicable = applicable_to(&product(), &discounts, now);
        let ids: Vec<i64> = applicable.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_recompute_line() {
        let d = discount(1, DiscountType::Percent, dec!(25), DiscountScope::All);
        let pricing = recompute_line(dec!(100), 3, Some(&d)).unwrap();
        assert_eq!(pricing.discount_id, Some(1));
        assert_eq!(pricing.discount_amount, dec!(25));
        assert_eq!(pricing.final_unit_price, dec!(75));
        assert_eq!(pricing.line_total, dec!(225));

        let no_discount = recompute_line(dec!(100), 2, None).unwrap();
        assert_eq!(no_discount.discount_id, None);
        assert_eq!(no_discount.line_total, dec!(200));
    }

    #[test]
    fn test_recompute_line_rejects_non_positive_quantity() {
        assert!(recompute_line(dec!(100), 0, None).is_err());
        assert!(recompute_line(dec!(100), -1, None).is_err());
    }

    #[test]
    fn test_order_totals() {
        let lines = vec![
            (dec!(100), 2, dec!(10), dec!(180)),
            (dec!(50), 1, dec!(0), dec!(50)),
        ];
        let totals = recompute_order_totals(&lines);
        assert_eq!(totals.subtotal, dec!(250));
        assert_eq!(totals.discount_total, dec!(20));
        assert_eq!(totals.total_amount, dec!(230));
    }

    #[test]
    fn test_submit_validation() {
        assert!(validate_order_pricing_before_submit(0, dec!(10)).is_err());
        assert!(validate_order_pricing_before_submit(1, dec!(-1)).is_err());
        assert!(validate_order_pricing_before_submit(1, dec!(0)).is_ok());
    }
}
