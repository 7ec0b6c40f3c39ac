//! Coupon applicability checks and discount arithmetic.
//!
//! Everything here is pure: callers supply the coupon, the order amount, the
//! user's prior redemptions and the instant to judge against. Both stores
//! run the same checks so validation and application can never disagree.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::errors::{CouponError, CouponResult, Rejection};
use crate::models::{Coupon, CouponStatus, DiscountKind};

/// Currency amounts are kept to two decimal places
const MONEY_SCALE: u32 = 2;

/// Largest order amount accepted by validation and application (10^15)
pub const MAX_ORDER_AMOUNT: Decimal = Decimal::from_parts(0xA4C6_8000, 0x0003_8D7E, 0, false, 0);

/// Discount the coupon grants on `order_amount`, ignoring applicability.
///
/// The raw amount is rounded to cents first and capped afterwards, so the
/// result never exceeds `maximum_discount_amount` (percentage coupons only)
/// or the order amount, whatever their scale.
pub fn discount_for(coupon: &Coupon, order_amount: Decimal) -> Decimal {
    let raw = match coupon.discount_kind {
        // A result too large to represent is capped by the order anyway
        DiscountKind::Percentage => order_amount
            .checked_div(Decimal::ONE_HUNDRED)
            .and_then(|share| share.checked_mul(coupon.discount_value))
            .unwrap_or(order_amount),
        DiscountKind::FixedAmount => coupon.discount_value,
    };

    let mut discount =
        raw.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    if coupon.discount_kind == DiscountKind::Percentage
        && let Some(cap) = coupon.maximum_discount_amount
    {
        discount = discount.min(cap);
    }

    discount.min(order_amount).max(Decimal::ZERO)
}

/// Decides whether `coupon` may be applied and, if so, for how much.
///
/// Checks run in a fixed order so the reported reason is stable: status,
/// window start, window end, total usage, per-user usage, minimum amount.
pub fn evaluate(
    coupon: &Coupon,
    order_amount: Decimal,
    user_redemptions: i64,
    now: DateTime<Utc>,
) -> Result<Decimal, Rejection> {
    if coupon.status != CouponStatus::Active {
        return Err(Rejection::Inactive);
    }
    if now < coupon.valid_from {
        return Err(Rejection::NotYetValid {
            valid_from: coupon.valid_from,
        });
    }
    if now > coupon.valid_until {
        return Err(Rejection::Expired {
            valid_until: coupon.valid_until,
        });
    }
    if coupon.used_count >= coupon.usage_limit {
        return Err(Rejection::UsageLimitReached {
            used: coupon.used_count,
            limit: coupon.usage_limit,
        });
    }
    if let Some(limit) = coupon.per_user_limit
        && user_redemptions >= limit
    {
        return Err(Rejection::UserLimitReached {
            used: user_redemptions,
            limit,
        });
    }
    if let Some(minimum) = coupon.minimum_order_amount
        && order_amount < minimum
    {
        return Err(Rejection::BelowMinimum {
            minimum,
            order_amount,
        });
    }

    Ok(discount_for(coupon, order_amount))
}

/// True when the coupon's window closed before `now`.
pub fn is_expired(coupon: &Coupon, now: DateTime<Utc>) -> bool {
    now > coupon.valid_until
}

/// Input checks shared by validation and application.
pub fn check_order_amount(order_amount: Decimal) -> CouponResult<()> {
    if order_amount < Decimal::ZERO {
        return Err(CouponError::InvalidInput(format!(
            "order amount cannot be negative: {order_amount}"
        )));
    }
    if order_amount > MAX_ORDER_AMOUNT {
        return Err(CouponError::InvalidInput(format!(
            "order amount {order_amount} exceeds the maximum of {MAX_ORDER_AMOUNT}"
        )));
    }
    Ok(())
}

pub fn check_user_id(user_id: &str) -> CouponResult<()> {
    if user_id.trim().is_empty() {
        return Err(CouponError::InvalidInput(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(())
}
