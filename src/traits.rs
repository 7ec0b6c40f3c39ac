//! Storage interface for coupons and their redemptions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::errors::CouponResult;
use crate::models::{Coupon, CouponStatus, NewCoupon, Redemption};

/// Trait for coupon backends
///
/// Codes passed in are already normalized by the caller.
#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Persist a validated coupon as `active` with zero uses
    ///
    /// # Errors
    /// * `CouponError::DuplicateCode` if the code is taken
    async fn insert(&self, coupon: NewCoupon, now: DateTime<Utc>) -> CouponResult<Coupon>;

    async fn find_by_code(&self, code: &str) -> CouponResult<Option<Coupon>>;

    /// All coupons ordered by code
    async fn list(&self) -> CouponResult<Vec<Coupon>>;

    /// # Errors
    /// * `Rejection::NotFound` if no coupon has this code
    async fn set_status(
        &self,
        code: &str,
        status: CouponStatus,
        now: DateTime<Utc>,
    ) -> CouponResult<Coupon>;

    /// How many times `user_id` has redeemed the coupon
    async fn user_redemption_count(&self, coupon_id: i64, user_id: &str) -> CouponResult<i64>;

    /// Validate and record one use of the coupon as a single atomic step
    ///
    /// Implementations must guarantee that concurrent calls never push
    /// `used_count` past `usage_limit`, and that a rejected call changes
    /// nothing.
    ///
    /// # Returns
    /// * `CouponResult<Redemption>` - The recorded redemption, or
    ///   `CouponError::Rejected` with the reason it was refused
    async fn redeem(
        &self,
        code: &str,
        user_id: &str,
        order_amount: Decimal,
        now: DateTime<Utc>,
    ) -> CouponResult<Redemption>;

    /// Redemptions of one coupon, oldest first
    async fn redemptions(&self, code: &str) -> CouponResult<Vec<Redemption>>;

    /// Mark every active coupon whose window has closed as inactive
    ///
    /// # Returns
    /// * `CouponResult<Vec<String>>` - Codes that were deactivated
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> CouponResult<Vec<String>>;
}
