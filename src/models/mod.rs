//! Data models for coupons, redemptions and validation results

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{CouponError, CouponResult, Rejection};

/// How a coupon's `discount_value` is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    /// `discount_value` is in percentage points of the order amount
    Percentage,
    /// `discount_value` is a currency amount taken off the order
    FixedAmount,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::FixedAmount => "fixed_amount",
        }
    }
}

impl fmt::Display for DiscountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscountKind {
    type Err = CouponError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(Self::Percentage),
            "fixed_amount" => Ok(Self::FixedAmount),
            other => Err(CouponError::Corrupt(format!("unknown discount kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    Active,
    Inactive,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CouponStatus {
    type Err = CouponError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(CouponError::Corrupt(format!("unknown coupon status '{other}'"))),
        }
    }
}

/// A stored discount rule, looked up by its code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    pub discount_kind: DiscountKind,
    pub discount_value: Decimal,
    pub minimum_order_amount: Option<Decimal>,
    /// Only honoured for percentage coupons
    pub maximum_discount_amount: Option<Decimal>,
    pub usage_limit: i64,
    pub used_count: i64,
    pub per_user_limit: Option<i64>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: CouponStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    /// Builds the stored form of a freshly created coupon.
    pub fn from_new(id: i64, new: NewCoupon, now: DateTime<Utc>) -> Self {
        Self {
            id,
            code: new.code,
            discount_kind: new.discount_kind,
            discount_value: new.discount_value,
            minimum_order_amount: new.minimum_order_amount,
            maximum_discount_amount: new.maximum_discount_amount,
            usage_limit: new.usage_limit,
            used_count: 0,
            per_user_limit: new.per_user_limit,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
            status: CouponStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Payload for creating a coupon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCoupon {
    pub code: String,
    pub discount_kind: DiscountKind,
    pub discount_value: Decimal,
    pub minimum_order_amount: Option<Decimal>,
    pub maximum_discount_amount: Option<Decimal>,
    pub usage_limit: i64,
    pub per_user_limit: Option<i64>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl NewCoupon {
    /// Checks the payload and normalizes the code.
    pub fn validate(mut self) -> CouponResult<Self> {
        self.code = normalize_code(&self.code)?;

        if self.discount_value <= Decimal::ZERO {
            return Err(invalid("discount value must be greater than 0"));
        }
        if self.discount_kind == DiscountKind::Percentage
            && self.discount_value > Decimal::ONE_HUNDRED
        {
            return Err(invalid("percentage discount cannot exceed 100"));
        }
        if self
            .minimum_order_amount
            .is_some_and(|min| min < Decimal::ZERO)
        {
            return Err(invalid("minimum order amount cannot be negative"));
        }
        if self
            .maximum_discount_amount
            .is_some_and(|cap| cap <= Decimal::ZERO)
        {
            return Err(invalid("maximum discount amount must be greater than 0"));
        }
        if self.usage_limit < 1 {
            return Err(invalid("usage limit must be at least 1"));
        }
        if self.per_user_limit.is_some_and(|limit| limit < 1) {
            return Err(invalid("per-user limit must be at least 1"));
        }
        if self.valid_from > self.valid_until {
            return Err(invalid("valid_from must not be after valid_until"));
        }

        Ok(self)
    }
}

/// One successful application of a coupon to an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: i64,
    pub coupon_id: i64,
    pub code: String,
    pub user_id: String,
    pub order_amount: Decimal,
    pub discount_amount: Decimal,
    pub redeemed_at: DateTime<Utc>,
}

/// Outcome of validating a coupon against an order without applying it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponCheck {
    pub code: String,
    pub valid: bool,
    /// Zero whenever `valid` is false
    pub discount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl CouponCheck {
    pub fn accepted(code: impl Into<String>, discount: Decimal) -> Self {
        Self {
            code: code.into(),
            valid: true,
            discount,
            rejection: None,
        }
    }

    pub fn rejected(code: impl Into<String>, reason: Rejection) -> Self {
        Self {
            code: code.into(),
            valid: false,
            discount: Decimal::ZERO,
            rejection: Some(reason),
        }
    }
}

/// Canonical form of a coupon code: trimmed and upper-cased.
pub fn normalize_code(code: &str) -> CouponResult<String> {
    let code = code.trim();
    if code.is_empty() {
        return Err(invalid("coupon code must not be empty"));
    }
    Ok(code.to_uppercase())
}

fn invalid(message: &str) -> CouponError {
    CouponError::InvalidInput(message.to_string())
}
