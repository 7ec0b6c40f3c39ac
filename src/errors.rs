//! Error and rejection types shared by the rules, stores and service

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Business reason a coupon cannot be applied to an order.
///
/// A rejection is an expected outcome, not a fault: validation reports it
/// inside a [`crate::models::CouponCheck`], application wraps it in
/// [`CouponError::Rejected`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("coupon not found")]
    NotFound,

    #[error("coupon is inactive")]
    Inactive,

    #[error("coupon is not valid until {valid_from}")]
    NotYetValid { valid_from: DateTime<Utc> },

    #[error("coupon expired at {valid_until}")]
    Expired { valid_until: DateTime<Utc> },

    #[error("coupon usage limit reached ({used}/{limit})")]
    UsageLimitReached { used: i64, limit: i64 },

    #[error("coupon already used {used} of {limit} allowed times by this user")]
    UserLimitReached { used: i64, limit: i64 },

    #[error("order amount {order_amount} is below the minimum of {minimum}")]
    BelowMinimum {
        minimum: Decimal,
        order_amount: Decimal,
    },
}

#[derive(Error, Debug)]
pub enum CouponError {
    #[error("coupon rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("coupon code already exists: {0}")]
    DuplicateCode(String),

    #[error("corrupt coupon record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CouponError {
    /// The business rejection behind this error, if it is one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

pub type CouponResult<T> = Result<T, CouponError>;
