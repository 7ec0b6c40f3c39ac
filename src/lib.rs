//! Coupon ledger: percentage and fixed-amount coupons with validity windows,
//! usage limits and atomic redemption, backed by SQLite or memory.

pub mod config;
pub mod coupon_service;
pub mod database;
pub mod errors;
pub mod memory;
pub mod models;
pub mod rules;
pub mod traits;

pub use coupon_service::CouponService;
pub use database::Database;
pub use errors::{CouponError, CouponResult, Rejection};
pub use memory::MemoryStore;
pub use models::{Coupon, CouponCheck, CouponStatus, DiscountKind, NewCoupon, Redemption};
pub use traits::CouponStore;
