//! In-process coupon store
//!
//! Holds every coupon and redemption behind a single `RwLock`. `redeem`
//! keeps the write lock across check, increment and append, which makes it
//! atomic with respect to every other caller.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::errors::{CouponError, CouponResult, Rejection};
use crate::models::{Coupon, CouponStatus, NewCoupon, Redemption};
use crate::rules;
use crate::traits::CouponStore;

#[derive(Default)]
struct Ledger {
    coupons: HashMap<String, Coupon>,
    redemptions: Vec<Redemption>,
    next_coupon_id: i64,
}

impl Ledger {
    fn user_uses(&self, coupon_id: i64, user_id: &str) -> i64 {
        self.redemptions
            .iter()
            .filter(|r| r.coupon_id == coupon_id && r.user_id == user_id)
            .count() as i64
    }
}

#[derive(Default)]
pub struct MemoryStore {
    ledger: RwLock<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CouponStore for MemoryStore {
    async fn insert(&self, coupon: NewCoupon, now: DateTime<Utc>) -> CouponResult<Coupon> {
        let mut ledger = self.ledger.write().await;

        if ledger.coupons.contains_key(&coupon.code) {
            return Err(CouponError::DuplicateCode(coupon.code));
        }

        ledger.next_coupon_id += 1;
        let stored = Coupon::from_new(ledger.next_coupon_id, coupon, now);
        ledger.coupons.insert(stored.code.clone(), stored.clone());

        Ok(stored)
    }

    async fn find_by_code(&self, code: &str) -> CouponResult<Option<Coupon>> {
        Ok(self.ledger.read().await.coupons.get(code).cloned())
    }

    async fn list(&self) -> CouponResult<Vec<Coupon>> {
        let mut coupons: Vec<Coupon> = self.ledger.read().await.coupons.values().cloned().collect();
        coupons.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(coupons)
    }

    async fn set_status(
        &self,
        code: &str,
        status: CouponStatus,
        now: DateTime<Utc>,
    ) -> CouponResult<Coupon> {
        let mut ledger = self.ledger.write().await;
        let coupon = ledger.coupons.get_mut(code).ok_or(Rejection::NotFound)?;

        coupon.status = status;
        coupon.updated_at = now;

        Ok(coupon.clone())
    }

    async fn user_redemption_count(&self, coupon_id: i64, user_id: &str) -> CouponResult<i64> {
        Ok(self.ledger.read().await.user_uses(coupon_id, user_id))
    }

    async fn redeem(
        &self,
        code: &str,
        user_id: &str,
        order_amount: Decimal,
        now: DateTime<Utc>,
    ) -> CouponResult<Redemption> {
        let mut guard = self.ledger.write().await;
        let ledger = &mut *guard;

        let snapshot = ledger.coupons.get(code).ok_or(Rejection::NotFound)?;
        let user_uses = ledger.user_uses(snapshot.id, user_id);
        let discount = rules::evaluate(snapshot, order_amount, user_uses, now)?;

        let coupon = ledger.coupons.get_mut(code).ok_or(Rejection::NotFound)?;
        coupon.used_count += 1;
        coupon.updated_at = now;

        let redemption = Redemption {
            id: ledger.redemptions.len() as i64 + 1,
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            user_id: user_id.to_string(),
            order_amount,
            discount_amount: discount,
            redeemed_at: now,
        };
        ledger.redemptions.push(redemption.clone());

        Ok(redemption)
    }

    async fn redemptions(&self, code: &str) -> CouponResult<Vec<Redemption>> {
        let ledger = self.ledger.read().await;
        let mut redemptions: Vec<Redemption> = ledger
            .redemptions
            .iter()
            .filter(|r| r.code == code)
            .cloned()
            .collect();
        redemptions.sort_by_key(|r| (r.redeemed_at, r.id));
        Ok(redemptions)
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> CouponResult<Vec<String>> {
        let mut ledger = self.ledger.write().await;

        let mut expired: Vec<String> = ledger
            .coupons
            .values_mut()
            .filter(|c| c.status == CouponStatus::Active && rules::is_expired(c, now))
            .map(|c| {
                c.status = CouponStatus::Inactive;
                c.updated_at = now;
                c.code.clone()
            })
            .collect();
        expired.sort();

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscountKind;
    use chrono::Duration;

    fn fixed_coupon(code: &str, limit: i64) -> NewCoupon {
        let now = Utc::now();
        NewCoupon {
            code: code.to_string(),
            discount_kind: DiscountKind::FixedAmount,
            discount_value: Decimal::from(10),
            minimum_order_amount: None,
            maximum_discount_amount: None,
            usage_limit: limit,
            per_user_limit: None,
            valid_from: now - Duration::hours(1),
            valid_until: now + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_code() {
        let store = MemoryStore::new();
        store.insert(fixed_coupon("TEN", 1), Utc::now()).await.unwrap();

        let err = store.insert(fixed_coupon("TEN", 1), Utc::now()).await.unwrap_err();
        assert!(matches!(err, CouponError::DuplicateCode(code) if code == "TEN"));
    }

    #[tokio::test]
    async fn redeem_increments_and_records() {
        let store = MemoryStore::new();
        store.insert(fixed_coupon("TEN", 2), Utc::now()).await.unwrap();

        let redemption = store
            .redeem("TEN", "alice", Decimal::from(50), Utc::now())
            .await
            .unwrap();
        assert_eq!(redemption.discount_amount, Decimal::from(10));

        let coupon = store.find_by_code("TEN").await.unwrap().unwrap();
        assert_eq!(coupon.used_count, 1);
        assert_eq!(store.redemptions("TEN").await.unwrap().len(), 1);
        assert_eq!(store.user_redemption_count(coupon.id, "alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejected_redeem_changes_nothing() {
        let store = MemoryStore::new();
        store.insert(fixed_coupon("TEN", 1), Utc::now()).await.unwrap();
        store
            .redeem("TEN", "alice", Decimal::from(50), Utc::now())
            .await
            .unwrap();

        let err = store
            .redeem("TEN", "bob", Decimal::from(50), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&Rejection::UsageLimitReached { used: 1, limit: 1 })
        );

        let coupon = store.find_by_code("TEN").await.unwrap().unwrap();
        assert_eq!(coupon.used_count, 1);
        assert_eq!(store.redemptions("TEN").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deactivate_expired_only_touches_closed_windows() {
        let store = MemoryStore::new();
        store.insert(fixed_coupon("OLD", 1), Utc::now()).await.unwrap();
        store.insert(fixed_coupon("NEW", 1), Utc::now()).await.unwrap();

        let later = Utc::now() + Duration::hours(2);
        // NEW's window also closed by `later`, so move it forward first
        {
            let mut ledger = store.ledger.write().await;
            if let Some(c) = ledger.coupons.get_mut("NEW") {
                c.valid_until = later + Duration::days(1);
            }
        }

        let expired = store.deactivate_expired(later).await.unwrap();
        assert_eq!(expired, vec!["OLD".to_string()]);

        let old = store.find_by_code("OLD").await.unwrap().unwrap();
        assert_eq!(old.status, CouponStatus::Inactive);
        assert!(store.deactivate_expired(later).await.unwrap().is_empty());
    }
}
