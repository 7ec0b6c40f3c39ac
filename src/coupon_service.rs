use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::errors::{CouponError, CouponResult, Rejection};
use crate::models::{Coupon, CouponCheck, CouponStatus, NewCoupon, Redemption, normalize_code};
use crate::rules;
use crate::traits::CouponStore;

/// Entry point for creating, checking and redeeming coupons.
///
/// Codes are normalized here so stores only ever see the canonical form.
/// The `*_at` variants take the instant to judge against; the plain ones
/// use the current time.
#[derive(Clone)]
pub struct CouponService {
    store: Arc<dyn CouponStore>,
}

impl CouponService {
    pub fn new(store: Arc<dyn CouponStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, coupon: NewCoupon) -> CouponResult<Coupon> {
        let coupon = coupon.validate()?;
        let created = self.store.insert(coupon, Utc::now()).await?;

        info!(
            "Created coupon {} ({} {}, limit {})",
            created.code, created.discount_kind, created.discount_value, created.usage_limit
        );
        Ok(created)
    }

    pub async fn get(&self, code: &str) -> CouponResult<Coupon> {
        let code = normalize_code(code)?;
        self.store
            .find_by_code(&code)
            .await?
            .ok_or_else(|| Rejection::NotFound.into())
    }

    pub async fn list(&self) -> CouponResult<Vec<Coupon>> {
        self.store.list().await
    }

    pub async fn validate(
        &self,
        code: &str,
        user_id: &str,
        order_amount: Decimal,
    ) -> CouponResult<CouponCheck> {
        self.validate_at(code, user_id, order_amount, Utc::now())
            .await
    }

    /// Reports whether the coupon could be applied, without changing anything.
    ///
    /// Business rejections come back inside the `CouponCheck`; only bad
    /// input and storage failures are errors.
    pub async fn validate_at(
        &self,
        code: &str,
        user_id: &str,
        order_amount: Decimal,
        now: DateTime<Utc>,
    ) -> CouponResult<CouponCheck> {
        let code = normalize_code(code)?;
        rules::check_user_id(user_id)?;
        rules::check_order_amount(order_amount)?;

        let Some(coupon) = self.store.find_by_code(&code).await? else {
            return Ok(CouponCheck::rejected(code, Rejection::NotFound));
        };

        let user_uses = if coupon.per_user_limit.is_some() {
            self.store.user_redemption_count(coupon.id, user_id).await?
        } else {
            0
        };

        Ok(match rules::evaluate(&coupon, order_amount, user_uses, now) {
            Ok(discount) => CouponCheck::accepted(code, discount),
            Err(reason) => CouponCheck::rejected(code, reason),
        })
    }

    pub async fn apply(
        &self,
        code: &str,
        user_id: &str,
        order_amount: Decimal,
    ) -> CouponResult<Redemption> {
        self.apply_at(code, user_id, order_amount, Utc::now()).await
    }

    /// Validates and redeems in one atomic store operation.
    ///
    /// # Errors
    /// * `CouponError::Rejected` with the specific reason; state is unchanged
    /// * `CouponError::InvalidInput` for an empty code or user, or an amount
    ///   outside `0..=rules::MAX_ORDER_AMOUNT`
    pub async fn apply_at(
        &self,
        code: &str,
        user_id: &str,
        order_amount: Decimal,
        now: DateTime<Utc>,
    ) -> CouponResult<Redemption> {
        let code = normalize_code(code)?;
        rules::check_user_id(user_id)?;
        rules::check_order_amount(order_amount)?;

        match self.store.redeem(&code, user_id, order_amount, now).await {
            Ok(redemption) => {
                info!(
                    "Applied coupon {} for user {}: discount {} on {}",
                    redemption.code, user_id, redemption.discount_amount, order_amount
                );
                Ok(redemption)
            }
            Err(CouponError::Rejected(reason)) => {
                info!("Rejected coupon {} for user {}: {}", code, user_id, reason);
                Err(CouponError::Rejected(reason))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn activate(&self, code: &str) -> CouponResult<Coupon> {
        self.set_status(code, CouponStatus::Active).await
    }

    pub async fn deactivate(&self, code: &str) -> CouponResult<Coupon> {
        self.set_status(code, CouponStatus::Inactive).await
    }

    async fn set_status(&self, code: &str, status: CouponStatus) -> CouponResult<Coupon> {
        let code = normalize_code(code)?;
        let coupon = self.store.set_status(&code, status, Utc::now()).await?;

        info!("Coupon {} is now {}", coupon.code, coupon.status);
        Ok(coupon)
    }

    pub async fn redemptions(&self, code: &str) -> CouponResult<Vec<Redemption>> {
        let code = normalize_code(code)?;
        if self.store.find_by_code(&code).await?.is_none() {
            return Err(Rejection::NotFound.into());
        }
        self.store.redemptions(&code).await
    }

    pub async fn sweep_expired(&self) -> CouponResult<Vec<String>> {
        self.sweep_expired_at(Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> CouponResult<Vec<String>> {
        let expired = self.store.deactivate_expired(now).await?;

        if expired.is_empty() {
            info!("No expired coupons found");
        } else {
            info!("Deactivated {} expired coupons: {}", expired.len(), expired.join(", "));
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::DiscountKind;
    use chrono::Duration;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn service() -> CouponService {
        CouponService::new(Arc::new(MemoryStore::new()))
    }

    fn spring_sale() -> NewCoupon {
        let now = Utc::now();
        NewCoupon {
            code: "spring20".to_string(),
            discount_kind: DiscountKind::Percentage,
            discount_value: dec("20"),
            minimum_order_amount: Some(dec("100")),
            maximum_discount_amount: Some(dec("30")),
            usage_limit: 3,
            per_user_limit: None,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
        }
    }

    #[tokio::test]
    async fn validate_reports_capped_discount_without_mutating() {
        let service = service();
        service.create(spring_sale()).await.unwrap();

        let check = service.validate("SPRING20", "alice", dec("200")).await.unwrap();
        assert!(check.valid);
        assert_eq!(check.discount, dec("30"));

        let coupon = service.get("spring20").await.unwrap();
        assert_eq!(coupon.used_count, 0);
    }

    #[tokio::test]
    async fn validate_below_minimum_is_invalid() {
        let service = service();
        service.create(spring_sale()).await.unwrap();

        let check = service.validate("spring20", "alice", dec("50")).await.unwrap();
        assert!(!check.valid);
        assert_eq!(check.discount, Decimal::ZERO);
        assert!(matches!(check.rejection, Some(Rejection::BelowMinimum { .. })));
    }

    #[tokio::test]
    async fn validate_unknown_code_is_not_found() {
        let check = service().validate("nope", "alice", dec("10")).await.unwrap();
        assert_eq!(check.rejection, Some(Rejection::NotFound));
    }

    #[tokio::test]
    async fn malformed_input_is_an_error() {
        let service = service();
        service.create(spring_sale()).await.unwrap();

        assert!(matches!(
            service.validate("", "alice", dec("10")).await,
            Err(CouponError::InvalidInput(_))
        ));
        assert!(matches!(
            service.apply("spring20", "alice", dec("-1")).await,
            Err(CouponError::InvalidInput(_))
        ));
        assert!(matches!(
            service.apply("spring20", " ", dec("150")).await,
            Err(CouponError::InvalidInput(_))
        ));
        assert!(matches!(
            service.validate("spring20", "alice", Decimal::MAX).await,
            Err(CouponError::InvalidInput(_))
        ));
        assert!(matches!(
            service.apply("spring20", "alice", Decimal::MAX).await,
            Err(CouponError::InvalidInput(_))
        ));
        assert_eq!(service.get("spring20").await.unwrap().used_count, 0);
    }

    #[tokio::test]
    async fn concurrent_applies_respect_per_user_limit() {
        let service = service();
        let mut coupon = spring_sale();
        coupon.per_user_limit = Some(1);
        service.create(coupon).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.apply("spring20", "alice", dec("150")).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert!(matches!(e.rejection(), Some(Rejection::UserLimitReached { .. }))),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(service.get("spring20").await.unwrap().used_count, 1);
    }

    #[tokio::test]
    async fn apply_until_exhausted() {
        let service = service();
        service.create(spring_sale()).await.unwrap();

        for user in ["a", "b", "c"] {
            let redemption = service.apply("spring20", user, dec("150")).await.unwrap();
            assert_eq!(redemption.discount_amount, dec("30"));
        }

        let err = service.apply("spring20", "d", dec("150")).await.unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&Rejection::UsageLimitReached { used: 3, limit: 3 })
        );

        let check = service.validate("spring20", "d", dec("150")).await.unwrap();
        assert!(!check.valid);
        assert_eq!(service.redemptions("spring20").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn per_user_limit_applies_per_user() {
        let service = service();
        let mut coupon = spring_sale();
        coupon.per_user_limit = Some(1);
        service.create(coupon).await.unwrap();

        service.apply("spring20", "alice", dec("150")).await.unwrap();
        let err = service.apply("spring20", "alice", dec("150")).await.unwrap_err();
        assert!(matches!(err.rejection(), Some(Rejection::UserLimitReached { .. })));

        let check = service.validate("spring20", "alice", dec("150")).await.unwrap();
        assert!(!check.valid);
        assert!(service.apply("spring20", "bob", dec("150")).await.is_ok());
    }

    #[tokio::test]
    async fn window_is_enforced_on_apply() {
        let service = service();
        let coupon = service.create(spring_sale()).await.unwrap();

        let early = coupon.valid_from - Duration::seconds(1);
        let err = service
            .apply_at("spring20", "alice", dec("150"), early)
            .await
            .unwrap_err();
        assert!(matches!(err.rejection(), Some(Rejection::NotYetValid { .. })));

        let late = coupon.valid_until + Duration::seconds(1);
        let check = service
            .validate_at("spring20", "alice", dec("150"), late)
            .await
            .unwrap();
        assert!(matches!(check.rejection, Some(Rejection::Expired { .. })));

        assert_eq!(service.get("spring20").await.unwrap().used_count, 0);
    }

    #[tokio::test]
    async fn deactivate_then_activate() {
        let service = service();
        service.create(spring_sale()).await.unwrap();

        service.deactivate("spring20").await.unwrap();
        let err = service.apply("spring20", "alice", dec("150")).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::Inactive));

        service.activate("spring20").await.unwrap();
        assert!(service.apply("spring20", "alice", dec("150")).await.is_ok());

        assert!(matches!(
            service.deactivate("missing").await.unwrap_err().rejection(),
            Some(Rejection::NotFound)
        ));
    }

    #[tokio::test]
    async fn concurrent_applies_never_over_redeem() {
        let service = service();
        service.create(spring_sale()).await.unwrap();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .apply("spring20", &format!("user-{i}"), dec("150"))
                        .await
                })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 3);
        assert_eq!(service.get("spring20").await.unwrap().used_count, 3);
    }

    #[tokio::test]
    async fn sweep_deactivates_expired() {
        let service = service();
        let coupon = service.create(spring_sale()).await.unwrap();

        assert!(service.sweep_expired().await.unwrap().is_empty());

        let after = coupon.valid_until + Duration::seconds(1);
        let expired = service.sweep_expired_at(after).await.unwrap();
        assert_eq!(expired, vec!["SPRING20".to_string()]);
        assert_eq!(
            service.get("spring20").await.unwrap().status,
            CouponStatus::Inactive
        );
    }
}
