use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, migrate::MigrateDatabase};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::errors::{CouponError, CouponResult, Rejection};
use crate::models::{Coupon, CouponStatus, NewCoupon, Redemption};
use crate::rules;
use crate::traits::CouponStore;

macro_rules! select_coupons {
    ($tail:literal) => {
        concat!(
            "SELECT id, code, discount_kind, discount_value, minimum_order_amount, ",
            "maximum_discount_amount, usage_limit, used_count, per_user_limit, ",
            "valid_from, valid_until, status, created_at, updated_at FROM coupons ",
            $tail
        )
    };
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str, max_connections: u32) -> CouponResult<Self> {
        // Create database file if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            if let Some(parent) = sqlite_file_path(db_url).and_then(|p| p.parent().map(PathBuf::from))
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(&parent)?;
            }
            info!("Creating database file");
            Sqlite::create_database(db_url).await?;
        }

        // Concurrent redemptions queue on the write lock instead of failing
        let options = SqliteConnectOptions::from_str(db_url)?.busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database, mainly for tests.
    ///
    /// Every SQLite memory connection is its own database, so the pool is
    /// pinned to one connection that is never recycled.
    pub async fn in_memory() -> CouponResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> CouponResult<Self> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized successfully");
        Ok(Self { pool })
    }

    async fn fetch_coupon(
        conn: &mut SqliteConnection,
        code: &str,
    ) -> CouponResult<Option<Coupon>> {
        let row = sqlx::query_as::<_, CouponRow>(select_coupons!("WHERE code = ?"))
            .bind(code)
            .fetch_optional(conn)
            .await?;

        row.map(Coupon::try_from).transpose()
    }
}

#[async_trait]
impl CouponStore for Database {
    async fn insert(&self, coupon: NewCoupon, now: DateTime<Utc>) -> CouponResult<Coupon> {
        let result = sqlx::query(
            r"
            INSERT INTO coupons (code, discount_kind, discount_value, minimum_order_amount,
                maximum_discount_amount, usage_limit, used_count, per_user_limit,
                valid_from, valid_until, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&coupon.code)
        .bind(coupon.discount_kind.as_str())
        .bind(coupon.discount_value.to_string())
        .bind(coupon.minimum_order_amount.map(|d| d.to_string()))
        .bind(coupon.maximum_discount_amount.map(|d| d.to_string()))
        .bind(coupon.usage_limit)
        .bind(coupon.per_user_limit)
        .bind(coupon.valid_from)
        .bind(coupon.valid_until)
        .bind(CouponStatus::Active.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Coupon::from_new(done.last_insert_rowid(), coupon, now)),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CouponError::DuplicateCode(coupon.code))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_code(&self, code: &str) -> CouponResult<Option<Coupon>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_coupon(&mut conn, code).await
    }

    async fn list(&self) -> CouponResult<Vec<Coupon>> {
        let rows = sqlx::query_as::<_, CouponRow>(select_coupons!("ORDER BY code"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Coupon::try_from).collect()
    }

    async fn set_status(
        &self,
        code: &str,
        status: CouponStatus,
        now: DateTime<Utc>,
    ) -> CouponResult<Coupon> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE coupons SET status = ?, updated_at = ? WHERE code = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(code)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(Rejection::NotFound.into());
        }

        let coupon = Self::fetch_coupon(&mut *tx, code)
            .await?
            .ok_or(Rejection::NotFound)?;
        tx.commit().await?;

        Ok(coupon)
    }

    async fn user_redemption_count(&self, coupon_id: i64, user_id: &str) -> CouponResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM redemptions WHERE coupon_id = ? AND user_id = ?",
        )
        .bind(coupon_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    async fn redeem(
        &self,
        code: &str,
        user_id: &str,
        order_amount: Decimal,
        now: DateTime<Utc>,
    ) -> CouponResult<Redemption> {
        let mut tx = self.pool.begin().await?;

        // Claim a use first: the guarded increment takes the write lock and
        // can never move used_count past usage_limit. Dropping the
        // transaction on any rejection below rolls the claim back.
        let claimed = sqlx::query(
            r"
            UPDATE coupons SET used_count = used_count + 1, updated_at = ?
            WHERE code = ? AND used_count < usage_limit
            ",
        )
        .bind(now)
        .bind(code)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let mut coupon = Self::fetch_coupon(&mut *tx, code)
            .await?
            .ok_or(Rejection::NotFound)?;

        // Judge against the state before this claim
        if claimed {
            coupon.used_count -= 1;
        }

        let user_uses = if coupon.per_user_limit.is_some() {
            let count: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM redemptions WHERE coupon_id = ? AND user_id = ?",
            )
            .bind(coupon.id)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
            count.0
        } else {
            0
        };

        let discount = rules::evaluate(&coupon, order_amount, user_uses, now)?;

        if !claimed {
            return Err(Rejection::UsageLimitReached {
                used: coupon.used_count,
                limit: coupon.usage_limit,
            }
            .into());
        }

        let result = sqlx::query(
            r"
            INSERT INTO redemptions (coupon_id, user_id, order_amount, discount_amount, redeemed_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(coupon.id)
        .bind(user_id)
        .bind(order_amount.to_string())
        .bind(discount.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Redemption {
            id: result.last_insert_rowid(),
            coupon_id: coupon.id,
            code: coupon.code,
            user_id: user_id.to_string(),
            order_amount,
            discount_amount: discount,
            redeemed_at: now,
        })
    }

    async fn redemptions(&self, code: &str) -> CouponResult<Vec<Redemption>> {
        let rows = sqlx::query_as::<_, RedemptionRow>(
            r"
            SELECT r.id, r.coupon_id, c.code, r.user_id, r.order_amount, r.discount_amount, r.redeemed_at
            FROM redemptions r
            JOIN coupons c ON c.id = r.coupon_id
            WHERE c.code = ?
            ORDER BY r.redeemed_at, r.id
            ",
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Redemption::try_from).collect()
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> CouponResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let rows =
            sqlx::query_as::<_, CouponRow>(select_coupons!("WHERE status = ? ORDER BY code"))
                .bind(CouponStatus::Active.as_str())
                .fetch_all(&mut *tx)
                .await?;

        let mut expired = Vec::new();
        for row in rows {
            let coupon = Coupon::try_from(row)?;
            if !rules::is_expired(&coupon, now) {
                continue;
            }

            sqlx::query("UPDATE coupons SET status = ?, updated_at = ? WHERE id = ?")
                .bind(CouponStatus::Inactive.as_str())
                .bind(now)
                .bind(coupon.id)
                .execute(&mut *tx)
                .await?;

            expired.push(coupon.code);
        }

        tx.commit().await?;
        Ok(expired)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

/// Column-level shape of a `coupons` row; money and enums are TEXT
#[derive(FromRow)]
struct CouponRow {
    id: i64,
    code: String,
    discount_kind: String,
    discount_value: String,
    minimum_order_amount: Option<String>,
    maximum_discount_amount: Option<String>,
    usage_limit: i64,
    used_count: i64,
    per_user_limit: Option<i64>,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = CouponError;

    fn try_from(row: CouponRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            discount_kind: row.discount_kind.parse()?,
            discount_value: parse_decimal(&row.discount_value)?,
            minimum_order_amount: row
                .minimum_order_amount
                .as_deref()
                .map(parse_decimal)
                .transpose()?,
            maximum_discount_amount: row
                .maximum_discount_amount
                .as_deref()
                .map(parse_decimal)
                .transpose()?,
            usage_limit: row.usage_limit,
            used_count: row.used_count,
            per_user_limit: row.per_user_limit,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            code: row.code,
        })
    }
}

#[derive(FromRow)]
struct RedemptionRow {
    id: i64,
    coupon_id: i64,
    code: String,
    user_id: String,
    order_amount: String,
    discount_amount: String,
    redeemed_at: DateTime<Utc>,
}

impl TryFrom<RedemptionRow> for Redemption {
    type Error = CouponError;

    fn try_from(row: RedemptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            coupon_id: row.coupon_id,
            code: row.code,
            user_id: row.user_id,
            order_amount: parse_decimal(&row.order_amount)?,
            discount_amount: parse_decimal(&row.discount_amount)?,
            redeemed_at: row.redeemed_at,
        })
    }
}

fn parse_decimal(value: &str) -> CouponResult<Decimal> {
    value
        .parse()
        .map_err(|e| CouponError::Corrupt(format!("bad decimal '{value}': {e}")))
}

/// Filesystem path behind a `sqlite:` URL, if it names a file.
fn sqlite_file_path(db_url: &str) -> Option<PathBuf> {
    let rest = db_url
        .strip_prefix("sqlite://")
        .or_else(|| db_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);

    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_path_from_url() {
        assert_eq!(
            sqlite_file_path("sqlite:database/coupons.db"),
            Some(PathBuf::from("database/coupons.db"))
        );
        assert_eq!(
            sqlite_file_path("sqlite:///tmp/c.db?mode=rwc"),
            Some(PathBuf::from("/tmp/c.db"))
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://x"), None);
    }
}
