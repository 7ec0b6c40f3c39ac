//! Environment configuration
//!
//! Values come from the process environment, after `dotenvy` has loaded any
//! `.env` file in the working directory:
//!
//! - `DATABASE_URL`: SQLite URL, or `memory` for a throwaway in-process store
//!   (default `sqlite:database/coupons.db`)
//! - `DATABASE_MAX_CONNECTIONS`: pool size (default 5)
//! - `SWEEP_SCHEDULE`: six-field cron expression for the expiry sweep
//!   (default every five minutes)

use std::env;

use anyhow::{Context, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:database/coupons.db";
pub const DEFAULT_SWEEP_SCHEDULE: &str = "0 */5 * * * *";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite { url: String, max_connections: u32 },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend: StoreBackend,
    pub sweep_schedule: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("DATABASE_MAX_CONNECTIONS is not a number: {raw}"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        if max_connections == 0 {
            anyhow::bail!("DATABASE_MAX_CONNECTIONS must be at least 1");
        }

        let backend = if url.trim() == "memory" {
            StoreBackend::Memory
        } else {
            StoreBackend::Sqlite {
                url,
                max_connections,
            }
        };

        let sweep_schedule = lookup("SWEEP_SCHEDULE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SWEEP_SCHEDULE.to_string());

        Ok(Self {
            backend,
            sweep_schedule,
        })
    }
}
