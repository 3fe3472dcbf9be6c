use anyhow::{anyhow, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::gateway::{RazorpayConfig, DEFAULT_GATEWAY_URL};
use crate::models::Money;
use crate::reconcile::TopUpLimits;

/// Runtime settings, read from the environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: Option<PathBuf>,
    pub match_fee: Money,
    pub billing_offset: FixedOffset,
    pub candidate_window_days: i64,
    pub scorer_concurrency: usize,
    pub oracle_timeout: Duration,
    pub scoring_model: String,
    pub insight_model: String,
    pub gateway_base_url: String,
    pub gateway_currency: String,
    pub razorpay_key_id: Option<String>,
    pub razorpay_key_secret: Option<String>,
    pub razorpay_webhook_secret: Option<String>,
    pub topup_limits: TopUpLimits,
    pub stale_after_minutes: i64,
    pub match_cron: String,
    pub sweep_cron: String,
    pub notify_webhook_url: Option<String>,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_path: get("DATABASE_PATH").map(PathBuf::from),
            match_fee: Money::from_cents(parse_or(&get, "MATCH_FEE_CENTS", 30)?),
            billing_offset: parse_or(&get, "BILLING_UTC_OFFSET", Utc.fix())?,
            candidate_window_days: parse_or(&get, "CANDIDATE_WINDOW_DAYS", 30)?,
            scorer_concurrency: parse_or(&get, "SCORER_CONCURRENCY", 10)?,
            oracle_timeout: Duration::from_secs(parse_or(&get, "ORACLE_TIMEOUT_SECS", 60)?),
            scoring_model: get("SCORING_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            insight_model: get("INSIGHT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            gateway_base_url: get("GATEWAY_BASE_URL").unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            gateway_currency: get("GATEWAY_CURRENCY").unwrap_or_else(|| "USD".to_string()),
            razorpay_key_id: get("RAZORPAY_KEY_ID"),
            razorpay_key_secret: get("RAZORPAY_KEY_SECRET"),
            razorpay_webhook_secret: get("RAZORPAY_WEBHOOK_SECRET"),
            topup_limits: TopUpLimits {
                min_dollars: parse_or(&get, "TOPUP_MIN_DOLLARS", 5)?,
                max_dollars: parse_or(&get, "TOPUP_MAX_DOLLARS", 500)?,
            },
            stale_after_minutes: parse_or(&get, "STALE_AFTER_MINUTES", 30)?,
            match_cron: get("MATCH_CRON").unwrap_or_else(|| "0 0 3 * * *".to_string()),
            sweep_cron: get("SWEEP_CRON").unwrap_or_else(|| "0 */10 * * * *".to_string()),
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),
            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 30)?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.match_fee.is_positive() {
            return Err(anyhow!("MATCH_FEE_CENTS must be positive"));
        }
        if self.candidate_window_days <= 0 {
            return Err(anyhow!("CANDIDATE_WINDOW_DAYS must be positive"));
        }
        if self.http_timeout.is_zero() {
            return Err(anyhow!("HTTP_TIMEOUT_SECS must be positive"));
        }
        if self.stale_after_minutes <= 0 {
            return Err(anyhow!("STALE_AFTER_MINUTES must be positive"));
        }
        if self.topup_limits.min_dollars <= 0 || self.topup_limits.min_dollars > self.topup_limits.max_dollars {
            return Err(anyhow!(
                "TOPUP_MIN_DOLLARS/TOPUP_MAX_DOLLARS must satisfy 0 < min <= max"
            ));
        }
        Ok(())
    }

    /// Gateway settings; only commands that talk to the gateway need them.
    pub fn razorpay(&self) -> Result<RazorpayConfig> {
        let required = |value: &Option<String>, key: &str| {
            value
                .clone()
                .with_context(|| format!("{} environment variable not set", key))
        };
        Ok(RazorpayConfig {
            base_url: self.gateway_base_url.clone(),
            key_id: required(&self.razorpay_key_id, "RAZORPAY_KEY_ID")?,
            key_secret: required(&self.razorpay_key_secret, "RAZORPAY_KEY_SECRET")?,
            webhook_secret: required(&self.razorpay_webhook_secret, "RAZORPAY_WEBHOOK_SECRET")?,
            currency: self.gateway_currency.clone(),
        })
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {}='{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.match_fee, Money::from_cents(30));
        assert_eq!(config.billing_offset.local_minus_utc(), 0);
        assert_eq!(config.candidate_window_days, 30);
        assert_eq!(config.scorer_concurrency, 10);
        assert_eq!(config.oracle_timeout, Duration::from_secs(60));
        assert_eq!(config.topup_limits, TopUpLimits::default());
        assert_eq!(config.stale_after_minutes, 30);
        assert_eq!(config.gateway_currency, "USD");
        assert!(config.notify_webhook_url.is_none());
        assert_eq!(config.http_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_and_blank_values() {
        let config = config_from(&[
            ("MATCH_FEE_CENTS", "45"),
            ("BILLING_UTC_OFFSET", "+05:30"),
            ("SCORER_CONCURRENCY", "4"),
            ("NOTIFY_WEBHOOK_URL", "  "),
        ])
        .unwrap();
        assert_eq!(config.match_fee, Money::from_cents(45));
        assert_eq!(config.billing_offset.local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(config.scorer_concurrency, 4);
        assert!(config.notify_webhook_url.is_none());
    }

    #[test]
    fn test_invalid_values_are_named() {
        let err = config_from(&[("MATCH_FEE_CENTS", "abc")]).unwrap_err();
        assert!(err.to_string().contains("MATCH_FEE_CENTS"));
        assert!(config_from(&[("MATCH_FEE_CENTS", "0")]).is_err());
        assert!(config_from(&[("TOPUP_MIN_DOLLARS", "600")]).is_err());
        assert!(config_from(&[("HTTP_TIMEOUT_SECS", "0")]).is_err());
    }

    #[test]
    fn test_gateway_credentials_required_on_demand() {
        let config = config_from(&[("RAZORPAY_KEY_ID", "rzp_test")]).unwrap();
        let err = config.razorpay().unwrap_err();
        assert!(err.to_string().contains("RAZORPAY_KEY_SECRET"));

        let config = config_from(&[
            ("RAZORPAY_KEY_ID", "rzp_test"),
            ("RAZORPAY_KEY_SECRET", "s"),
            ("RAZORPAY_WEBHOOK_SECRET", "w"),
        ])
        .unwrap();
        assert_eq!(config.razorpay().unwrap().key_id, "rzp_test");
    }
}
