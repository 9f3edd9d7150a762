use crate::error::CliError;
use arb_engine::{intent::IntentConfig, trader::TraderConfig};
use arb_instrument::Currency;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{collections::HashMap, path::Path, time::Duration};

/// Spec §6's configuration surface: `{primaryCurrencies, fixedReserve, minTradeAmount,
/// pathFindInterval, profitTimeoutMin, blacklistTtl, instantRetryLimits}`, loaded from a TOML
/// file. Credentials and connection strings are deliberately excluded from this struct and read
/// straight from the environment by [`Secrets::from_env`] instead, so they never round-trip
/// through a config file an operator might accidentally commit.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub primary_currencies: Vec<String>,
    #[serde(default)]
    pub fixed_reserve: HashMap<String, Decimal>,
    pub min_trade_amount: Decimal,
    pub path_find_interval_secs: u64,
    #[serde(default = "default_profit_monitor_tick_secs")]
    pub profit_monitor_tick_secs: u64,
    pub profit_timeout_min: u64,
    pub blacklist_ttl_secs: u64,
    #[serde(default = "default_blacklist_sweep_interval_secs")]
    pub blacklist_sweep_interval_secs: u64,
    #[serde(default)]
    pub instant_retry_limits: InstantRetryLimits,
    /// Parsed and logged but otherwise unused: spec §1 scopes the HTTP admin surface out of this
    /// core, so no server is ever bound to it (see `SPEC_FULL.md` §3).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstantRetryLimits {
    #[serde(default = "default_not_enough_crypto_retries")]
    pub not_enough_crypto: u32,
}

impl Default for InstantRetryLimits {
    fn default() -> Self {
        Self { not_enough_crypto: default_not_enough_crypto_retries() }
    }
}

fn default_not_enough_crypto_retries() -> u32 {
    arb_execution::instant::DEFAULT_NOT_ENOUGH_CRYPTO_RETRY_LIMIT
}

fn default_profit_monitor_tick_secs() -> u64 {
    2
}

fn default_blacklist_sweep_interval_secs() -> u64 {
    60
}

fn default_http_port() -> u16 {
    8080
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|source| CliError::ReadConfig {
            path: path_ref.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn trader_config(&self) -> TraderConfig {
        TraderConfig {
            primary_currencies: self.primary_currencies.iter().map(Currency::new).collect(),
            fixed_reserve: self
                .fixed_reserve
                .iter()
                .map(|(currency, amount)| (Currency::new(currency), *amount))
                .collect(),
            min_trade_amount: self.min_trade_amount,
            path_find_interval: Duration::from_secs(self.path_find_interval_secs),
            blacklist_sweep_interval: Duration::from_secs(self.blacklist_sweep_interval_secs),
        }
    }

    pub fn intent_config(&self) -> IntentConfig {
        IntentConfig {
            min_trade_amount: self.min_trade_amount,
            profit_monitor_tick: Duration::from_secs(self.profit_monitor_tick_secs),
            profit_timeout: Duration::from_secs(self.profit_timeout_min * 60),
            blacklist_ttl: Duration::from_secs(self.blacklist_ttl_secs),
            end_currencies: self.primary_currencies.iter().map(Currency::new).collect(),
        }
    }
}

/// Credentials and connection strings, read straight from the process environment rather than a
/// config file (spec §6: "Environment variables configure API credentials, database DSN, and
/// HTTP port").
#[derive(Debug, Clone)]
pub struct Secrets {
    pub database_url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self, CliError> {
        Ok(Self {
            database_url: read_env("ARB_DATABASE_URL")?,
            api_key: read_env("ARB_API_KEY")?,
            api_secret: read_env("ARB_API_SECRET")?,
        })
    }
}

fn read_env(key: &str) -> Result<String, CliError> {
    std::env::var(key).map_err(|_| CliError::MissingEnv(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        primary_currencies = ["USDT", "USDC"]
        min_trade_amount = "1"
        path_find_interval_secs = 5
        profit_timeout_min = 40
        blacklist_ttl_secs = 300

        [fixed_reserve]
        USDT = "10"
    "#;

    #[test]
    fn parses_sample_config_with_defaults_filled_in() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.primary_currencies, vec!["USDT", "USDC"]);
        assert_eq!(config.http_port, 8080);
        assert_eq!(
            config.instant_retry_limits.not_enough_crypto,
            arb_execution::instant::DEFAULT_NOT_ENOUGH_CRYPTO_RETRY_LIMIT
        );
    }

    #[test]
    fn trader_config_converts_currency_strings() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let trader_config = config.trader_config();
        assert!(trader_config.primary_currencies.contains(&Currency::new("USDT")));
        assert_eq!(
            trader_config.fixed_reserve.get(&Currency::new("USDT")).copied(),
            Some(rust_decimal::Decimal::from(10))
        );
    }
}
