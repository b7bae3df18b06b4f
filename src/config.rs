use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;

use crate::engine::{EngineSettings, PaymentMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Simulated,
    Approve,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: String,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.key, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Process configuration, read from `COURTBOOK_*` environment variables.
///
/// | Env Var (`COURTBOOK_` prefix) | Default       |
/// |-------------------------------|---------------|
/// | `PORT`                        | `8080`        |
/// | `BIND`                        | `0.0.0.0`     |
/// | `DATA_DIR`                    | `./data`      |
/// | `METRICS_PORT`                | unset         |
/// | `LOCK_TIMEOUT_SECS`           | `30`          |
/// | `PAYMENT_MODE`                | `inline`      |
/// | `GATEWAY`                     | `simulated`   |
/// | `GATEWAY_APPROVAL_RATE`       | `0.9`         |
/// | `GATEWAY_MIN_DELAY_MS`        | `1000`        |
/// | `GATEWAY_MAX_DELAY_MS`        | `3000`        |
/// | `GATEWAY_TIMEOUT_SECS`        | `10`          |
/// | `PAYMENT_DEADLINE_MINUTES`    | `15`          |
/// | `STALE_PAYMENT_MINUTES`       | `30`          |
/// | `REAPER_INTERVAL_SECS`        | `30`          |
/// | `AUDIT_INTERVAL_SECS`         | `0` (off)     |
/// | `COMPACT_THRESHOLD`           | `1000`        |
/// | `WORKER_POOL_SIZE`            | `10`          |
/// | `OPENING_TIME`                | `08:00`       |
/// | `CLOSING_TIME`                | `23:00`       |
/// | `SESSIONS_FILE`               | unset         |
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub gateway: GatewayKind,
    pub approval_rate: f64,
    pub gateway_min_delay: Duration,
    pub gateway_max_delay: Duration,
    pub reaper_interval: Duration,
    /// `None` disables the periodic integrity scan.
    pub audit_interval: Option<Duration>,
    pub compact_threshold: u64,
    pub sessions_file: Option<PathBuf>,
    pub engine: EngineSettings,
}

const PREFIX: &str = "COURTBOOK_";

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Keys are passed with the prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(&format!("{PREFIX}{key}")).filter(|v| !v.trim().is_empty());
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let port = num(&get, "PORT", 8080u16)?;
        let bind = text("BIND", "0.0.0.0");
        let data_dir = PathBuf::from(text("DATA_DIR", "./data"));
        let metrics_port = match get("METRICS_PORT") {
            Some(v) => Some(parse_value::<u16>("METRICS_PORT", &v)?),
            None => None,
        };

        let payment_mode = match text("PAYMENT_MODE", "inline").as_str() {
            "inline" => PaymentMode::Inline,
            "background" => PaymentMode::Background,
            other => return Err(invalid("PAYMENT_MODE", format!("unknown mode {other:?}"))),
        };
        let gateway = match text("GATEWAY", "simulated").as_str() {
            "simulated" => GatewayKind::Simulated,
            "approve" => GatewayKind::Approve,
            "decline" => GatewayKind::Decline,
            other => return Err(invalid("GATEWAY", format!("unknown gateway {other:?}"))),
        };

        let approval_rate = num(&get, "GATEWAY_APPROVAL_RATE", 0.9f64)?;
        if !(0.0..=1.0).contains(&approval_rate) {
            return Err(invalid("GATEWAY_APPROVAL_RATE", "must be within [0, 1]"));
        }
        let min_delay = num(&get, "GATEWAY_MIN_DELAY_MS", 1000u64)?;
        let max_delay = num(&get, "GATEWAY_MAX_DELAY_MS", 3000u64)?;
        if max_delay < min_delay {
            return Err(invalid(
                "GATEWAY_MAX_DELAY_MS",
                "must not be below GATEWAY_MIN_DELAY_MS",
            ));
        }

        let opening = time(&get, "OPENING_TIME", "08:00")?;
        let closing = time(&get, "CLOSING_TIME", "23:00")?;
        if opening >= closing {
            return Err(invalid("CLOSING_TIME", "must be after OPENING_TIME"));
        }

        let audit_secs = num(&get, "AUDIT_INTERVAL_SECS", 0u64)?;

        Ok(Self {
            port,
            bind,
            data_dir,
            metrics_port,
            gateway,
            approval_rate,
            gateway_min_delay: Duration::from_millis(min_delay),
            gateway_max_delay: Duration::from_millis(max_delay),
            reaper_interval: Duration::from_secs(num(&get, "REAPER_INTERVAL_SECS", 30u64)?.max(1)),
            audit_interval: (audit_secs > 0).then(|| Duration::from_secs(audit_secs)),
            compact_threshold: num(&get, "COMPACT_THRESHOLD", 1000u64)?,
            sessions_file: get("SESSIONS_FILE").map(PathBuf::from),
            engine: EngineSettings {
                lock_timeout: Duration::from_secs(num(&get, "LOCK_TIMEOUT_SECS", 30u64)?),
                payment_mode,
                gateway_timeout: Duration::from_secs(num(&get, "GATEWAY_TIMEOUT_SECS", 10u64)?),
                payment_deadline: Duration::from_secs(
                    num(&get, "PAYMENT_DEADLINE_MINUTES", 15u64)? * 60,
                ),
                stale_payment: Duration::from_secs(num(&get, "STALE_PAYMENT_MINUTES", 30u64)? * 60),
                opening,
                closing,
                worker_pool_size: num(&get, "WORKER_POOL_SIZE", 10usize)?.max(1),
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtbook.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError {
        key: format!("{PREFIX}{key}"),
        message: message.into(),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, format!("{raw:?}: {e}")))
}

fn num<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn time(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<NaiveTime, ConfigError> {
    let raw = get(key).unwrap_or_else(|| default.to_string());
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| invalid(key, format!("{raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{PREFIX}{k}"), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.port, 8080);
        assert_eq!(c.listen_addr(), "0.0.0.0:8080");
        assert_eq!(c.wal_path(), PathBuf::from("./data/courtbook.wal"));
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.gateway, GatewayKind::Simulated);
        assert_eq!(c.engine.lock_timeout, Duration::from_secs(30));
        assert_eq!(c.engine.payment_mode, PaymentMode::Inline);
        assert_eq!(c.engine.payment_deadline, Duration::from_secs(15 * 60));
        assert_eq!(c.audit_interval, None);
        assert_eq!(c.engine.worker_pool_size, 10);
        assert_eq!(c.engine.opening, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("PORT", "9000"),
            ("PAYMENT_MODE", "background"),
            ("GATEWAY", "decline"),
            ("AUDIT_INTERVAL_SECS", "600"),
            ("METRICS_PORT", "9100"),
            ("WORKER_POOL_SIZE", "3"),
        ])
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.engine.payment_mode, PaymentMode::Background);
        assert_eq!(c.gateway, GatewayKind::Decline);
        assert_eq!(c.audit_interval, Some(Duration::from_secs(600)));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.engine.worker_pool_size, 3);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(config(&[("PORT", "http")]).unwrap_err().key, "COURTBOOK_PORT");
        assert!(config(&[("GATEWAY_APPROVAL_RATE", "1.5")]).is_err());
        assert!(config(&[("PAYMENT_MODE", "later")]).is_err());
        assert!(config(&[("OPENING_TIME", "23:00"), ("CLOSING_TIME", "08:00")]).is_err());
        assert!(config(&[("GATEWAY_MIN_DELAY_MS", "500"), ("GATEWAY_MAX_DELAY_MS", "100")]).is_err());
    }
}
