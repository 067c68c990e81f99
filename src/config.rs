use std::path::PathBuf;

use chrono::{FixedOffset, Offset, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both SLOTD_TLS_CERT and SLOTD_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read once from `SLOTD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Reference zone for calendar-day availability.
    pub tz_offset: FixedOffset,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            tz_offset: Utc.fix(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let tls_cert = lookup("SLOTD_TLS_CERT");
        let tls_key = lookup("SLOTD_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            port: parsed(&lookup, "SLOTD_PORT")?.unwrap_or(defaults.port),
            bind: lookup("SLOTD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SLOTD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("SLOTD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "SLOTD_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "SLOTD_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "SLOTD_METRICS_PORT")?,
            tls_cert,
            tls_key,
            tz_offset: match lookup("SLOTD_TZ_OFFSET") {
                Some(value) => parse_offset(&value)?,
                None => defaults.tz_offset,
            },
        })
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

/// `+HH:MM`, `-HH:MM` or `Z`.
fn parse_offset(value: &str) -> Result<FixedOffset, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        var: "SLOTD_TZ_OFFSET",
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") {
        return Ok(Utc.fix());
    }
    let (sign, rest) = match value.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid("expected +HH:MM or -HH:MM")),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| invalid("expected +HH:MM or -HH:MM"))?;
    let hours: i32 = hours.parse().map_err(|_| invalid("bad hours"))?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid("bad minutes"))?;
    if minutes >= 60 {
        return Err(invalid("bad minutes"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| invalid("out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(from(&[]).unwrap(), ServerConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = from(&[
            ("SLOTD_PORT", "6000"),
            ("SLOTD_DATA_DIR", "/var/lib/slotd"),
            ("SLOTD_METRICS_PORT", "9100"),
            ("SLOTD_TZ_OFFSET", "+09:00"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/slotd"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.tz_offset.local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn bad_number_names_the_variable() {
        let err = from(&[("SLOTD_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert!(err.to_string().starts_with("SLOTD_MAX_CONNECTIONS"));
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(matches!(
            from(&[("SLOTD_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
        let cfg = from(&[("SLOTD_TLS_CERT", "c.pem"), ("SLOTD_TLS_KEY", "k.pem")]).unwrap();
        assert_eq!(cfg.tls_key.as_deref(), Some("k.pem"));
    }

    #[test]
    fn offsets() {
        assert_eq!(parse_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("09:00").is_err());
        assert!(parse_offset("+09:75").is_err());
        assert!(parse_offset("+25:00").is_err());
    }
}
