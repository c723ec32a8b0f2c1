use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub otp_ttl_secs: i64,
    pub session_ttl_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            data_dir: PathBuf::from("./data"),
            otp_ttl_secs: 5 * 60,
            session_ttl_hours: 24,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            port: try_load("SCHOOLD_PORT", defaults.port),
            data_dir: env::var("SCHOOLD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            otp_ttl_secs: try_load("SCHOOLD_OTP_TTL_SECS", defaults.otp_ttl_secs),
            session_ttl_hours: try_load("SCHOOLD_SESSION_TTL_HOURS", defaults.session_ttl_hours),
        }
    }

    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid {key} value `{raw}`: {e}; using default {default}");
                default
            }
        },
        Err(_) => {
            info!("{key} not set, using default: {default}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_data_dir_keeps_default_lifetimes() {
        let cfg = Config::with_data_dir("/tmp/school");
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/school"));
        assert_eq!(cfg.otp_ttl_secs, 300);
        assert_eq!(cfg.session_ttl_hours, 24);
    }
}
