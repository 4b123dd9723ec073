use std::{env::var, fmt::Display, str::FromStr, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::error::ConfigError;
use crate::supervisor::SupervisorSettings;

lazy_static! {
  static ref TOKEN_RE: Regex = Regex::new(r"^\d{3,}:[A-Za-z0-9_-]{30,}$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
  Development,
  Production,
}

impl Environment {
  pub fn as_str(&self) -> &'static str {
    match self {
      Environment::Development => "development",
      Environment::Production => "production",
    }
  }

  pub fn is_development(&self) -> bool {
    *self == Environment::Development
  }
}

impl FromStr for Environment {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "development" | "dev" => Ok(Environment::Development),
      "production" | "prod" => Ok(Environment::Production),
      other => Err(format!("unknown environment {other}")),
    }
  }
}

#[derive(Clone)]
pub struct Config {
  pub token: String,
  pub api_url: Option<Url>,
  pub request_timeout: Duration,
  pub poll_timeout: Duration,
  pub max_retries: u32,
  pub retry_base_delay: Duration,
  pub retry_max_delay: Duration,
  pub shutdown_timeout: Duration,
  pub drop_pending_updates: bool,
  pub host: String,
  pub port: u16,
  pub log_level: String,
  pub environment: Environment,
}

// The token never reaches logs.
impl std::fmt::Debug for Config {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Config")
      .field("token", &"<redacted>")
      .field("api_url", &self.api_url)
      .field("request_timeout", &self.request_timeout)
      .field("poll_timeout", &self.poll_timeout)
      .field("max_retries", &self.max_retries)
      .field("retry_base_delay", &self.retry_base_delay)
      .field("retry_max_delay", &self.retry_max_delay)
      .field("shutdown_timeout", &self.shutdown_timeout)
      .field("drop_pending_updates", &self.drop_pending_updates)
      .field("host", &self.host)
      .field("port", &self.port)
      .field("log_level", &self.log_level)
      .field("environment", &self.environment)
      .finish()
  }
}

impl Config {
  fn with_token(token: String) -> Self {
    Self {
      token,
      api_url: None,
      request_timeout: Duration::from_secs(30),
      poll_timeout: Duration::from_secs(20),
      max_retries: 5,
      retry_base_delay: Duration::from_secs(5),
      retry_max_delay: Duration::from_secs(60),
      shutdown_timeout: Duration::from_secs(10),
      drop_pending_updates: true,
      host: "0.0.0.0".to_string(),
      port: 8080,
      log_level: "INFO".to_string(),
      environment: Environment::Production,
    }
  }

  /// Read the configuration from the process environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|k| var(k).ok())
  }

  /// Same as [`Config::from_env`] but with a custom variable source.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let token = lookup("TELEGRAM_BOT_TOKEN")
      .map(|t| t.trim().to_string())
      .filter(|t| !t.is_empty())
      .ok_or(ConfigError::MissingToken)?;
    if !TOKEN_RE.is_match(&token) {
      return Err(ConfigError::MalformedToken);
    }

    let mut cfg = Self::with_token(token);

    if let Some(secs) = parse_env::<u64, _>(&lookup, "REQUEST_TIMEOUT")? {
      cfg.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_env::<u64, _>(&lookup, "POLL_TIMEOUT")? {
      cfg.poll_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = parse_env(&lookup, "MAX_RETRIES")? {
      cfg.max_retries = n;
    }
    if let Some(secs) = parse_env::<u64, _>(&lookup, "RETRY_BASE_DELAY")? {
      cfg.retry_base_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_env::<u64, _>(&lookup, "RETRY_MAX_DELAY")? {
      cfg.retry_max_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_env::<u64, _>(&lookup, "SHUTDOWN_TIMEOUT")? {
      cfg.shutdown_timeout = Duration::from_secs(secs);
    }
    if let Some(flag) = lookup("DROP_PENDING_UPDATES") {
      cfg.drop_pending_updates = parse_bool("DROP_PENDING_UPDATES", &flag)?;
    }
    if let Some(host) = lookup("HOST").filter(|h| !h.trim().is_empty()) {
      cfg.host = host.trim().to_string();
    }
    if let Some(port) = parse_env(&lookup, "PORT")? {
      cfg.port = port;
    }
    if let Some(level) = lookup("LOG_LEVEL").filter(|l| !l.trim().is_empty()) {
      level_directive(&level).ok_or_else(|| {
        invalid("LOG_LEVEL", &level, "expected DEBUG, INFO, WARNING, ERROR or CRITICAL")
      })?;
      cfg.log_level = level.trim().to_string();
    }
    if let Some(env) = parse_env(&lookup, "ENVIRONMENT")? {
      cfg.environment = env;
    }
    if let Some(raw) = lookup("TELEGRAM_API_URL").filter(|u| !u.trim().is_empty()) {
      let url = Url::parse(raw.trim()).map_err(|e| invalid("TELEGRAM_API_URL", &raw, e))?;
      cfg.api_url = Some(url);
    }

    cfg.validate()?;
    Ok(cfg)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.max_retries == 0 {
      return Err(invalid("MAX_RETRIES", "0", "must be at least 1"));
    }
    if self.retry_base_delay.is_zero() {
      return Err(invalid("RETRY_BASE_DELAY", "0", "must be positive"));
    }
    if self.retry_max_delay < self.retry_base_delay {
      return Err(invalid(
        "RETRY_MAX_DELAY",
        &self.retry_max_delay.as_secs().to_string(),
        "must not be below RETRY_BASE_DELAY",
      ));
    }
    // A long poll that outlives the HTTP timeout would always fail.
    if self.poll_timeout >= self.request_timeout {
      return Err(invalid(
        "POLL_TIMEOUT",
        &self.poll_timeout.as_secs().to_string(),
        "must be below REQUEST_TIMEOUT",
      ));
    }
    Ok(())
  }

  /// Numeric bot id, the part of the token before the colon.
  pub fn bot_id(&self) -> &str {
    self.token.split(':').next().unwrap_or_default()
  }

  pub fn bind_address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  /// Filter directive for `tracing_subscriber::EnvFilter`.
  pub fn log_directive(&self) -> &'static str {
    level_directive(&self.log_level).unwrap_or("info")
  }

  pub fn supervisor_settings(&self) -> SupervisorSettings {
    SupervisorSettings {
      max_retries: self.max_retries,
      backoff_base: self.retry_base_delay,
      backoff_ceiling: self.retry_max_delay,
      poll_timeout: self.poll_timeout,
      shutdown_timeout: self.shutdown_timeout,
      drop_pending_updates: self.drop_pending_updates,
      ..SupervisorSettings::default()
    }
  }
}

fn parse_env<T, F>(lookup: &F, k: &'static str) -> Result<Option<T>, ConfigError>
where
  T: FromStr,
  <T as FromStr>::Err: Display,
  F: Fn(&str) -> Option<String>,
{
  match lookup(k) {
    Some(val) if !val.trim().is_empty() => val
      .trim()
      .parse::<T>()
      .map(Some)
      .map_err(|e| invalid(k, &val, e)),
    _ => Ok(None),
  }
}

fn level_directive(level: &str) -> Option<&'static str> {
  match level.trim().to_lowercase().as_str() {
    "trace" => Some("trace"),
    "debug" => Some("debug"),
    "info" => Some("info"),
    "warning" | "warn" => Some("warn"),
    "error" | "critical" | "fatal" => Some("error"),
    _ => None,
  }
}

fn parse_bool(k: &'static str, val: &str) -> Result<bool, ConfigError> {
  match val.trim().to_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(invalid(k, val, "expected a boolean")),
  }
}

fn invalid(key: &'static str, value: &str, reason: impl Display) -> ConfigError {
  ConfigError::InvalidValue {
    key,
    value: value.to_string(),
    reason: reason.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  const TOKEN: &str = "123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw8";

  fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |k| map.get(k).cloned()
  }

  #[test]
  fn test_defaults() {
    let cfg = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", TOKEN)])).unwrap();
    assert_eq!(cfg.max_retries, 5);
    assert_eq!(cfg.retry_base_delay, Duration::from_secs(5));
    assert_eq!(cfg.retry_max_delay, Duration::from_secs(60));
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.environment, Environment::Production);
    assert!(cfg.drop_pending_updates);
    assert_eq!(cfg.bot_id(), "123456789");
    assert_eq!(cfg.bind_address(), "0.0.0.0:8080");
  }

  #[test]
  fn test_missing_token() {
    let err = Config::from_lookup(lookup(&[])).unwrap_err();
    assert!(matches!(err, ConfigError::MissingToken));

    let err = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "  ")])).unwrap_err();
    assert!(matches!(err, ConfigError::MissingToken));
  }

  #[test]
  fn test_malformed_token() {
    for bad in ["abc", "123456789", "123456789:short", "bot:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw8"] {
      let err = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", bad)])).unwrap_err();
      assert!(matches!(err, ConfigError::MalformedToken), "{bad} should be rejected");
    }
  }

  #[test]
  fn test_overrides() {
    let cfg = Config::from_lookup(lookup(&[
      ("TELEGRAM_BOT_TOKEN", TOKEN),
      ("MAX_RETRIES", "3"),
      ("RETRY_BASE_DELAY", "2"),
      ("RETRY_MAX_DELAY", "16"),
      ("PORT", "9000"),
      ("ENVIRONMENT", "Development"),
      ("DROP_PENDING_UPDATES", "no"),
      ("LOG_LEVEL", "WARNING"),
      ("TELEGRAM_API_URL", "http://localhost:8081"),
    ]))
    .unwrap();

    let settings = cfg.supervisor_settings();
    assert_eq!(settings.max_retries, 3);
    assert_eq!(settings.backoff_base, Duration::from_secs(2));
    assert_eq!(settings.backoff_ceiling, Duration::from_secs(16));
    assert!(!settings.drop_pending_updates);
    assert_eq!(cfg.port, 9000);
    assert!(cfg.environment.is_development());
    assert_eq!(cfg.log_directive(), "warn");
    assert_eq!(cfg.api_url.unwrap().as_str(), "http://localhost:8081/");
  }

  #[test]
  fn test_invalid_number_names_key() {
    let err = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", TOKEN), ("PORT", "http")]))
      .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));
  }

  #[test]
  fn test_rejects_inconsistent_values() {
    let err = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", TOKEN), ("MAX_RETRIES", "0")]))
      .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { key: "MAX_RETRIES", .. }));

    let err = Config::from_lookup(lookup(&[
      ("TELEGRAM_BOT_TOKEN", TOKEN),
      ("RETRY_BASE_DELAY", "30"),
      ("RETRY_MAX_DELAY", "10"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { key: "RETRY_MAX_DELAY", .. }));

    let err = Config::from_lookup(lookup(&[
      ("TELEGRAM_BOT_TOKEN", TOKEN),
      ("POLL_TIMEOUT", "30"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { key: "POLL_TIMEOUT", .. }));
  }

  #[test]
  fn test_log_level() {
    let cfg = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", TOKEN), ("LOG_LEVEL", "Critical")]))
      .unwrap();
    assert_eq!(cfg.log_directive(), "error");

    let err = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", TOKEN), ("LOG_LEVEL", "verbose")]))
      .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { key: "LOG_LEVEL", .. }));
  }

  #[test]
  fn test_debug_redacts_token() {
    let cfg = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", TOKEN)])).unwrap();
    let printed = format!("{cfg:?}");
    assert!(!printed.contains("AAHdqTcv"));
    assert!(printed.contains("<redacted>"));
  }
}
