//! Environment-variable tunnel loader
//!
//! Builds a single [`TunnelConfig`] from `<PREFIX>_*` variables. Nothing is
//! produced unless `<PREFIX>_USE_SSH=true`.

use super::tunnel::{DynamicSocks5Config, Socks5Config, SshConfig, TunnelConfig};
use crate::error::TunnelError;
use std::str::FromStr;

/// Prefix used when none is given
pub const DEFAULT_ENV_PREFIX: &str = "DB";

struct EnvReader<'a, F> {
    prefix: &'a str,
    lookup: F,
}

impl<'a, F> EnvReader<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}_{}", self.prefix, key)).filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).as_deref() == Some("true")
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, TunnelError> {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                TunnelError::Config(format!(
                    "{}_{} is not a valid number: {}",
                    self.prefix, key, raw
                ))
            }),
            None => Ok(None),
        }
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, TunnelError> {
        Ok(self.parse(key)?.unwrap_or(default))
    }
}

impl TunnelConfig {
    /// Load a tunnel from the process environment
    pub fn from_env(prefix: &str) -> Result<Option<TunnelConfig>, TunnelError> {
        Self::from_env_with(prefix, |key| std::env::var(key).ok())
    }

    /// Load a tunnel through an arbitrary variable lookup
    pub fn from_env_with<F>(prefix: &str, lookup: F) -> Result<Option<TunnelConfig>, TunnelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { prefix, lookup };

        if !env.flag("USE_SSH") {
            return Ok(None);
        }

        let ssh = SshConfig {
            host: env.string_or("SSH_HOST", "localhost"),
            port: env.parse_or("SSH_PORT", 22)?,
            username: env.string_or("SSH_USERNAME", "root"),
            password: env.get("SSH_PASSWORD"),
            private_key: env.get("SSH_PRIVATE_KEY"),
            private_key_path: None,
            passphrase: env.get("SSH_PASSPHRASE"),
            connect_timeout_secs: 15,
            keepalive_secs: 30,
        };

        let mut config = TunnelConfig::new(
            ssh,
            env.string_or("HOST", "localhost"),
            env.parse_or("PORT", 5432)?,
            env.parse_or("LOCAL_PORT", 15432)?,
        );
        config.name = env.get("TUNNEL_NAME");
        config.auto_reconnect = env.flag("AUTO_RECONNECT");
        config.max_reconnect_attempts = env.parse_or("MAX_RECONNECT_ATTEMPTS", 5)?;
        config.reconnect_delay_ms = env.parse_or("RECONNECT_DELAY", 5000)?;

        if env.flag("ENABLE_SOCKS5") {
            let (username, password) = match (env.get("SOCKS5_USERNAME"), env.get("SOCKS5_PASSWORD"))
            {
                (Some(u), Some(p)) => (Some(u), Some(p)),
                _ => (None, None),
            };
            config.socks5 = Some(Socks5Config {
                enabled: true,
                port: env.parse("SOCKS5_PORT")?,
                host: env.get("SOCKS5_HOST"),
                username,
                password,
            });
        }

        if env.flag("ENABLE_DYNAMIC_SOCKS5") {
            config.dynamic_socks5 = Some(DynamicSocks5Config {
                enabled: true,
                port: env.parse("DYNAMIC_SOCKS5_PORT")?,
                host: env.get("DYNAMIC_SOCKS5_HOST"),
            });
        }

        Ok(Some(config))
    }
}
