//! Global configuration table (§4.12, §6).

use std::time::Duration;

use serde::Deserialize;

/// One statically configured device, ingested at engine start (§4.7).
#[derive(Clone, Debug, Deserialize)]
pub struct StaticDevice {
    pub name: String,
    pub uri: String,
    pub protocol: String,
}

/// Retry budget applied by the scan state machine (§4.3).
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    // `Duration` has no native TOML representation; store seconds.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

mod duration_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(dead_code)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Top-level configuration table.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub static_devices: Vec<StaticDevice>,

    /// Whether device listings report the network host name as the model
    /// string, rather than the capability-reported model.
    #[serde(default)]
    pub model_is_netname: bool,

    #[serde(default = "RetryPolicy::default")]
    pub retry: RetryPolicy,

    /// How long `open` waits for registry readiness before giving up.
    #[serde(default = "default_readiness_timeout", with = "duration_secs")]
    pub readiness_timeout: Duration,
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            static_devices: Vec::new(),
            model_is_netname: false,
            retry: RetryPolicy::default(),
            readiness_timeout: default_readiness_timeout(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML document.
    pub fn from_toml(text: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_policy_matches_spec() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[test]
    fn parses_static_devices_from_toml() {
        let cfg = Config::from_toml(r#"
            model_is_netname = true

            [[static_devices]]
            name = "front-desk"
            uri = "http://10.0.0.5/eSCL/"
            protocol = "escl"

            [retry]
            max_attempts = 3
            interval = 2
        "#).unwrap();

        assert!(cfg.model_is_netname);
        assert_eq!(cfg.static_devices.len(), 1);
        assert_eq!(cfg.static_devices[0].name, "front-desk");
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.interval, Duration::from_secs(2));
        assert_eq!(cfg.readiness_timeout, Duration::from_secs(5));
    }
}
