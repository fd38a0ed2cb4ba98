use std::time::Duration;

/// Operator settings, read from the environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Concurrent reconciliations per controller
    pub concurrency: u16,
    /// Level-triggered requeue of a healthy cluster
    pub requeue: Duration,
    /// Timeout of every management API request
    pub broker_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            requeue: Duration::from_secs(30),
            broker_timeout: Duration::from_secs(10),
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {raw:?} for {name}");
            None
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_number::<u16>, env_number::<u64>)
    }

    fn from_lookup(num16: impl Fn(&str) -> Option<u16>, num64: impl Fn(&str) -> Option<u64>) -> Self {
        let default = Self::default();
        Self {
            concurrency: num16("OPERATOR_CONCURRENCY")
                .filter(|c| *c > 0)
                .unwrap_or(default.concurrency),
            requeue: num64("OPERATOR_REQUEUE_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(default.requeue),
            broker_timeout: num64("OPERATOR_BROKER_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(default.broker_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let cfg = OperatorConfig::from_lookup(|_| None, |_| None);
        assert_eq!(cfg, OperatorConfig::default());
    }

    #[test]
    fn test_overrides() {
        let cfg = OperatorConfig::from_lookup(
            |k| (k == "OPERATOR_CONCURRENCY").then_some(8),
            |k| match k {
                "OPERATOR_REQUEUE_SECONDS" => Some(60),
                "OPERATOR_BROKER_TIMEOUT_SECONDS" => Some(3),
                _ => None,
            },
        );
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.requeue, Duration::from_secs(60));
        assert_eq!(cfg.broker_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_zero_concurrency_is_ignored() {
        let cfg = OperatorConfig::from_lookup(|_| Some(0), |_| None);
        assert_eq!(cfg.concurrency, 4);
    }
}
