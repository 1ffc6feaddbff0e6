use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use watch_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "127.0.0.1")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "http://127.0.0.1:5001")]
    pub collector_url: url::Url,

    #[envconfig(default = "/log")]
    pub log_path: String,

    #[envconfig(default = "/pdf")]
    pub resource_path: String,

    // The collector summarizes the video before replying to `/log`.
    #[envconfig(default = "600000")]
    pub log_timeout: EnvMsDuration,

    #[envconfig(default = "300000")]
    pub resource_timeout: EnvMsDuration,

    #[envconfig(default = "15000")]
    pub suppression_window: EnvMsDuration,

    #[envconfig(default = "600")]
    pub debounce_delay: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub poll_interval: NonZeroMsDuration,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "true")]
    pub sideload: bool,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_endpoint(&self) -> Result<url::Url, url::ParseError> {
        self.collector_url.join(&self.log_path)
    }

    pub fn resource_endpoint(&self) -> Result<url::Url, url::ParseError> {
        self.collector_url.join(&self.resource_path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A millisecond duration that must be positive, for timer periods.
#[derive(Debug, Clone, Copy)]
pub struct NonZeroMsDuration(pub time::Duration);

impl FromStr for NonZeroMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let EnvMsDuration(duration) = s.parse()?;
        if duration.is_zero() {
            return Err(ParseEnvMsDurationError);
        }

        Ok(NonZeroMsDuration(duration))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL", default = "30000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "127.0.0.1:3310");
        assert_eq!(config.log_endpoint().unwrap().as_str(), "http://127.0.0.1:5001/log");
        assert_eq!(config.resource_endpoint().unwrap().as_str(), "http://127.0.0.1:5001/pdf");
        assert_eq!(config.suppression_window.0, time::Duration::from_secs(15));
        assert_eq!(config.debounce_delay.0, time::Duration::from_millis(600));
        assert_eq!(config.poll_interval.0, time::Duration::from_secs(5));
        assert_eq!(config.retry_policy.policy(), RetryPolicy::default());
    }

    #[test]
    fn timeouts_leave_room_for_slow_collectors() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.log_timeout.0, time::Duration::from_secs(600));
        assert_eq!(config.resource_timeout.0, time::Duration::from_secs(300));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let env = HashMap::from([("POLL_INTERVAL".to_owned(), "0".to_owned())]);

        assert!(Config::init_from_hashmap(&env).is_err());
        assert_eq!(
            "0".parse::<NonZeroMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
        assert_eq!(
            "1".parse::<NonZeroMsDuration>().unwrap().0,
            time::Duration::from_millis(1)
        );
    }

    #[test]
    fn overrides() {
        let env = HashMap::from([
            ("COLLECTOR_URL".to_owned(), "http://collector:8080".to_owned()),
            ("SUPPRESSION_WINDOW".to_owned(), "2000".to_owned()),
            ("RETRY_MAX_ATTEMPTS".to_owned(), "3".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.log_endpoint().unwrap().as_str(), "http://collector:8080/log");
        assert_eq!(config.suppression_window.0, time::Duration::from_secs(2));
        assert_eq!(config.retry_policy.policy().max_attempts, 3);
    }

    #[test]
    fn rejects_bad_durations() {
        assert_eq!(
            "soon".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}
