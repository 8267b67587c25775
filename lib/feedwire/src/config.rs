//! Transport and pipeline configuration.

use std::time::Duration;

/// Default number of credential prompts per request and challenge kind.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;

/// Configuration for the transport base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Request timeout duration.
    pub timeout: Duration,
    /// Connection timeout duration (proxy tunnel included).
    pub connect_timeout: Duration,
    /// Maximum idle connections per host.
    pub pool_idle_per_host: usize,
    /// Idle connection timeout.
    pub pool_idle_timeout: Duration,
    /// Whether to resend requests whose pooled connection closed before use.
    pub retry_canceled_requests: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(100),
            connect_timeout: Duration::from_secs(10),
            pool_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            retry_canceled_requests: true,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    pool_idle_per_host: Option<usize>,
    pool_idle_timeout: Option<Duration>,
    retry_canceled_requests: Option<bool>,
}

impl TransportConfigBuilder {
    /// Set the request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the maximum idle connections per host.
    #[must_use]
    pub const fn pool_idle_per_host(mut self, count: usize) -> Self {
        self.pool_idle_per_host = Some(count);
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub const fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(timeout);
        self
    }

    /// Set whether canceled pooled requests are resent.
    #[must_use]
    pub const fn retry_canceled_requests(mut self, retry: bool) -> Self {
        self.retry_canceled_requests = Some(retry);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            timeout: self.timeout.unwrap_or(defaults.timeout),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            pool_idle_per_host: self
                .pool_idle_per_host
                .unwrap_or(defaults.pool_idle_per_host),
            pool_idle_timeout: self.pool_idle_timeout.unwrap_or(defaults.pool_idle_timeout),
            retry_canceled_requests: self
                .retry_canceled_requests
                .unwrap_or(defaults.retry_canceled_requests),
        }
    }
}

/// Configuration for pipeline assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Transport settings shared by every pipeline.
    pub transport: TransportConfig,
    /// Whether the legacy token layer is part of the pipeline.
    ///
    /// Defaults to `true` when the `legacy-token-auth` feature is enabled.
    pub legacy_token_auth: bool,
    /// Maximum credential prompts per request for each authentication layer.
    pub max_auth_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            legacy_token_auth: cfg!(feature = "legacy-token-auth"),
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    transport: Option<TransportConfig>,
    legacy_token_auth: Option<bool>,
    max_auth_attempts: Option<u32>,
}

impl PipelineConfigBuilder {
    /// Set the transport configuration.
    #[must_use]
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Include or omit the legacy token layer.
    #[must_use]
    pub const fn legacy_token_auth(mut self, enabled: bool) -> Self {
        self.legacy_token_auth = Some(enabled);
        self
    }

    /// Set the maximum credential prompts per request (at least one).
    #[must_use]
    pub const fn max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = Some(attempts);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            transport: self.transport.unwrap_or(defaults.transport),
            legacy_token_auth: self
                .legacy_token_auth
                .unwrap_or(defaults.legacy_token_auth),
            max_auth_attempts: self
                .max_auth_attempts
                .unwrap_or(defaults.max_auth_attempts)
                .max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_config() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(100));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.pool_idle_per_host, 32);
        assert!(config.retry_canceled_requests);
    }

    #[test]
    fn transport_builder_overrides() {
        let config = TransportConfig::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_per_host(16)
            .retry_canceled_requests(false)
            .build();

        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.pool_idle_per_host, 16);
        assert_eq!(config.pool_idle_timeout, Duration::from_secs(90));
        assert!(!config.retry_canceled_requests);
    }

    #[test]
    fn legacy_flag_follows_feature_by_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.legacy_token_auth, cfg!(feature = "legacy-token-auth"));
        assert_eq!(config.max_auth_attempts, DEFAULT_MAX_AUTH_ATTEMPTS);
    }

    #[test]
    fn pipeline_builder_overrides() {
        let config = PipelineConfig::builder()
            .legacy_token_auth(true)
            .max_auth_attempts(0)
            .transport(TransportConfig::builder().pool_idle_per_host(4).build())
            .build();

        assert!(config.legacy_token_auth);
        assert_eq!(config.max_auth_attempts, 1);
        assert_eq!(config.transport.pool_idle_per_host, 4);
    }
}
