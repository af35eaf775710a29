//! Client configuration types and builders.

use std::time::Duration;

use zbc_core::protocol::DEFAULT_MAX_FRAME_LENGTH;

/// Default bootstrap broker address.
const DEFAULT_BOOTSTRAP_ADDRESS: &str = "127.0.0.1:51015";
/// Default connection timeout.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default time to wait for a response to a request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on a single socket read in the connection reader loop.
const DEFAULT_READ_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default initial retry backoff.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1);
/// Default maximum retry backoff.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(100);
/// Default retry multiplier.
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
/// Default time budget for retrying one operation.
const DEFAULT_RETRY_DEADLINE: Duration = Duration::from_secs(10);
/// Default topology refresh interval.
const DEFAULT_TOPOLOGY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Default topic subscription channel capacity.
const DEFAULT_TOPIC_SUBSCRIPTION_CAPACITY: usize = 1000;
/// Default task lock duration.
const DEFAULT_TASK_LOCK_DURATION: Duration = Duration::from_secs(300);
/// Default task subscription credits.
const DEFAULT_TASK_CREDITS: u32 = 32;

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for zbc_core::ZbcError {
    fn from(err: ConfigError) -> Self {
        zbc_core::ZbcError::Configuration(err.message)
    }
}

/// Network configuration for broker connections.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    bootstrap_address: String,
    connection_timeout: Duration,
    request_timeout: Duration,
    read_poll_interval: Duration,
    max_frame_length: usize,
}

impl NetworkConfig {
    /// Returns the address used before any topology is known.
    pub fn bootstrap_address(&self) -> &str {
        &self.bootstrap_address
    }

    /// Returns the connection timeout duration.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Returns the time to wait for a response to a request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the bound on a single read in the reader loop.
    pub fn read_poll_interval(&self) -> Duration {
        self.read_poll_interval
    }

    /// Returns the largest frame length accepted from a broker.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap_address: DEFAULT_BOOTSTRAP_ADDRESS.to_string(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            read_poll_interval: DEFAULT_READ_POLL_INTERVAL,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Builder for `NetworkConfig`.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    bootstrap_address: Option<String>,
    connection_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    read_poll_interval: Option<Duration>,
    max_frame_length: Option<usize>,
}

impl NetworkConfigBuilder {
    /// Creates a new network configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bootstrap broker address (`host:port`).
    pub fn bootstrap_address(mut self, address: impl Into<String>) -> Self {
        self.bootstrap_address = Some(address.into());
        self
    }

    /// Sets the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the time to wait for a response to a request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the bound on a single read in the reader loop.
    pub fn read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = Some(interval);
        self
    }

    /// Sets the largest frame length accepted from a broker.
    pub fn max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = Some(length);
        self
    }

    /// Builds the network configuration, returning an error if validation fails.
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        let bootstrap_address = self
            .bootstrap_address
            .unwrap_or_else(|| DEFAULT_BOOTSTRAP_ADDRESS.to_string());
        let connection_timeout = self.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let read_poll_interval = self.read_poll_interval.unwrap_or(DEFAULT_READ_POLL_INTERVAL);
        let max_frame_length = self.max_frame_length.unwrap_or(DEFAULT_MAX_FRAME_LENGTH);

        if bootstrap_address.rsplit_once(':').is_none() {
            return Err(ConfigError::new(format!(
                "bootstrap address '{}' must be host:port",
                bootstrap_address
            )));
        }

        if connection_timeout.is_zero() || request_timeout.is_zero() {
            return Err(ConfigError::new("timeouts must be non-zero"));
        }

        if read_poll_interval.is_zero() {
            return Err(ConfigError::new("read_poll_interval must be non-zero"));
        }

        if max_frame_length < 64 {
            return Err(ConfigError::new("max_frame_length must be at least 64 bytes"));
        }

        Ok(NetworkConfig {
            bootstrap_address,
            connection_timeout,
            request_timeout,
            read_poll_interval,
            max_frame_length,
        })
    }
}

/// Retry configuration for failed operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: bool,
    deadline: Duration,
}

impl RetryConfig {
    /// Returns the initial backoff duration.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the maximum backoff duration.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the backoff multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns whether delays are randomized.
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Returns the time budget for retrying one operation.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            jitter: true,
            deadline: DEFAULT_RETRY_DEADLINE,
        }
    }
}

impl From<RetryConfig> for RetryConfigBuilder {
    fn from(config: RetryConfig) -> Self {
        Self {
            initial_backoff: Some(config.initial_backoff),
            max_backoff: Some(config.max_backoff),
            multiplier: Some(config.multiplier),
            jitter: Some(config.jitter),
            deadline: Some(config.deadline),
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
    deadline: Option<Duration>,
}

impl RetryConfigBuilder {
    /// Creates a new retry configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial backoff duration.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Sets the maximum backoff duration.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Sets the backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enables or disables randomized delays.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Sets the time budget for retrying one operation.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Builds the retry configuration, returning an error if validation fails.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `initial_backoff` is zero or exceeds `max_backoff`
    /// - `multiplier` is less than 1.0
    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        let initial_backoff = self.initial_backoff.unwrap_or(DEFAULT_INITIAL_BACKOFF);
        let max_backoff = self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF);
        let multiplier = self.multiplier.unwrap_or(DEFAULT_RETRY_MULTIPLIER);
        let jitter = self.jitter.unwrap_or(true);
        let deadline = self.deadline.unwrap_or(DEFAULT_RETRY_DEADLINE);

        if initial_backoff.is_zero() {
            return Err(ConfigError::new("initial_backoff must be non-zero"));
        }

        if initial_backoff > max_backoff {
            return Err(ConfigError::new(
                "initial_backoff must not exceed max_backoff",
            ));
        }

        if !(multiplier >= 1.0) {
            return Err(ConfigError::new("multiplier must be at least 1.0"));
        }

        Ok(RetryConfig {
            initial_backoff,
            max_backoff,
            multiplier,
            jitter,
            deadline,
        })
    }
}

/// Topology refresh configuration.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    refresh_interval: Duration,
    background_refresh: bool,
}

impl TopologyConfig {
    /// Returns the age after which a topology snapshot is stale.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Returns whether a background task refreshes stale topology.
    ///
    /// Without it, staleness is only checked before routed sends.
    pub fn background_refresh(&self) -> bool {
        self.background_refresh
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_TOPOLOGY_REFRESH_INTERVAL,
            background_refresh: true,
        }
    }
}

/// Builder for `TopologyConfig`.
#[derive(Debug, Clone, Default)]
pub struct TopologyConfigBuilder {
    refresh_interval: Option<Duration>,
    background_refresh: Option<bool>,
}

impl TopologyConfigBuilder {
    /// Creates a new topology configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the age after which a topology snapshot is stale.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Enables or disables the background refresh task.
    pub fn background_refresh(mut self, enabled: bool) -> Self {
        self.background_refresh = Some(enabled);
        self
    }

    /// Builds the topology configuration, returning an error if validation fails.
    pub fn build(self) -> Result<TopologyConfig, ConfigError> {
        let refresh_interval = self
            .refresh_interval
            .unwrap_or(DEFAULT_TOPOLOGY_REFRESH_INTERVAL);

        if refresh_interval.is_zero() {
            return Err(ConfigError::new("refresh_interval must be non-zero"));
        }

        Ok(TopologyConfig {
            refresh_interval,
            background_refresh: self.background_refresh.unwrap_or(true),
        })
    }
}

/// Subscription defaults.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    topic_capacity: usize,
    task_lock_duration: Duration,
    task_credits: u32,
}

impl SubscriptionConfig {
    /// Returns the per-partition channel capacity of topic subscriptions.
    pub fn topic_capacity(&self) -> usize {
        self.topic_capacity
    }

    /// Returns how long a locked task stays with its worker.
    pub fn task_lock_duration(&self) -> Duration {
        self.task_lock_duration
    }

    /// Returns the credits granted to a task subscription when none are given.
    pub fn task_credits(&self) -> u32 {
        self.task_credits
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            topic_capacity: DEFAULT_TOPIC_SUBSCRIPTION_CAPACITY,
            task_lock_duration: DEFAULT_TASK_LOCK_DURATION,
            task_credits: DEFAULT_TASK_CREDITS,
        }
    }
}

/// Builder for `SubscriptionConfig`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionConfigBuilder {
    topic_capacity: Option<usize>,
    task_lock_duration: Option<Duration>,
    task_credits: Option<u32>,
}

impl SubscriptionConfigBuilder {
    /// Creates a new subscription configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-partition channel capacity of topic subscriptions.
    pub fn topic_capacity(mut self, capacity: usize) -> Self {
        self.topic_capacity = Some(capacity);
        self
    }

    /// Sets how long a locked task stays with its worker.
    pub fn task_lock_duration(mut self, duration: Duration) -> Self {
        self.task_lock_duration = Some(duration);
        self
    }

    /// Sets the default task subscription credits.
    pub fn task_credits(mut self, credits: u32) -> Self {
        self.task_credits = Some(credits);
        self
    }

    /// Builds the subscription configuration, returning an error if validation fails.
    pub fn build(self) -> Result<SubscriptionConfig, ConfigError> {
        let topic_capacity = self
            .topic_capacity
            .unwrap_or(DEFAULT_TOPIC_SUBSCRIPTION_CAPACITY);
        let task_lock_duration = self.task_lock_duration.unwrap_or(DEFAULT_TASK_LOCK_DURATION);
        let task_credits = self.task_credits.unwrap_or(DEFAULT_TASK_CREDITS);

        if topic_capacity == 0 {
            return Err(ConfigError::new("topic_capacity must be at least 1"));
        }

        if task_credits == 0 || task_credits > i32::MAX as u32 {
            return Err(ConfigError::new("task_credits must be between 1 and i32::MAX"));
        }

        Ok(SubscriptionConfig {
            topic_capacity,
            task_lock_duration,
            task_credits,
        })
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    network: NetworkConfig,
    retry: RetryConfig,
    topology: TopologyConfig,
    subscription: SubscriptionConfig,
}

impl ClientConfig {
    /// Creates a new client configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the network configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Returns the retry configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the topology configuration.
    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    /// Returns the subscription configuration.
    pub fn subscription(&self) -> &SubscriptionConfig {
        &self.subscription
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    network: NetworkConfigBuilder,
    retry: RetryConfigBuilder,
    topology: TopologyConfigBuilder,
    subscription: SubscriptionConfigBuilder,
}

impl ClientConfigBuilder {
    /// Creates a new client configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures network settings using a builder function.
    pub fn network<F>(mut self, f: F) -> Self
    where
        F: FnOnce(NetworkConfigBuilder) -> NetworkConfigBuilder,
    {
        self.network = f(self.network);
        self
    }

    /// Configures retry settings using a builder function.
    pub fn retry<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RetryConfigBuilder) -> RetryConfigBuilder,
    {
        self.retry = f(self.retry);
        self
    }

    /// Configures topology refresh using a builder function.
    pub fn topology<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TopologyConfigBuilder) -> TopologyConfigBuilder,
    {
        self.topology = f(self.topology);
        self
    }

    /// Configures subscription defaults using a builder function.
    pub fn subscription<F>(mut self, f: F) -> Self
    where
        F: FnOnce(SubscriptionConfigBuilder) -> SubscriptionConfigBuilder,
    {
        self.subscription = f(self.subscription);
        self
    }

    /// Sets the bootstrap broker address.
    pub fn bootstrap_address(mut self, address: impl Into<String>) -> Self {
        self.network = self.network.bootstrap_address(address);
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.network = self.network.request_timeout(timeout);
        self
    }

    /// Builds the client configuration, returning an error if validation fails.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        Ok(ClientConfig {
            network: self.network.build()?,
            retry: self.retry.build()?,
            topology: self.topology.build()?,
            subscription: self.subscription.build()?,
        })
    }
}
