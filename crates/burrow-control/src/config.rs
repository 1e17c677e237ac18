//! Control plane configuration

use std::time::Duration;

/// Timeouts and limits shared by every tunnel session
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How long a proxied request waits for its response
    pub request_timeout: Duration,

    /// Period of the registry health sweep
    pub health_check_interval: Duration,

    /// Deadline for a single liveness ping write
    pub health_probe_timeout: Duration,

    /// Deadline for any other write to a tunnel connection
    pub write_timeout: Duration,

    /// How long a new connection may take to send its registration
    pub registration_timeout: Duration,

    /// Upper bound on in-flight requests per session
    pub max_pending: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(10),
            max_pending: 1024,
        }
    }
}

impl ControlConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_health_probe_timeout(mut self, timeout: Duration) -> Self {
        self.health_probe_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }
}
