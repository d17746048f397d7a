use crate::error::{Error, Result};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// `shutdown` blocks until every live batch resolves on its own.
    Drain,
    /// `shutdown` cancels live batches and resolves their handles as
    /// cancelled.
    Abandon,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        ShutdownPolicy::Drain
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub num_threads: Option<usize>,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    pub pin_workers: bool,

    /// A worker requests a steal only from a peer whose load exceeds its
    /// own by at least this margin.
    pub steal_margin: usize,

    /// Longest single pause a fully backed-off worker takes between polls.
    pub idle_park: Duration,

    pub max_live_batches: Option<usize>,
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: None,
            thread_name_prefix: "spindle-worker".to_string(),
            stack_size: Some(2 * 1024 * 1024),
            pin_workers: false,
            steal_margin: 2,
            idle_park: Duration::from_micros(100),
            max_live_batches: None,
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.num_threads {
            if n == 0 {
                return Err(Error::config("num_threads must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("num_threads too large (max 1024)"));
            }
        }

        if self.steal_margin == 0 {
            return Err(Error::config("steal_margin must be >= 1"));
        }

        if self.idle_park.is_zero() {
            return Err(Error::config("idle_park must be > 0"));
        }

        if self.max_live_batches == Some(0) {
            return Err(Error::config("max_live_batches must be > 0 when set"));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.config.pin_workers = pin;
        self
    }

    pub fn steal_margin(mut self, margin: usize) -> Self {
        self.config.steal_margin = margin;
        self
    }

    pub fn idle_park(mut self, pause: Duration) -> Self {
        self.config.idle_park = pause;
        self
    }

    pub fn max_live_batches(mut self, cap: usize) -> Self {
        self.config.max_live_batches = Some(cap);
        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.config.shutdown_policy = policy;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
