//! Runtime configuration for sessions.

use std::time::Duration;

use crate::event_bus::{EventBus, StdOutSink, TraceLog};

/// Tunables for one session's runtime behaviour.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Concurrent executors per worker process.
    pub worker_concurrency: usize,
    /// Consult storage for terminal results of freshly registered calls,
    /// extending memoization across session boundaries.
    pub cross_session_memoization: bool,
    /// Backoff policy for broker/storage faults.
    pub retry: RetryPolicy,
    /// Event bus wiring.
    pub event_bus: EventBusConfig,
    /// SQLite database name for the durable storage adapter; resolved
    /// against `MYCELIA_SQLITE_DB` when unset.
    pub sqlite_db_name: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cross_session_memoization: false,
            retry: RetryPolicy::default(),
            event_bus: EventBusConfig::default(),
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
        }
    }
}

impl RuntimeConfig {
    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if provided.is_some() {
            return provided;
        }
        dotenvy::dotenv().ok();
        Some(std::env::var("MYCELIA_SQLITE_DB").unwrap_or_else(|_| "mycelia.db".to_string()))
    }

    #[must_use]
    pub fn with_worker_concurrency(mut self, limit: usize) -> Self {
        self.worker_concurrency = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_cross_session_memoization(mut self, enabled: bool) -> Self {
        self.cross_session_memoization = enabled;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    #[must_use]
    pub fn with_sqlite_db_name(mut self, name: impl Into<String>) -> Self {
        self.sqlite_db_name = Self::resolve_sqlite_db_name(Some(name.into()));
        self
    }

    /// Database URL for the SQLite storage adapter: an explicit
    /// `MYCELIA_SQLITE_URL` wins, otherwise the configured db name.
    pub fn sqlite_url(&self) -> String {
        std::env::var("MYCELIA_SQLITE_URL").unwrap_or_else(|_| {
            let name = self.sqlite_db_name.as_deref().unwrap_or("mycelia.db");
            format!("sqlite://{name}")
        })
    }
}

/// Capped exponential backoff for infrastructure faults.
///
/// The delay for attempt `n` (zero-based) is `base * 2^n`, capped at
/// `max`. Infrastructure errors never fail a call; the worker simply
/// waits and retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Which sinks a session's event bus is built with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub sinks: Vec<SinkConfig>,
}

impl EventBusConfig {
    #[must_use]
    pub fn with_stdout_only() -> Self {
        Self {
            sinks: vec![SinkConfig::StdOut],
        }
    }

    #[must_use]
    pub fn with_memory_sink() -> Self {
        Self {
            sinks: vec![SinkConfig::StdOut, SinkConfig::Memory],
        }
    }

    #[must_use]
    pub fn add_sink(mut self, sink: SinkConfig) -> Self {
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
        self
    }

    /// Materialize the configured bus.
    pub fn build_event_bus(&self) -> EventBus {
        let sinks: Vec<Box<dyn crate::event_bus::EventSink>> = self
            .sinks
            .iter()
            .map(|sink| -> Box<dyn crate::event_bus::EventSink> {
                match sink {
                    SinkConfig::StdOut => Box::new(StdOutSink::default()),
                    SinkConfig::Memory => Box::new(TraceLog::new()),
                }
            })
            .collect();
        EventBus::with_sinks(sinks)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::with_stdout_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(30), Duration::from_millis(500));
    }

    #[test]
    fn worker_concurrency_never_zero() {
        let config = RuntimeConfig::default().with_worker_concurrency(0);
        assert_eq!(config.worker_concurrency, 1);
    }

    #[test]
    fn add_sink_deduplicates() {
        let config = EventBusConfig::with_stdout_only()
            .add_sink(SinkConfig::Memory)
            .add_sink(SinkConfig::Memory);
        assert_eq!(
            config.sinks,
            vec![SinkConfig::StdOut, SinkConfig::Memory]
        );
    }
}
