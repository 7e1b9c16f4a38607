//! Controller configuration.

use std::time::Duration;

/// Tunables for the invocation control loop, loaded from environment
/// variables or built from [`Default`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrency ceiling for the evaluation worker pool.
    pub max_parallel_evals: usize,

    /// Concurrency ceiling for the action executor pool.
    pub max_parallel_actions: usize,

    /// Re-enqueue an evaluation state when its newest record is older
    /// than this.
    pub eval_stale_threshold: Duration,

    /// Ticks between sweeps of the evaluation state registry.
    pub short_loop_period: u64,

    /// Ticks between sweeps of the invocation cache for orphans.
    pub long_loop_period: u64,

    /// Cadence of the tick counter driving the sweeps.
    pub tick_interval: Duration,

    /// Deadline applied to invocations whose spec carries none.
    pub default_invocation_timeout: Duration,

    /// Number of error-outcome evaluations tolerated before an
    /// invocation is failed. The default of 0 fails an invocation on
    /// its first error; raise it to allow transient errors to retry.
    pub max_error_count: usize,

    /// How long `close` waits for in-flight work to drain.
    pub graceful_stop_timeout: Duration,

    /// Delay before re-evaluating an invocation whose workflow is not
    /// yet ready.
    pub not_ready_retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_parallel_evals: 1000,
            max_parallel_actions: num_cpus::get().max(1) * 2,
            eval_stale_threshold: Duration::from_millis(100),
            short_loop_period: 10,
            long_loop_period: 50,
            tick_interval: Duration::from_secs(1),
            default_invocation_timeout: Duration::from_secs(10 * 60),
            max_error_count: 0,
            graceful_stop_timeout: Duration::from_secs(60),
            not_ready_retry_delay: Duration::from_millis(100),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables, falling back to
    /// the defaults above for anything unset or unparsable.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            max_parallel_evals: env_usize("HEADWAY_MAX_PARALLEL_EVALS", defaults.max_parallel_evals),
            max_parallel_actions: env_usize(
                "HEADWAY_MAX_PARALLEL_ACTIONS",
                defaults.max_parallel_actions,
            ),
            eval_stale_threshold: env_millis(
                "HEADWAY_EVAL_STALE_THRESHOLD_MS",
                defaults.eval_stale_threshold,
            ),
            short_loop_period: env_u64("HEADWAY_SHORT_LOOP_PERIOD", defaults.short_loop_period),
            long_loop_period: env_u64("HEADWAY_LONG_LOOP_PERIOD", defaults.long_loop_period),
            tick_interval: env_millis("HEADWAY_TICK_INTERVAL_MS", defaults.tick_interval),
            default_invocation_timeout: env_millis(
                "HEADWAY_DEFAULT_INVOCATION_TIMEOUT_MS",
                defaults.default_invocation_timeout,
            ),
            max_error_count: env_usize("HEADWAY_MAX_ERROR_COUNT", defaults.max_error_count),
            graceful_stop_timeout: env_millis(
                "HEADWAY_GRACEFUL_STOP_TIMEOUT_MS",
                defaults.graceful_stop_timeout,
            ),
            not_ready_retry_delay: env_millis(
                "HEADWAY_NOT_READY_RETRY_DELAY_MS",
                defaults.not_ready_retry_delay,
            ),
        })
    }
}

fn env_usize(key: &str, fallback: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn env_millis(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}
