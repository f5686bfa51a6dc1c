//! Tunable intervals, limits and timeouts.

use std::time::Duration;

/// Polling interval used when a start request does not specify one.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
/// Interval between continuous kill ticks.
pub const DEFAULT_KILL_INTERVAL: Duration = Duration::from_secs(2);
/// Length of the normalized prefix used as a kill signature.
pub const SIGNATURE_LEN: usize = 80;
/// Maximum rows returned by a discovered-queries read.
pub const DISCOVERED_QUERIES_LIMIT: usize = 100;

/// Runtime settings for the monitoring core.
///
/// Timeouts are deployment parameters; every blocking network step is bounded
/// by one of them.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub default_poll_interval_secs: u64,
    pub kill_interval: Duration,
    pub signature_len: usize,
    pub discovered_limit: usize,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
    pub ssh_timeout: Duration,
    pub ssh_keepalive: Duration,
    pub pool_max_size: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            default_poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            kill_interval: DEFAULT_KILL_INTERVAL,
            signature_len: SIGNATURE_LEN,
            discovered_limit: DISCOVERED_QUERIES_LIMIT,
            connect_timeout: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(30),
            ssh_timeout: Duration::from_secs(20),
            ssh_keepalive: Duration::from_secs(30),
            pool_max_size: 4,
        }
    }
}

impl MonitorSettings {
    /// Upper bound for one polling or kill cycle, including connection setup.
    pub fn cycle_timeout(&self) -> Duration {
        self.connect_timeout + self.ssh_timeout + self.statement_timeout * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_timeout_covers_connection_setup() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.cycle_timeout(), Duration::from_secs(10 + 20 + 2 * 30));

        let tight = MonitorSettings {
            connect_timeout: Duration::from_secs(1),
            ssh_timeout: Duration::from_secs(2),
            statement_timeout: Duration::from_millis(500),
            ..MonitorSettings::default()
        };
        assert_eq!(tight.cycle_timeout(), Duration::from_secs(4));
    }
}
