//! Per-plugin execution metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Command execution counters for one plugin instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetrics {
    /// Commands attempted, successful or not.
    pub execution_count: u64,
    /// Cumulative wall-clock time.
    pub total_execution_time: Duration,
    /// `total_execution_time / execution_count`.
    pub average_execution_time: Duration,
    /// Commands that failed.
    pub error_count: u64,
    /// When the last command finished.
    pub last_executed: Option<DateTime<Utc>>,
}

impl PluginMetrics {
    /// Account for one finished command.
    pub fn record(&mut self, elapsed: Duration, success: bool) {
        self.execution_count = self.execution_count.saturating_add(1);
        self.total_execution_time = self.total_execution_time.saturating_add(elapsed);
        let count = u32::try_from(self.execution_count).unwrap_or(u32::MAX);
        self.average_execution_time = self
            .total_execution_time
            .checked_div(count)
            .unwrap_or_default();
        if !success {
            self.error_count = self.error_count.saturating_add(1);
        }
        self.last_executed = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_updates_average_and_errors() {
        let mut metrics = PluginMetrics::default();
        metrics.record(Duration::from_millis(10), true);
        metrics.record(Duration::from_millis(30), false);

        assert_eq!(metrics.execution_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.total_execution_time, Duration::from_millis(40));
        assert_eq!(metrics.average_execution_time, Duration::from_millis(20));
        assert!(metrics.last_executed.is_some());
    }
}
