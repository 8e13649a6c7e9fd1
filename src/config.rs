use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use crate::viewport::MAX_VIEWPORTS;

pub const SEQUENCE_DISPLAY_HOLD: Duration = Duration::from_millis(1500);
pub const ALERT_AUTO_CLOSE: Duration = Duration::from_millis(5000);
pub const SURFACE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

const DEFAULT_SEQUENCE_TIMEOUT_MS: u64 = 1000;
const MAX_EXTRACT_WORKERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerConfig {
    pub extract_workers: usize,
    pub viewport_count: usize,
    pub sequence_timeout: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        let auto_workers = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4)
            .clamp(1, 8);
        Self {
            extract_workers: auto_workers,
            viewport_count: MAX_VIEWPORTS,
            sequence_timeout: Duration::from_millis(DEFAULT_SEQUENCE_TIMEOUT_MS),
        }
    }
}

impl ViewerConfig {
    /// Defaults overridden by `QUADVIEW_*` variables, read once per process.
    pub fn from_env() -> Self {
        static CONFIG: OnceLock<ViewerConfig> = OnceLock::new();

        *CONFIG.get_or_init(|| Self::from_lookup(|name| std::env::var(name).ok()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let positive = |name: &str| -> Option<u64> {
            let value = lookup(name)?.trim().parse::<u64>().ok()?;
            (value > 0).then_some(value)
        };

        Self {
            extract_workers: positive("QUADVIEW_EXTRACT_WORKERS")
                .map_or(defaults.extract_workers, |value| value as usize)
                .clamp(1, MAX_EXTRACT_WORKERS),
            viewport_count: positive("QUADVIEW_VIEWPORTS")
                .map_or(defaults.viewport_count, |value| value as usize)
                .clamp(1, MAX_VIEWPORTS),
            sequence_timeout: positive("QUADVIEW_SEQUENCE_TIMEOUT_MS")
                .map_or(defaults.sequence_timeout, Duration::from_millis),
        }
    }

    /// Workers for a batch of `file_count` files.
    pub fn workers_for(&self, file_count: usize) -> usize {
        self.extract_workers
            .clamp(1, MAX_EXTRACT_WORKERS)
            .min(file_count.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ViewerConfig {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        ViewerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = config(&[]);
        assert_eq!(config, ViewerConfig::default());
        assert_eq!(config.viewport_count, 4);
        assert_eq!(config.sequence_timeout, Duration::from_millis(1000));
        assert!((1..=8).contains(&config.extract_workers));
    }

    #[test]
    fn overrides_are_clamped() {
        let config = config(&[
            ("QUADVIEW_EXTRACT_WORKERS", "500"),
            ("QUADVIEW_VIEWPORTS", "9"),
            ("QUADVIEW_SEQUENCE_TIMEOUT_MS", " 250 "),
        ]);
        assert_eq!(config.extract_workers, 32);
        assert_eq!(config.viewport_count, 4);
        assert_eq!(config.sequence_timeout, Duration::from_millis(250));
    }

    #[test]
    fn zero_or_garbage_falls_back() {
        let config = config(&[
            ("QUADVIEW_EXTRACT_WORKERS", "0"),
            ("QUADVIEW_VIEWPORTS", "two"),
        ]);
        let defaults = ViewerConfig::default();
        assert_eq!(config.extract_workers, defaults.extract_workers);
        assert_eq!(config.viewport_count, 4);
    }

    #[test]
    fn workers_never_exceed_batch() {
        let config = config(&[("QUADVIEW_EXTRACT_WORKERS", "8")]);
        assert_eq!(config.workers_for(3), 3);
        assert_eq!(config.workers_for(0), 1);
        assert_eq!(config.workers_for(100), 8);
    }
}
