//! Metric logger trait and composites.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Sink for training metrics.
pub trait MetricLogger: Send + Sync {
    /// Log one named value, e.g. `train/value_loss`.
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log several values sharing a step.
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        let sorted: BTreeMap<_, _> = metrics.iter().collect();
        for (name, value) in sorted {
            self.log_scalar(name, *value, step);
        }
    }

    /// Flush pending writes.
    fn close(&self) {}
}

/// Discards everything.
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &HashMap<String, f64>, _step: u64) {}
}

/// Dispatches to several loggers in order.
#[derive(Default)]
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}

/// Keeps every logged value, in logging order.
#[derive(Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<(String, f64, u64)>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(name, value, step)` records so far.
    pub fn records(&self) -> Vec<(String, f64, u64)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Values logged under `name`.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records()
            .into_iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, _)| v)
            .collect()
    }
}

impl MetricLogger for RecordingLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut records) = self.records.lock() {
            records.push((name.to_string(), value, step));
        }
    }
}

impl<T: MetricLogger + ?Sized> MetricLogger for std::sync::Arc<T> {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        (**self).log_scalar(name, value, step);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        (**self).log_metrics(metrics, step);
    }

    fn close(&self) {
        (**self).close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(RecordingLogger::new());
        let b = Arc::new(RecordingLogger::new());
        let mut composite = CompositeLogger::new(vec![Box::new(Arc::clone(&a))]);
        composite.add(Box::new(Arc::clone(&b)));
        composite.add(Box::new(NoOpLogger));
        assert_eq!(composite.len(), 3);

        composite.log_scalar("reward/mean", 2.5, 1);
        assert_eq!(a.values("reward/mean"), vec![2.5]);
        assert_eq!(b.values("reward/mean"), vec![2.5]);
    }

    #[test]
    fn test_log_metrics_is_name_ordered() {
        let logger = RecordingLogger::new();
        let metrics: HashMap<String, f64> = [("b".to_string(), 2.0), ("a".to_string(), 1.0)].into();
        logger.log_metrics(&metrics, 7);

        let names: Vec<String> = logger.records().into_iter().map(|(n, _, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(logger.records().iter().all(|(_, _, step)| *step == 7));
    }
}
