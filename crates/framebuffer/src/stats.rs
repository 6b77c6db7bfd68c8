//! Per-frame telemetry. Queue and work samples come from the router lanes;
//! the frame-level durations come from the wait and gather paths.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct FrameStats {
    pub queue_times: Vec<Duration>,
    pub work_times: Vec<Duration>,
    pub wait_frame: Duration,
    pub compress: Duration,
    pub decompress: Duration,
    pub gather: Duration,
    pub master_write: Duration,
    pub compressed_percent: f64,
}

impl FrameStats {
    pub fn clear_task_samples(&mut self) {
        self.queue_times.clear();
        self.work_times.clear();
    }
}

/// Distribution summary of a sample set, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl Summary {
    pub fn of(samples: &[Duration]) -> Option<Summary> {
        if samples.is_empty() {
            return None;
        }
        let mut millis: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1e3).collect();
        millis.sort_by(|a, b| a.partial_cmp(b).expect("durations are finite"));

        let min = millis[0];
        let max = millis[millis.len() - 1];
        let mean = millis.iter().sum::<f64>() / millis.len() as f64;
        let mid = millis.len() / 2;
        let median = if millis.len() % 2 == 0 {
            (millis[mid - 1] + millis[mid]) / 2.0
        } else {
            millis[mid]
        };
        Some(Summary {
            min,
            max,
            mean,
            median,
        })
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "min {:.3}ms, median {:.3}ms, mean {:.3}ms, max {:.3}ms",
            self.min, self.median, self.mean, self.max
        )
    }
}
