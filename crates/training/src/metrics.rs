use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Per-step bookkeeping: smoothed loss, character accuracy, and throughput.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    chars_processed: u64,
    loss_ema: ExponentialMovingAverage,
    accuracy_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            chars_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            accuracy_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, chars: u64, loss: f64, accuracy: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.chars_processed = self.chars_processed.saturating_add(chars);
        let step_chars_per_sec = if step_duration > Duration::ZERO {
            chars as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            accuracy: self.accuracy_ema.update(accuracy),
            step_accuracy: accuracy,
            chars,
            chars_per_sec: self.throughput_ema.update(step_chars_per_sec),
            total_chars: self.chars_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub accuracy: f64,
    pub step_accuracy: f64,
    pub chars: u64,
    pub chars_per_sec: f64,
    pub total_chars: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
        assert_eq!(ema.value(), Some(3.0));
    }

    #[test]
    fn snapshot_accumulates_characters() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_step(100, 2.0, 0.5);
        let snapshot = metrics.record_step(50, 1.0, 0.6);
        assert_eq!(snapshot.total_chars, 150);
        assert!(snapshot.loss < 2.0);
    }
}
