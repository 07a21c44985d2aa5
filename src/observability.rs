use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub total_duration_ms: f64,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub commands_executed: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing `step`. The duration is recorded when the timer drops.
    pub fn start_step(&self, step: &str) -> StepTimer {
        StepTimer {
            step: step.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_step_success(&self, commands: usize) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.steps_succeeded += 1;
            guard.commands_executed += commands as u64;
        }
    }

    pub fn record_step_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.steps_failed += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StepTimer {
    step: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StepTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.steps.entry(self.step.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(step = self.step.as_str(), duration_ms, "Step duration recorded");
        self.recorded = true;
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        step_count = snapshot.steps.len(),
        steps_succeeded = snapshot.steps_succeeded,
        steps_failed = snapshot.steps_failed,
        commands_executed = snapshot.commands_executed,
        "Pipeline metrics summary"
    );
    for (step, metrics) in &snapshot.steps {
        info!(
            step = step.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Step metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP seqpipe_steps_succeeded_total Steps that completed\n");
        output.push_str("# TYPE seqpipe_steps_succeeded_total counter\n");
        output.push_str(&format!(
            "seqpipe_steps_succeeded_total {}\n",
            self.steps_succeeded
        ));
        output.push_str("# HELP seqpipe_steps_failed_total Steps that raised an error\n");
        output.push_str("# TYPE seqpipe_steps_failed_total counter\n");
        output.push_str(&format!("seqpipe_steps_failed_total {}\n", self.steps_failed));
        output.push_str("# HELP seqpipe_commands_executed_total External commands launched\n");
        output.push_str("# TYPE seqpipe_commands_executed_total counter\n");
        output.push_str(&format!(
            "seqpipe_commands_executed_total {}\n",
            self.commands_executed
        ));
        output.push_str("# HELP seqpipe_step_calls_total Step invocation count\n");
        output.push_str("# TYPE seqpipe_step_calls_total counter\n");
        output.push_str(
            "# HELP seqpipe_step_duration_seconds_total Accumulated step duration in seconds\n",
        );
        output.push_str("# TYPE seqpipe_step_duration_seconds_total counter\n");
        output.push_str("# HELP seqpipe_step_duration_seconds_max Maximum step duration in seconds\n");
        output.push_str("# TYPE seqpipe_step_duration_seconds_max gauge\n");
        for (step, metrics) in &self.steps {
            output.push_str(&format!(
                "seqpipe_step_calls_total{{step=\"{}\"}} {}\n",
                step, metrics.calls
            ));
            output.push_str(&format!(
                "seqpipe_step_duration_seconds_total{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "seqpipe_step_duration_seconds_max{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP seqpipe_job_duration_seconds Total job duration\n");
        output.push_str("# TYPE seqpipe_job_duration_seconds gauge\n");
        output.push_str(&format!(
            "seqpipe_job_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_on_drop() {
        let metrics = MetricsCollector::new();
        {
            let _timer = metrics.start_step("Analysis.Flagstat");
        }
        metrics.record_step_success(2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.steps["Analysis.Flagstat"].calls, 1);
        assert_eq!(snapshot.commands_executed, 2);

        let text = snapshot.to_prometheus();
        assert!(text.contains("seqpipe_step_calls_total{step=\"Analysis.Flagstat\"} 1"));
        assert!(text.contains("seqpipe_steps_succeeded_total 1"));
    }
}
