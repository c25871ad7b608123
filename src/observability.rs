use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::StageStatus;

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub outcomes: OutcomeCounts,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub succeeded: u64,
    pub degraded: u64,
    pub failed: u64,
    pub approved: u64,
    pub rejected: u64,
    pub skipped: u64,
}

impl OutcomeCounts {
    fn labelled(&self) -> [(&'static str, u64); 6] {
        [
            ("succeeded", self.succeeded),
            ("degraded", self.degraded),
            ("failed", self.failed),
            ("approved", self.approved),
            ("rejected", self.rejected),
            ("skipped", self.skipped),
        ]
    }
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
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

    pub fn record_status(&self, status: StageStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            let counts = &mut guard.outcomes;
            match status {
                StageStatus::Succeeded => counts.succeeded += 1,
                StageStatus::Degraded => counts.degraded += 1,
                StageStatus::Failed => counts.failed += 1,
                StageStatus::Approved => counts.approved += 1,
                StageStatus::Rejected => counts.rejected += 1,
                StageStatus::Skipped => counts.skipped += 1,
            }
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

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        succeeded = snapshot.outcomes.succeeded,
        degraded = snapshot.outcomes.degraded,
        failed = snapshot.outcomes.failed,
        skipped = snapshot.outcomes.skipped,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP mlops_pipeline_stage_outcomes_total Stage outcomes by status\n");
        output.push_str("# TYPE mlops_pipeline_stage_outcomes_total counter\n");
        for (status, count) in self.outcomes.labelled() {
            output.push_str(&format!(
                "mlops_pipeline_stage_outcomes_total{{status=\"{status}\"}} {count}\n"
            ));
        }
        output.push_str("# HELP mlops_pipeline_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE mlops_pipeline_stage_calls_total counter\n");
        output.push_str(
            "# HELP mlops_pipeline_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE mlops_pipeline_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP mlops_pipeline_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE mlops_pipeline_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let label = escape_label(stage);
            output.push_str(&format!(
                "mlops_pipeline_stage_calls_total{{stage=\"{}\"}} {}\n",
                label, metrics.calls
            ));
            output.push_str(&format!(
                "mlops_pipeline_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                label,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "mlops_pipeline_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                label,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP mlops_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE mlops_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "mlops_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("Train");
        }
        collector.record_status(StageStatus::Degraded);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.stages["Train"].calls, 1);
        assert_eq!(snapshot.outcomes.degraded, 1);
    }

    #[test]
    fn prometheus_labels_are_escaped() {
        let collector = MetricsCollector::new();
        drop(collector.start_stage("Say \"hi\""));
        let text = collector.snapshot().to_prometheus();
        assert!(text.contains("stage=\"Say \\\"hi\\\"\""));
        assert!(text.contains("mlops_pipeline_stage_outcomes_total{status=\"skipped\"} 0"));
    }
}
