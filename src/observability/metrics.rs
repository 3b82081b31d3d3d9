// Render coordination metrics
//
// Counters for admissions, lock contention and render outcomes plus a
// render duration histogram, exported in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::types::{RenderError, RenderOutcome};
use crate::safety::LockStats;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that can move both ways
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct HistogramBucket {
    le: f64, // upper bound in seconds
    count: AtomicU64,
}

/// Duration histogram with cumulative buckets
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for renders: one second to one hour
    pub fn new_render_duration() -> Self {
        let bounds = [1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0];
        Self {
            buckets: bounds
                .iter()
                .map(|&le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Metrics owned by one coordinator
#[derive(Debug)]
pub struct RenderMetrics {
    pub uploads_accepted: Counter,
    pub uploads_rejected: Counter,
    pub lock_contentions: Counter,
    pub stale_locks_reaped: Counter,
    pub renders_started: Counter,
    pub renders_done: Counter,
    pub renders_non_zero_exit: Counter,
    pub renders_signaled: Counter,
    pub renders_error_marker: Counter,
    pub renders_timeout: Counter,
    pub renders_missing_artifact: Counter,
    pub renders_spawn_failed: Counter,
    pub mirror_fetched: Counter,
    pub mirror_failed: Counter,
    pub active_renders: Gauge,
    pub render_duration: Histogram,
}

impl Default for RenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderMetrics {
    pub fn new() -> Self {
        Self {
            uploads_accepted: Counter::new(),
            uploads_rejected: Counter::new(),
            lock_contentions: Counter::new(),
            stale_locks_reaped: Counter::new(),
            renders_started: Counter::new(),
            renders_done: Counter::new(),
            renders_non_zero_exit: Counter::new(),
            renders_signaled: Counter::new(),
            renders_error_marker: Counter::new(),
            renders_timeout: Counter::new(),
            renders_missing_artifact: Counter::new(),
            renders_spawn_failed: Counter::new(),
            mirror_fetched: Counter::new(),
            mirror_failed: Counter::new(),
            active_renders: Gauge::new(),
            render_duration: Histogram::new_render_duration(),
        }
    }

    pub fn record_outcome(&self, outcome: &RenderOutcome, wall_time: Duration) {
        self.render_duration.observe(wall_time);
        match outcome {
            RenderOutcome::Done(_) => self.renders_done.inc(),
            RenderOutcome::Failed(failure) => match failure.error {
                RenderError::NonZeroExit { .. } => self.renders_non_zero_exit.inc(),
                RenderError::Signaled { .. } => self.renders_signaled.inc(),
                RenderError::ErrorMarkerInOutput => self.renders_error_marker.inc(),
                RenderError::Timeout { .. } => self.renders_timeout.inc(),
                RenderError::MissingArtifact { .. } => self.renders_missing_artifact.inc(),
            },
        }
    }

    pub fn renders_total(&self) -> u64 {
        self.renders_done.get()
            + self.renders_non_zero_exit.get()
            + self.renders_signaled.get()
            + self.renders_error_marker.get()
            + self.renders_timeout.get()
            + self.renders_missing_artifact.get()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP renderbox_uploads_total Uploads by admission result\n");
        output.push_str("# TYPE renderbox_uploads_total counter\n");
        output.push_str(&format!(
            "renderbox_uploads_total{{result=\"accepted\"}} {}\n",
            self.uploads_accepted.get()
        ));
        output.push_str(&format!(
            "renderbox_uploads_total{{result=\"rejected\"}} {}\n",
            self.uploads_rejected.get()
        ));

        output.push_str("# HELP renderbox_lock_contentions_total Requests refused as busy\n");
        output.push_str("# TYPE renderbox_lock_contentions_total counter\n");
        output.push_str(&format!(
            "renderbox_lock_contentions_total {}\n",
            self.lock_contentions.get()
        ));

        output.push_str("# HELP renderbox_stale_locks_reaped_total Lock markers removed at startup\n");
        output.push_str("# TYPE renderbox_stale_locks_reaped_total counter\n");
        output.push_str(&format!(
            "renderbox_stale_locks_reaped_total {}\n",
            self.stale_locks_reaped.get()
        ));

        output.push_str("# HELP renderbox_renders_started_total Renderer processes started\n");
        output.push_str("# TYPE renderbox_renders_started_total counter\n");
        output.push_str(&format!(
            "renderbox_renders_started_total {}\n",
            self.renders_started.get()
        ));

        output.push_str("# HELP renderbox_renders_total Finished renders by outcome\n");
        output.push_str("# TYPE renderbox_renders_total counter\n");
        for (outcome, counter) in [
            ("done", &self.renders_done),
            ("non_zero_exit", &self.renders_non_zero_exit),
            ("signaled", &self.renders_signaled),
            ("error_marker", &self.renders_error_marker),
            ("timeout", &self.renders_timeout),
            ("missing_artifact", &self.renders_missing_artifact),
        ] {
            output.push_str(&format!(
                "renderbox_renders_total{{outcome=\"{}\"}} {}\n",
                outcome,
                counter.get()
            ));
        }

        output.push_str("# HELP renderbox_render_spawn_failures_total Renderer start failures\n");
        output.push_str("# TYPE renderbox_render_spawn_failures_total counter\n");
        output.push_str(&format!(
            "renderbox_render_spawn_failures_total {}\n",
            self.renders_spawn_failed.get()
        ));

        output.push_str("# HELP renderbox_mirror_fetches_total Remote asset fetches\n");
        output.push_str("# TYPE renderbox_mirror_fetches_total counter\n");
        output.push_str(&format!(
            "renderbox_mirror_fetches_total{{result=\"ok\"}} {}\n",
            self.mirror_fetched.get()
        ));
        output.push_str(&format!(
            "renderbox_mirror_fetches_total{{result=\"failed\"}} {}\n",
            self.mirror_failed.get()
        ));

        output.push_str("# HELP renderbox_active_renders Renders currently running\n");
        output.push_str("# TYPE renderbox_active_renders gauge\n");
        output.push_str(&format!(
            "renderbox_active_renders {}\n",
            self.active_renders.get()
        ));

        output.push_str("# HELP renderbox_render_duration_seconds Render wall time\n");
        output.push_str("# TYPE renderbox_render_duration_seconds histogram\n");
        for bucket in &self.render_duration.buckets {
            output.push_str(&format!(
                "renderbox_render_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "renderbox_render_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.render_duration.get_count()
        ));
        output.push_str(&format!(
            "renderbox_render_duration_seconds_sum {}\n",
            self.render_duration.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "renderbox_render_duration_seconds_count {}\n",
            self.render_duration.get_count()
        ));

        output
    }
}

/// Prometheus lines for lock manager counters
pub fn export_lock_stats(stats: &LockStats) -> String {
    let mut output = String::new();
    output.push_str("# HELP renderbox_lock_operations_total Lock marker operations\n");
    output.push_str("# TYPE renderbox_lock_operations_total counter\n");
    for (op, value) in [
        ("acquire", stats.acquisitions),
        ("release", stats.releases),
        ("contention", stats.contentions),
        ("sweep", stats.swept),
    ] {
        output.push_str(&format!(
            "renderbox_lock_operations_total{{op=\"{}\"}} {}\n",
            op, value
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RenderFailure;
    use std::path::PathBuf;

    #[test]
    fn gauge_never_goes_negative() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let hist = Histogram::new_render_duration();
        hist.observe(Duration::from_millis(500));
        hist.observe(Duration::from_secs(20));

        assert_eq!(hist.get_count(), 2);
        assert_eq!(hist.get_bucket_count(1.0), 1);
        assert_eq!(hist.get_bucket_count(30.0), 2);
    }

    #[test]
    fn outcomes_land_in_their_counters() {
        let metrics = RenderMetrics::new();
        metrics.record_outcome(&RenderOutcome::Done(PathBuf::from("/o/a0001.png")), Duration::from_secs(2));
        metrics.record_outcome(
            &RenderOutcome::Failed(RenderFailure {
                error: RenderError::Timeout {
                    deadline: Duration::from_secs(1),
                },
                excerpt: String::new(),
            }),
            Duration::from_secs(1),
        );

        assert_eq!(metrics.renders_done.get(), 1);
        assert_eq!(metrics.renders_timeout.get(), 1);
        assert_eq!(metrics.renders_total(), 2);

        let text = metrics.export_prometheus();
        assert!(text.contains("renderbox_renders_total{outcome=\"done\"} 1"));
        assert!(text.contains("renderbox_renders_total{outcome=\"timeout\"} 1"));
        assert!(text.contains("renderbox_render_duration_seconds_count 2"));
    }

    #[test]
    fn lock_stats_export() {
        let text = export_lock_stats(&LockStats {
            acquisitions: 3,
            releases: 3,
            contentions: 1,
            swept: 0,
        });
        assert!(text.contains("renderbox_lock_operations_total{op=\"acquire\"} 3"));
        assert!(text.contains("renderbox_lock_operations_total{op=\"contention\"} 1"));
    }
}
