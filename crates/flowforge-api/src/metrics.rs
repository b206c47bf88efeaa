use flowforge_core::TaskStatus;
use flowforge_store::{ReapReport, StatusCounts};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Prometheus metrics for the API service
pub struct ApiMetrics {
    pub registry: Registry,

    pub tasks_submitted_total: IntCounter,

    // Refreshed from the store by the background loop
    pub tasks: IntGaugeVec,

    pub reaper_recovered_total: IntCounterVec,

    pub http_requests_total: IntCounterVec,
}

impl ApiMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_submitted_total =
            IntCounter::new("ff_tasks_submitted_total", "Tasks accepted through the API")?;
        registry.register(Box::new(tasks_submitted_total.clone()))?;

        let tasks = IntGaugeVec::new(
            Opts::new("ff_tasks", "Number of tasks by status"),
            &["status"],
        )?;
        registry.register(Box::new(tasks.clone()))?;

        let reaper_recovered_total = IntCounterVec::new(
            Opts::new(
                "ff_reaper_recovered_total",
                "Expired claims recovered by the reaper",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(reaper_recovered_total.clone()))?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("ff_http_requests_total", "HTTP requests by route and status"),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        Ok(ApiMetrics {
            registry,
            tasks_submitted_total,
            tasks,
            reaper_recovered_total,
            http_requests_total,
        })
    }

    pub fn update_task_counts(&self, counts: &StatusCounts) {
        for status in TaskStatus::ALL {
            self.tasks
                .with_label_values(&[status.as_str()])
                .set(counts.get(status) as i64);
        }
    }

    pub fn record_reap(&self, report: &ReapReport) {
        self.reaper_recovered_total
            .with_label_values(&["requeued"])
            .inc_by(report.requeued as u64);
        self.reaper_recovered_total
            .with_label_values(&["failed"])
            .inc_by(report.failed as u64);
    }

    pub fn record_request(&self, route: &str, status: u16) {
        self.http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Text exposition of everything in the registry
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_updates() {
        let metrics = ApiMetrics::new().unwrap();
        metrics.tasks_submitted_total.inc();
        metrics.update_task_counts(&StatusCounts {
            pending: 4,
            processing: 1,
            completed: 7,
            failed: 2,
        });
        metrics.record_reap(&ReapReport {
            requeued: 3,
            failed: 1,
        });
        metrics.record_request("/tasks", 201);

        let text = metrics.render().unwrap();
        assert!(text.contains("ff_tasks_submitted_total 1"));
        assert!(text.contains("ff_tasks{status=\"pending\"} 4"));
        assert!(text.contains("ff_tasks{status=\"failed\"} 2"));
        assert!(text.contains("ff_reaper_recovered_total{outcome=\"requeued\"} 3"));
        assert!(text.contains("ff_http_requests_total{route=\"/tasks\",status=\"201\"} 1"));
    }
}
