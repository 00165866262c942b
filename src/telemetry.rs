use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::HashSet;

const NAMESPACE: &str = "frame_gateway";

pub struct Metrics {
    frames_received: IntCounter,
    frames_failed: IntCounterVec,
    detection_duration: Histogram,
    active_sessions: IntGauge,
    sessions_opened: IntCounter,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let frames_received =
            IntCounter::new("frames_received_total", "Total number of frames received")?;

        let frames_failed = IntCounterVec::new(
            Opts::new(
                "frames_failed_total",
                "Total number of frames answered with an error",
            ),
            &["reason"],
        )?;

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));
        let detection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "detection_duration_ms",
                "Duration of decode and detection per frame in milliseconds",
            )
            .buckets(boundaries),
        )?;

        let active_sessions = IntGauge::new("active_sessions", "Number of open sessions")?;
        let sessions_opened =
            IntCounter::new("sessions_opened_total", "Total number of sessions accepted")?;

        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_failed.clone()))?;
        registry.register(Box::new(detection_duration.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(sessions_opened.clone()))?;

        Ok(Metrics {
            frames_received,
            frames_failed,
            detection_duration,
            active_sessions,
            sessions_opened,
            registry,
        })
    }

    pub fn record_frame_received(&self) {
        self.frames_received.inc();
    }

    pub fn record_frame_failed(&self, reason: &str) {
        self.frames_failed.with_label_values(&[reason]).inc();
    }

    pub fn record_detection_duration(&self, duration_ms: f64) {
        self.detection_duration.observe(duration_ms);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.inc();
        self.active_sessions.inc();
    }

    pub fn record_session_closed(&self) {
        self.active_sessions.dec();
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 26, 46, 146);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_render_exposes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_frame_received();
        metrics.record_frame_received();
        metrics.record_frame_failed("invalid_json");
        metrics.record_detection_duration(12.0);
        metrics.record_session_opened();

        let text = metrics.render().unwrap();

        assert!(text.contains("frame_gateway_frames_received_total 2"));
        assert!(text.contains("frame_gateway_frames_failed_total{reason=\"invalid_json\"} 1"));
        assert!(text.contains("frame_gateway_detection_duration_ms_count 1"));
        assert!(text.contains("frame_gateway_active_sessions 1"));

        metrics.record_session_closed();
        assert!(metrics
            .render()
            .unwrap()
            .contains("frame_gateway_active_sessions 0"));
    }
}
