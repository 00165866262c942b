use super::{DetectionError, Detector};
use crate::{config::StubDetectorConfig, decoder::RawImage, detection::DetectionRecord};
use std::time::Duration;
use tokio::time::sleep;
use tonic::async_trait;

/// Answers every frame with the same configured detections.
#[derive(Debug, Clone)]
pub struct StubDetector {
    detections: Vec<DetectionRecord>,
    delay: Option<Duration>,
}

impl StubDetector {
    pub fn new(detections: Vec<DetectionRecord>, delay: Option<Duration>) -> Self {
        Self { detections, delay }
    }

    pub fn from_config(config: &StubDetectorConfig) -> Self {
        Self::new(config.detections.clone(), config.get_delay())
    }
}

#[async_trait]
impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn detect(&self, image: RawImage) -> Result<Vec<DetectionRecord>, DetectionError> {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }

        tracing::debug!(
            width = image.width(),
            height = image.height(),
            detections = self.detections.len(),
            "Stub detection"
        );
        Ok(self.detections.clone())
    }
}
