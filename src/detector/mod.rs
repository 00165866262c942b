use crate::{
    config::{DetectorConfig, DetectorMode},
    decoder::RawImage,
    detection::DetectionRecord,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tonic::async_trait;

mod proto;
mod remote;
mod stub;

pub use remote::{RemoteDetector, RemoteDetectorError};
pub use stub::StubDetector;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detector rejected the frame: {0}")]
    Rejected(String),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("{0}")]
    Internal(String),
}

/// Turns a decoded frame into detections. Implementations may suspend for
/// as long as they need; callers bound every call with a timeout.
#[async_trait]
pub trait Detector: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn detect(&self, image: RawImage) -> Result<Vec<DetectionRecord>, DetectionError>;
}

#[derive(Error, Debug)]
pub enum DetectorSetupError {
    #[error("detector.remote must be configured when detector.mode is `remote`")]
    MissingRemoteConfig,
    #[error("Remote detector error: {0}")]
    Remote(#[from] RemoteDetectorError),
}

pub async fn build_detector(
    config: &DetectorConfig,
) -> Result<Arc<dyn Detector>, DetectorSetupError> {
    let detector: Arc<dyn Detector> = match config.mode {
        DetectorMode::Stub => Arc::new(StubDetector::from_config(&config.stub)),
        DetectorMode::Remote => {
            let remote = config
                .remote
                .as_ref()
                .ok_or(DetectorSetupError::MissingRemoteConfig)?;
            Arc::new(RemoteDetector::connect(remote).await?)
        }
    };

    tracing::info!(detector = detector.name(), "Detector ready");
    Ok(detector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_stub_detector() {
        let detector = build_detector(&DetectorConfig::default()).await.unwrap();
        assert_eq!(detector.name(), "stub");
    }

    #[tokio::test]
    async fn test_build_remote_without_config_fails() {
        let config = DetectorConfig {
            mode: DetectorMode::Remote,
            ..DetectorConfig::default()
        };

        let result = build_detector(&config).await;
        assert!(matches!(
            result,
            Err(DetectorSetupError::MissingRemoteConfig)
        ));
    }

    #[test]
    fn test_timeout_message() {
        let err = DetectionError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out after 1500ms");
    }
}
