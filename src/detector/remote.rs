use super::{
    proto::{
        yolo_service_client::YoloServiceClient, BoundingBox, Empty, ImageFrame, PredictionBatch,
    },
    DetectionError, Detector,
};
use crate::{config::RemoteDetectorConfig, decoder::RawImage, detection::DetectionRecord};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tonic::{
    async_trait,
    transport::{Channel, Endpoint},
    Code, Request, Status,
};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum RemoteDetectorError {
    #[error("Failed to connect to gRPC server: {0}")]
    ConnectionFailed(#[from] tonic::transport::Error),
    #[error("Maximum connection retries exceeded.")]
    MaxRetriesExceeded,
    #[error("gRPC request failed: {0}")]
    GrpcRequestFailed(#[from] Status),
}

/// Forwards frames to a YOLO inference service over gRPC.
#[derive(Debug, Clone)]
pub struct RemoteDetector {
    client: YoloServiceClient<Channel>,
    class_labels: Arc<Vec<String>>,
}

impl RemoteDetector {
    pub async fn connect(config: &RemoteDetectorConfig) -> Result<Self, RemoteDetectorError> {
        let mut client = Self::get_client(config).await?;

        // Labels are fetched once; the service does not change them at runtime.
        let labels = client
            .get_yolo_class_labels(Request::new(Empty {}))
            .await?
            .into_inner();
        let class_labels = labels
            .class_labels
            .into_iter()
            .map(|color_label| color_label.label)
            .collect::<Vec<_>>();
        tracing::info!(
            address = %config.get_address(),
            labels = class_labels.len(),
            "Connected to inference service"
        );

        Ok(Self {
            client,
            class_labels: Arc::new(class_labels),
        })
    }

    async fn get_client(
        config: &RemoteDetectorConfig,
    ) -> Result<YoloServiceClient<Channel>, RemoteDetectorError> {
        let endpoint = Endpoint::from_shared(config.get_address())?;
        let attempt_timeout = Duration::from_millis(config.connect_timeout_ms);
        let max_retry_delay = Duration::from_millis(config.max_retry_delay_ms);
        let mut retry_delay = Duration::from_millis(config.initial_retry_delay_ms);

        for retry_count in 0..config.max_retries {
            match timeout(attempt_timeout, endpoint.connect()).await {
                Ok(Ok(channel)) => return Ok(YoloServiceClient::new(channel)),
                Ok(Err(e)) => {
                    tracing::error!("Failed to connect to gRPC server: {:?}", e);
                }
                Err(_) => {
                    tracing::error!("Connection timeout");
                }
            }

            tracing::warn!(
                "Retrying connection (attempt {}/{})",
                retry_count + 1,
                config.max_retries
            );
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(RemoteDetectorError::MaxRetriesExceeded)
    }
}

#[async_trait]
impl Detector for RemoteDetector {
    fn name(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip_all, fields(detector = "remote"))]
    async fn detect(&self, image: RawImage) -> Result<Vec<DetectionRecord>, DetectionError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let frame = ImageFrame {
            image_data: image.encoded.to_vec(),
            timestamp,
        };

        let mut client = self.client.clone();
        let batch = client
            .predict(Request::new(frame))
            .await
            .map_err(status_to_error)?
            .into_inner();

        Ok(label_detections(batch, &self.class_labels))
    }
}

fn status_to_error(status: Status) -> DetectionError {
    let message = status.message().to_string();
    match status.code() {
        Code::InvalidArgument => DetectionError::Rejected(message),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted => {
            DetectionError::Unavailable(message)
        }
        code => DetectionError::Internal(format!("{:?}: {}", code, message)),
    }
}

fn label_detections(batch: PredictionBatch, class_labels: &[String]) -> Vec<DetectionRecord> {
    batch
        .detections
        .into_iter()
        .map(|bbox: BoundingBox| {
            let class_label = class_labels
                .get(bbox.class_id as usize)
                .cloned()
                .unwrap_or_else(|| format!("Unknown class {}", bbox.class_id));

            DetectionRecord::new(
                [bbox.x1, bbox.y1, bbox.x2, bbox.y2],
                class_label,
                bbox.confidence,
            )
        })
        .collect()
}
