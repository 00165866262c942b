use crate::{
    config::SessionConfig,
    decoder::{DecodeError, FrameDecoder},
    detection::{DetectionRecord, DetectionResult},
    detector::{DetectionError, Detector},
    protocol::{parse_client_bytes, parse_client_message, FrameSubmit, ProtocolError, ServerMessage},
    registry::{SessionHandle, SessionId, SessionRegistry, SessionState},
    telemetry::Metrics,
    transport::{Inbound, Outbound, TransportError, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION},
};
use futures::{
    future::{self, BoxFuture},
    stream::FuturesOrdered,
    FutureExt, Sink, SinkExt, Stream, StreamExt,
};
use std::{net::SocketAddr, pin::pin, sync::Arc, time::Duration};
use tokio::time::{timeout, Instant};
use tokio_util::task::AbortOnDropHandle;
use tracing::Instrument;

/// One frame accepted from a session, numbered from 0 in arrival order.
#[derive(Debug)]
pub struct FrameRequest {
    pub session_id: SessionId,
    pub sequence: u64,
    pub image: String,
}

#[derive(Debug)]
struct FrameFailure {
    sequence: u64,
    error: ProtocolError,
}

type PendingReply = BoxFuture<'static, Result<DetectionResult, FrameFailure>>;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// The client closed the connection or the stream ended.
    ClientClosed,
    /// Reading or writing failed.
    TransportFailed(TransportError),
    /// The registry cancelled the session.
    Shutdown,
    /// Too many consecutive client errors.
    PolicyViolation,
}

impl SessionEnd {
    fn close_frame(&self) -> Option<Outbound> {
        match self {
            SessionEnd::Shutdown => Some(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "server shutting down",
            }),
            SessionEnd::PolicyViolation => Some(Outbound::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason: "too many invalid frames",
            }),
            SessionEnd::ClientClosed | SessionEnd::TransportFailed(_) => None,
        }
    }
}

/// Runs sessions. Holds only shared, read-only collaborators, so one
/// instance serves every connection.
#[derive(Clone)]
pub struct Dispatcher {
    decoder: FrameDecoder,
    detector: Arc<dyn Detector>,
    detection_timeout: Duration,
    max_in_flight: usize,
    max_consecutive_errors: Option<u32>,
    metrics: Arc<Metrics>,
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    pub fn new(
        config: &SessionConfig,
        detector: Arc<dyn Detector>,
        metrics: Arc<Metrics>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            decoder: FrameDecoder::from_config(config),
            detector,
            detection_timeout: config.get_detection_timeout(),
            max_in_flight: config.get_max_in_flight(),
            max_consecutive_errors: config.max_consecutive_errors,
            metrics,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Drives one connection until it closes. Replies are written in the
    /// order their frames arrived, and at most `max_in_flight` frames are
    /// pending at any time; beyond that the connection is not read.
    pub async fn serve<I, O>(&self, inbound: I, outbound: O, peer: Option<SocketAddr>) -> SessionEnd
    where
        I: Stream<Item = Result<Inbound, TransportError>> + Send,
        O: Sink<Outbound, Error = TransportError> + Send,
    {
        let handle = self.registry.register(peer);
        let span = tracing::info_span!("session", session_id = %handle.id());

        self.run(handle, inbound, outbound).instrument(span).await
    }

    async fn run<I, O>(&self, handle: SessionHandle, inbound: I, outbound: O) -> SessionEnd
    where
        I: Stream<Item = Result<Inbound, TransportError>> + Send,
        O: Sink<Outbound, Error = TransportError> + Send,
    {
        let mut inbound = pin!(inbound);
        let mut outbound = pin!(outbound);
        let cancel = handle.cancellation().clone();

        let mut pending: FuturesOrdered<PendingReply> = FuturesOrdered::new();
        let mut next_sequence: u64 = 0;
        let mut consecutive_errors: u32 = 0;

        let end = loop {
            let can_read = pending.len() < self.max_in_flight;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break SessionEnd::Shutdown,

                Some(done) = pending.next(), if !pending.is_empty() => {
                    let reply = self.finish_frame(done, &mut consecutive_errors);
                    if let Err(e) = outbound.send(Outbound::Text(reply.to_json())).await {
                        break SessionEnd::TransportFailed(e);
                    }
                    if self
                        .max_consecutive_errors
                        .is_some_and(|limit| consecutive_errors >= limit)
                    {
                        tracing::warn!(consecutive_errors, "Closing session after repeated invalid frames");
                        break SessionEnd::PolicyViolation;
                    }
                }

                message = inbound.next(), if can_read => {
                    let parsed = match message {
                        Some(Ok(Inbound::Text(text))) => parse_client_message(text.as_str()),
                        Some(Ok(Inbound::Binary(bytes))) => parse_client_bytes(&bytes),
                        Some(Ok(Inbound::Close)) | None => break SessionEnd::ClientClosed,
                        Some(Err(e)) => break SessionEnd::TransportFailed(e),
                    };

                    self.metrics.record_frame_received();
                    let sequence = next_sequence;
                    next_sequence += 1;

                    let reply = match parsed {
                        Ok(FrameSubmit { image }) => self.dispatch(FrameRequest {
                            session_id: handle.id(),
                            sequence,
                            image,
                        }),
                        Err(error) => future::ready(Err(FrameFailure { sequence, error })).boxed(),
                    };
                    pending.push_back(reply);
                }
            }
        };

        if !pending.is_empty() {
            tracing::debug!(abandoned = pending.len(), "Abandoning in-flight frames");
        }
        // Dropping the queue aborts every detection still running.
        drop(pending);

        match &end {
            SessionEnd::TransportFailed(e) => {
                tracing::warn!("Session transport failed: {}", e);
            }
            _ => {
                handle.set_state(SessionState::Closing);
                if let Some(frame) = end.close_frame() {
                    if let Err(e) = outbound.send(frame).await {
                        tracing::debug!("Failed to send close frame: {}", e);
                    }
                }
                if let Err(e) = outbound.close().await {
                    tracing::debug!("Failed to close connection: {}", e);
                }
            }
        }

        handle.set_state(SessionState::Closed);
        tracing::info!(frames = next_sequence, end = ?end, "Session closed");
        end
    }

    /// Runs decode and detection for one frame on its own task. Dropping the
    /// returned future aborts the task.
    fn dispatch(&self, request: FrameRequest) -> PendingReply {
        let FrameRequest {
            session_id,
            sequence,
            image,
        } = request;

        let task = tokio::spawn(
            process_frame(
                self.decoder.clone(),
                Arc::clone(&self.detector),
                self.detection_timeout,
                Arc::clone(&self.metrics),
                image,
            )
            .instrument(tracing::debug_span!("frame", %session_id, sequence)),
        );
        let task = AbortOnDropHandle::new(task);

        async move {
            match task.await {
                Ok(Ok(detections)) => Ok(DetectionResult {
                    sequence,
                    detections,
                }),
                Ok(Err(error)) => Err(FrameFailure { sequence, error }),
                Err(e) => Err(FrameFailure {
                    sequence,
                    error: DetectionError::Internal(format!("detection task failed: {}", e)).into(),
                }),
            }
        }
        .boxed()
    }

    fn finish_frame(
        &self,
        done: Result<DetectionResult, FrameFailure>,
        consecutive_errors: &mut u32,
    ) -> ServerMessage {
        match done {
            Ok(DetectionResult {
                sequence,
                detections,
            }) => {
                *consecutive_errors = 0;
                tracing::debug!(sequence, detections = detections.len(), "Frame answered");
                ServerMessage::detections(detections)
            }
            Err(FrameFailure { sequence, error }) => {
                self.metrics.record_frame_failed(error.reason());
                if error.is_client_error() {
                    *consecutive_errors += 1;
                    tracing::debug!(sequence, "Rejected frame: {}", error);
                } else {
                    tracing::warn!(sequence, "Detection failed: {}", error);
                }
                error.into()
            }
        }
    }
}

async fn process_frame(
    decoder: FrameDecoder,
    detector: Arc<dyn Detector>,
    detection_timeout: Duration,
    metrics: Arc<Metrics>,
    image: String,
) -> Result<Vec<DetectionRecord>, ProtocolError> {
    let started = Instant::now();

    let raw = tokio::task::spawn_blocking(move || {
        let payload = decoder.decode_payload(&image)?;
        decoder.decode(payload)
    })
    .await
    .map_err(|_| DecodeError::Interrupted)??;

    let detections = timeout(detection_timeout, detector.detect(raw))
        .await
        .map_err(|_| DetectionError::Timeout(detection_timeout))??;

    metrics.record_detection_duration(started.elapsed().as_secs_f64() * 1000.0);

    Ok(detections
        .into_iter()
        .map(DetectionRecord::normalized)
        .collect())
}
