use crate::reference::{FetchLimits, ImageFetcher, ResolvableReference, StoredReference};
use facegate_core::{
    BurstReport, Descriptor, DescriptorExtractor, ExtractorError, MatchPolicy, PipelineError,
    ReferenceError, Verifier,
};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("reference error: {0}")]
    Reference(#[from] ReferenceError),
    #[error("no face detected in registration image")]
    NoFaceDetected,
    #[error("request expired before the engine picked it up")]
    TimedOut,
    #[error("engine failed to start: {0}")]
    Startup(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Image supplied at registration.
#[derive(Debug, Clone)]
pub enum RegistrationImage {
    Bytes(Vec<u8>),
    Url(String),
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Describe {
        image: RegistrationImage,
        deadline: Instant,
        reply: oneshot::Sender<Result<Descriptor, EngineError>>,
    },
    Verify {
        frames: Vec<Vec<u8>>,
        reference: StoredReference,
        deadline: Instant,
        reply: oneshot::Sender<Result<BurstReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    policy: MatchPolicy,
}

impl EngineHandle {
    /// Extract the face descriptor of a registration image.
    pub async fn describe(
        &self,
        image: RegistrationImage,
        deadline: Instant,
    ) -> Result<Descriptor, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Describe {
                image,
                deadline,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Run burst verification against a stored reference.
    pub async fn verify(
        &self,
        frames: Vec<Vec<u8>>,
        reference: StoredReference,
        deadline: Instant,
    ) -> Result<BurstReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify {
                frames,
                reference,
                deadline,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the extractor, the verifier and the blocking HTTP client
/// used for remote references. Requests are served strictly one at a time.
/// Fails fast if the thread or its HTTP client cannot be created.
pub fn spawn_engine<E>(
    extractor: E,
    policy: MatchPolicy,
    fetch_limits: FetchLimits,
) -> Result<EngineHandle, EngineError>
where
    E: DescriptorExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            let fetcher = match ImageFetcher::new(fetch_limits) {
                Ok(fetcher) => {
                    let _ = ready_tx.send(Ok(()));
                    fetcher
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let mut extractor = extractor;
            let mut verifier = Verifier::new(policy);

            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Describe { image, deadline, reply } => {
                        let result = if Instant::now() >= deadline {
                            Err(EngineError::TimedOut)
                        } else {
                            run_describe(&mut extractor, &fetcher, image)
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Verify {
                        frames,
                        reference,
                        deadline,
                        reply,
                    } => {
                        let result = if Instant::now() >= deadline {
                            Err(EngineError::TimedOut)
                        } else {
                            let reference = ResolvableReference {
                                stored: reference,
                                fetcher: &fetcher,
                            };
                            verifier
                                .verify_burst(&mut extractor, &frames, reference)
                                .map_err(EngineError::from)
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| EngineError::Startup(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(EngineHandle { tx, policy }),
        Ok(Err(message)) => Err(EngineError::Startup(message)),
        Err(_) => Err(EngineError::ChannelClosed),
    }
}

/// Extract the single face of a registration image, downloading it first
/// when it is given by URL.
fn run_describe<E: DescriptorExtractor>(
    extractor: &mut E,
    fetcher: &ImageFetcher,
    image: RegistrationImage,
) -> Result<Descriptor, EngineError> {
    let bytes = match image {
        RegistrationImage::Bytes(bytes) => bytes,
        RegistrationImage::Url(url) => fetcher.fetch(&url)?,
    };
    let frame = match extractor.extract(&bytes) {
        Ok(frame) => frame.ok_or(EngineError::NoFaceDetected)?,
        Err(ExtractorError::Decode(err)) => {
            tracing::debug!(error = %err, "describe: image is not readable");
            return Err(EngineError::NoFaceDetected);
        }
        Err(err) => return Err(err.into()),
    };
    tracing::debug!(dim = frame.descriptor.len(), "describe: face extracted");
    Ok(frame.descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        jpeg_stub, live_burst, ScriptedExtractor, CORRUPT_KEY, NO_FACE_KEY, REFERENCE_KEY,
        STRANGER_KEY,
    };
    use facegate_core::MatchVerdict;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn limits() -> FetchLimits {
        FetchLimits {
            timeout: Duration::from_secs(2),
            max_bytes: 1024,
            allow_private_hosts: true,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    fn engine() -> EngineHandle {
        spawn_engine(ScriptedExtractor::standard(), MatchPolicy::default(), limits()).unwrap()
    }

    async fn reference_descriptor(engine: &EngineHandle) -> Descriptor {
        engine
            .describe(RegistrationImage::Bytes(jpeg_stub(REFERENCE_KEY)), deadline())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_describe_returns_descriptor() {
        let engine = engine();
        let descriptor = reference_descriptor(&engine).await;
        assert_eq!(descriptor.values, vec![0.05, 0.0]);
    }

    #[tokio::test]
    async fn test_describe_without_face() {
        let engine = engine();
        let err = engine
            .describe(RegistrationImage::Bytes(jpeg_stub(NO_FACE_KEY)), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
    }

    #[tokio::test]
    async fn test_describe_unreadable_image_is_no_face() {
        let engine = engine();
        let err = engine
            .describe(RegistrationImage::Bytes(jpeg_stub(CORRUPT_KEY)), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
    }

    #[tokio::test]
    async fn test_corrupt_frame_fails_burst_as_no_face() {
        let engine = engine();
        let reference = StoredReference::Descriptor(reference_descriptor(&engine).await);
        let mut frames = live_burst();
        frames[3] = jpeg_stub(CORRUPT_KEY);
        let report = engine.verify(frames, reference, deadline()).await.unwrap();
        assert_eq!(report.verdict, MatchVerdict::FailedNoFace);
    }

    #[tokio::test]
    async fn test_verify_accepts_live_burst() {
        let engine = engine();
        let reference = StoredReference::Descriptor(reference_descriptor(&engine).await);
        let report = engine.verify(live_burst(), reference, deadline()).await.unwrap();
        assert_eq!(report.verdict, MatchVerdict::Accepted);
    }

    #[tokio::test]
    async fn test_verify_rejects_stranger_reference() {
        let engine = engine();
        let stranger = engine
            .describe(RegistrationImage::Bytes(jpeg_stub(STRANGER_KEY)), deadline())
            .await
            .unwrap();
        let report = engine
            .verify(live_burst(), StoredReference::Descriptor(stranger), deadline())
            .await
            .unwrap();
        assert_eq!(report.verdict, MatchVerdict::RejectedNoMatch);
    }

    #[tokio::test]
    async fn test_expired_request_skips_extraction() {
        let extractor = ScriptedExtractor::standard();
        let calls = extractor.call_counter();
        let engine = spawn_engine(extractor, MatchPolicy::default(), limits()).unwrap();

        let expired = Instant::now() - Duration::from_millis(1);
        let err = engine
            .verify(
                live_burst(),
                StoredReference::Descriptor(Descriptor::new(vec![0.0, 0.0])),
                expired,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TimedOut));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_url_reference_is_system_error() {
        let engine = engine();
        let err = engine
            .verify(
                live_burst(),
                StoredReference::Url("http://127.0.0.1:9/reference.jpg".into()),
                deadline(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Pipeline(PipelineError::Reference(ReferenceError::Fetch(_)))
        ));
    }

    #[tokio::test]
    async fn test_short_burst_rejected() {
        let engine = engine();
        let mut frames = live_burst();
        frames.pop();
        let err = engine
            .verify(frames, StoredReference::Url("http://unused".into()), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::BurstSize(4))));
    }
}
