//! Bounded inference pool running blocking detection off the async executor.
//!
use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use common::protocol::Detection;
use tokio::{
    sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError},
    task::JoinError,
};

use crate::{
    config::{FrameSize, PoolConfig},
    error::DetectError,
    pipeline::DetectPipeline,
};

type DetectResult = Result<Vec<Detection>, DetectError>;

/// Inference pool with a bounded number of outstanding frames.
///
/// At most `workers` frames are processed at once on the blocking thread pool and at most
/// `queue_capacity` more wait for a turn. Frames beyond that are rejected right away instead of
/// piling up.
pub struct InferPool {
    pipeline: Arc<DetectPipeline>,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    infer_timeout: Option<Duration>,
}

impl InferPool {
    pub fn new(pipeline: Arc<DetectPipeline>, config: &PoolConfig) -> Result<Self> {
        config.validate()?;

        log::info!(
            "Running up to {} inferences at once with queue capacity {}",
            config.workers,
            config.queue_capacity
        );

        Ok(Self {
            pipeline,
            admission: Arc::new(Semaphore::new(config.workers + config.queue_capacity)),
            workers: Arc::new(Semaphore::new(config.workers)),
            infer_timeout: config.infer_timeout,
        })
    }

    /// Size detections are reported in, `None` if it is the uploaded frame's own size.
    pub fn frame_size(&self) -> Option<FrameSize> {
        self.pipeline.resize()
    }

    /// Queue a frame for detection without waiting for a worker.
    pub fn submit(&self, data: Bytes) -> Result<PendingDetection, DetectError> {
        let admission = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|err| match err {
                TryAcquireError::NoPermits => DetectError::Busy,
                TryAcquireError::Closed => DetectError::PoolClosed,
            })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(run_job(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.workers),
            data,
            reply_tx,
            admission,
        ));

        Ok(PendingDetection {
            reply_rx,
            timeout: self.infer_timeout,
        })
    }

    /// Queue a frame and wait for its detections.
    pub async fn detect(&self, data: Bytes) -> DetectResult {
        self.submit(data)?.wait().await
    }
}

/// Handle to a queued frame.
///
/// Dropping it gives up on the frame. If no worker picked it up yet, it is never processed.
pub struct PendingDetection {
    reply_rx: oneshot::Receiver<DetectResult>,
    timeout: Option<Duration>,
}

impl PendingDetection {
    pub async fn wait(self) -> DetectResult {
        let reply = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.reply_rx)
                .await
                .map_err(|_| DetectError::Timeout)?,
            None => self.reply_rx.await,
        };

        // The job only drops the reply sender without answering if the pool went away
        reply.map_err(|_| DetectError::PoolClosed)?
    }
}

/// Wait for a free worker, then run the frame on the blocking thread pool.
///
/// The admission permit is held until inference is done, so frames whose requester timed out
/// still count against the pool capacity while they run. Frames whose requester is gone before a
/// worker is free are dropped unprocessed.
async fn run_job(
    pipeline: Arc<DetectPipeline>,
    workers: Arc<Semaphore>,
    data: Bytes,
    mut reply_tx: oneshot::Sender<DetectResult>,
    admission: OwnedSemaphorePermit,
) {
    let worker = tokio::select! {
        biased;
        _ = reply_tx.closed() => {
            log::debug!("Requester went away while the frame was queued, skipping it");
            return;
        }
        worker = workers.acquire_owned() => match worker {
            Ok(worker) => worker,
            Err(_) => return,
        },
    };
    if reply_tx.is_closed() {
        log::debug!("Requester went away before inference started, skipping frame");
        return;
    }

    let result = tokio::task::spawn_blocking(move || {
        let _worker = worker;
        pipeline.process(&data)
    })
    .await
    .unwrap_or_else(|err| Err(join_failure(err)));
    drop(admission);

    if reply_tx.send(result).is_err() {
        log::debug!("Requester went away before the result was ready");
    }
}

fn join_failure(err: JoinError) -> DetectError {
    if !err.is_panic() {
        return DetectError::PoolClosed;
    }

    let payload = err.into_panic();
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    log::error!("Inference recovered from panic: {reason}");

    DetectError::Inference(anyhow!("detector panicked: {reason}"))
}
