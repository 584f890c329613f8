use photoscan_core::{FaceExtraction, FusionVersion, Pipeline, PipelineError, ProcessedFace};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("image processing exceeded {0:?}")]
    TimedOut(Duration),
    #[error("workers built different fusion versions: {0} vs {1}")]
    VersionSkew(String, String),
    #[error("engine needs at least one worker")]
    NoWorkers,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from async callers to the worker threads.
enum EngineRequest {
    Extract {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<FaceExtraction, PipelineError>>,
    },
    Query {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Option<ProcessedFace>, PipelineError>>,
    },
}

/// Settles who gives up on a job first: the worker by finishing it, or the
/// caller by timing out. Exactly one side wins.
#[derive(Default)]
struct Claim(AtomicBool);

impl Claim {
    fn take(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// A request plus the worker permit it holds until the worker is done with it.
struct Job {
    request: EngineRequest,
    permit: OwnedSemaphorePermit,
    claim: Arc<Claim>,
}

impl Job {
    /// Process the request. Returns `false` when the caller timed out first and
    /// a replacement worker already owns this worker's slot.
    fn run(self, pipeline: &mut Pipeline) -> bool {
        match self.request {
            EngineRequest::Extract { bytes, reply } => {
                let _ = reply.send(pipeline.process(&bytes));
            }
            EngineRequest::Query { bytes, reply } => {
                let _ = reply.send(pipeline.query(&bytes));
            }
        }
        if self.claim.take() {
            true
        } else {
            self.permit.forget();
            false
        }
    }
}

type PipelineFactory = Box<dyn FnMut(usize) -> Result<Pipeline, PipelineError> + Send>;

/// State shared by every handle and by replacement workers.
struct Pool {
    permits: Arc<Semaphore>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    factory: Mutex<PipelineFactory>,
    version: FusionVersion,
    /// Live workers plus replacements still being built.
    slots: AtomicUsize,
    next_worker: AtomicUsize,
}

impl Pool {
    /// Build a pipeline for a worker stuck on a timed-out image and start it in
    /// the background. The pool closes once no worker is left.
    fn replace_worker(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let worker = pool.next_worker.fetch_add(1, Ordering::Relaxed);
            let built = {
                let mut factory = pool.factory.lock().unwrap_or_else(|e| e.into_inner());
                (*factory)(worker)
            };
            let started = match built {
                Ok(pipeline) if *pipeline.version() != pool.version => Err(EngineError::VersionSkew(
                    pool.version.tag(),
                    pipeline.version().tag(),
                )),
                Ok(pipeline) => start_worker(&pool.rx, worker, pipeline),
                Err(e) => Err(e.into()),
            };
            match started {
                Ok(()) => {
                    pool.permits.add_permits(1);
                    tracing::info!(worker, "replacement worker started");
                }
                Err(e) => {
                    tracing::error!(worker, error = %e, "could not replace stuck worker");
                    if pool.slots.fetch_sub(1, Ordering::AcqRel) == 1 {
                        tracing::error!("no workers left; closing engine");
                        pool.permits.close();
                    }
                }
            }
        });
    }
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Job>,
    /// One permit per live worker, so the timeout only runs while a worker is free for the image.
    pool: Arc<Pool>,
    version: Arc<FusionVersion>,
    workers: usize,
    timeout: Duration,
}

impl EngineHandle {
    /// Fusion version shared by every worker's pipeline.
    pub fn version(&self) -> &FusionVersion {
        &self.version
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Detect, normalize and embed every face in a photo.
    pub async fn extract(&self, bytes: Vec<u8>) -> Result<FaceExtraction, EngineError> {
        self.call(|reply| EngineRequest::Extract { bytes, reply }).await
    }

    /// Embed the largest face of a selfie.
    pub async fn query(&self, bytes: Vec<u8>) -> Result<Option<ProcessedFace>, EngineError> {
        self.call(|reply| EngineRequest::Query { bytes, reply }).await
    }

    async fn call<T, F>(&self, build: F) -> Result<T, EngineError>
    where
        F: FnOnce(oneshot::Sender<Result<T, PipelineError>>) -> EngineRequest,
    {
        let permit = Arc::clone(&self.pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        let claim = Arc::new(Claim::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            request: build(reply_tx),
            permit,
            claim: Arc::clone(&claim),
        };
        self.tx.send(job).await.map_err(|_| EngineError::ChannelClosed)?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(reply) => Ok(reply.map_err(|_| EngineError::ChannelClosed)??),
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "image processing timed out; skipping");
                if claim.take() {
                    self.pool.replace_worker();
                }
                Err(EngineError::TimedOut(self.timeout))
            }
        }
    }
}

fn start_worker(rx: &Arc<Mutex<mpsc::Receiver<Job>>>, worker: usize, mut pipeline: Pipeline) -> Result<(), EngineError> {
    let rx = Arc::clone(rx);
    std::thread::Builder::new()
        .name(format!("photoscan-worker-{worker}"))
        .spawn(move || {
            tracing::debug!(worker, "worker thread started");
            loop {
                // Only the receive is under the lock; processing runs unlocked.
                let job = {
                    let mut rx = rx.lock().unwrap_or_else(|e| e.into_inner());
                    rx.blocking_recv()
                };
                let Some(job) = job else { break };
                if !job.run(&mut pipeline) {
                    tracing::warn!(worker, "finished an abandoned image; retiring");
                    break;
                }
            }
            tracing::debug!(worker, "worker thread exiting");
        })
        .map(|_| ())
        .map_err(EngineError::Spawn)
}

/// Spawn `workers` OS threads, each owning one [`Pipeline`] built by `factory`.
///
/// Every pipeline is built before any thread starts, so a missing model fails
/// here rather than on the first request. A request that outlives `timeout` is
/// reported as timed out. Its worker is retired once it returns, and `factory`
/// builds a replacement straight away, so a hung image never takes the pool
/// down with it.
pub fn spawn_engine<F>(workers: usize, timeout: Duration, mut factory: F) -> Result<EngineHandle, EngineError>
where
    F: FnMut(usize) -> Result<Pipeline, PipelineError> + Send + 'static,
{
    if workers == 0 {
        return Err(EngineError::NoWorkers);
    }

    let mut pipelines = Vec::with_capacity(workers);
    for worker in 0..workers {
        let pipeline = factory(worker)?;
        tracing::info!(worker, version = %pipeline.version(), "pipeline loaded");
        pipelines.push(pipeline);
    }

    let version = pipelines[0].version().clone();
    if let Some(other) = pipelines.iter().find(|p| *p.version() != version) {
        return Err(EngineError::VersionSkew(version.tag(), other.version().tag()));
    }

    let (tx, rx) = mpsc::channel::<Job>(workers);
    let rx = Arc::new(Mutex::new(rx));

    for (worker, pipeline) in pipelines.into_iter().enumerate() {
        start_worker(&rx, worker, pipeline)?;
    }

    tracing::info!(workers, timeout = ?timeout, "engine started");

    let pool = Pool {
        permits: Arc::new(Semaphore::new(workers)),
        rx,
        factory: Mutex::new(Box::new(factory)),
        version: version.clone(),
        slots: AtomicUsize::new(workers),
        next_worker: AtomicUsize::new(workers),
    };
    Ok(EngineHandle {
        tx,
        pool: Arc::new(pool),
        version: Arc::new(version),
        workers,
        timeout,
    })
}
