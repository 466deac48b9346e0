//! Daemon module - one background process per session
//!
//! Any number of clients may connect; each connection is framed and
//! validated independently, while every command runs on a single worker
//! that owns the [`Executor`]. A connection waits for each response
//! before reading its next frame, so responses leave in request order.
//! The daemon exits on a `close` command, on cancellation, or after the
//! idle timeout with no clients and no command in flight.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeEngine, Correlator};
use crate::core::config::{validate_session_name, EngineKind};
use crate::core::{BrowseError, Config, Response, Result};
use crate::engine::{Engine, MemoryEngine};
use crate::executor::Executor;
use crate::protocol::{validate, Command, Decoded, FrameCodec};
use crate::session::{BoxStream, Listener, Registry};

const JOB_QUEUE: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A validated command on its way to the worker
struct Job {
    command: Command,
    reply: oneshot::Sender<Outcome>,
}

struct Outcome {
    response: Response,
    /// The command shut the session down
    closed: bool,
}

/// Client and command bookkeeping for idle reaping
struct Activity {
    started: Instant,
    connections: AtomicUsize,
    in_flight: AtomicUsize,
    /// Milliseconds since `started` of the last activity
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            connections: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last.store(now, Ordering::Relaxed);
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        if self.connections.load(Ordering::Relaxed) > 0 || self.in_flight.load(Ordering::Relaxed) > 0 {
            return false;
        }
        let now = self.started.elapsed().as_millis() as u64;
        let quiet = now.saturating_sub(self.last.load(Ordering::Relaxed));
        quiet >= timeout.as_millis() as u64
    }
}

/// A session daemon
pub struct Daemon {
    session: String,
    registry: Registry,
    engine: Arc<dyn Engine>,
    bridge: Option<Correlator>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build a daemon with the engine named in the config
    pub fn new(session: &str, config: Config) -> Result<Self> {
        let (engine, bridge): (Arc<dyn Engine>, Option<Correlator>) = match config.engine.kind {
            EngineKind::Memory => (Arc::new(MemoryEngine::from_config(&config.engine)?), None),
            EngineKind::Bridge => {
                let correlator = Correlator::new(config.bridge_timeout());
                (
                    Arc::new(BridgeEngine::new(correlator.clone())),
                    Some(correlator),
                )
            }
        };
        let mut daemon = Self::with_engine(session, config, engine)?;
        daemon.bridge = bridge;
        Ok(daemon)
    }

    /// Build a daemon around an existing engine
    pub fn with_engine(session: &str, config: Config, engine: Arc<dyn Engine>) -> Result<Self> {
        validate_session_name(session)?;
        Ok(Self {
            session: session.to_string(),
            idle_timeout: config.idle_timeout(),
            registry: Registry::new(config),
            engine,
            bridge: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Override the idle timeout; zero disables reaping
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the session's endpoints, serve until shutdown, then clean up
    pub async fn run(self) -> Result<()> {
        let endpoint = self.registry.endpoint(&self.session)?;
        let listener = endpoint.bind().await?;
        let bridge = match &self.bridge {
            Some(_) => {
                let endpoint = self.registry.bridge_endpoint(&self.session)?;
                let listener = endpoint.bind().await?;
                tracing::info!(endpoint = %endpoint, "bridge listening");
                Some((endpoint, listener))
            }
            None => None,
        };
        self.registry.write_pid(&self.session)?;
        tracing::info!(
            session = %self.session,
            endpoint = %endpoint,
            engine = self.engine.name(),
            "daemon listening"
        );

        let registry = self.registry.clone();
        let session = self.session.clone();
        let (bridge_endpoint, bridge_listener) = match bridge {
            Some((endpoint, listener)) => (Some(endpoint), Some(listener)),
            None => (None, None),
        };

        let result = self.serve(listener, bridge_listener).await;

        endpoint.cleanup();
        if let Some(endpoint) = bridge_endpoint {
            endpoint.cleanup();
        }
        registry.remove_pid(&session);
        tracing::info!(session = %session, "daemon stopped");
        result
    }

    /// Serve already-bound listeners until shutdown
    pub async fn serve(self, listener: Listener, bridge: Option<Listener>) -> Result<()> {
        let token = self.shutdown.clone();
        let activity = Arc::new(Activity::new());
        let (jobs, queue) = mpsc::channel::<Job>(JOB_QUEUE);
        let worker = tokio::spawn(work(Executor::new(self.engine.clone()), queue));

        if let (Some(correlator), Some(listener)) = (self.bridge.clone(), bridge) {
            tokio::spawn(accept_bridge(listener, correlator, token.clone()));
        }

        let reaping = !self.idle_timeout.is_zero();
        let period = (self.idle_timeout / 4).clamp(Duration::from_millis(20), Duration::from_secs(5));
        let mut tick = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        activity.connections.fetch_add(1, Ordering::Relaxed);
                        activity.touch();
                        tracing::debug!(clients = activity.connections.load(Ordering::Relaxed), "client connected");
                        tokio::spawn(connection(stream, jobs.clone(), activity.clone(), token.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = tick.tick(), if reaping => {
                    if activity.is_idle(self.idle_timeout) {
                        tracing::info!(
                            session = %self.session,
                            idle_secs = self.idle_timeout.as_secs(),
                            "idle timeout reached, shutting down"
                        );
                        break;
                    }
                }
            }
        }

        token.cancel();
        drop(jobs);
        worker
            .await
            .map_err(|e| BrowseError::Other(format!("worker task failed: {}", e)))
    }
}

/// The single worker: runs commands one at a time, in arrival order
async fn work(mut executor: Executor, mut queue: mpsc::Receiver<Job>) {
    while let Some(job) = queue.recv().await {
        let response = executor.execute(job.command).await;
        let closed = executor.is_closed();
        let _ = job.reply.send(Outcome { response, closed });
        if closed {
            break;
        }
    }
    queue.close();
    executor.shutdown().await;
}

async fn connection(
    stream: BoxStream,
    jobs: mpsc::Sender<Job>,
    activity: Arc<Activity>,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, FrameCodec);
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = framed.next() => frame,
        };

        let (response, closed) = match frame {
            None => break,
            Some(Ok(Decoded::Message(raw))) => match validate(&raw) {
                Ok(command) => {
                    activity.in_flight.fetch_add(1, Ordering::Relaxed);
                    let outcome = submit(&jobs, command).await;
                    activity.in_flight.fetch_sub(1, Ordering::Relaxed);
                    activity.touch();
                    outcome
                }
                Err(err) => {
                    let id = err.id.clone().unwrap_or_default();
                    tracing::warn!(id = %id, error = %err, "rejected command");
                    (Response::err(id, err.to_string()), false)
                }
            },
            Some(Ok(Decoded::Malformed(reason))) => {
                let err = BrowseError::MalformedFrame(reason);
                tracing::warn!(error = %err, "malformed frame");
                (Response::err("", err.to_string()), false)
            }
            Some(Err(e)) => {
                // The stream is out of sync; say why and hang up
                tracing::warn!(error = %e, "dropping connection");
                if matches!(e, BrowseError::FrameTooLarge { .. }) {
                    let _ = framed.send(Response::err("", e.to_string())).await;
                }
                break;
            }
        };

        if let Err(e) = framed.send(&response).await {
            tracing::debug!(id = %response.id, error = %e, "client went away before its response");
            break;
        }
        if closed {
            token.cancel();
            break;
        }
    }
    activity.connections.fetch_sub(1, Ordering::Relaxed);
    activity.touch();
    tracing::debug!("client disconnected");
}

/// Hand a command to the worker and wait for its outcome
async fn submit(jobs: &mpsc::Sender<Job>, command: Command) -> (Response, bool) {
    let id = command.id.clone();
    let (reply, outcome) = oneshot::channel();
    if jobs.send(Job { command, reply }).await.is_err() {
        return (Response::err(id, "Daemon is shutting down"), false);
    }
    match outcome.await {
        Ok(Outcome { response, closed }) => (response, closed),
        Err(_) => (Response::err(id, "Daemon is shutting down"), false),
    }
}

async fn accept_bridge(listener: Listener, correlator: Correlator, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    correlator.attach(stream).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bridge accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}
