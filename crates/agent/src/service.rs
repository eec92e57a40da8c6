//! Agent-side session handling for the control protocol.
//!
//! At most one Execute session runs at a time. A session ends with exactly
//! one `complete` message unless its stream was dropped or it was aborted,
//! in which case the installer's cleanup runs instead.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use installer_proto::{AbortResponse, Error, ProgressMessage, ShutdownResponse};
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::installer::{Installer, ProgressSender};

/// Outcome of the installer's cleanup for one session, `Some` holding the
/// error. Set at most once.
type Cleanup = Arc<OnceCell<Option<String>>>;

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct ServiceState {
    active: Option<ActiveSession>,
    /// Cleanup of the latest session, kept after the session ends
    last_cleanup: Option<Cleanup>,
    shutdown_requested: bool,
}

pub struct AgentService {
    installer: Arc<dyn Installer>,
    config: AgentConfig,
    state: Mutex<ServiceState>,
    next_session: AtomicU64,
    shutdown: CancellationToken,
}

impl AgentService {
    pub fn new(installer: Arc<dyn Installer>, config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            installer,
            config,
            state: Mutex::new(ServiceState::default()),
            next_session: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Fires once the service has accepted a shutdown and no session is
    /// running.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// Starts a session and returns its progress stream.
    ///
    /// Dropping the stream before the final message cancels the session and
    /// runs the installer's abort.
    pub async fn execute(self: &Arc<Self>) -> Result<SessionStream> {
        let (tx, rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let cancel = CancellationToken::new();
        let cleanup = Cleanup::default();
        let (done_tx, done_rx) = watch::channel(false);

        let id = {
            let mut state = self.state.lock().await;
            if state.shutdown_requested {
                return Err(AgentError::ShuttingDown);
            }
            if state.active.is_some() {
                return Err(AgentError::AlreadyRunning);
            }
            let id = self.next_session.fetch_add(1, Ordering::SeqCst);
            state.active = Some(ActiveSession {
                id,
                cancel: cancel.clone(),
                done: done_rx,
            });
            state.last_cleanup = Some(Arc::clone(&cleanup));
            id
        };

        info!(session = id, "Execute session started");

        let service = Arc::clone(self);
        let session_cancel = cancel.clone();
        tokio::spawn(async move {
            service.run_session(id, tx, session_cancel, cleanup).await;
            let _ = done_tx.send(true);
        });

        Ok(SessionStream {
            inner: ReceiverStream::new(rx),
            _guard: cancel.drop_guard(),
        })
    }

    async fn run_session(
        &self,
        id: u64,
        tx: mpsc::Sender<ProgressMessage>,
        cancel: CancellationToken,
        cleanup: Cleanup,
    ) {
        let result = self
            .installer
            .execute(ProgressSender::new(tx.clone()), cancel.clone())
            .await;

        if cancel.is_cancelled() && result.is_err() {
            warn!(session = id, "Execute session cancelled before completion, cleaning up");
            if let Some(e) = self.clean_up(&cleanup).await {
                error!(session = id, error = %e, "Cleanup of cancelled session failed");
            }
        } else {
            let last = match result {
                Ok(()) => {
                    info!(session = id, "Execute session completed");
                    ProgressMessage::completed("Operation completed")
                }
                Err(e) => {
                    error!(session = id, error = %e, "Execute session failed");
                    ProgressMessage::completed("Operation failed").with_error(Error::new(e.to_string()))
                }
            };
            let _ = tx.send(last).await;
        }
        drop(tx);

        let mut state = self.state.lock().await;
        if state.active.as_ref().is_some_and(|s| s.id == id) {
            state.active = None;
        }
        if state.shutdown_requested {
            info!("Session finished, shutting down");
            self.shutdown.cancel();
        }
    }

    /// Stops the active session, if any, then runs the installer's cleanup.
    ///
    /// Cleanup runs at most once per session. When the latest session was
    /// already cleaned up, for example after its stream was dropped, the
    /// recorded outcome is returned instead.
    pub async fn abort(&self) -> AbortResponse {
        let (active, cleanup) = {
            let state = self.state.lock().await;
            let active = state
                .active
                .as_ref()
                .map(|s| (s.cancel.clone(), s.done.clone()));
            (active, state.last_cleanup.clone())
        };

        if let Some((cancel, mut done)) = active {
            info!("Aborting active session");
            cancel.cancel();
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }

        match self.clean_up(&cleanup.unwrap_or_default()).await {
            None => AbortResponse::default(),
            Some(e) => {
                error!(error = %e, "Abort failed");
                AbortResponse::failed(e)
            }
        }
    }

    async fn clean_up(&self, cleanup: &Cleanup) -> Option<String> {
        cleanup
            .get_or_init(|| async {
                match self.installer.abort().await {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                }
            })
            .await
            .clone()
    }

    /// Stops accepting sessions and shuts the service down once the active
    /// session, if any, has ended.
    pub async fn shutdown(&self) -> ShutdownResponse {
        let mut state = self.state.lock().await;
        state.shutdown_requested = true;
        if state.active.is_none() {
            info!("Shutdown requested, agent is idle");
            self.shutdown.cancel();
        } else {
            info!("Shutdown requested, waiting for the active session");
        }
        ShutdownResponse::default()
    }
}

/// Progress of one Execute session. Cancels the session when dropped.
pub struct SessionStream {
    inner: ReceiverStream<ProgressMessage>,
    _guard: DropGuard,
}

impl Stream for SessionStream {
    type Item = ProgressMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
