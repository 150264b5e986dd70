//! Registry and lifecycle of interactive pod sessions (exec and port-forward).
//!
//! Every session runs as a small set of tasks joined by one cancellation
//! token: cancelling it (stop, context switch, either side hanging up) tears
//! down both directions. The registry map is only locked for insert, remove
//! and list, never across I/O.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::SinkExt;
use kube::api::TerminalSize;
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::client::context_registry::{ActiveContext, ClusterRegistry};
use crate::core::client::pods::{
    BoxedReader, BoxedWriter, DuplexStream, ExecStreams, PodConnector, PodRef,
};
use crate::domain::session::model::{
    ExecInput, ExecOutput, PortPair, SessionFilter, SessionKind, SessionStatus, SessionSummary,
};
use crate::errors::AppError;

pub const REASON_STOPPED: &str = "stopped";
pub const REASON_CONTEXT_CHANGED: &str = "context changed";
pub const REASON_SHUTDOWN: &str = "server shutting down";
const REASON_CLIENT_GONE: &str = "client disconnected";
const REASON_EXITED: &str = "process exited";

const FORWARD_BIND_ADDR: &str = "127.0.0.1";

fn closed(reason: &str) -> SessionStatus {
    SessionStatus::Closed {
        reason: reason.to_string(),
    }
}

/// A remote port can be forwarded once per pod and context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PortClaim {
    context: String,
    namespace: String,
    pod: String,
    remote_port: u16,
}

pub struct SessionHandle {
    pub id: Uuid,
    pub kind: SessionKind,
    pub context: String,
    /// Generation of the active context the session was started under.
    pub generation: u64,
    pub target: PodRef,
    pub ports: Option<PortPair>,
    pub started_at: DateTime<Utc>,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

impl SessionHandle {
    fn new(
        id: Uuid,
        kind: SessionKind,
        active: &ActiveContext,
        target: PodRef,
        ports: Option<PortPair>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SessionStatus::Starting);
        Arc::new(Self {
            id,
            kind,
            context: active.name().to_string(),
            generation: active.generation,
            target,
            ports,
            started_at: Utc::now(),
            status,
            cancel: CancellationToken::new(),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            kind: self.kind,
            context: self.context.clone(),
            namespace: self.target.namespace.clone(),
            pod: self.target.pod.clone(),
            container: self.target.container.clone(),
            local_port: self.ports.map(|p| p.local_port),
            remote_port: self.ports.map(|p| p.remote_port),
            status: self.status(),
            started_at: self.started_at,
        }
    }

    fn activate(&self) {
        self.status.send_if_modified(|current| {
            if *current == SessionStatus::Starting {
                *current = SessionStatus::Active;
                true
            } else {
                false
            }
        });
    }

    /// Enter a terminal status. Only the first call wins.
    fn terminate(&self, status: SessionStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = status;
                true
            }
        });
        self.cancel.cancel();
        changed
    }

    fn claim(&self) -> Option<PortClaim> {
        self.ports.map(|ports| PortClaim {
            context: self.context.clone(),
            namespace: self.target.namespace.clone(),
            pod: self.target.pod.clone(),
            remote_port: ports.remote_port,
        })
    }
}

enum PumpEnd {
    Eof,
    CallerGone,
    Cancelled,
}

pub struct SessionManager {
    registry: Arc<ClusterRegistry>,
    connector: Arc<dyn PodConnector>,
    config: SessionConfig,
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
    port_claims: DashMap<PortClaim, Uuid>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        connector: Arc<dyn PodConnector>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connector,
            config,
            sessions: DashMap::new(),
            port_claims: DashMap::new(),
        })
    }

    /// Open an exec into `target` and bridge it to the caller's frame channels.
    ///
    /// Dropping the `input` sender or the `output` receiver ends the session.
    pub async fn start_exec(
        self: &Arc<Self>,
        target: PodRef,
        command: Vec<String>,
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<ExecOutput>,
    ) -> Result<SessionSummary, AppError> {
        let active = self.registry.active();
        let client = active.context.client().await?;

        let handle = SessionHandle::new(Uuid::new_v4(), SessionKind::Exec, &active, target, None);
        self.register(&handle)?;

        let opened = self
            .establish(&handle, self.connector.exec(client, &handle.target, command))
            .await;
        let streams = match opened {
            Ok(streams) => streams,
            Err(err) => {
                self.finish(&handle, SessionStatus::Errored { message: err.to_string() });
                return Err(err);
            }
        };

        handle.activate();
        info!("Exec session {} started on {} ({})", handle.id, handle.target, handle.context);
        tokio::spawn(Arc::clone(self).run_exec(handle.clone(), streams, input, output));

        Ok(handle.summary())
    }

    /// Listen on a local port and tunnel every connection to `remote_port` of
    /// the pod. `local_port` of `None` or 0 picks a free port.
    pub async fn start_port_forward(
        self: &Arc<Self>,
        target: PodRef,
        local_port: Option<u16>,
        remote_port: u16,
    ) -> Result<SessionSummary, AppError> {
        let active = self.registry.active();
        let client = active.context.client().await?;

        let id = Uuid::new_v4();
        let claim = PortClaim {
            context: active.name().to_string(),
            namespace: target.namespace.clone(),
            pod: target.pod.clone(),
            remote_port,
        };
        match self.port_claims.entry(claim.clone()) {
            Entry::Occupied(owner) => {
                return Err(AppError::Conflict(format!(
                    "port {} of {} is already forwarded by session {}",
                    remote_port,
                    target,
                    owner.get()
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }

        let requested = local_port.unwrap_or(0);
        let bound = match TcpListener::bind((FORWARD_BIND_ADDR, requested)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr.port())),
            Err(e) => Err(e),
        };
        let (listener, local_port) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.port_claims.remove_if(&claim, |_, owner| *owner == id);
                return Err(AppError::Conflict(format!(
                    "local port {} is not available: {}",
                    requested, e
                )));
            }
        };

        let ports = PortPair {
            local_port,
            remote_port,
        };
        let handle = SessionHandle::new(id, SessionKind::PortForward, &active, target, Some(ports));
        self.register(&handle)?;

        // The first stream proves the pod is reachable before we report success.
        let opened = self
            .establish(
                &handle,
                self.connector.port_forward(client.clone(), &handle.target, remote_port),
            )
            .await;
        let first = match opened {
            Ok(stream) => stream,
            Err(err) => {
                self.finish(&handle, SessionStatus::Errored { message: err.to_string() });
                return Err(err);
            }
        };

        handle.activate();
        info!(
            "Port-forward session {} started: {}:{} -> {}:{}",
            id, FORWARD_BIND_ADDR, local_port, handle.target, remote_port
        );
        tokio::spawn(Arc::clone(self).run_port_forward(handle.clone(), listener, client, first));

        Ok(handle.summary())
    }

    pub fn stop(&self, id: &Uuid) -> Result<SessionSummary, AppError> {
        self.stop_with(id, REASON_STOPPED)
    }

    /// Stop the tunnel matching these ports, if any. Repeating it is harmless.
    pub fn stop_port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Option<SessionSummary> {
        let wanted = Some(PortPair {
            local_port,
            remote_port,
        });
        let id = self
            .sessions
            .iter()
            .find(|s| {
                s.kind == SessionKind::PortForward
                    && s.target.namespace == namespace
                    && s.target.pod == pod
                    && s.ports == wanted
            })
            .map(|s| s.id)?;

        self.stop(&id).ok()
    }

    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|s| s.summary())
            .filter(|s| filter.matches(s))
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Force-close every session started before `generation`.
    pub fn close_stale(&self, generation: u64, reason: &str) -> usize {
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.generation < generation)
            .map(|s| s.id)
            .collect();

        stale
            .iter()
            .filter(|id| self.stop_with(id, reason).is_ok())
            .count()
    }

    pub fn close_all(&self, reason: &str) -> usize {
        let all: Vec<Uuid> = self.sessions.iter().map(|s| s.id).collect();
        all.iter().filter(|id| self.stop_with(id, reason).is_ok()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn stop_with(&self, id: &Uuid, reason: &str) -> Result<SessionSummary, AppError> {
        let (_, handle) = self
            .sessions
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("session {} not found", id)))?;

        handle.terminate(closed(reason));
        self.release_claim(&handle);

        info!("Session {} on {} closed: {}", id, handle.target, reason);
        Ok(handle.summary())
    }

    /// Make the session visible to `close_stale`.
    ///
    /// A switch that bumped the generation before the insert has already swept
    /// the registry, so the session is closed here instead.
    fn register(&self, handle: &Arc<SessionHandle>) -> Result<(), AppError> {
        self.sessions.insert(handle.id, handle.clone());
        if self.registry.generation() != handle.generation {
            self.finish(handle, closed(REASON_CONTEXT_CHANGED));
            return Err(AppError::ConnectError(format!(
                "context '{}' was switched away while the session was starting",
                handle.context
            )));
        }
        Ok(())
    }

    /// Record a terminal status and drop the session from the registry.
    fn finish(&self, handle: &Arc<SessionHandle>, status: SessionStatus) {
        if handle.terminate(status) {
            debug!("Session {} finished: {:?}", handle.id, handle.status());
        }
        self.sessions
            .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, handle));
        self.release_claim(handle);
    }

    fn release_claim(&self, handle: &SessionHandle) {
        if let Some(claim) = handle.claim() {
            self.port_claims.remove_if(&claim, |_, owner| *owner == handle.id);
        }
    }

    /// Await a cluster-side stream, bounded by the start timeout and by the
    /// session being cancelled meanwhile.
    async fn establish<T>(
        &self,
        handle: &SessionHandle,
        open: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        let timeout = self.config.start_timeout;
        tokio::select! {
            _ = handle.cancel.cancelled() => Err(AppError::ConnectError(format!(
                "session {} was closed while starting",
                handle.id
            ))),
            opened = tokio::time::timeout(timeout, open) => match opened {
                Ok(result) => result,
                Err(_) => Err(AppError::ConnectError(format!(
                    "stream to {} did not open within {}ms",
                    handle.target,
                    timeout.as_millis()
                ))),
            },
        }
    }

    async fn run_exec(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        streams: ExecStreams,
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<ExecOutput>,
    ) {
        let ExecStreams {
            stdin,
            stdout,
            stderr,
            resize,
            exit,
        } = streams;
        let cancel = handle.cancel.clone();

        let mut to_pod = tokio::spawn(pump_input(input, stdin, resize, cancel.clone()));
        let mut from_pod = tokio::spawn(pump_output(stdout, stderr, output.clone(), cancel.clone()));

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = &mut to_pod => Some(closed(REASON_CLIENT_GONE)),
            ended = &mut from_pod => match ended {
                Ok(PumpEnd::CallerGone) => Some(closed(REASON_CLIENT_GONE)),
                Ok(PumpEnd::Cancelled) => None,
                Ok(PumpEnd::Eof) | Err(_) => tokio::select! {
                    _ = cancel.cancelled() => None,
                    failure = exit => Some(match failure {
                        Some(message) => SessionStatus::Errored { message },
                        None => closed(REASON_EXITED),
                    }),
                },
            },
        };

        cancel.cancel();
        to_pod.abort();
        from_pod.abort();

        if let Some(status) = status {
            self.finish(&handle, status);
        }

        // Tell the caller why, if it is still listening.
        let notice = match handle.status() {
            SessionStatus::Errored { message } => Some(message),
            SessionStatus::Closed { reason } if reason != REASON_EXITED && reason != REASON_CLIENT_GONE => {
                Some(format!("session closed: {}", reason))
            }
            _ => None,
        };
        if let Some(data) = notice {
            let _ = output.try_send(ExecOutput::Error { data });
        }
    }

    async fn run_port_forward(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        listener: TcpListener,
        client: Client,
        first: Box<dyn DuplexStream>,
    ) {
        let cancel = handle.cancel.clone();
        let remote_port = handle.ports.map(|p| p.remote_port).unwrap_or_default();
        let mut pending = Some(first);

        let status = loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break None,
                accepted = listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    break Some(SessionStatus::Errored {
                        message: format!("accept failed: {}", e),
                    })
                }
            };

            let upstream = match pending.take() {
                Some(stream) => stream,
                None => {
                    let opened = self
                        .establish(
                            &handle,
                            self.connector.port_forward(client.clone(), &handle.target, remote_port),
                        )
                        .await;
                    match opened {
                        Ok(stream) => stream,
                        // Pod gone or cluster unreachable: the tunnel is dead.
                        Err(err) => break Some(SessionStatus::Errored { message: err.to_string() }),
                    }
                }
            };

            debug!("Session {}: connection from {}", handle.id, peer);
            tokio::spawn(bridge(handle.id, cancel.clone(), socket, upstream));
        };

        if let Some(status) = status {
            warn!("Port-forward session {} to {} ended: {:?}", handle.id, handle.target, status);
            self.finish(&handle, status);
        }
    }
}

async fn bridge(
    id: Uuid,
    cancel: CancellationToken,
    mut socket: TcpStream,
    mut upstream: Box<dyn DuplexStream>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut upstream) => match copied {
            Ok((sent, received)) => {
                debug!("Session {}: connection closed ({} bytes out, {} in)", id, sent, received)
            }
            Err(e) => debug!("Session {}: connection failed: {}", id, e),
        },
    }
}

/// Caller to pod: keystrokes to stdin, resizes to the terminal size channel.
async fn pump_input(
    mut input: mpsc::Receiver<ExecInput>,
    mut stdin: Option<BoxedWriter>,
    mut resize: Option<futures::channel::mpsc::Sender<TerminalSize>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = input.recv() => frame,
        };

        match frame {
            None => return,
            Some(ExecInput::Input { data }) => {
                let Some(writer) = stdin.as_mut() else { continue };
                let written = match writer.write_all(data.as_bytes()).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    // The pod side is closing; the output pump notices.
                    debug!("stdin closed: {}", e);
                    stdin = None;
                }
            }
            Some(ExecInput::Resize { rows, cols }) => {
                let Some(sizes) = resize.as_mut() else { continue };
                let size = TerminalSize {
                    width: cols,
                    height: rows,
                };
                if sizes.send(size).await.is_err() {
                    resize = None;
                }
            }
        }
    }
}

/// Pod to caller. Finishes when stdout ends or the caller goes away.
async fn pump_output(
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    output: mpsc::Sender<ExecOutput>,
    cancel: CancellationToken,
) -> PumpEnd {
    let stderr = stderr.map(|reader| tokio::spawn(forward(reader, output.clone(), cancel.clone())));

    let ended = match stdout {
        Some(reader) => forward(reader, output, cancel).await,
        None => PumpEnd::Eof,
    };

    if let Some(stderr) = stderr {
        stderr.abort();
    }
    ended
}

async fn forward(mut reader: BoxedReader, output: mpsc::Sender<ExecOutput>, cancel: CancellationToken) -> PumpEnd {
    let mut buf = vec![0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return PumpEnd::Cancelled,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let data = drain_utf8(&mut pending);
                if data.is_empty() {
                    continue;
                }
                if output.send(ExecOutput::Output { data }).await.is_err() {
                    return PumpEnd::CallerGone;
                }
            }
            Err(e) => {
                debug!("exec output read failed: {}", e);
                return PumpEnd::Eof;
            }
        }
    }
}

/// Decode the complete UTF-8 prefix of `pending`, keeping a trailing partial
/// character for the next read.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let rest = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
