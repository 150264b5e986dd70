use std::fmt;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::FutureExt;
use kube::api::{AttachParams, TerminalSize};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::core::client::kube_resources::Pod;
use crate::errors::AppError;

/// Byte stream that can be read and written, e.g. one forwarded port.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub pod: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container.filter(|c| !c.is_empty());
        self
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)?;
        if let Some(container) = &self.container {
            write!(f, ":{}", container)?;
        }
        Ok(())
    }
}

/// The cluster side of an established exec.
pub struct ExecStreams {
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub resize: Option<mpsc::Sender<TerminalSize>>,
    /// Resolves when the remote process ends: `None` on a clean exit, the
    /// failure message otherwise (including a stream that dropped).
    pub exit: BoxFuture<'static, Option<String>>,
}

/// Opens pod-scoped streams. Each call opens exactly one cluster-side stream.
#[async_trait]
pub trait PodConnector: Send + Sync {
    async fn exec(
        &self,
        client: Client,
        target: &PodRef,
        command: Vec<String>,
    ) -> Result<ExecStreams, AppError>;

    async fn port_forward(
        &self,
        client: Client,
        target: &PodRef,
        port: u16,
    ) -> Result<Box<dyn DuplexStream>, AppError>;
}

/// Exec and port-forward over the apiserver's websocket subprotocols.
pub struct KubePodConnector;

#[async_trait]
impl PodConnector for KubePodConnector {
    async fn exec(
        &self,
        client: Client,
        target: &PodRef,
        command: Vec<String>,
    ) -> Result<ExecStreams, AppError> {
        let pods: Api<Pod> = Api::namespaced(client, &target.namespace);

        let mut params = AttachParams::interactive_tty();
        if let Some(container) = &target.container {
            params = params.container(container.clone());
        }

        let mut attached = pods.exec(&target.pod, command, &params).await?;
        debug!("Exec attached to {}", target);

        let stdin = attached.stdin().map(|w| Box::new(w) as BoxedWriter);
        let stdout = attached.stdout().map(|r| Box::new(r) as BoxedReader);
        let stderr = attached.stderr().map(|r| Box::new(r) as BoxedReader);
        let resize = attached.terminal_size();

        let exit = async move {
            let status = match attached.take_status() {
                Some(status) => status.await,
                None => None,
            };
            // `attached` lives until here so the websocket task is not dropped early.
            drop(attached);

            match status {
                Some(status) if status.status.as_deref() == Some("Failure") => Some(
                    status
                        .message
                        .or(status.reason)
                        .unwrap_or_else(|| "command failed".to_string()),
                ),
                Some(_) => None,
                None => Some("exec stream closed without exit status".to_string()),
            }
        }
        .boxed();

        Ok(ExecStreams {
            stdin,
            stdout,
            stderr,
            resize,
            exit,
        })
    }

    async fn port_forward(
        &self,
        client: Client,
        target: &PodRef,
        port: u16,
    ) -> Result<Box<dyn DuplexStream>, AppError> {
        let pods: Api<Pod> = Api::namespaced(client, &target.namespace);

        let mut forwarder = pods.portforward(&target.pod, &[port]).await?;
        let stream = forwarder.take_stream(port).ok_or_else(|| {
            AppError::ConnectError(format!("no stream for port {} on {}", port, target))
        })?;

        let label = target.to_string();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!("Port-forward to {}:{} ended: {}", label, port, e);
            }
        });

        Ok(Box::new(stream))
    }
}
