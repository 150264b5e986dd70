//! Doubles for the cluster-facing seams, shared by unit tests.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use kube::api::TerminalSize;
use kube::{Client, Config};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{SessionConfig, WatchConfig};
use crate::core::client::context_registry::{ActiveContext, ClusterRegistry};
use crate::core::client::kube_client::ContextSource;
use crate::core::client::kubeconfig::ContextSpec;
use crate::core::client::pods::{DuplexStream, ExecStreams, PodConnector, PodRef};
use crate::core::client::watchers::{DeltaStream, WatchDelta, WatchSource};
use crate::core::state::runtime::k8s::resource_snapshot::{Health, ResourceRecord};
use crate::core::state::runtime::k8s::watch_state::{HubEvent, WatchKey};
use crate::errors::AppError;

const WAIT: Duration = Duration::from_secs(3);

/// A context whose client points at a closed local port.
pub fn context_spec(name: &str) -> ContextSpec {
    let config = Config::new("http://127.0.0.1:1".parse().unwrap());
    ContextSpec {
        name: name.to_string(),
        cluster: format!("{name}-cluster"),
        user: Some("tester".into()),
        namespace: None,
        server_url: Some("http://127.0.0.1:1".into()),
        fingerprint: name.to_string(),
        source: ContextSource::Config(config),
    }
}

pub fn test_registry(names: &[&str], active: &str) -> Arc<ClusterRegistry> {
    let specs = names.iter().map(|n| context_spec(n)).collect();
    Arc::new(ClusterRegistry::new(specs, active).unwrap())
}

pub fn watch_config() -> WatchConfig {
    WatchConfig {
        idle_grace: Duration::from_millis(50),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(20),
        subscriber_buffer: 16,
        sample_limit: 100,
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        start_timeout: Duration::from_millis(300),
    }
}

pub fn pod(name: &str, health: Health) -> ResourceRecord {
    ResourceRecord::new(Some("default".into()), name, "Running", health)
}

pub async fn next_event(rx: &mut broadcast::Receiver<HubEvent>) -> HubEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for hub event")
        .expect("hub channel closed")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

type Feed = mpsc::UnboundedSender<Result<WatchDelta, AppError>>;

/// Watch source whose streams are driven by the test.
#[derive(Default)]
pub struct FakeWatchSource {
    opens: AtomicUsize,
    failing: AtomicUsize,
    feeds: Mutex<Vec<Feed>>,
    contexts: Mutex<Vec<String>>,
}

impl FakeWatchSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn last_context(&self) -> Option<String> {
        self.contexts.lock().unwrap().last().cloned()
    }

    /// Sender of the `index`-th successfully opened stream.
    pub async fn feed(&self, index: usize) -> Feed {
        wait_until(|| self.feeds.lock().unwrap().len() > index).await;
        self.feeds.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl WatchSource for FakeWatchSource {
    async fn open(&self, _key: &WatchKey, active: &ActiveContext) -> Result<DeltaStream, AppError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(active.name().to_string());

        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AppError::ConnectError("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().push(tx);
        Ok(rx.boxed())
    }
}

/// Handle on one fake exec: lets the test end the remote process.
#[derive(Clone)]
pub struct ExecProbe {
    pub done: CancellationToken,
    pub exit_message: Arc<Mutex<Option<String>>>,
    pub resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl ExecProbe {
    pub fn finish(&self, failure: Option<&str>) {
        *self.exit_message.lock().unwrap() = failure.map(str::to_string);
        self.done.cancel();
    }
}

/// Pod connector that echoes every byte back, for exec and port-forward.
#[derive(Default)]
pub struct FakePodConnector {
    pub execs: Mutex<Vec<ExecProbe>>,
    pub forwards: AtomicUsize,
    pub fail: std::sync::atomic::AtomicBool,
    pub delay: Mutex<Option<Duration>>,
}

impl FakePodConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn exec_probe(&self, index: usize) -> ExecProbe {
        self.execs.lock().unwrap()[index].clone()
    }

    async fn before_open(&self) -> Result<(), AppError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::ConnectError("pod unreachable".into()));
        }
        Ok(())
    }
}

fn echo(done: CancellationToken) -> tokio::io::DuplexStream {
    let (caller_side, pod_side) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(pod_side);
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::io::copy(&mut reader, &mut writer) => {}
        }
    });
    caller_side
}

#[async_trait]
impl PodConnector for FakePodConnector {
    async fn exec(
        &self,
        _client: Client,
        _target: &PodRef,
        _command: Vec<String>,
    ) -> Result<ExecStreams, AppError> {
        self.before_open().await?;

        let probe = ExecProbe {
            done: CancellationToken::new(),
            exit_message: Arc::new(Mutex::new(None)),
            resizes: Arc::new(Mutex::new(Vec::new())),
        };
        self.execs.lock().unwrap().push(probe.clone());

        let (reader, writer) = tokio::io::split(echo(probe.done.clone()));

        let (resize_tx, mut resize_rx) = mpsc::channel::<TerminalSize>(8);
        let resizes = probe.resizes.clone();
        tokio::spawn(async move {
            while let Some(size) = resize_rx.next().await {
                resizes.lock().unwrap().push((size.width, size.height));
            }
        });

        let done = probe.done.clone();
        let message = probe.exit_message.clone();
        let exit = async move {
            done.cancelled().await;
            message.lock().unwrap().take()
        }
        .boxed();

        Ok(ExecStreams {
            stdin: Some(Box::new(writer)),
            stdout: Some(Box::new(reader)),
            stderr: None,
            resize: Some(resize_tx),
            exit,
        })
    }

    async fn port_forward(
        &self,
        _client: Client,
        _target: &PodRef,
        _port: u16,
    ) -> Result<Box<dyn DuplexStream>, AppError> {
        self.before_open().await?;
        self.forwards.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(echo(CancellationToken::new())))
    }
}
