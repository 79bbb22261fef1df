//! The worker: the download manager in its own execution context
//!
//! The worker owns a dedicated OS thread running its own tokio runtime. The
//! host never sees the manager; it opens [`Connection`]s and exchanges JSON
//! text with the worker over them (see [`protocol`]). Each connection gets
//! its own sequence numbers and sees every download event, in order per key.

pub mod protocol;

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::download::{DownloadEvent, DownloadKey, DownloadManager, ManagerOptions};
use crate::source::SourceSet;
use crate::store::ContentStore;
use protocol::{Command, Event, Message, PROTOCOL_VERSION, Request};

/// How long shutdown waits for blocking work (tag writing) to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the worker builds its manager from
pub struct WorkerSetup {
    pub sources: SourceSet,
    pub store_dir: PathBuf,
    pub options: ManagerOptions,
}

enum Control {
    Connect {
        ingress: mpsc::UnboundedReceiver<String>,
        egress: mpsc::UnboundedSender<String>,
    },
    Shutdown,
}

/// Host-side handle to a running worker. Dropping it stops the worker.
pub struct WorkerHost {
    control: mpsc::UnboundedSender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHost {
    /// Start the worker thread and wait until its manager is ready
    pub async fn start(setup: WorkerSetup) -> Result<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("tunefetch-worker".to_string())
            .spawn(move || worker_main(setup, control_rx, ready_tx))
            .context("Failed to spawn worker thread")?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e.context("Worker failed to start"));
            }
            Err(_) => {
                let _ = thread.join();
                anyhow::bail!("Worker exited during startup");
            }
        }

        info!("Worker started");
        Ok(Self {
            control: control_tx,
            thread: Some(thread),
        })
    }

    /// Open a new connection to the worker
    pub fn connect(&self) -> Result<Connection> {
        let (to_worker, ingress) = mpsc::unbounded_channel();
        let (egress, from_worker) = mpsc::unbounded_channel();

        self.control
            .send(Control::Connect { ingress, egress })
            .map_err(|_| anyhow::anyhow!("Worker is not running"))?;

        Ok(Connection {
            sender: ConnectionSender { inner: to_worker },
            receiver: ConnectionReceiver { inner: from_worker },
        })
    }

    pub fn is_running(&self) -> bool {
        !self.control.is_closed()
    }

    /// Stop the worker and wait for its thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHost {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sending half of a connection
#[derive(Clone)]
pub struct ConnectionSender {
    inner: mpsc::UnboundedSender<String>,
}

impl ConnectionSender {
    /// Send one raw JSON request
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.inner
            .send(text.into())
            .map_err(|_| anyhow::anyhow!("Worker connection closed"))
    }

    pub fn send(&self, request: &Request) -> Result<()> {
        let text = serde_json::to_string(request).context("Failed to serialize request")?;
        self.send_text(text)
    }
}

/// Receiving half of a connection
pub struct ConnectionReceiver {
    inner: mpsc::UnboundedReceiver<String>,
}

impl ConnectionReceiver {
    /// Next raw JSON message; `None` once the worker closed the connection
    pub async fn recv_text(&mut self) -> Option<String> {
        self.inner.recv().await
    }

    /// Next message, skipping (and logging) any that fail to parse
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let text = self.inner.recv().await?;
            match serde_json::from_str(&text) {
                Ok(message) => return Some(message),
                Err(e) => warn!("Dropping unreadable worker message: {}", e),
            }
        }
    }
}

/// A duplex text channel to the worker
pub struct Connection {
    pub sender: ConnectionSender,
    pub receiver: ConnectionReceiver,
}

impl Connection {
    pub fn split(self) -> (ConnectionSender, ConnectionReceiver) {
        (self.sender, self.receiver)
    }
}

fn worker_main(
    setup: WorkerSetup,
    control: mpsc::UnboundedReceiver<Control>,
    ready: oneshot::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("tunefetch-worker-rt")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(anyhow::Error::new(e).context("Failed to build worker runtime")));
            return;
        }
    };

    runtime.block_on(async move {
        let store = match ContentStore::open(&setup.store_dir).await {
            Ok(store) => store,
            Err(e) => {
                let _ = ready.send(Err(anyhow::anyhow!(
                    "Failed to open content store at {}: {}",
                    setup.store_dir.display(),
                    e
                )));
                return;
            }
        };

        let manager = DownloadManager::new(setup.sources, store, setup.options);
        let _ = ready.send(Ok(()));
        serve(manager, control).await;
    });

    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    debug!("Worker runtime stopped");
}

/// Accept connections until told to stop
async fn serve(manager: DownloadManager, mut control: mpsc::UnboundedReceiver<Control>) {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    loop {
        tokio::select! {
            command = control.recv() => match command {
                Some(Control::Connect { ingress, egress }) => {
                    let events = manager.subscribe();
                    let session = Session::new(manager.clone(), egress, stop_tx.clone());
                    tokio::spawn(session.run(ingress, events));
                }
                Some(Control::Shutdown) | None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }

    info!("Worker stopping");
}

/// Whether the session keeps going after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One connection's worth of worker state
struct Session {
    manager: DownloadManager,
    egress: mpsc::UnboundedSender<String>,
    stop: watch::Sender<bool>,
    seq: u64,
    /// Request that most recently asked for each key on this connection
    origins: HashMap<DownloadKey, String>,
    /// Keys this connection removed; their broadcast removal is already answered
    removed: HashSet<DownloadKey>,
}

impl Session {
    fn new(
        manager: DownloadManager,
        egress: mpsc::UnboundedSender<String>,
        stop: watch::Sender<bool>,
    ) -> Self {
        Self {
            manager,
            egress,
            stop,
            seq: 0,
            origins: HashMap::new(),
            removed: HashSet::new(),
        }
    }

    /// Serve one connection. `events` is subscribed when the connection
    /// opens; the session sees everything published from then on.
    async fn run(
        mut self,
        mut ingress: mpsc::UnboundedReceiver<String>,
        mut events: broadcast::Receiver<DownloadEvent>,
    ) {
        debug!("Connection opened");

        loop {
            tokio::select! {
                line = ingress.recv() => match line {
                    Some(text) => {
                        if self.handle(&text).await == Flow::Stop {
                            break;
                        }
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.forward(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Connection lagged, {} events dropped", missed);
                        self.emit(None, Event::Resync { missed });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }

            if self.egress.is_closed() {
                break;
            }
        }

        debug!("Connection closed");
    }

    fn forward(&mut self, event: DownloadEvent) {
        match event {
            DownloadEvent::Updated(snapshot) => {
                let request_id = self.origins.get(&snapshot.key).cloned();
                self.emit(request_id, Event::Download { snapshot });
            }
            DownloadEvent::Removed(key) => {
                let request_id = self.origins.remove(&key);
                if !self.removed.remove(&key) {
                    self.emit(request_id, Event::Removed { key });
                }
            }
        }
    }

    async fn handle(&mut self, text: &str) -> Flow {
        let request = match Request::parse(text) {
            Ok(request) => request,
            Err((request_id, e)) => {
                warn!("Rejected request: {}", e);
                self.emit(request_id, Event::error(&e));
                return Flow::Continue;
            }
        };

        let request_id = request.request_id;
        let event = match request.command {
            Command::Download { service, kind, id } => {
                match self.manager.start_download(service, kind, id).await {
                    Ok(handle) => {
                        if let Some(request_id) = &request_id {
                            self.origins.insert(handle.key, request_id.clone());
                        }
                        Event::Accepted { handle }
                    }
                    Err(e) => Event::error(&e),
                }
            }
            Command::GetAll => Event::Downloads {
                downloads: self.manager.get_all().await,
            },
            Command::GetById { service, kind, id } => {
                match self.manager.get_by_id(&DownloadKey::new(service, kind, id)).await {
                    Ok(snapshot) => Event::Snapshot { snapshot },
                    Err(e) => Event::error(&e),
                }
            }
            Command::Remove { service, kind, id } => {
                let key = DownloadKey::new(service, kind, id);
                match self.manager.remove(&key).await {
                    Ok(_) => {
                        self.removed.insert(key);
                        self.origins.remove(&key);
                        Event::Removed { key }
                    }
                    Err(e) => Event::error(&e),
                }
            }
            Command::Register { id, target } => {
                let (service, kind) = target.target();
                self.manager.sources().refs().register(id, target);
                Event::Registered {
                    key: DownloadKey::new(service, kind, id),
                }
            }
            Command::Status => Event::Status {
                worker_version: env!("CARGO_PKG_VERSION").to_string(),
                services: self.manager.sources().configured(),
                stats: self.manager.stats().await,
            },
            Command::Destroy => {
                self.emit(request_id, Event::Destroyed);
                let _ = self.stop.send(true);
                return Flow::Stop;
            }
        };

        self.emit(request_id, event);
        Flow::Continue
    }

    /// Serialize and send one message. Failures are logged, never fatal.
    fn emit(&mut self, request_id: Option<String>, event: Event) {
        let message = Message {
            version: PROTOCOL_VERSION,
            seq: self.seq + 1,
            request_id,
            event,
        };

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize worker message: {}", e);
                return;
            }
        };

        if self.egress.send(text).is_err() {
            warn!("Host dropped connection, message {} lost", message.seq);
            return;
        }
        self.seq += 1;
    }
}
