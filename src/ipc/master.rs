//! The master side of the coordinator: a unix socket server that replays the
//! log history to each client and then streams every new entry.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{self, IpcMessage};
use crate::events::LogEvent;
use crate::log_store::LogStore;

/// A bound master socket and its connected clients.
#[derive(Debug)]
pub struct MasterHandle {
    socket_path: PathBuf,
    shutdown: CancellationToken,
    clients: Arc<AtomicUsize>,
    cleaned: bool,
}

impl MasterHandle {
    /// Binds `socket_path` and starts accepting clients.
    ///
    /// A stale socket file is only removed when `remove_stale` is set, i.e. when
    /// a connect attempt was refused rather than finding no file at all.
    pub(crate) fn bind(
        socket_path: &Path,
        log_store: LogStore,
        remove_stale: bool,
    ) -> io::Result<Self> {
        if remove_stale {
            match std::fs::remove_file(socket_path) {
                Ok(()) => debug!("removed stale socket {}", socket_path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        let listener = UnixListener::bind(socket_path)?;
        log_store.add_system_log(format!("IPC server listening on {}", socket_path.display()));

        let shutdown = CancellationToken::new();
        let clients = Arc::new(AtomicUsize::new(0));
        tokio::spawn(accept_clients(
            listener,
            log_store,
            shutdown.clone(),
            clients.clone(),
        ));
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            shutdown,
            clients,
            cleaned: false,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Stops accepting, drops every client and removes the socket file. Idempotent.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.shutdown.cancel();
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", self.socket_path.display(), err);
            }
        }
    }
}

impl Drop for MasterHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_clients(
    listener: UnixListener,
    log_store: LogStore,
    shutdown: CancellationToken,
    clients: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    clients.fetch_add(1, Ordering::SeqCst);
                    let connection = ClientConnection { clients: clients.clone() };
                    tokio::spawn(serve_client(stream, log_store.clone(), shutdown.clone(), connection));
                }
                Err(err) => warn!("failed to accept IPC client: {}", err),
            },
        }
    }
    debug!("IPC accept loop stopped");
}

// Decrements the client count when a connection task ends, however it ends.
struct ClientConnection {
    clients: Arc<AtomicUsize>,
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_client(
    stream: UnixStream,
    log_store: LogStore,
    shutdown: CancellationToken,
    _connection: ClientConnection,
) {
    let (reader, mut writer) = stream.into_split();
    let (history, mut subscription) = log_store.snapshot_and_subscribe();
    if let Err(err) = send(&mut writer, &IpcMessage::History { data: history }).await {
        debug!("client went away before history: {}", err);
        return;
    }

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = subscription.recv() => match event {
                Some(LogEvent::Appended(entry)) => {
                    if let Err(err) = send(&mut writer, &IpcMessage::Log { data: entry }).await {
                        debug!("dropping IPC client: {}", err);
                        break;
                    }
                }
                Some(LogEvent::Replaced(_)) | Some(LogEvent::FilterChanged(_)) => {}
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_client_line(&log_store, &line),
                Ok(None) => break,
                Err(err) => {
                    debug!("IPC client read failed: {}", err);
                    break;
                }
            },
        }
    }
}

fn handle_client_line(log_store: &LogStore, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match protocol::decode(line) {
        // Client commands are recorded, not dispatched.
        Ok(message) => match serde_json::to_string(&message) {
            Ok(json) => {
                log_store.add_system_log(format!("Received command from client: {}", json));
            }
            Err(err) => {
                log_store.add_system_log(format!("Error parsing IPC message: {}", err));
            }
        },
        Err(err) => {
            log_store.add_system_log(format!("Error parsing IPC message: {}", err));
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, message: &IpcMessage) -> io::Result<()> {
    let line = protocol::encode(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
