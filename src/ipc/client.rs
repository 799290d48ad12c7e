//! The client side of the coordinator: mirrors the master's log store.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{self, IpcMessage};
use crate::log_store::LogStore;

/// A live connection to the master.
///
/// Once history has arrived, the reader task is the only writer to the
/// mirrored store, so every entry keeps the index the master gave it.
#[derive(Debug)]
pub struct ClientHandle {
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
    closed: CancellationToken,
}

impl ClientHandle {
    pub(crate) fn start(stream: UnixStream, log_store: LogStore) -> Self {
        log_store.add_system_log("Connected to muxd master");
        let (reader, writer) = stream.into_split();
        let closed = CancellationToken::new();
        let reader = tokio::spawn(mirror(reader, log_store, closed.clone()));
        Self {
            writer: Mutex::new(Some(writer)),
            reader,
            closed,
        }
    }

    /// Sends one message to the master.
    pub async fn send(&self, message: &IpcMessage) -> io::Result<()> {
        let line = protocol::encode(message)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection to master is closed",
            ));
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Resolves once the connection to the master has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the connection without reporting it as lost. Idempotent.
    pub async fn cleanup(&self) {
        self.reader.abort();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.closed.cancel();
    }
}

async fn mirror(reader: OwnedReadHalf, log_store: LogStore, closed: CancellationToken) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => apply_line(&log_store, &line),
            Ok(None) => break,
            Err(err) => {
                debug!("IPC read from master failed: {}", err);
                break;
            }
        }
    }
    log_store.add_system_log("Lost connection to muxd master");
    closed.cancel();
}

fn apply_line(log_store: &LogStore, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match protocol::decode(line) {
        Ok(IpcMessage::History { data }) => {
            if let Err(err) = log_store.set_logs(data) {
                warn!("skipping history from master: {}", err);
            }
        }
        Ok(IpcMessage::Log { data }) => {
            if let Err(err) = log_store.ingest(data) {
                warn!("skipping log entry from master: {}", err);
            }
        }
        Ok(IpcMessage::Restart { process_name }) => {
            debug!("ignoring restart request for {} sent by master", process_name);
        }
        Err(err) => warn!("Error parsing IPC message from master: {}", err),
    }
}
