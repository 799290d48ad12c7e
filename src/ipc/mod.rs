//! Master/client coordination over a unix domain socket.
//!
//! The first instance to find no live listener on the socket path becomes the
//! master: it supervises services and serves its log store. Every later
//! instance becomes a client that mirrors the master's log store.

mod client;
mod master;
pub mod protocol;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixStream;
use tracing::{debug, info};

pub use client::ClientHandle;
pub use master::MasterHandle;
pub use protocol::{IpcMessage, ProtocolError};

use crate::log_store::LogStore;

/// File name of the socket in the system temp directory.
pub const DEFAULT_SOCKET_NAME: &str = "muxd.sock";

/// Default socket path, `<temp dir>/muxd.sock`.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_SOCKET_NAME)
}

/// The role this instance won during election.
#[derive(Debug)]
pub enum Role {
    Master(MasterHandle),
    Client(Arc<ClientHandle>),
}

impl Role {
    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master(_))
    }

    /// Releases the socket (master) or closes the connection (client). Never fails.
    pub async fn cleanup(&mut self) {
        match self {
            Role::Master(master) => master.cleanup(),
            Role::Client(client) => client.cleanup().await,
        }
    }
}

/// Elects a role for `socket_path`.
///
/// A successful connect makes this instance a client. A missing socket file or
/// a refused connection makes it the master. Any other connect error is
/// returned. If another instance wins the bind race, the connect is retried once.
pub async fn initialize(socket_path: &Path, log_store: &LogStore) -> Result<Role> {
    let remove_stale = match UnixStream::connect(socket_path).await {
        Ok(stream) => {
            info!("joining master at {}", socket_path.display());
            return Ok(Role::Client(Arc::new(ClientHandle::start(
                stream,
                log_store.clone(),
            ))));
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => true,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to connect to {}", socket_path.display()))
        }
    };

    match MasterHandle::bind(socket_path, log_store.clone(), remove_stale) {
        Ok(master) => {
            info!("acting as master on {}", socket_path.display());
            Ok(Role::Master(master))
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            debug!("lost the bind race on {}, retrying as client", socket_path.display());
            let stream = UnixStream::connect(socket_path)
                .await
                .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
            Ok(Role::Client(Arc::new(ClientHandle::start(
                stream,
                log_store.clone(),
            ))))
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to listen on {}", socket_path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn first_instance_is_master_and_second_mirrors_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxd.sock");

        let master_store = LogStore::new();
        master_store.add_log("api", "booting");
        let mut master = initialize(&path, &master_store).await.unwrap();
        assert!(master.is_master());
        assert!(master_store
            .get_logs()
            .iter()
            .any(|e| e.text == format!("IPC server listening on {}", path.display())));

        let client_store = LogStore::new();
        let mut client = initialize(&path, &client_store).await.unwrap();
        assert!(!client.is_master());

        wait_until(|| client_store.get_logs() == master_store.get_logs()).await;
        master_store.add_log("api", "ready");
        master_store.add_system_log("done");
        wait_until(|| client_store.get_logs() == master_store.get_logs()).await;

        if let Role::Master(handle) = &master {
            assert_eq!(handle.client_count(), 1);
        }

        client.cleanup().await;
        master.cleanup().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_socket_file_does_not_block_election() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxd.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let mut role = initialize(&path, &LogStore::new()).await.unwrap();
        assert!(role.is_master());
        role.cleanup().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_instances_elect_exactly_one_master() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..20 {
            let path = dir.path().join(format!("race-{}.sock", round));
            let (first_store, second_store) = (LogStore::new(), LogStore::new());
            let (first, second) = tokio::join!(
                initialize(&path, &first_store),
                initialize(&path, &second_store)
            );
            let (mut first, mut second) = (first.unwrap(), second.unwrap());
            assert!(
                first.is_master() ^ second.is_master(),
                "round {} elected {} masters",
                round,
                first.is_master() as u8 + second.is_master() as u8
            );

            let (master, client) = if first.is_master() {
                (&mut first, &mut second)
            } else {
                (&mut second, &mut first)
            };
            if let Role::Master(handle) = &*master {
                wait_until(|| handle.client_count() == 1).await;
            }
            client.cleanup().await;
            master.cleanup().await;
        }
    }

    #[tokio::test]
    async fn client_notices_when_master_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxd.sock");
        let mut master = initialize(&path, &LogStore::new()).await.unwrap();

        let client_store = LogStore::new();
        let client = initialize(&path, &client_store).await.unwrap();
        let Role::Client(handle) = &client else {
            panic!("expected client role");
        };
        if let Role::Master(master) = &master {
            wait_until(|| master.client_count() == 1).await;
        }

        master.cleanup().await;
        tokio::time::timeout(Duration::from_secs(5), handle.closed())
            .await
            .unwrap();
        let last = client_store.get_logs().pop().unwrap();
        assert_eq!(last.text, "Lost connection to muxd master");
    }

    #[test]
    fn default_socket_lives_in_temp_dir() {
        let path = default_socket_path();
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.ends_with("muxd.sock"));
    }
}
