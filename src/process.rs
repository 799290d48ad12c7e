//! The capability interface the supervisor uses to run services.
//!
//! The supervisor never touches an OS process type directly. It asks a
//! `Launcher` for a `LaunchedProcess`, reads its output streams, and drives it
//! through the `ChildProcess` trait (signal + exit notification). `OsLauncher`
//! is the real implementation on top of `tokio::process`.

use std::fmt;
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;

use crate::service::ServiceDefinition;

/// Readable output stream of a launched process.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Signals the supervisor can send to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Polite termination request (SIGTERM on unix).
    Terminate,
    /// Forced kill (SIGKILL on unix).
    Kill,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, absent when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal number, if any.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// A non-zero exit code. Signal deaths are not failures.
    pub fn is_failure(&self) -> bool {
        matches!(self.code, Some(code) if code != 0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exited with code {}", code)?,
            None => f.write_str("exited with code none")?,
        }
        if let Some(signal) = self.signal {
            write!(f, " and signal {}", signal)?;
        }
        Ok(())
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Control surface of a running child.
#[async_trait]
pub trait ChildProcess: Send {
    /// Sends `signal` without waiting for the child to exit.
    fn signal(&mut self, signal: KillSignal) -> io::Result<()>;

    /// Resolves once the child has exited. Must be cancel-safe.
    async fn wait(&mut self) -> io::Result<ExitOutcome>;
}

/// A freshly spawned process and its output streams.
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub child: Box<dyn ChildProcess>,
}

/// Spawns processes for service definitions.
pub trait Launcher: Send + Sync {
    fn launch(&self, definition: &ServiceDefinition) -> io::Result<LaunchedProcess>;
}

/// Launches real OS processes, each in its own process group on unix.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, definition: &ServiceDefinition) -> io::Result<LaunchedProcess> {
        let mut command = Command::new(&definition.cmd);
        command
            .args(&definition.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .map(|stream| Box::new(stream) as BoxedReader);
        let stderr = child
            .stderr
            .take()
            .map(|stream| Box::new(stream) as BoxedReader);
        Ok(LaunchedProcess {
            pid,
            stdout,
            stderr,
            child: Box::new(OsChild { child, pid }),
        })
    }
}

struct OsChild {
    child: tokio::process::Child,
    pid: Option<u32>,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn signal(&mut self, signal: KillSignal) -> io::Result<()> {
        match self.pid {
            Some(pid) => send_os_signal(pid, signal).or_else(|err| {
                // The group may already be gone while the leader is still being reaped.
                if signal == KillSignal::Kill {
                    self.child.start_kill()
                } else {
                    Err(err)
                }
            }),
            None => self.child.start_kill(),
        }
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        Ok(status.into())
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: KillSignal) -> io::Result<()> {
    let sig = match signal {
        KillSignal::Terminate => libc::SIGTERM,
        KillSignal::Kill => libc::SIGKILL,
    };
    let pid = pid as i32;
    let group = unsafe { libc::kill(-pid, sig) };
    let leader = unsafe { libc::kill(pid, sig) };
    if group == 0 || leader == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_os_signal(_pid: u32, _signal: KillSignal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process signals are only supported on unix",
    ))
}
