//! Service definitions and lifecycle state.
//!
//! This module defines the immutable `ServiceDefinition` handed to the supervisor,
//! the readiness probe configuration, the lifecycle `ProcessState`, and the
//! per-service display flags used by log consumers.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name used for entries narrated by muxd itself rather than a service.
pub const SYSTEM_PROCESS: &str = "SYSTEM";

/// Default readiness poll interval in milliseconds.
pub const DEFAULT_READY_INTERVAL_MS: u64 = 1000;
/// Default readiness timeout in milliseconds.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 30_000;

/// Palette assigned to services that do not configure a color.
pub const COLOR_PALETTE: [&str; 6] = [
    "#FF0000", "#FFFF00", "#00FF00", "#0000FF", "#FF00FF", "#00FFFF",
];

/// Returns the palette color for the service at `index`.
pub fn palette_color(index: usize) -> &'static str {
    COLOR_PALETTE[index % COLOR_PALETTE.len()]
}

/// Static description of one supervised service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Unique name of the service.
    pub name: String,
    /// The command executable.
    pub cmd: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Services that must be healthy before this one is spawned.
    pub depends_on: Vec<String>,
    /// Optional readiness probe.
    pub ready_check: Option<ReadyCheck>,
    /// Display color (e.g. `#00FF00`).
    pub color: String,
}

impl ServiceDefinition {
    /// Builds a definition with no dependencies, no ready check and a palette color.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args,
            depends_on: Vec::new(),
            ready_check: None,
            color: palette_color(0).to_string(),
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_ready_check(mut self, check: ReadyCheck) -> Self {
        self.ready_check = Some(check);
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    /// Renders the command line for narration.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.cmd.clone();
        }
        format!("{} {}", self.cmd, self.args.join(" "))
    }
}

/// What a readiness probe tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyProbe {
    /// A shell-style command that must exit with code 0.
    Command(String),
    /// An HTTP(S) URL that must answer with a 2xx status.
    Url(String),
}

/// Readiness probe configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCheck {
    pub probe: ReadyProbe,
    pub interval: Duration,
    pub timeout: Duration,
}

impl ReadyCheck {
    pub fn command(command: impl Into<String>) -> Self {
        Self::with_defaults(ReadyProbe::Command(command.into()))
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::with_defaults(ReadyProbe::Url(url.into()))
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn with_defaults(probe: ReadyProbe) -> Self {
        Self {
            probe,
            interval: Duration::from_millis(DEFAULT_READY_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
        }
    }
}

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Initialized but not started yet.
    Pending,
    /// Spawned, readiness not yet established.
    Starting,
    /// Running and ready.
    Healthy,
    /// A supervisor-initiated kill is in flight.
    Stopping,
    /// Not running.
    Stopped,
    /// Exited with an error, failed to spawn, or failed its ready check.
    Failed,
    /// Old handle is gone, a new spawn is about to begin.
    Restarting,
}

impl ProcessState {
    pub fn label(self) -> &'static str {
        match self {
            ProcessState::Pending => "PENDING",
            ProcessState::Starting => "STARTING",
            ProcessState::Healthy => "HEALTHY",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Stopped => "STOPPED",
            ProcessState::Failed => "FAILED",
            ProcessState::Restarting => "RESTARTING",
        }
    }

    /// Stable rest states a service settles into once its spawn attempt resolves.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ProcessState::Healthy | ProcessState::Stopped | ProcessState::Failed
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-service display flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags {
    pub mute: bool,
    pub solo: bool,
}

/// Decides whether entries from `process` should be shown given every service's flags.
///
/// When any service is solo, only solo services are visible. Otherwise muted
/// services are hidden. Names without flags (such as `SYSTEM`) count as neither.
pub fn is_visible(process: &str, flags: &HashMap<String, ServiceFlags>) -> bool {
    let any_solo = flags.values().any(|f| f.solo);
    let own = flags.get(process).copied().unwrap_or_default();
    if any_solo {
        return own.solo;
    }
    !own.mute
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(entries: &[(&str, bool, bool)]) -> HashMap<String, ServiceFlags> {
        entries
            .iter()
            .map(|(name, mute, solo)| {
                (
                    name.to_string(),
                    ServiceFlags {
                        mute: *mute,
                        solo: *solo,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn muted_services_are_hidden() {
        let flags = flags(&[("api", true, false), ("web", false, false)]);
        assert!(!is_visible("api", &flags));
        assert!(is_visible("web", &flags));
        assert!(is_visible(SYSTEM_PROCESS, &flags));
    }

    #[test]
    fn solo_overrides_mute_and_hides_everything_else() {
        let flags = flags(&[("api", true, true), ("web", false, false)]);
        assert!(is_visible("api", &flags));
        assert!(!is_visible("web", &flags));
        assert!(!is_visible(SYSTEM_PROCESS, &flags));
    }

    #[test]
    fn ready_check_defaults() {
        let check = ReadyCheck::command("true");
        assert_eq!(check.interval, Duration::from_millis(1000));
        assert_eq!(check.timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn palette_wraps() {
        assert_eq!(palette_color(0), "#FF0000");
        assert_eq!(palette_color(6), "#FF0000");
        assert_eq!(palette_color(7), "#FFFF00");
    }
}
