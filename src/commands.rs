//! Line commands read from stdin by the headless front-end.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::events::lock;
use crate::ipc::{ClientHandle, IpcMessage};
use crate::log_store::LogStore;
use crate::service::ServiceFlags;
use crate::supervisor::Supervisor;

pub const HELP: &str = "commands: start <name> | stop <name> | restart <name> | mute <name> | \
solo <name> | filter [regex] | status | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    Stop(String),
    Restart(String),
    Mute(String),
    Solo(String),
    /// An empty pattern clears the filter.
    Filter(String),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("{0} needs a service name")]
    MissingName(&'static str),
}

/// Parses one input line.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let name = |verb: &'static str| {
        if rest.is_empty() {
            Err(CommandError::MissingName(verb))
        } else {
            Ok(rest.to_string())
        }
    };
    match word {
        "" => Err(CommandError::Empty),
        "start" => name("start").map(Command::Start),
        "stop" => name("stop").map(Command::Stop),
        "restart" | "r" => name("restart").map(Command::Restart),
        "mute" | "m" => name("mute").map(Command::Mute),
        "solo" | "s" => name("solo").map(Command::Solo),
        "filter" | "f" | "/" => Ok(Command::Filter(rest.to_string())),
        "status" | "ps" => Ok(Command::Status),
        "help" | "?" => Ok(Command::Help),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// What the input loop should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    /// Feedback for the user that must not go into the log store.
    Message(String),
    Quit,
}

/// Where commands are applied.
pub enum Target {
    /// Supervision commands act on the local supervisor.
    Master(Supervisor),
    /// Only restart is forwarded; display flags are local.
    Client {
        client: Arc<ClientHandle>,
        flags: Mutex<HashMap<String, ServiceFlags>>,
    },
}

pub struct CommandContext {
    log_store: LogStore,
    target: Target,
}

impl CommandContext {
    pub fn master(supervisor: Supervisor) -> Self {
        Self {
            log_store: supervisor.log_store().clone(),
            target: Target::Master(supervisor),
        }
    }

    pub fn client(client: Arc<ClientHandle>, log_store: LogStore) -> Self {
        Self {
            log_store,
            target: Target::Client {
                client,
                flags: Mutex::new(HashMap::new()),
            },
        }
    }

    /// Current display flags, used by the printer.
    pub fn flags(&self) -> HashMap<String, ServiceFlags> {
        match &self.target {
            Target::Master(supervisor) => supervisor.all_flags(),
            Target::Client { flags, .. } => lock(flags).clone(),
        }
    }

    pub async fn execute(&self, command: Command) -> Reply {
        debug!("executing {:?}", command);
        match (command, &self.target) {
            (Command::Quit, _) => Reply::Quit,
            (Command::Help, _) => Reply::Message(HELP.to_string()),
            (Command::Filter(pattern), _) => {
                self.log_store.set_filter(pattern);
                Reply::Done
            }

            (Command::Start(name), Target::Master(supervisor)) => {
                let supervisor = supervisor.clone();
                tokio::spawn(async move { supervisor.start(&name).await });
                Reply::Done
            }
            (Command::Stop(name), Target::Master(supervisor)) => {
                let supervisor = supervisor.clone();
                tokio::spawn(async move { supervisor.stop(&name).await });
                Reply::Done
            }
            (Command::Restart(name), Target::Master(supervisor)) => {
                let supervisor = supervisor.clone();
                tokio::spawn(async move { supervisor.restart(&name).await });
                Reply::Done
            }
            (Command::Mute(name), Target::Master(supervisor)) => {
                if supervisor.toggle_mute(&name) {
                    Reply::Done
                } else {
                    Reply::Message(format!("unknown service: {}", name))
                }
            }
            (Command::Solo(name), Target::Master(supervisor)) => {
                if supervisor.toggle_solo(&name) {
                    Reply::Done
                } else {
                    Reply::Message(format!("unknown service: {}", name))
                }
            }
            (Command::Status, Target::Master(supervisor)) => {
                let mut out = String::new();
                for status in supervisor.statuses() {
                    let pid = status
                        .pid
                        .map(|pid| pid.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let _ = writeln!(out, "{:<20} {:<10} {}", status.name, status.state, pid);
                }
                Reply::Message(out.trim_end().to_string())
            }

            (Command::Restart(name), Target::Client { client, .. }) => {
                match client.send(&IpcMessage::Restart { process_name: name }).await {
                    Ok(()) => Reply::Done,
                    Err(err) => Reply::Message(format!("failed to reach master: {}", err)),
                }
            }
            (Command::Mute(name), Target::Client { flags, .. }) => {
                let mut flags = lock(flags);
                let entry = flags.entry(name.clone()).or_default();
                entry.mute = !entry.mute;
                let word = if entry.mute { "muted" } else { "unmuted" };
                Reply::Message(format!("{} is now {}.", name, word))
            }
            (Command::Solo(name), Target::Client { flags, .. }) => {
                let mut flags = lock(flags);
                let entry = flags.entry(name.clone()).or_default();
                entry.solo = !entry.solo;
                let word = if entry.solo { "solo" } else { "unsolo" };
                Reply::Message(format!("{} is now {}.", name, word))
            }
            (Command::Start(_) | Command::Stop(_) | Command::Status, Target::Client { .. }) => {
                Reply::Message("only the master instance supervises services".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::service::{ProcessState, ServiceDefinition};
    use crate::supervisor::SupervisorOptions;

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!(parse_command("restart api"), Ok(Command::Restart("api".into())));
        assert_eq!(parse_command("  m   web "), Ok(Command::Mute("web".into())));
        assert_eq!(parse_command("filter err|warn"), Ok(Command::Filter("err|warn".into())));
        assert_eq!(parse_command("filter"), Ok(Command::Filter(String::new())));
        assert_eq!(parse_command("q"), Ok(Command::Quit));
        assert_eq!(parse_command("status"), Ok(Command::Status));
    }

    #[test]
    fn reports_bad_input() {
        assert_eq!(parse_command("   "), Err(CommandError::Empty));
        assert_eq!(parse_command("solo"), Err(CommandError::MissingName("solo")));
        assert_eq!(
            parse_command("launch api"),
            Err(CommandError::Unknown("launch".into()))
        );
    }

    #[tokio::test]
    async fn master_commands_drive_the_supervisor() {
        let store = LogStore::new();
        let supervisor = Supervisor::new(
            vec![ServiceDefinition::new("api", "sleep", vec!["30".into()])],
            store.clone(),
            SupervisorOptions::default(),
        );
        let ctx = CommandContext::master(supervisor.clone());

        assert_eq!(ctx.execute(Command::Start("api".into())).await, Reply::Done);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while supervisor.state("api") != Some(ProcessState::Healthy) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(ctx.execute(Command::Mute("api".into())).await, Reply::Done);
        assert!(ctx.flags()["api"].mute);
        assert_eq!(
            ctx.execute(Command::Solo("nope".into())).await,
            Reply::Message("unknown service: nope".into())
        );
        ctx.execute(Command::Filter("boom".into())).await;
        assert_eq!(store.get_filter(), "boom");

        match ctx.execute(Command::Status).await {
            Reply::Message(text) => assert!(text.starts_with("api") && text.contains("HEALTHY")),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(ctx.execute(Command::Quit).await, Reply::Quit);
        supervisor.cleanup().await;
    }
}
