//! Configuration management for muxd.
//!
//! This module defines the structure of the `muxd.config.json` configuration
//! file (TOML is accepted too, chosen by extension) and turns it into the
//! validated service definitions the supervisor consumes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::service::{palette_color, ReadyCheck, ServiceDefinition};
use crate::supervisor::SupervisorOptions;

/// Config file looked up in the working directory when `-C` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "muxd.config.json";

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Services to supervise, in start order.
    pub services: Vec<ServiceConfig>,
    /// Optional runtime settings.
    #[serde(default)]
    pub settings: Settings,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Unique name of the service.
    pub name: String,
    /// Command to execute. Split shell-style when `args` is absent.
    pub cmd: String,
    /// Explicit arguments; `cmd` is then taken verbatim as the program.
    pub args: Option<Vec<String>>,
    /// Services that must be healthy before this one starts.
    pub depends_on: Option<Vec<String>>,
    /// Readiness probe.
    pub ready: Option<ReadyConfig>,
    /// Color override (e.g. `#00FF00`).
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyKind {
    Command,
    Url,
}

/// Configuration for a readiness probe. Durations are milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyConfig {
    #[serde(rename = "type")]
    pub kind: ReadyKind,
    pub command: Option<String>,
    pub url: Option<String>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
}

/// Runtime settings. Command-line flags take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub socket_path: Option<PathBuf>,
    pub dependency_poll_ms: Option<u64>,
    pub dependency_timeout_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
    pub filter: Option<String>,
}

impl Settings {
    pub fn supervisor_options(&self) -> SupervisorOptions {
        let defaults = SupervisorOptions::default();
        SupervisorOptions {
            dependency_poll: self
                .dependency_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.dependency_poll),
            dependency_timeout: self.dependency_timeout_ms.map(Duration::from_millis),
            kill_timeout: self
                .kill_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.kill_timeout),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no services defined")]
    NoServices,
    #[error("duplicate service name: {0}")]
    DuplicateName(String),
    #[error("empty cmd for {0}")]
    EmptyCommand(String),
    #[error("failed to parse cmd for {service}: {reason}")]
    InvalidCommand { service: String, reason: String },
    #[error("ready check of type {kind} for {service} needs a `{kind}` field")]
    MissingReadyTarget { service: String, kind: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// `.toml` files are TOML, everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw, ConfigFormat::from_path(path))
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

pub fn parse_config(raw: &str, format: ConfigFormat) -> Result<Config> {
    let config = match format {
        ConfigFormat::Json => serde_json::from_str(raw)?,
        ConfigFormat::Toml => toml::from_str(raw)?,
    };
    Ok(config)
}

impl Config {
    /// Validates the services and converts them into definitions, assigning
    /// palette colors by position where none is configured.
    pub fn service_definitions(&self) -> Result<Vec<ServiceDefinition>, ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateName(service.name.clone()));
            }
        }

        let definitions = self
            .services
            .iter()
            .enumerate()
            .map(|(index, service)| definition_from_config(index, service))
            .collect::<Result<Vec<_>, _>>()?;

        for definition in &definitions {
            for dep in &definition.depends_on {
                if !seen.contains(dep.as_str()) {
                    // Kept as is: the dependent will wait until stopped or timed out.
                    warn!("{} depends on unknown service {}", definition.name, dep);
                }
            }
        }
        Ok(definitions)
    }
}

fn definition_from_config(
    index: usize,
    service: &ServiceConfig,
) -> Result<ServiceDefinition, ConfigError> {
    let (cmd, args) = match &service.args {
        Some(args) => (service.cmd.clone(), args.clone()),
        None => {
            let mut parts =
                shell_words::split(&service.cmd).map_err(|err| ConfigError::InvalidCommand {
                    service: service.name.clone(),
                    reason: err.to_string(),
                })?;
            if parts.is_empty() {
                return Err(ConfigError::EmptyCommand(service.name.clone()));
            }
            let cmd = parts.remove(0);
            (cmd, parts)
        }
    };
    if cmd.trim().is_empty() {
        return Err(ConfigError::EmptyCommand(service.name.clone()));
    }

    let mut definition = ServiceDefinition::new(service.name.clone(), cmd, args).with_color(
        service
            .color
            .clone()
            .unwrap_or_else(|| palette_color(index).to_string()),
    );
    definition.depends_on = service.depends_on.clone().unwrap_or_default();
    if let Some(ready) = &service.ready {
        definition.ready_check = Some(ready_check_from_config(&service.name, ready)?);
    }
    Ok(definition)
}

fn ready_check_from_config(service: &str, ready: &ReadyConfig) -> Result<ReadyCheck, ConfigError> {
    let missing = |kind| ConfigError::MissingReadyTarget {
        service: service.to_string(),
        kind,
    };
    let mut check = match ready.kind {
        ReadyKind::Command => {
            ReadyCheck::command(ready.command.clone().ok_or_else(|| missing("command"))?)
        }
        ReadyKind::Url => ReadyCheck::url(ready.url.clone().ok_or_else(|| missing("url"))?),
    };
    // Zero means "use the default", same as leaving the field out.
    if let Some(interval) = ready.interval.filter(|ms| *ms > 0) {
        check = check.interval(Duration::from_millis(interval));
    }
    if let Some(timeout) = ready.timeout.filter(|ms| *ms > 0) {
        check = check.timeout(Duration::from_millis(timeout));
    }
    Ok(check)
}
