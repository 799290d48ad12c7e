//! Headless rendering of the log store.
//!
//! `LogPrinter` turns log entries into `[name] text` lines with colored
//! prefixes, applying the mute/solo visibility rule and the regex filter.
//! `run_printer` drives it from a store subscription.

use std::collections::HashMap;
use std::io::{self, Write};

use regex::{Regex, RegexBuilder};
use strip_ansi_escapes::strip;
use tracing::{debug, warn};

use crate::events::LogEvent;
use crate::log_store::{LogEntry, LogStore};
use crate::service::{is_visible, ServiceFlags};

/// Formats and filters log entries for a terminal.
#[derive(Debug, Clone)]
pub struct LogPrinter {
    colors: HashMap<String, String>,
    use_color: bool,
    filter: Option<Regex>,
}

impl LogPrinter {
    /// `colors` maps service names to `#RRGGBB` (or a basic color name).
    pub fn new(colors: HashMap<String, String>, use_color: bool) -> Self {
        Self {
            colors,
            use_color,
            filter: None,
        }
    }

    /// Compiles `filter` as a case-insensitive regex. Empty or invalid filters show everything.
    pub fn set_filter(&mut self, filter: &str) {
        if filter.is_empty() {
            self.filter = None;
            return;
        }
        match RegexBuilder::new(filter).case_insensitive(true).build() {
            Ok(regex) => self.filter = Some(regex),
            Err(err) => {
                warn!("Invalid filter regex {:?}: {}", filter, err);
                self.filter = None;
            }
        }
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Renders `entry`, or `None` when it is hidden by flags or the filter.
    pub fn format_entry(
        &self,
        entry: &LogEntry,
        flags: &HashMap<String, ServiceFlags>,
    ) -> Option<String> {
        if !is_visible(&entry.process, flags) {
            return None;
        }
        if let Some(filter) = &self.filter {
            let plain = sanitize_text(&format!("[{}] {}", entry.process, entry.text));
            if !filter.is_match(&plain) {
                return None;
            }
        }
        let mut prefix = format!("[{}]", entry.process);
        if self.use_color {
            prefix = apply_color(
                &prefix,
                self.colors.get(&entry.process).map(String::as_str),
            );
        }
        Some(format!("{} {}", prefix, entry.text))
    }

    /// Writes every visible entry of `entries` to `out`.
    pub fn print_all<W: Write>(
        &self,
        entries: &[LogEntry],
        flags: &HashMap<String, ServiceFlags>,
        out: &mut W,
    ) -> io::Result<()> {
        for entry in entries {
            if let Some(line) = self.format_entry(entry, flags) {
                writeln!(out, "{}", line)?;
            }
        }
        out.flush()
    }
}

/// Prints the current history and then every store event until the store goes away.
///
/// `flags` is consulted per event so mute/solo changes apply to later lines.
pub async fn run_printer<W, F>(
    log_store: LogStore,
    mut printer: LogPrinter,
    flags: F,
    mut out: W,
) -> io::Result<()>
where
    W: Write,
    F: Fn() -> HashMap<String, ServiceFlags>,
{
    let (history, mut subscription) = log_store.snapshot_and_subscribe();
    printer.set_filter(&log_store.get_filter());
    printer.print_all(&history, &flags(), &mut out)?;

    while let Some(event) = subscription.recv().await {
        match event {
            LogEvent::Appended(entry) => {
                if let Some(line) = printer.format_entry(&entry, &flags()) {
                    writeln!(out, "{}", line)?;
                    out.flush()?;
                }
            }
            LogEvent::Replaced(entries) => {
                debug!("log history replaced with {} entries", entries.len());
                printer.print_all(&entries, &flags(), &mut out)?;
            }
            LogEvent::FilterChanged(filter) => {
                printer.set_filter(&filter);
                if printer.has_filter() {
                    writeln!(out, "-- filter: {} --", filter)?;
                } else {
                    writeln!(out, "-- filter cleared --")?;
                }
                printer.print_all(&log_store.get_logs(), &flags(), &mut out)?;
            }
        }
    }
    Ok(())
}

/// Removes ANSI escape codes. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let Some(color) = color else {
        return prefix.to_string();
    };
    if let Some((r, g, b)) = parse_hex(color) {
        return format!("\u{1b}[38;2;{};{};{}m{}\u{1b}[0m", r, g, b, prefix);
    }
    let code = match color.to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}

fn parse_hex(color: &str) -> Option<(u8, u8, u8)> {
    let hex = color.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |range| u8::from_str_radix(&hex[range], 16).ok();
    Some((channel(0..2)?, channel(2..4)?, channel(4..6)?))
}
