//! Authentication log monitoring
//!
//! Tails auth logs (sshd, sudo) and converts matched lines into
//! application events for the rule engine's brute-force and
//! privilege-escalation detectors. Tracks the file position across polls
//! and restarts from the beginning when the file is rotated.

use anyhow::{Context, Result};
use chrono::Utc;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AuthLogConfig;
use crate::rules::AppEvent;

/// What a matched line means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogEventKind {
    FailedAuth,
    Sudo,
}

/// Compiled pattern for matching log lines
struct CompiledPattern {
    name: String,
    regex: Regex,
    kind: LogEventKind,
}

/// Monitor for a single log file
struct LogTail {
    service: String,
    path: PathBuf,
    patterns: Vec<CompiledPattern>,
    file_position: u64,
}

impl LogTail {
    fn new(service: String, config: &AuthLogConfig) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                let regex = Regex::new(&p.regex)
                    .with_context(|| format!("Invalid regex pattern: {}", p.regex))?;

                let kind = match p.event_type.as_str() {
                    "sudo" => LogEventKind::Sudo,
                    _ => LogEventKind::FailedAuth,
                };

                Ok(CompiledPattern {
                    name: p.name.clone(),
                    regex,
                    kind,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            service,
            path: PathBuf::from(&config.log_path),
            patterns,
            file_position: 0,
        })
    }

    /// Process new lines from the log file
    fn process_new_lines(&mut self) -> Result<Vec<AppEvent>> {
        let mut events = Vec::new();

        if !self.path.exists() {
            debug!("Log file does not exist: {}", self.path.display());
            return Ok(events);
        }

        let file = File::open(&self.path)?;
        let metadata = file.metadata()?;
        let file_size = metadata.len();

        // Handle log rotation (file got smaller)
        if file_size < self.file_position {
            info!(
                "Log file {} appears to have been rotated, starting from beginning",
                self.path.display()
            );
            self.file_position = 0;
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.file_position))?;

        let mut line = String::new();
        while reader.read_line(&mut line)? > 0 {
            if let Some(event) = self.match_line(&line) {
                events.push(event);
            }
            line.clear();
        }

        self.file_position = reader.stream_position()?;
        Ok(events)
    }

    /// Match a line against all patterns
    fn match_line(&self, line: &str) -> Option<AppEvent> {
        for pattern in &self.patterns {
            if let Some(captures) = pattern.regex.captures(line) {
                // Local events (sudo) carry no address; attribute them to
                // the host itself so windows still key on a source.
                let src_ip = captures
                    .name("ip")
                    .and_then(|m| m.as_str().parse::<IpAddr>().ok())
                    .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

                debug!(
                    "Matched pattern '{}' for {} in service {}",
                    pattern.name, src_ip, self.service
                );

                return Some(match pattern.kind {
                    LogEventKind::FailedAuth => AppEvent::AuthFailure {
                        src_ip,
                        service: self.service.clone(),
                        ts: Utc::now(),
                    },
                    LogEventKind::Sudo => AppEvent::SudoInvocation { src_ip, ts: Utc::now() },
                });
            }
        }
        None
    }
}

/// Auth log monitor manager
pub struct AuthLogMonitor {
    tails: HashMap<String, LogTail>,
}

impl AuthLogMonitor {
    pub fn new() -> Self {
        Self { tails: HashMap::new() }
    }

    /// Add a log to monitor
    pub fn add_log(&mut self, name: String, config: &AuthLogConfig) -> Result<()> {
        if !config.enabled {
            debug!("Auth log {} is disabled, skipping", name);
            return Ok(());
        }

        let tail = LogTail::new(name.clone(), config)?;
        info!(
            "Monitoring auth log '{}' at {}",
            name,
            tail.path.display()
        );
        self.tails.insert(name, tail);
        Ok(())
    }

    pub fn monitored_paths(&self) -> Vec<PathBuf> {
        self.tails.values().map(|t| t.path.clone()).collect()
    }

    /// Poll all tails and collect new events
    pub fn poll(&mut self) -> Vec<AppEvent> {
        let mut events = Vec::new();

        for (name, tail) in &mut self.tails {
            match tail.process_new_lines() {
                Ok(mut new_events) => events.append(&mut new_events),
                Err(e) => error!("Error reading auth log {}: {}", name, e),
            }
        }

        events
    }
}

impl Default for AuthLogMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Start auth log monitoring: a notify watcher on the parent directories
/// plus a periodic poll in case file events are missed.
pub async fn start_auth_log_monitoring(
    logs: HashMap<String, AuthLogConfig>,
    event_tx: mpsc::Sender<AppEvent>,
) -> Result<()> {
    let mut monitor = AuthLogMonitor::new();

    for (name, config) in &logs {
        if let Err(e) = monitor.add_log(name.clone(), config) {
            warn!("Failed to add auth log {}: {}", name, e);
        }
    }

    let paths = monitor.monitored_paths();
    if paths.is_empty() {
        warn!("No auth logs to monitor");
        return Ok(());
    }

    let (watcher_tx, mut watcher_rx) = mpsc::channel::<Result<Event, notify::Error>>(100);

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = watcher_tx.blocking_send(res);
        },
        Config::default(),
    )?;

    let mut watched_dirs = std::collections::HashSet::new();
    for path in &paths {
        if let Some(parent) = path.parent() {
            if watched_dirs.insert(parent.to_path_buf()) && parent.exists() {
                watcher.watch(parent, RecursiveMode::NonRecursive)?;
                info!("Watching directory: {}", parent.display());
            }
        }
    }

    // Initial poll
    for event in monitor.poll() {
        event_tx.send(event).await?;
    }

    info!("Auth log monitoring started for {} logs", monitor.tails.len());

    loop {
        tokio::select! {
            Some(res) = watcher_rx.recv() => {
                match res {
                    Ok(event) => {
                        let relevant = event.paths.iter().any(|p| {
                            paths.iter().any(|mp| p.ends_with(mp.file_name().unwrap_or_default()))
                        });

                        if relevant {
                            for app_event in monitor.poll() {
                                if event_tx.send(app_event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("File watcher error: {}", e);
                    }
                }
            }

            // Poll periodically in case we miss file events
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                for app_event in monitor.poll() {
                    if event_tx.send(app_event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogPatternConfig;
    use std::io::Write;

    fn ssh_config(path: &str) -> AuthLogConfig {
        AuthLogConfig {
            enabled: true,
            log_path: path.to_string(),
            patterns: vec![
                LogPatternConfig {
                    name: "failed_password".to_string(),
                    regex: r"Failed password for .* from (?P<ip>\d+\.\d+\.\d+\.\d+)".to_string(),
                    event_type: "failed_auth".to_string(),
                },
                LogPatternConfig {
                    name: "sudo_session".to_string(),
                    regex: r"sudo:\s+\S+ : TTY=".to_string(),
                    event_type: "sudo".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_failed_password_matching() {
        let tail = LogTail::new("ssh".to_string(), &ssh_config("/var/log/auth.log")).unwrap();

        let line = "Dec  4 10:00:00 server sshd[1234]: Failed password for root from 192.168.1.100 port 22 ssh2";
        let event = tail.match_line(line).expect("line matches");

        match event {
            AppEvent::AuthFailure { src_ip, service, .. } => {
                assert_eq!(src_ip.to_string(), "192.168.1.100");
                assert_eq!(service, "ssh");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_sudo_matching_without_ip() {
        let tail = LogTail::new("ssh".to_string(), &ssh_config("/var/log/auth.log")).unwrap();

        let line = "Dec  4 10:00:00 server sudo:   alice : TTY=pts/0 ; PWD=/home/alice ; USER=root ; COMMAND=/bin/ls";
        let event = tail.match_line(line).expect("line matches");

        match event {
            AppEvent::SudoInvocation { src_ip, .. } => {
                assert_eq!(src_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_position_tracking_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("auth.log");
        let mut file = File::create(&log_path).unwrap();
        writeln!(file, "sshd[1]: Failed password for root from 192.168.1.100 port 22").unwrap();
        file.flush().unwrap();

        let mut tail =
            LogTail::new("ssh".to_string(), &ssh_config(log_path.to_str().unwrap())).unwrap();

        assert_eq!(tail.process_new_lines().unwrap().len(), 1);
        // No new lines: nothing re-read
        assert!(tail.process_new_lines().unwrap().is_empty());

        // Rotation: file replaced with a shorter one
        let mut file = File::create(&log_path).unwrap();
        writeln!(file, "x: Failed password for a from 10.0.0.5 port 22").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.process_new_lines().unwrap().len(), 1);
    }

    #[test]
    fn test_unmatched_lines_ignored() {
        let tail = LogTail::new("ssh".to_string(), &ssh_config("/var/log/auth.log")).unwrap();
        assert!(tail.match_line("sshd[1]: Accepted publickey for alice").is_none());
    }
}
