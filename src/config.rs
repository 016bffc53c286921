use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub auth_logs: HashMap<String, AuthLogConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut auth_logs = HashMap::new();

        // Default sshd monitoring
        auth_logs.insert(
            "ssh".to_string(),
            AuthLogConfig {
                enabled: true,
                log_path: "/var/log/auth.log".to_string(),
                patterns: vec![
                    LogPatternConfig {
                        name: "failed_password".to_string(),
                        regex: r"Failed password for .* from (?P<ip>\d+\.\d+\.\d+\.\d+)".to_string(),
                        event_type: "failed_auth".to_string(),
                    },
                    LogPatternConfig {
                        name: "invalid_user".to_string(),
                        regex: r"Invalid user .* from (?P<ip>\d+\.\d+\.\d+\.\d+)".to_string(),
                        event_type: "failed_auth".to_string(),
                    },
                    LogPatternConfig {
                        name: "sudo_session".to_string(),
                        regex: r"sudo:\s+\S+ : TTY=".to_string(),
                        event_type: "sudo".to_string(),
                    },
                ],
            },
        );

        Self {
            capture: CaptureConfig::default(),
            flow: FlowConfig::default(),
            classifier: ClassifierConfig::default(),
            rules: RulesConfig::default(),
            alerts: AlertConfig::default(),
            auth_logs,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowsentry/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("flowsentry/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

/// Packet capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interface to capture on (None = first non-loopback)
    #[serde(default)]
    pub interface: Option<String>,

    /// BPF filter expression
    #[serde(default = "default_bpf_filter")]
    pub filter: String,

    /// Snapshot length
    #[serde(default = "default_snaplen")]
    pub snaplen: u32,

    /// Read timeout in milliseconds
    #[serde(default = "default_capture_timeout_ms")]
    pub timeout_ms: u32,

    /// Enable promiscuous mode
    #[serde(default = "default_true")]
    pub promiscuous: bool,

    /// Packet channel capacity between capture and engine
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            filter: default_bpf_filter(),
            snaplen: default_snaplen(),
            timeout_ms: default_capture_timeout_ms(),
            promiscuous: true,
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Flow reconstruction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Inactivity timeout in milliseconds before a flow is force-closed
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,

    /// Inter-packet gap in milliseconds at which a flow goes idle
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    /// Minimum consecutive payload packets to count a bulk run
    #[serde(default = "default_bulk_min_packets")]
    pub bulk_min_packets: u32,

    /// Interval between expiry sweeps in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Maximum concurrent flows
    #[serde(default = "default_table_size")]
    pub table_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
            bulk_min_packets: default_bulk_min_packets(),
            sweep_interval_ms: default_sweep_interval_ms(),
            table_size: default_table_size(),
        }
    }
}

impl FlowConfig {
    pub fn inactivity_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.inactivity_timeout_ms as i64)
    }

    pub fn idle_threshold_secs(&self) -> f64 {
        self.idle_threshold_ms as f64 / 1000.0
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Statistical classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Confidence below which a label is replaced with Unknown-Traffic
    #[serde(default = "default_unknown_threshold")]
    pub unknown_threshold: f64,

    /// Time budget per classification in milliseconds
    #[serde(default = "default_classify_budget_ms")]
    pub budget_ms: u64,

    /// Concurrent classification workers
    #[serde(default = "default_classify_workers")]
    pub workers: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            unknown_threshold: default_unknown_threshold(),
            budget_ms: default_classify_budget_ms(),
            workers: default_classify_workers(),
        }
    }
}

impl ClassifierConfig {
    pub fn budget(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.budget_ms)
    }
}

/// A sliding-window counter rule: fire at `threshold` events in `window_secs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRule {
    pub window_secs: u64,
    pub threshold: usize,
}

impl WindowRule {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

/// Slow-connection (connection starvation) rule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowConnConfig {
    /// Tracking window for open connections in seconds
    #[serde(default = "default_slow_conn_window")]
    pub window_secs: u64,

    /// Concurrently open low-throughput connections to fire at
    #[serde(default = "default_slow_conn_threshold")]
    pub threshold: usize,

    /// A connection with at most this many payload bytes counts as slow
    #[serde(default = "default_slow_conn_max_bytes")]
    pub max_bytes: u64,
}

impl Default for SlowConnConfig {
    fn default() -> Self {
        Self {
            window_secs: default_slow_conn_window(),
            threshold: default_slow_conn_threshold(),
            max_bytes: default_slow_conn_max_bytes(),
        }
    }
}

impl SlowConnConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

/// Payload pattern inspection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_true")]
    pub detect_sqli: bool,

    #[serde(default = "default_true")]
    pub detect_xss: bool,

    #[serde(default = "default_true")]
    pub detect_cmdi: bool,

    /// Maximum payload bytes to inspect per packet
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            detect_sqli: true,
            detect_xss: true,
            detect_cmdi: true,
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// Signature rule engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Failed auth attempts per source
    #[serde(default = "default_brute_force_rule")]
    pub brute_force: WindowRule,

    /// Elevated-privilege invocations per source
    #[serde(default = "default_priv_esc_rule")]
    pub privilege_escalation: WindowRule,

    /// Distinct destination ports per source
    #[serde(default = "default_port_scan_rule")]
    pub port_scan: WindowRule,

    #[serde(default)]
    pub slow_conn: SlowConnConfig,

    #[serde(default)]
    pub payload: PayloadConfig,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            brute_force: default_brute_force_rule(),
            privilege_escalation: default_priv_esc_rule(),
            port_scan: default_port_scan_rule(),
            slow_conn: SlowConnConfig::default(),
            payload: PayloadConfig::default(),
        }
    }
}

/// Alert dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Suppression window per (source, label) pair in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Bounded traffic-sample history size
    #[serde(default = "default_traffic_history")]
    pub traffic_history: usize,

    /// Bounded alert history size
    #[serde(default = "default_alert_history")]
    pub alert_history: usize,

    /// Optional path for periodic JSON snapshot export
    #[serde(default)]
    pub export_path: Option<String>,

    /// Snapshot export interval in milliseconds
    #[serde(default = "default_export_interval_ms")]
    pub export_interval_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            traffic_history: default_traffic_history(),
            alert_history: default_alert_history(),
            export_path: None,
            export_interval_ms: default_export_interval_ms(),
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// One monitored authentication log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthLogConfig {
    /// Whether this log is monitored
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the log file
    pub log_path: String,

    /// Patterns to match in the log file
    pub patterns: Vec<LogPatternConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPatternConfig {
    /// Name for this pattern
    pub name: String,

    /// Regex pattern; an `ip` named capture group attributes the event
    pub regex: String,

    /// Event type for matches: "failed_auth" or "sudo"
    pub event_type: String,
}

// Default value functions
fn default_bpf_filter() -> String {
    "ip".to_string()
}

fn default_snaplen() -> u32 {
    65535
}

fn default_capture_timeout_ms() -> u32 {
    100
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_inactivity_timeout_ms() -> u64 {
    2000
}

fn default_idle_threshold_ms() -> u64 {
    1000
}

fn default_bulk_min_packets() -> u32 {
    4
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_table_size() -> usize {
    100_000
}

fn default_unknown_threshold() -> f64 {
    0.60
}

fn default_classify_budget_ms() -> u64 {
    250
}

fn default_classify_workers() -> usize {
    4
}

fn default_brute_force_rule() -> WindowRule {
    WindowRule { window_secs: 10, threshold: 10 }
}

fn default_priv_esc_rule() -> WindowRule {
    WindowRule { window_secs: 30, threshold: 3 }
}

fn default_port_scan_rule() -> WindowRule {
    WindowRule { window_secs: 60, threshold: 10 }
}

fn default_slow_conn_window() -> u64 {
    120
}

fn default_slow_conn_threshold() -> usize {
    20
}

fn default_slow_conn_max_bytes() -> u64 {
    1024
}

fn default_max_payload_bytes() -> usize {
    2048
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_traffic_history() -> usize {
    200
}

fn default_alert_history() -> usize {
    500
}

fn default_export_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}
