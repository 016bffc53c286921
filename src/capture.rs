//! Packet capture
//!
//! Live capture from a network interface and pcap file replay, both behind
//! the [`PacketSource`] trait so the engine never depends on the capture
//! method. A dedicated capture thread pulls packets and bridges them into
//! the async engine over a bounded channel.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::CaptureConfig;
use crate::packet::Packet;

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Frames received from the capture handle
    pub received: u64,
    /// Frames that failed to parse
    pub malformed: u64,
}

/// A source of parsed packets
pub trait PacketSource: Send {
    /// Get the next packet. `Ok(None)` means no packet right now (live
    /// read timeout); `Err` means the source is exhausted or broken.
    fn next_packet(&mut self) -> Result<Option<Packet>>;

    fn stats(&self) -> CaptureStats;
}

fn header_timestamp(header: &pcap::PacketHeader) -> DateTime<Utc> {
    Utc.timestamp_opt(header.ts.tv_sec as i64, (header.ts.tv_usec as u32) * 1000)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Live capture from a network interface
pub struct LiveSource {
    capture: pcap::Capture<pcap::Active>,
    stats: CaptureStats,
}

impl LiveSource {
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let device = match &config.interface {
            Some(name) => pcap::Device::from(name.as_str()),
            None => pcap::Device::lookup()
                .context("Failed to look up capture device")?
                .context("No capture device available")?,
        };

        info!("Opening capture on {}", device.name);

        let mut capture = pcap::Capture::from_device(device)
            .context("Failed to create capture")?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen as i32)
            .timeout(config.timeout_ms as i32)
            .open()
            .context("Failed to open capture (root privileges required?)")?;

        if !config.filter.is_empty() {
            capture
                .filter(&config.filter, true)
                .with_context(|| format!("Invalid BPF filter: {}", config.filter))?;
        }

        Ok(Self {
            capture,
            stats: CaptureStats::default(),
        })
    }
}

impl PacketSource for LiveSource {
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        match self.capture.next_packet() {
            Ok(raw) => {
                self.stats.received += 1;
                let ts = header_timestamp(raw.header);
                match Packet::from_ethernet(ts, raw.data) {
                    Some(pkt) => Ok(Some(pkt)),
                    None => {
                        self.stats.malformed += 1;
                        Ok(None)
                    }
                }
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }
}

/// Replay from a pcap file
pub struct FileSource {
    capture: pcap::Capture<pcap::Offline>,
    stats: CaptureStats,
    finished: bool,
}

impl FileSource {
    pub fn open(path: &str) -> Result<Self> {
        let capture = pcap::Capture::from_file(path)
            .with_context(|| format!("Failed to open pcap file: {}", path))?;

        info!("Replaying pcap file {}", path);

        Ok(Self {
            capture,
            stats: CaptureStats::default(),
            finished: false,
        })
    }
}

impl PacketSource for FileSource {
    fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.finished {
            anyhow::bail!("pcap replay finished");
        }

        loop {
            match self.capture.next_packet() {
                Ok(raw) => {
                    self.stats.received += 1;
                    let ts = header_timestamp(raw.header);
                    match Packet::from_ethernet(ts, raw.data) {
                        Some(pkt) => return Ok(Some(pkt)),
                        None => {
                            self.stats.malformed += 1;
                            continue;
                        }
                    }
                }
                Err(pcap::Error::NoMorePackets) => {
                    self.finished = true;
                    anyhow::bail!("pcap replay finished");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }
}

/// Run a packet source on the current (OS) thread, bridging packets into
/// the engine's channel. Returns when the source ends or the engine hangs
/// up. Malformed frames were already dropped and counted by the source.
pub fn run_capture_loop(mut source: Box<dyn PacketSource>, packet_tx: mpsc::Sender<Packet>) {
    loop {
        match source.next_packet() {
            Ok(Some(pkt)) => {
                if packet_tx.blocking_send(pkt).is_err() {
                    // Engine shut down
                    break;
                }
            }
            Ok(None) => {
                // Read timeout; keep polling
                continue;
            }
            Err(e) => {
                let stats = source.stats();
                if stats.malformed > 0 {
                    warn!("{} malformed frames dropped during capture", stats.malformed);
                }
                info!("Capture ended after {} frames: {}", stats.received, e);
                break;
            }
        }
    }
}

/// Spawn the capture loop on its own thread.
pub fn spawn_capture_thread(
    source: Box<dyn PacketSource>,
    packet_tx: mpsc::Sender<Packet>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || run_capture_loop(source, packet_tx))
        .unwrap_or_else(|e| {
            error!("Failed to spawn capture thread: {}", e);
            std::thread::spawn(|| {})
        })
}
