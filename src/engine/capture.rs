//! Frame sources
//!
//! Capture is a collaborator behind the `FrameSource` trait; the engine
//! only pulls `RawFrame`s. Live capture and pcap replay are provided, plus
//! an in-memory source for tests. Driver internals stay out of scope.

use std::collections::VecDeque;
use std::path::PathBuf;

#[cfg(feature = "live-capture")]
use anyhow::Context;
#[cfg(feature = "live-capture")]
use chrono::{DateTime, TimeZone};
use chrono::Utc;
use serde::{Deserialize, Serialize};
#[cfg(feature = "live-capture")]
use tracing::warn;

use crate::core::arp::RawFrame;

/// BPF filter matching plain and 802.1Q-tagged ARP
#[cfg(feature = "live-capture")]
const ARP_FILTER: &str = "arp or (vlan and arp)";

/// Capture method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Live device capture
    Live,
    /// PCAP file replay
    File,
    /// In-memory frames (tests)
    Dummy,
}

impl Default for CaptureMethod {
    fn default() -> Self {
        CaptureMethod::Live
    }
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub method: CaptureMethod,
    /// Interface name (live method)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// PCAP file path (file method)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcap_file: Option<PathBuf>,
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,
    #[serde(default = "default_true")]
    pub promiscuous: bool,
    /// Read timeout, milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            method: CaptureMethod::default(),
            interface: None,
            pcap_file: None,
            snaplen: default_snaplen(),
            promiscuous: true,
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_snaplen() -> i32 {
    65535
}

fn default_timeout_ms() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

/// Capture statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub received: u64,
    pub dropped: u64,
}

/// The collaborator seam: something that produces raw frames
pub trait FrameSource: Send {
    /// The next frame, `Ok(None)` when nothing is available right now
    fn next_frame(&mut self) -> anyhow::Result<Option<RawFrame>>;

    /// True once the source is exhausted (file replay, dummy)
    fn is_eof(&self) -> bool {
        false
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats::default()
    }
}

/// Build a source from configuration
pub fn create_source(config: &CaptureConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    match config.method {
        #[cfg(feature = "live-capture")]
        CaptureMethod::Live => {
            let interface = config
                .interface
                .clone()
                .context("live capture requires an interface")?;
            Ok(Box::new(LiveSource::open(&interface, config)?))
        }
        #[cfg(feature = "live-capture")]
        CaptureMethod::File => {
            let path = config
                .pcap_file
                .clone()
                .context("file capture requires pcap_file")?;
            Ok(Box::new(FileSource::open(&path)?))
        }
        #[cfg(not(feature = "live-capture"))]
        CaptureMethod::Live | CaptureMethod::File => anyhow::bail!(
            "built without libpcap support; rebuild with the live-capture feature"
        ),
        CaptureMethod::Dummy => Ok(Box::new(DummySource::new("dummy0"))),
    }
}

/// Live device capture via libpcap
#[cfg(feature = "live-capture")]
pub struct LiveSource {
    interface: String,
    capture: pcap::Capture<pcap::Active>,
    stats: CaptureStats,
}

#[cfg(feature = "live-capture")]
impl LiveSource {
    pub fn open(interface: &str, config: &CaptureConfig) -> anyhow::Result<Self> {
        let mut capture = pcap::Capture::from_device(interface)
            .with_context(|| format!("no such capture device: {}", interface))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms)
            .open()
            .with_context(|| format!("failed to open capture on {}", interface))?;

        capture
            .filter(ARP_FILTER, true)
            .context("failed to install ARP capture filter")?;

        Ok(Self {
            interface: interface.to_string(),
            capture,
            stats: CaptureStats::default(),
        })
    }
}

#[cfg(feature = "live-capture")]
impl FrameSource for LiveSource {
    fn next_frame(&mut self) -> anyhow::Result<Option<RawFrame>> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.stats.received += 1;
                Ok(Some(RawFrame {
                    interface: self.interface.clone(),
                    timestamp: timeval_to_utc(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64),
                    bytes: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}

/// PCAP file replay
#[cfg(feature = "live-capture")]
pub struct FileSource {
    name: String,
    capture: pcap::Capture<pcap::Offline>,
    stats: CaptureStats,
    eof: bool,
}

#[cfg(feature = "live-capture")]
impl FileSource {
    pub fn open(path: &PathBuf) -> anyhow::Result<Self> {
        let capture = pcap::Capture::from_file(path)
            .with_context(|| format!("failed to open pcap file: {}", path.display()))?;
        Ok(Self {
            name: format!("pcap:{}", path.display()),
            capture,
            stats: CaptureStats::default(),
            eof: false,
        })
    }
}

#[cfg(feature = "live-capture")]
impl FrameSource for FileSource {
    fn next_frame(&mut self) -> anyhow::Result<Option<RawFrame>> {
        if self.eof {
            return Ok(None);
        }
        match self.capture.next_packet() {
            Ok(packet) => {
                self.stats.received += 1;
                Ok(Some(RawFrame {
                    interface: self.name.clone(),
                    timestamp: timeval_to_utc(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64),
                    bytes: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::NoMorePackets) => {
                self.eof = true;
                Ok(None)
            }
            Err(err) => {
                warn!(error = %err, "pcap replay error, treating as end of file");
                self.eof = true;
                Ok(None)
            }
        }
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}

/// Pre-seeded in-memory source
pub struct DummySource {
    interface: String,
    frames: VecDeque<RawFrame>,
    stats: CaptureStats,
}

impl DummySource {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            frames: VecDeque::new(),
            stats: CaptureStats::default(),
        }
    }

    pub fn push(&mut self, bytes: Vec<u8>) {
        self.frames.push_back(RawFrame {
            interface: self.interface.clone(),
            timestamp: Utc::now(),
            bytes,
        });
    }

    pub fn push_frame(&mut self, frame: RawFrame) {
        self.frames.push_back(frame);
    }
}

impl FrameSource for DummySource {
    fn next_frame(&mut self) -> anyhow::Result<Option<RawFrame>> {
        match self.frames.pop_front() {
            Some(frame) => {
                self.stats.received += 1;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    fn is_eof(&self) -> bool {
        self.frames.is_empty()
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}

#[cfg(feature = "live-capture")]
fn timeval_to_utc(sec: i64, usec: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(sec, (usec.clamp(0, 999_999) as u32) * 1000)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_source_drains() {
        let mut source = DummySource::new("test0");
        source.push(vec![0u8; 60]);
        source.push(vec![1u8; 60]);

        assert!(!source.is_eof());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.is_eof());
        assert_eq!(source.stats().received, 2);
    }

    #[test]
    fn test_create_source_requires_destination() {
        let config = CaptureConfig {
            method: CaptureMethod::File,
            ..Default::default()
        };
        assert!(create_source(&config).is_err());
    }

    #[cfg(feature = "live-capture")]
    #[test]
    fn test_timeval_conversion() {
        let ts = timeval_to_utc(1_700_000_000, 500_000);
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }
}
