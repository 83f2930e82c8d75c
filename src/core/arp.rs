//! ARP wire format and frame normalization
//!
//! Parses captured ethernet frames (including 802.1Q tagged frames) into
//! typed ARP events. Anything that is not a well-formed ARP-over-IPv4
//! frame is rejected and counted, never propagated downstream.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::trace;

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// A MAC that can never be a legitimate sender
    pub fn is_invalid_sender(&self) -> bool {
        *self == Self::ZERO || *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid mac address: {0}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split([':', '-']) {
            if count == 6 {
                return Err(MacParseError(s.to_string()));
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(MacParseError(s.to_string()));
        }
        Ok(MacAddr(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// ARP operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArpOp {
    Request,
    Reply,
    Unknown(u16),
}

impl From<u16> for ArpOp {
    fn from(val: u16) -> Self {
        match val {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            n => ArpOp::Unknown(n),
        }
    }
}

impl fmt::Display for ArpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArpOp::Request => write!(f, "request"),
            ArpOp::Reply => write!(f, "reply"),
            ArpOp::Unknown(n) => write!(f, "op{}", n),
        }
    }
}

/// Parsed ARP payload (after the ethernet header)
#[derive(Debug, Clone)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Parse an ARP-for-IPv4-over-ethernet payload (28 bytes)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_PACKET_LEN {
            return None;
        }

        // Hardware type must be ethernet
        if u16::from_be_bytes([data[0], data[1]]) != 1 {
            return None;
        }

        // Protocol type must be IPv4
        if u16::from_be_bytes([data[2], data[3]]) != 0x0800 {
            return None;
        }

        // Address lengths: 6-byte MAC, 4-byte IPv4
        if data[4] != 6 || data[5] != 4 {
            return None;
        }

        let operation = ArpOp::from(u16::from_be_bytes([data[6], data[7]]));

        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let sender_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);
        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);
        let target_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        Some(ArpPacket {
            operation,
            sender_mac: MacAddr(sender_mac),
            sender_ip,
            target_mac: MacAddr(target_mac),
            target_ip,
        })
    }

    /// Gratuitous ARP: the sender is talking about its own address
    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }

    /// ARP announcement: a gratuitous reply
    pub fn is_announcement(&self) -> bool {
        matches!(self.operation, ArpOp::Reply) && self.is_gratuitous()
    }
}

/// A raw frame as delivered by the capture collaborator
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub interface: String,
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// Normalized ARP event consumed by every detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArpEvent {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
    pub interface: String,
    pub vlan: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub gratuitous: bool,
}

impl ArpEvent {
    /// Canonical string encoding shared by the exact, fuzzy, and regex
    /// matchers. One encoding means one view of the event for all of them.
    pub fn canonical_encoding(&self) -> String {
        format!(
            "op={} sender={}/{} target={}/{} gratuitous={}",
            self.operation,
            self.sender_ip,
            self.sender_mac,
            self.target_ip,
            self.target_mac,
            if self.gratuitous { 1 } else { 0 },
        )
    }
}

/// Why a frame was rejected by the normalizer
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),
    #[error("not an ARP frame (ethertype {0:#06x})")]
    NotArp(u16),
    #[error("malformed ARP payload")]
    Malformed,
}

/// Normalizer drop counters, shared with the stats reporter
#[derive(Debug, Default)]
pub struct NormalizerStats {
    pub accepted: AtomicU64,
    pub truncated: AtomicU64,
    pub non_arp: AtomicU64,
    pub malformed: AtomicU64,
}

/// Converts raw captured frames into typed ARP events
#[derive(Debug, Default)]
pub struct FrameNormalizer {
    stats: NormalizerStats,
}

impl FrameNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse ethernet (+ optional single 802.1Q tag) and the ARP payload.
    /// Rejections are counted; the caller drops them.
    pub fn normalize(&self, frame: &RawFrame) -> Result<ArpEvent, NormalizeError> {
        let data = &frame.bytes;
        if data.len() < ETHERNET_HEADER_LEN {
            self.stats.truncated.fetch_add(1, Ordering::Relaxed);
            return Err(NormalizeError::Truncated(data.len()));
        }

        let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
        let mut offset = ETHERNET_HEADER_LEN;
        let mut vlan = None;

        if ethertype == ETHERTYPE_VLAN {
            if data.len() < ETHERNET_HEADER_LEN + 4 {
                self.stats.truncated.fetch_add(1, Ordering::Relaxed);
                return Err(NormalizeError::Truncated(data.len()));
            }
            vlan = Some(u16::from_be_bytes([data[14], data[15]]) & 0x0fff);
            ethertype = u16::from_be_bytes([data[16], data[17]]);
            offset += 4;
        }

        if ethertype != ETHERTYPE_ARP {
            self.stats.non_arp.fetch_add(1, Ordering::Relaxed);
            return Err(NormalizeError::NotArp(ethertype));
        }

        let arp = ArpPacket::parse(&data[offset..]).ok_or_else(|| {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            NormalizeError::Malformed
        })?;

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        let gratuitous = arp.is_gratuitous();
        trace!(
            interface = %frame.interface,
            op = %arp.operation,
            sender = %arp.sender_ip,
            "normalized arp frame"
        );

        Ok(ArpEvent {
            operation: arp.operation,
            sender_mac: arp.sender_mac,
            sender_ip: arp.sender_ip,
            target_mac: arp.target_mac,
            target_ip: arp.target_ip,
            interface: frame.interface.clone(),
            vlan,
            timestamp: frame.timestamp,
            gratuitous,
        })
    }

    pub fn stats(&self) -> &NormalizerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arp_reply_bytes(sender_mac: [u8; 6], sender_ip: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0xff; 6]); // dst
        frame.extend_from_slice(&sender_mac); // src
        frame.extend_from_slice(&0x0806u16.to_be_bytes()); // ethertype
        frame.extend_from_slice(&1u16.to_be_bytes()); // hw type
        frame.extend_from_slice(&0x0800u16.to_be_bytes()); // proto type
        frame.push(6); // hw len
        frame.push(4); // proto len
        frame.extend_from_slice(&2u16.to_be_bytes()); // op = reply
        frame.extend_from_slice(&sender_mac);
        frame.extend_from_slice(&sender_ip);
        frame.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        frame.extend_from_slice(&[192, 168, 1, 100]);
        frame
    }

    fn make_frame(bytes: Vec<u8>) -> RawFrame {
        RawFrame {
            interface: "eth0".to_string(),
            timestamp: Utc::now(),
            bytes,
        }
    }

    #[test]
    fn test_normalize_reply() {
        let normalizer = FrameNormalizer::new();
        let frame = make_frame(arp_reply_bytes(
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            [192, 168, 1, 1],
        ));

        let event = normalizer.normalize(&frame).unwrap();
        assert_eq!(event.operation, ArpOp::Reply);
        assert_eq!(event.sender_ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(event.sender_mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(event.vlan, None);
        assert!(!event.gratuitous);
    }

    #[test]
    fn test_normalize_vlan_tagged() {
        let normalizer = FrameNormalizer::new();
        let inner = arp_reply_bytes([0xaa; 6], [10, 0, 0, 1]);

        // Splice a 802.1Q tag (vlan 42) between src MAC and ethertype
        let mut frame = inner[..12].to_vec();
        frame.extend_from_slice(&0x8100u16.to_be_bytes());
        frame.extend_from_slice(&42u16.to_be_bytes());
        frame.extend_from_slice(&inner[12..]);

        let event = normalizer.normalize(&make_frame(frame)).unwrap();
        assert_eq!(event.vlan, Some(42));
        assert_eq!(event.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_normalize_rejects_non_arp() {
        let normalizer = FrameNormalizer::new();
        let mut bytes = arp_reply_bytes([0xaa; 6], [10, 0, 0, 1]);
        bytes[12] = 0x08;
        bytes[13] = 0x00; // IPv4

        let err = normalizer.normalize(&make_frame(bytes)).unwrap_err();
        assert_eq!(err, NormalizeError::NotArp(0x0800));
        assert_eq!(normalizer.stats().non_arp.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_normalize_rejects_truncated() {
        let normalizer = FrameNormalizer::new();
        let mut bytes = arp_reply_bytes([0xaa; 6], [10, 0, 0, 1]);
        bytes.truncate(20);

        assert!(matches!(
            normalizer.normalize(&make_frame(bytes)),
            Err(NormalizeError::Malformed)
        ));
    }

    #[test]
    fn test_gratuitous_detection() {
        let mut bytes = arp_reply_bytes([0xaa; 6], [192, 168, 1, 1]);
        // Rewrite target IP to equal sender IP
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&[192, 168, 1, 1]);

        let packet = ArpPacket::parse(&bytes[14..]).unwrap();
        assert!(packet.is_announcement());

        let normalizer = FrameNormalizer::new();
        let event = normalizer.normalize(&make_frame(bytes)).unwrap();
        assert!(event.gratuitous);
    }

    #[test]
    fn test_mac_parse_roundtrip() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_canonical_encoding_stable() {
        let event = ArpEvent {
            operation: ArpOp::Reply,
            sender_mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            sender_ip: Ipv4Addr::new(192, 168, 1, 1),
            target_mac: MacAddr::ZERO,
            target_ip: Ipv4Addr::new(192, 168, 1, 100),
            interface: "eth0".to_string(),
            vlan: None,
            timestamp: Utc::now(),
            gratuitous: false,
        };
        assert_eq!(
            event.canonical_encoding(),
            "op=reply sender=192.168.1.1/aa:bb:cc:dd:ee:ff \
             target=192.168.1.100/00:00:00:00:00:00 gratuitous=0"
        );
    }
}
