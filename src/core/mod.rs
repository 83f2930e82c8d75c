//! Shared data model
//!
//! Wire-level ARP types, the normalized event the detectors consume, and
//! the detection/assessment records they produce.

pub mod arp;
pub mod event;

pub use self::arp::{
    ArpEvent, ArpOp, ArpPacket, FrameNormalizer, MacAddr, NormalizeError, RawFrame,
};
pub use self::event::{DetectionEvent, DetectionKind, IncidentKey, Severity, ThreatAssessment};
