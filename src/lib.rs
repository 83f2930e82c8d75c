//! arpsentry: passive ARP intrusion detection
//!
//! Watches ARP traffic on one or more interfaces, maintains the
//! authoritative IP↔MAC binding state, and raises prioritized alerts for
//! spoofing, gateway impersonation, and related link-layer MITM activity.
//!
//! # Architecture
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────────────────────┐
//! │ Capture  │──▶│ Normalizer │──▶│ Bindings │ Rate │ Patterns   │
//! └──────────┘   └────────────┘   └──────────────┬───────────────┘
//!                   (fan-out, independent tasks) │
//!                                                ▼
//!                                         ┌────────────┐   ┌────────────┐
//!                                         │ Aggregator │──▶│   Alerts   │
//!                                         └────────────┘   └────────────┘
//! ```
//!
//! Capture feeds a bounded queue; each detector consumes independently so a
//! slow detector never stalls ingestion. Overflow is dropped and counted at
//! the queue boundary, never blocked on.

pub mod aggregator;
pub mod alerts;
pub mod bindings;
pub mod config;
pub mod core;
pub mod engine;
pub mod patterns;
pub mod rate;

pub use crate::config::Config;
pub use crate::core::event::{DetectionEvent, DetectionKind, Severity};
