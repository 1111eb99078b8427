//! Audio graph factory: per-channel transmit graphs and receive strips.

pub mod inbound;
pub mod outbound;

pub use inbound::{InboundStrip, RadioMode};
pub use outbound::{ClipHandle, TrackControl, build_outbound};
