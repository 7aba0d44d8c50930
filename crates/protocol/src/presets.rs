//! Initial stream parameter selection.
//!
//! A client declares (or the transport infers) a coarse connection class and
//! a device class; the cross product indexes a preset of starting fps,
//! quality, and keyframe cadence. Client-supplied values override the preset
//! and everything is clamped afterwards, so a preset is a starting point,
//! never a bound.

use serde::{Deserialize, Serialize};

/// Coarse link-quality descriptor reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    Slow,
    #[default]
    Medium,
    Fast,
}

/// Rough form factor of the viewing client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Tablet,
    Mobile,
    Tv,
}

/// Starting parameters for a stream before client overrides and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPreset {
    pub fps: u32,
    pub quality: u32,
    /// Every Nth frame is flagged as a keyframe.
    pub keyframe_interval: u32,
}

impl StreamPreset {
    /// Look up the preset for a connection/device combination. Total over
    /// both enums — every combination has an answer.
    pub fn for_client(connection: ConnectionClass, device: DeviceClass) -> Self {
        use ConnectionClass::*;
        use DeviceClass::*;

        let keyframe_interval = match connection {
            Slow => 15,
            Medium => 10,
            Fast => 8,
        };

        let (fps, quality) = match (connection, device) {
            (Fast, Desktop) => (30, 80),
            (Fast, Tablet) => (30, 75),
            (Fast, Mobile) => (25, 70),
            (Fast, Tv) => (30, 85),
            (Medium, Desktop) => (24, 70),
            (Medium, Tablet) => (20, 65),
            (Medium, Mobile) => (20, 60),
            (Medium, Tv) => (24, 75),
            (Slow, Desktop) => (15, 50),
            (Slow, Tablet) => (12, 45),
            (Slow, Mobile) => (10, 40),
            (Slow, Tv) => (15, 55),
        };

        Self {
            fps,
            quality,
            keyframe_interval,
        }
    }
}
