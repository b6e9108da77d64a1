//! Device state enums published through shared memory.
//!
//! All enums use `#[repr(u8)]` so they can be carried in the binary
//! `TelStatShm` record and re-validated on the reader side with `from_u8`.

use serde::{Deserialize, Serialize};

// ─── Mount ──────────────────────────────────────────────────────────

/// Mount state.
///
/// `Hunting` and `Tracking` differ only in whether every axis has settled
/// within the tracking tolerance; the mount flips between them without
/// operator involvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TelState {
    /// All axes at rest, no objective.
    Stopped = 0,
    /// Moving to a fixed position target.
    Slewing = 1,
    /// Moving toward a tracking target, not yet locked.
    Hunting = 2,
    /// Locked on a tracking target.
    Tracking = 3,
    /// Seeking home switches.
    Homing = 4,
    /// Discovering travel limits.
    Limiting = 5,
}

impl TelState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Stopped),
            1 => Some(Self::Slewing),
            2 => Some(Self::Hunting),
            3 => Some(Self::Tracking),
            4 => Some(Self::Homing),
            5 => Some(Self::Limiting),
            _ => None,
        }
    }

    /// True while the mount is executing a target of any kind.
    #[inline]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }

    /// True while following (or acquiring) a tracking target.
    #[inline]
    pub const fn is_on_track_path(&self) -> bool {
        matches!(self, Self::Hunting | Self::Tracking)
    }
}

impl Default for TelState {
    fn default() -> Self {
        Self::Stopped
    }
}

// ─── Dome ───────────────────────────────────────────────────────────

/// Dome rotation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DomeState {
    /// No dome installed.
    Absent = 0,
    /// Dome at rest.
    Stopped = 1,
    /// Dome rotating to a target azimuth.
    Rotating = 2,
    /// Dome seeking its home switch.
    Homing = 3,
}

impl DomeState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Absent),
            1 => Some(Self::Stopped),
            2 => Some(Self::Rotating),
            3 => Some(Self::Homing),
            _ => None,
        }
    }

    #[inline]
    pub const fn is_moving(&self) -> bool {
        matches!(self, Self::Rotating | Self::Homing)
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl Default for DomeState {
    fn default() -> Self {
        Self::Absent
    }
}

// ─── Shutter / roof ─────────────────────────────────────────────────

/// Shutter (or roll-off roof) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShutterState {
    /// No shutter installed.
    Absent = 0,
    /// Position unknown, at rest.
    Idle = 1,
    /// Opening under way.
    Opening = 2,
    /// Closing under way.
    Closing = 3,
    /// Fully open.
    Open = 4,
    /// Fully closed.
    Closed = 5,
}

impl ShutterState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Absent),
            1 => Some(Self::Idle),
            2 => Some(Self::Opening),
            3 => Some(Self::Closing),
            4 => Some(Self::Open),
            5 => Some(Self::Closed),
            _ => None,
        }
    }

    #[inline]
    pub const fn is_moving(&self) -> bool {
        matches!(self, Self::Opening | Self::Closing)
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl Default for ShutterState {
    fn default() -> Self {
        Self::Absent
    }
}

// ─── Filter wheel ───────────────────────────────────────────────────

/// Filter wheel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FilterState {
    /// No wheel installed.
    Absent = 0,
    /// Wheel at rest on a known filter.
    Idle = 1,
    /// Wheel turning.
    Moving = 2,
}

impl FilterState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Absent),
            1 => Some(Self::Idle),
            2 => Some(Self::Moving),
            _ => None,
        }
    }
}

impl Default for FilterState {
    fn default() -> Self {
        Self::Absent
    }
}

// ─── Mirror cover ───────────────────────────────────────────────────

/// Mirror cover state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CoverState {
    /// No cover installed.
    Absent = 0,
    /// Position unknown, at rest.
    Idle = 1,
    /// Opening under way.
    Opening = 2,
    /// Closing under way.
    Closing = 3,
    /// Fully open.
    Open = 4,
    /// Fully closed.
    Closed = 5,
}

impl CoverState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Absent),
            1 => Some(Self::Idle),
            2 => Some(Self::Opening),
            3 => Some(Self::Closing),
            4 => Some(Self::Open),
            5 => Some(Self::Closed),
            _ => None,
        }
    }
}

impl Default for CoverState {
    fn default() -> Self {
        Self::Absent
    }
}
