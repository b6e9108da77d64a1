//! Per-motor record and axis identifiers.
//!
//! One `MotorInfo` exists per controllable motor. The struct is `#[repr(C)]`
//! and lives inside the published `TelStatShm` record, so it carries only
//! fixed-size numeric fields and its layout is append-only.
//!
//! Ownership contract: only the state machine that owns a motor mutates its
//! entry; readers see whole-record snapshots through the seqlock.

use std::f64::consts::TAU;

/// Index of a motor in the published `minfo` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MotorId {
    /// Hour-angle axis.
    Hour = 0,
    /// Declination axis.
    Dec = 1,
    /// Field rotator.
    Rot = 2,
    /// Focus motor.
    Focus = 3,
    /// Filter wheel motor.
    Filter = 4,
}

impl MotorId {
    /// Array index into `TelStatShm::minfo`.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The three mount axes, in canonical order.
    pub const MOUNT: [MotorId; 3] = [MotorId::Hour, MotorId::Dec, MotorId::Rot];
}

/// Per-motor configuration and live state.
///
/// Positions (`cpos`, `dpos`, `neglim`, `poslim`) are radians from the home
/// switch in the canonical direction; velocities are rad/s. `raw` is the
/// last controller counter reading in whichever space the motor reports
/// (`estep`/`esign` when encoded, `step`/`sign` otherwise).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MotorInfo {
    /// Controller node address.
    pub axis: i32,
    /// Motor steps per revolution.
    pub step: i32,
    /// Encoder counts per revolution (equals `step` when no encoder).
    pub estep: i32,
    /// Motor direction sense, +1 or -1.
    pub sign: i32,
    /// Encoder direction sense, +1 or -1.
    pub esign: i32,

    /// Motor installed.
    pub have: u8,
    /// Position feedback comes from an encoder.
    pub haveenc: u8,
    /// Home switch is sensed through the encoder channel.
    pub enchome: u8,
    /// Limit switches installed.
    pub havelim: u8,
    /// Home switch reads low when on its home side.
    pub homelow: u8,
    /// Home approach ends on the positive side of the switch.
    pub posside: u8,
    /// Home position has been found; `cpos` is meaningful.
    pub ishomed: u8,
    /// A homing sequence is running.
    pub homing: u8,
    /// A limit-discovery sequence is running.
    pub limiting: u8,
    pub _pad: [u8; 3],

    /// Last raw counter reading.
    pub raw: i64,
    /// Current position, rad from home.
    pub cpos: f64,
    /// Desired position, rad from home.
    pub dpos: f64,
    /// Commanded velocity, rad/s (0 when at rest).
    pub cvel: f64,
    /// Maximum velocity, rad/s.
    pub maxvel: f64,
    /// Maximum acceleration, rad/s².
    pub maxacc: f64,
    /// Deceleration used when stopping into a limit, rad/s².
    pub slimacc: f64,
    /// Positive travel limit, rad from home.
    pub poslim: f64,
    /// Negative travel limit, rad from home.
    pub neglim: f64,
    /// Servo damping factor.
    pub df: f64,
    /// Focus optical scale, motor steps per µm of focus travel.
    pub focscale: f64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<MotorInfo>(), 120);
static_assertions::const_assert_eq!(core::mem::align_of::<MotorInfo>(), 8);

impl Default for MotorInfo {
    fn default() -> Self {
        // SAFETY: all fields are numeric primitives or arrays thereof;
        // zero is a valid value for every field.
        unsafe { core::mem::zeroed() }
    }
}

impl MotorInfo {
    #[inline]
    pub fn have(&self) -> bool {
        self.have != 0
    }

    #[inline]
    pub fn haveenc(&self) -> bool {
        self.haveenc != 0
    }

    #[inline]
    pub fn ishomed(&self) -> bool {
        self.ishomed != 0
    }

    /// Counts per radian in the feedback space the controller reports
    /// (signed): `esign·estep/2π` when encoded, else `sign·step/2π`.
    #[inline]
    pub fn counts_per_rad(&self) -> f64 {
        if self.haveenc() {
            f64::from(self.esign) * f64::from(self.estep) / TAU
        } else {
            f64::from(self.sign) * f64::from(self.step) / TAU
        }
    }

    /// Counts per radian in motor space (signed), regardless of encoder.
    #[inline]
    pub fn motor_counts_per_rad(&self) -> f64 {
        f64::from(self.sign) * f64::from(self.step) / TAU
    }

    /// Convert a position in rad to feedback-space counts, rounded.
    #[inline]
    pub fn pos_to_counts(&self, rad: f64) -> i64 {
        (self.counts_per_rad() * rad).round() as i64
    }

    /// Convert a raw feedback-space count to rad from home.
    #[inline]
    pub fn counts_to_pos(&self, counts: f64) -> f64 {
        if self.haveenc() {
            TAU * f64::from(self.esign) * counts / f64::from(self.estep)
        } else {
            TAU * f64::from(self.sign) * counts / f64::from(self.step)
        }
    }

    /// Fold a new raw reading into `raw`/`cpos`.
    ///
    /// An encoder that moved by exactly one count is averaged with the
    /// previous reading so a boundary dither does not alias into a
    /// half-count position jump.
    pub fn update_from_raw(&mut self, raw: i64) {
        let eff = if self.haveenc() && (raw - self.raw).abs() == 1 {
            (raw + self.raw) as f64 / 2.0
        } else {
            raw as f64
        };
        self.raw = raw;
        self.cpos = self.counts_to_pos(eff);
    }

    /// Angular tolerance distinguishing HUNTING from TRACKING.
    ///
    /// A configured value of 0 means 1.5 feedback counts.
    #[inline]
    pub fn track_tolerance(&self, trackacc: f64) -> f64 {
        if trackacc == 0.0 {
            let counts = if self.haveenc() { self.estep } else { self.step };
            1.5 * TAU / f64::from(counts.max(1))
        } else {
            trackacc
        }
    }

    /// True when `cpos` is inside the discovered travel range.
    #[inline]
    pub fn within_limits(&self) -> bool {
        self.cpos > self.neglim && self.cpos < self.poslim
    }

    /// Focus travel in µm to motor rad from home.
    #[inline]
    pub fn focus_um_to_rad(&self, um: f64) -> f64 {
        TAU * um * self.focscale / f64::from(self.step.max(1))
    }

    /// Motor rad from home to focus travel in µm.
    #[inline]
    pub fn focus_rad_to_um(&self, rad: f64) -> f64 {
        if self.focscale == 0.0 {
            return 0.0;
        }
        rad * f64::from(self.step) / (TAU * self.focscale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc_motor() -> MotorInfo {
        MotorInfo {
            have: 1,
            haveenc: 1,
            step: 100_000,
            estep: 200_000,
            sign: 1,
            esign: -1,
            neglim: -2.0,
            poslim: 2.0,
            ..MotorInfo::default()
        }
    }

    #[test]
    fn motor_id_indices() {
        assert_eq!(MotorId::Hour.index(), 0);
        assert_eq!(MotorId::Dec.index(), 1);
        assert_eq!(MotorId::Rot.index(), 2);
        assert_eq!(MotorId::Focus.index(), 3);
        assert_eq!(MotorId::Filter.index(), 4);
    }

    #[test]
    fn counts_roundtrip_encoder_space() {
        let m = enc_motor();
        let counts = m.pos_to_counts(1.0);
        assert_eq!(counts, -(200_000.0 / TAU).round() as i64);
        let back = m.counts_to_pos(counts as f64);
        assert!((back - 1.0).abs() < 1e-4);
    }

    #[test]
    fn update_from_raw_smooths_single_count_dither() {
        let mut m = enc_motor();
        m.update_from_raw(1000);
        let p0 = m.cpos;
        m.update_from_raw(1001);
        // averaged between 1000 and 1001
        let expect = m.counts_to_pos(1000.5);
        assert!((m.cpos - expect).abs() < 1e-12);
        assert!(m.cpos < p0); // esign = -1: larger raw is more negative
        m.update_from_raw(1005);
        assert_eq!(m.raw, 1005);
    }

    #[test]
    fn track_tolerance_zero_means_counts() {
        let m = enc_motor();
        let tol = m.track_tolerance(0.0);
        assert!((tol - 1.5 * TAU / 200_000.0).abs() < 1e-15);
        assert_eq!(m.track_tolerance(0.01), 0.01);
    }

    #[test]
    fn within_limits() {
        let mut m = enc_motor();
        m.cpos = 0.0;
        assert!(m.within_limits());
        m.cpos = 2.5;
        assert!(!m.within_limits());
        m.cpos = -2.5;
        assert!(!m.within_limits());
    }
}
