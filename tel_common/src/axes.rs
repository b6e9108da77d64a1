//! Mount pointing-model parameters.

use std::f64::consts::FRAC_PI_2;

/// Pointing-model parameters relating apparent HA/Dec to axis angles.
///
/// The values are persisted in `home.cfg` across runs, so the sign
/// conventions here are load-bearing: `HT`/`DT` locate the mount pole,
/// `XP`/`YC` are the axis zero-point offsets, `NP` is the axis
/// non-perpendicularity and `R0` the rotator reading at zero parallactic
/// angle.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TelAxes {
    /// German equatorial mount.
    pub germeq: u8,
    /// German equatorial currently flipped over the pier.
    pub germeq_flip: u8,
    /// Fork mount that tracks through the zenith flipped.
    pub zenflip: u8,
    pub _pad: [u8; 5],

    /// Hour angle of the mount pole, rad.
    pub ht: f64,
    /// Declination of the mount pole, rad.
    pub dt: f64,
    /// HA-axis zero-point offset, rad.
    pub xp: f64,
    /// Dec-axis zero-point offset, rad.
    pub yc: f64,
    /// Axis non-perpendicularity, rad.
    pub np: f64,
    /// Rotator zero point, rad.
    pub r0: f64,
    /// HA-axis negative travel limit, rad (mirrored from the hour motor).
    pub hneglim: f64,
    /// HA-axis positive travel limit, rad (mirrored from the hour motor).
    pub hposlim: f64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<TelAxes>(), 72);

impl Default for TelAxes {
    fn default() -> Self {
        // SAFETY: all fields are numeric; all-zeros is valid.
        unsafe { core::mem::zeroed() }
    }
}

impl TelAxes {
    /// Apply the `LARGEXP` fixup for mounts whose HA home switch sits more
    /// than 180 degrees from north.
    pub fn apply_largexp(&mut self) {
        self.ht -= FRAC_PI_2;
        self.xp += FRAC_PI_2;
    }
}
