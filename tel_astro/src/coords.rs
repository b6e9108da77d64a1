//! HA/Dec ↔ Alt/Az conversions at a given latitude.
//!
//! Azimuth is east of north; hour angle is positive west of the meridian.
//! The two conversions are the same spherical transform, so they are exact
//! mutual inverses by construction.

use crate::angles::range;
use std::f64::consts::TAU;

/// Equatorial to horizon: `(ha, dec) -> (alt, az)`.
pub fn hadec_aa(lat: f64, ha: f64, dec: f64) -> (f64, f64) {
    transform(lat, ha, dec)
}

/// Horizon to equatorial: `(alt, az) -> (ha, dec)`.
pub fn aa_hadec(lat: f64, alt: f64, az: f64) -> (f64, f64) {
    let (dec, ha) = transform(lat, az, alt);
    (ha, dec)
}

/// The underlying involution. Feeding `(ha, dec)` yields `(alt, az)`;
/// feeding `(az, alt)` yields `(dec, ha)`.
fn transform(lat: f64, a: f64, b: f64) -> (f64, f64) {
    let (slat, clat) = lat.sin_cos();
    let (sa, ca) = a.sin_cos();
    let (sb, cb) = b.sin_cos();

    let out_b = (slat * sb + clat * cb * ca).asin();
    let out_a = (-sa * cb).atan2(clat * sb - slat * cb * ca);
    (out_b, range(out_a, TAU))
}
