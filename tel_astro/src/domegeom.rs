//! Dome wall-intercept geometry.
//!
//! Finds where the telescope's optical ray pierces the dome sphere, given
//! the offsets of the mount from the dome centre, so the slit can be
//! positioned for an off-centre mount.
//!
//! Offsets, in the same length unit as the radius:
//! - `offset_north`: RA/Dec intersection south(+) of the dome centre
//! - `offset_east`: RA/Dec intersection east(+) of the dome centre
//! - `offset_height`: RA/Dec intersection above(+) the dome equator
//! - `optical_offset`: Dec/optical intersection from the RA/Dec
//!   intersection, positive west of the mount near the zenith
//! - `radius`: dome radius

use std::f64::consts::{FRAC_PI_2, PI, TAU};
use thiserror::Error;

use crate::angles::range;

/// Invalid dome geometry parameters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GeometryError {
    #[error("dome radius must be larger than 0, got {0}")]
    NonPositiveRadius(f64),
}

/// Calibrated dome geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomeGeometry {
    offset_north: f64,
    offset_east: f64,
    offset_height: f64,
    optical_offset: f64,
    radius: f64,
}

impl DomeGeometry {
    pub fn new(
        offset_north: f64,
        offset_east: f64,
        offset_height: f64,
        optical_offset: f64,
        radius: f64,
    ) -> Result<Self, GeometryError> {
        if radius <= 0.0 {
            return Err(GeometryError::NonPositiveRadius(radius));
        }
        Ok(Self {
            offset_north,
            offset_east,
            offset_height,
            optical_offset,
            radius,
        })
    }

    /// Dome radius.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Point where the optical ray meets the dome sphere, in the dome
    /// frame. All inputs radians.
    pub fn wall_point(&self, ha: f64, dec: f64, lat: f64) -> [f64; 3] {
        let a = -self.offset_north + self.optical_offset * (lat - FRAC_PI_2).cos() * (ha - PI).sin();
        let b = self.offset_east + self.optical_offset * (ha - PI).cos();
        let c = self.offset_height - self.optical_offset * (lat - FRAC_PI_2).sin() * (ha - PI).sin();
        let d = (lat - FRAC_PI_2).cos() * dec.cos() * (-ha).cos() + (lat - FRAC_PI_2).sin() * dec.sin();
        let e = dec.cos() * (-ha).sin();
        let f = -(lat - FRAC_PI_2).sin() * dec.cos() * (-ha).cos() + (lat - FRAC_PI_2).cos() * dec.sin();

        let ray_dot = a * d + b * e + c * f;
        let ray_len2 = d * d + e * e + f * f;
        let k = (-ray_dot
            + (ray_dot * ray_dot
                + ray_len2 * (self.radius * self.radius - a * a - b * b - c * c))
                .sqrt())
            / ray_len2;

        [a + d * k, b + e * k, c + f * k]
    }

    /// Dome-wall Alt/Az for a telescope pointing, radians.
    ///
    /// `alt` in `[-pi/2, pi/2]`, `az` in `[0, 2pi)` east of north.
    pub fn alt_az(&self, ha: f64, dec: f64, lat: f64) -> (f64, f64) {
        let p = self.wall_point(ha, dec, lat);
        let alt = (p[2] / self.radius).clamp(-1.0, 1.0).asin();
        let az = range(-p[1].atan2(p[0]) + PI, TAU);
        (alt, az)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_geometry() -> DomeGeometry {
        DomeGeometry::new(2.0, -4.0, 3.0, 0.0, 16.5).unwrap()
    }

    #[test]
    fn rejects_non_positive_radius() {
        assert_eq!(
            DomeGeometry::new(0.0, 0.0, 0.0, 0.0, 0.0),
            Err(GeometryError::NonPositiveRadius(0.0))
        );
        assert!(DomeGeometry::new(0.0, 0.0, 0.0, 0.0, -1.0).is_err());
    }

    #[test]
    fn wall_point_lies_on_sphere() {
        let g = reference_geometry();
        let lat = 30f64.to_radians();
        let p = g.wall_point(0.0, 30f64.to_radians(), lat);
        let r2 = p[0] * p[0] + p[1] * p[1] + p[2] * p[2];
        assert!((r2 - 16.5 * 16.5).abs() < 1e-9);
    }

    #[test]
    fn alt_az_consistent_with_wall_point() {
        let g = reference_geometry();
        let lat = 30f64.to_radians();
        let (alt, az) = g.alt_az(0.0, 30f64.to_radians(), lat);
        let p = g.wall_point(0.0, 30f64.to_radians(), lat);
        assert!(alt.is_finite() && az.is_finite());
        assert!((p[2] / g.radius() - alt.sin()).abs() < 1e-12);
        assert!((-FRAC_PI_2..=FRAC_PI_2).contains(&alt));
        assert!((0.0..TAU).contains(&az));
    }

    #[test]
    fn sphere_invariant_over_the_sky() {
        let g = reference_geometry();
        let lat = 30f64.to_radians();
        let r2 = g.radius() * g.radius();
        for ha_deg in (-90..90).step_by(15) {
            for dec_deg in (-85..85).step_by(15) {
                let p = g.wall_point(
                    (ha_deg as f64).to_radians(),
                    (dec_deg as f64).to_radians(),
                    lat,
                );
                let got = p[0] * p[0] + p[1] * p[1] + p[2] * p[2];
                assert!(
                    (got - r2).abs() < 1e-8,
                    "off-sphere at ha={ha_deg} dec={dec_deg}"
                );
            }
        }
    }

    #[test]
    fn centred_mount_tracks_telescope_azimuth() {
        // With zero offsets the dome azimuth must equal the telescope's.
        let g = DomeGeometry::new(0.0, 0.0, 0.0, 0.0, 10.0).unwrap();
        let lat = 0.6;
        let (tel_alt, tel_az) = crate::coords::hadec_aa(lat, 0.4, 0.2);
        let (alt, az) = g.alt_az(0.4, 0.2, lat);
        assert!((alt - tel_alt).abs() < 1e-9);
        assert!(crate::angles::delra(az - tel_az) < 1e-9);
    }
}
