//! Angle range folding and differences. Radians throughout.

use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Fold `v` into `[0, r)`.
#[inline]
pub fn range(v: f64, r: f64) -> f64 {
    let folded = v % r;
    if folded < 0.0 { folded + r } else { folded }
}

/// Fold an hour angle into `[-pi, pi)`.
#[inline]
pub fn ha_range(ha: f64) -> f64 {
    range(ha + PI, TAU) - PI
}

/// Normalise an (ha, dec) pair so that dec lies within `[-pi/2, pi/2]`,
/// swinging ha through the pole when it does not.
pub fn hd_range(ha: f64, dec: f64) -> (f64, f64) {
    let mut ha = ha;
    let mut dec = range(dec + PI, TAU) - PI; // [-pi, pi)
    if dec > FRAC_PI_2 {
        dec = PI - dec;
        ha += PI;
    } else if dec < -FRAC_PI_2 {
        dec = -PI - dec;
        ha += PI;
    }
    (ha_range(ha), dec)
}

/// Magnitude of the smallest rotation between two angles.
#[inline]
pub fn delra(dra: f64) -> f64 {
    ha_range(dra).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_folds_negatives() {
        assert!((range(-0.5, TAU) - (TAU - 0.5)).abs() < 1e-12);
        assert!((range(TAU + 0.25, TAU) - 0.25).abs() < 1e-12);
        assert_eq!(range(0.0, TAU), 0.0);
    }

    #[test]
    fn ha_range_is_symmetric() {
        assert!((ha_range(PI + 0.1) - (-PI + 0.1)).abs() < 1e-12);
        assert!((ha_range(-PI - 0.1) - (PI - 0.1)).abs() < 1e-12);
        assert_eq!(ha_range(0.0), 0.0);
    }

    #[test]
    fn hd_range_swings_through_pole() {
        let (ha, dec) = hd_range(0.0, FRAC_PI_2 + 0.1);
        assert!((dec - (FRAC_PI_2 - 0.1)).abs() < 1e-12);
        assert!((ha.abs() - PI).abs() < 1e-12);

        let (ha, dec) = hd_range(1.0, -FRAC_PI_2 - 0.2);
        assert!((dec - (-FRAC_PI_2 + 0.2)).abs() < 1e-12);
        assert!((ha - (1.0 - PI)).abs() < 1e-12);
    }

    #[test]
    fn delra_wraps() {
        assert!((delra(TAU - 0.01) - 0.01).abs() < 1e-12);
        assert!((delra(0.01) - 0.01).abs() < 1e-12);
        assert!((delra(PI) - PI).abs() < 1e-12);
    }
}
