//! Atmospheric refraction and its inverse.
//!
//! The forward direction (`refract`) lifts a true altitude to the apparent
//! altitude the telescope must point at; `unrefract` backs the bending out
//! of an apparent altitude. The pair uses the matched Saemundsson/Bennett
//! expressions; a roundtrip closes to a few arcseconds above 5 degrees,
//! inside the tracking tolerance of any axis this daemon drives.

const ARCMIN: f64 = std::f64::consts::TAU / (360.0 * 60.0);

/// Scale factor for non-standard pressure (mB) and temperature (°C).
#[inline]
fn met_scale(pressure: f64, temp: f64) -> f64 {
    if pressure <= 0.0 {
        return 0.0; // vacuum: no refraction
    }
    (pressure / 1010.0) * (283.0 / (273.0 + temp))
}

/// True altitude to apparent altitude, rad.
pub fn refract(pressure: f64, temp: f64, true_alt: f64) -> f64 {
    let h = true_alt.to_degrees().max(-5.0);
    let r = 1.02 / ((h + 10.3 / (h + 5.11)).to_radians().tan()) * ARCMIN;
    true_alt + r * met_scale(pressure, temp)
}

/// Apparent altitude to true altitude, rad.
pub fn unrefract(pressure: f64, temp: f64, app_alt: f64) -> f64 {
    let ha = app_alt.to_degrees().max(-5.0);
    let r = 1.0 / ((ha + 7.31 / (ha + 4.4)).to_radians().tan()) * ARCMIN;
    app_alt - r * met_scale(pressure, temp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizon_refraction_is_about_half_a_degree() {
        let r = refract(1010.0, 10.0, 0.0);
        let arcmin = r.to_degrees() * 60.0;
        assert!((28.0..=36.0).contains(&arcmin), "refraction {arcmin}'");
    }

    #[test]
    fn vacuum_means_no_bending() {
        assert_eq!(refract(0.0, 10.0, 0.5), 0.5);
        assert_eq!(unrefract(0.0, 10.0, 0.5), 0.5);
    }

    #[test]
    fn roundtrip_above_five_degrees() {
        for alt_deg in [5.0, 10.0, 20.0, 45.0, 80.0] {
            let alt = (alt_deg as f64).to_radians();
            let back = unrefract(1010.0, 10.0, refract(1010.0, 10.0, alt));
            let arcsec = (back - alt).abs().to_degrees() * 3600.0;
            assert!(arcsec < 8.0, "alt {alt_deg}: closure {arcsec}\"");
        }
    }

    #[test]
    fn refraction_decreases_with_altitude() {
        let low = refract(1010.0, 10.0, 0.1) - 0.1;
        let high = refract(1010.0, 10.0, 1.0) - 1.0;
        assert!(low > high);
        assert!(high > 0.0);
    }
}
