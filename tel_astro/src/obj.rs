//! Celestial targets and their circumstances.

use crate::angles::{ha_range, range};
use crate::coords::hadec_aa;
use crate::precess::as_ap;
use crate::refraction::refract;
use crate::time::now_lst;
use std::f64::consts::TAU;
use tel_common::shm::NowShm;
use thiserror::Error;

/// Sentinel epoch value meaning "epoch of date" (apparent place).
pub const EOD_EPOCH: f64 = -9786.0;

/// A fixed celestial target.
///
/// Catalog fields (`f_*`) are set at construction; circumstance fields
/// (`s_*`) are filled in by [`obj_cir`] for a specific `Now`.
#[derive(Debug, Clone, PartialEq)]
pub struct Obj {
    /// Target name.
    pub name: String,
    /// Catalog RA, rad.
    pub f_ra: f64,
    /// Catalog Dec, rad.
    pub f_dec: f64,
    /// Catalog equinox, MJD.
    pub f_epoch: f64,

    /// Computed RA at the requested epoch, rad.
    pub s_ra: f64,
    /// Computed Dec at the requested epoch, rad.
    pub s_dec: f64,
    /// Computed apparent (refracted) altitude, rad.
    pub s_alt: f64,
    /// Computed azimuth, rad E of N.
    pub s_az: f64,
}

impl Obj {
    /// A fixed object at the given catalog place.
    pub fn fixed(name: &str, ra: f64, dec: f64, epoch_mjd: f64) -> Self {
        Self {
            name: name.to_string(),
            f_ra: ra,
            f_dec: dec,
            f_epoch: epoch_mjd,
            s_ra: 0.0,
            s_dec: 0.0,
            s_alt: 0.0,
            s_az: 0.0,
        }
    }
}

/// Compute the circumstances of `op` for the given `Now`, in place.
///
/// Fills `s_ra`/`s_dec` at `now.epoch` (EOD = apparent place at `now.mjd`)
/// and `s_alt`/`s_az` at the site, with refraction applied to the altitude.
pub fn obj_cir(now: &NowShm, op: &mut Obj) {
    let target_epoch = if now.epoch == EOD_EPOCH || now.epoch == 0.0 {
        now.mjd
    } else {
        now.epoch
    };

    let mut ra = op.f_ra;
    let mut dec = op.f_dec;
    as_ap(target_epoch, op.f_epoch, &mut ra, &mut dec);
    op.s_ra = range(ra, TAU);
    op.s_dec = dec;

    // Horizon place always uses the place of date.
    let (mut ra_eod, mut dec_eod) = (op.f_ra, op.f_dec);
    as_ap(now.mjd, op.f_epoch, &mut ra_eod, &mut dec_eod);
    let lst = now_lst(now);
    let ha = ha_range(lst - ra_eod);
    let (alt, az) = hadec_aa(now.lat, ha, dec_eod);
    op.s_alt = refract(now.pressure, now.temp, alt);
    op.s_az = az;
}

/// Error from [`db_crack_line`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DbError {
    #[error("db line has too few fields")]
    TooShort,
    #[error("unsupported object class '{0}'")]
    UnsupportedClass(String),
    #[error("bad number in db line: {0}")]
    BadNumber(String),
}

/// Parse a sexagesimal field like `12:34:56.7` (or plain decimal).
fn parse_sexa(s: &str) -> Result<f64, DbError> {
    let s = s.trim();
    let neg = s.starts_with('-');
    let body = s.trim_start_matches(['-', '+']);
    let mut value = 0.0;
    let mut scale = 1.0;
    for part in body.split(':') {
        let v: f64 = part
            .trim()
            .parse()
            .map_err(|_| DbError::BadNumber(s.to_string()))?;
        value += v / scale;
        scale *= 60.0;
    }
    Ok(if neg { -value } else { value })
}

/// Parse the fixed-object subset of the catalog line format:
/// `Name,f[|subclass],RA(h:m:s),Dec(d:m:s)[,mag[,epoch-year]]`.
///
/// Ephemeris classes (planets, orbital elements) are resolved by the
/// scheduler before they reach this daemon.
pub fn db_crack_line(line: &str) -> Result<Obj, DbError> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    if fields.len() < 4 {
        return Err(DbError::TooShort);
    }

    let class = fields[1].trim();
    if !class.starts_with('f') {
        return Err(DbError::UnsupportedClass(class.to_string()));
    }

    let ra_hours = parse_sexa(fields[2])?;
    let dec_deg = parse_sexa(fields[3])?;

    let epoch_year: f64 = if fields.len() >= 6 {
        fields[5]
            .trim()
            .parse()
            .map_err(|_| DbError::BadNumber(fields[5].to_string()))?
    } else {
        2000.0
    };

    Ok(Obj::fixed(
        fields[0].trim(),
        ra_hours / 24.0 * TAU,
        dec_deg.to_radians(),
        year_to_mjd(epoch_year),
    ))
}

/// Convert a fractional Julian year to MJD.
pub fn year_to_mjd(year: f64) -> f64 {
    crate::time::MJD_J2000 + (year - 2000.0) * 365.25
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MJD_J2000;

    #[test]
    fn fixed_object_circumstances() {
        let mut now = NowShm::default();
        now.mjd = MJD_J2000;
        now.lat = 0.558;
        now.lng = -1.593;
        now.temp = 10.0;
        now.pressure = 1010.0;
        now.epoch = EOD_EPOCH;

        let mut op = Obj::fixed("test", 1.0, 0.3, MJD_J2000);
        obj_cir(&now, &mut op);

        // At the catalog epoch the apparent place equals the catalog place.
        assert!((op.s_ra - 1.0).abs() < 1e-9);
        assert!((op.s_dec - 0.3).abs() < 1e-9);
        assert!(op.s_az >= 0.0 && op.s_az < TAU);
        assert!(op.s_alt.abs() <= std::f64::consts::FRAC_PI_2 + 0.02);
    }

    #[test]
    fn parse_sexa_forms() {
        assert!((parse_sexa("12:30:00").unwrap() - 12.5).abs() < 1e-12);
        assert!((parse_sexa("-0:30").unwrap() + 0.5).abs() < 1e-12);
        assert!((parse_sexa("5.25").unwrap() - 5.25).abs() < 1e-12);
        assert!(parse_sexa("abc").is_err());
    }

    #[test]
    fn db_line_fixed_object() {
        let op = db_crack_line("M 31,f|G,0:42:44.3,41:16:9,3.4,2000").unwrap();
        assert_eq!(op.name, "M 31");
        assert!((op.f_ra - (0.0 + 42.0 / 60.0 + 44.3 / 3600.0) / 24.0 * TAU).abs() < 1e-9);
        assert!((op.f_dec - (41.0_f64 + 16.0 / 60.0 + 9.0 / 3600.0).to_radians()).abs() < 1e-9);
        assert!((op.f_epoch - MJD_J2000).abs() < 1e-9);
    }

    #[test]
    fn db_line_rejects_planets() {
        assert_eq!(
            db_crack_line("Mars,P"),
            Err(DbError::TooShort)
        );
        assert!(matches!(
            db_crack_line("Ceres,e,10,20,30,40"),
            Err(DbError::UnsupportedClass(_))
        ));
    }
}
