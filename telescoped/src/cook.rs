//! Conversions between the astronomical frame and axis coordinates, and
//! the target-tolerance predicates.
//!
//! `hd2xyr` and `mk_cook` are mutual inverses up to the mesh correction
//! and refraction pair: a pointing cooked from the encoders and fed back
//! through `hd2xyr` lands on the same axis angles.

use crate::error::DeviceError;
use tel_astro::angles::{hd_range, range};
use tel_astro::coords::{aa_hadec, hadec_aa};
use tel_astro::mount::{
    tel_hadec2pa, tel_hadec2xy, tel_ideal2realxy, tel_realxy2ideal, tel_xy2hadec, MeshMap,
};
use tel_astro::precess::ap_as;
use tel_astro::refraction::unrefract;
use tel_astro::time::{now_lst, MJD_J2000};
use tel_common::consts::SPD;
use tel_common::motor::MotorId;
use tel_common::shm::TelStatShm;
use std::f64::consts::TAU;

/// Apparent HA/Dec to axis angles `(x, y, r)`, applying the mesh
/// correction and the non-ideal axis terms. The rotator angle is the
/// parallactic angle plus the rotator zero when a rotator is installed.
pub fn hd2xyr(stat: &TelStatShm, mesh: &MeshMap, ha: f64, dec: f64) -> (f64, f64, f64) {
    let tax = &stat.tax;
    let (mdha, mddec) = mesh.correction(ha, dec);
    let (ha, dec) = hd_range(ha + mdha, dec + mddec);
    let (x, y) = tel_hadec2xy(ha, dec, tax);
    let (x, y) = tel_ideal2realxy(tax, x, y);

    let rmot = &stat.minfo[MotorId::Rot.index()];
    let r = if rmot.have() {
        tel_hadec2pa(ha, dec, tax, stat.now.lat) + tax.r0 * f64::from(rmot.sign)
    } else {
        0.0
    };
    (x, y, r)
}

/// From the raw axis positions compute every published coordinate set:
/// the inverse of [`hd2xyr`], then refraction backed out and all frames
/// derived.
pub fn mk_cook(stat: &mut TelStatShm, mesh: &MeshMap) {
    let x = stat.minfo[MotorId::Hour.index()].cpos;
    let y = stat.minfo[MotorId::Dec.index()].cpos;

    // Back out non-ideal axes, then the pointing model.
    let (x, y) = tel_realxy2ideal(&stat.tax, x, y);
    let (ha, dec) = tel_xy2hadec(x, y, &stat.tax);

    // Back out the mesh correction.
    let (mdha, mddec) = mesh.correction(ha, dec);
    stat.mdha = mdha;
    stat.mddec = mddec;
    let (ha, dec) = hd_range(ha - mdha, dec - mddec);

    // Horizon place (apparent; the axes point at the refracted sky).
    let (alt, az) = hadec_aa(stat.now.lat, ha, dec);
    stat.calt = alt;
    stat.caz = az;

    // Apparent equatorial place with refraction backed out.
    let true_alt = unrefract(stat.now.pressure, stat.now.temp, alt);
    let (ha, dec) = aa_hadec(stat.now.lat, true_alt, az);
    let lst = now_lst(&stat.now);
    let mut ra = range(lst - ha, TAU);
    stat.cara = ra;
    stat.caha = ha;
    stat.cadec = dec;

    // J2000 astrometric place.
    let mut dec_j2k = dec;
    ap_as(stat.now.mjd, MJD_J2000, &mut ra, &mut dec_j2k);
    stat.cj2kra = ra;
    stat.cj2kdec = dec_j2k;

    // Position angle.
    stat.cpa = tel_hadec2pa(ha, dec, &stat.tax, stat.now.lat);
}

/// Check each mount-axis value against its travel limits, wrapping whole
/// revolutions in when allowed. The values are updated in place.
pub fn chk_limits(
    stat: &TelStatShm,
    wrapok: bool,
    x: &mut f64,
    y: &mut f64,
    r: &mut f64,
) -> Result<(), DeviceError> {
    let vals: [&mut f64; 3] = [x, y, r];
    for (id, v) in MotorId::MOUNT.iter().zip(vals) {
        let mip = &stat.minfo[id.index()];
        if !mip.have() {
            continue;
        }

        while *v <= mip.neglim {
            if !wrapok {
                return Err(DeviceError::LimitViolation {
                    axis: mip.axis,
                    value: *v,
                    which: "negative",
                });
            }
            *v += TAU;
        }
        while *v >= mip.poslim {
            if !wrapok {
                return Err(DeviceError::LimitViolation {
                    axis: mip.axis,
                    value: *v,
                    which: "positive",
                });
            }
            *v -= TAU;
        }
        if *v <= mip.neglim || *v >= mip.poslim {
            return Err(DeviceError::LimitViolation {
                axis: mip.axis,
                value: *v,
                which: "limit-gap",
            });
        }
    }
    Ok(())
}

/// Debounced target test used while acquiring: all installed axes inside
/// tolerance, and they have stayed there for at least one second.
pub fn at_target(
    stat: &TelStatShm,
    trackacc: f64,
    since_mjd: &mut Option<f64>,
    now_mjd: f64,
) -> bool {
    for id in MotorId::MOUNT {
        let mip = &stat.minfo[id.index()];
        if !mip.have() {
            continue;
        }
        let tol = mip.track_tolerance(trackacc);
        if tel_astro::angles::delra(mip.cpos - mip.dpos) > tol {
            *since_mjd = None;
            return false;
        }
    }
    match *since_mjd {
        None => {
            *since_mjd = Some(now_mjd);
            false
        }
        Some(t0) => now_mjd >= t0 + 1.0 / SPD,
    }
}

/// Undebounced target test used while tracking; reports the first axis
/// out of tolerance.
pub fn on_target(stat: &TelStatShm, trackacc: f64) -> Result<(), i32> {
    for id in MotorId::MOUNT {
        let mip = &stat.minfo[id.index()];
        if !mip.have() {
            continue;
        }
        let tol = mip.track_tolerance(trackacc);
        if tel_astro::angles::delra(mip.cpos - mip.dpos) > tol {
            return Err(mip.axis);
        }
    }
    Ok(())
}

/// With no objective, desireds mirror currents so displays read sanely.
pub fn dummy_targ(stat: &mut TelStatShm) {
    for id in MotorId::MOUNT {
        let i = id.index();
        stat.minfo[i].dpos = stat.minfo[i].cpos;
    }
    stat.dj2kra = stat.cj2kra;
    stat.dj2kdec = stat.cj2kdec;
    stat.dara = stat.cara;
    stat.dadec = stat.cadec;
    stat.daha = stat.caha;
    stat.dalt = stat.calt;
    stat.daz = stat.caz;
    stat.dpa = stat.cpa;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;
    use tel_astro::angles::delra;

    fn stat_with_mount() -> TelStatShm {
        let mut stat = TelStatShm::default();
        stat.now.mjd = MJD_J2000 + 5_000.0;
        stat.now.lat = 0.558;
        stat.now.lng = -1.593;
        stat.now.temp = 10.0;
        stat.now.pressure = 1010.0;
        stat.tax.dt = FRAC_PI_2;
        for (i, id) in MotorId::MOUNT.iter().enumerate() {
            let mip = &mut stat.minfo[id.index()];
            mip.axis = i as i32;
            mip.have = u8::from(i < 2); // no rotator
            mip.haveenc = 1;
            mip.step = 1_000_000;
            mip.estep = 1_000_000;
            mip.sign = 1;
            mip.esign = 1;
            mip.neglim = -TAU;
            mip.poslim = TAU;
            mip.ishomed = 1;
        }
        stat
    }

    #[test]
    fn hd2xyr_mkcook_are_mutual_inverses() {
        let mut stat = stat_with_mount();
        let mesh = MeshMap::empty();

        for &(ha, dec) in &[(0.3, 0.5), (-1.0, -0.2), (1.2, 1.0), (0.0, 0.0)] {
            // The target pipeline hands hd2xyr the refracted-sky place, as
            // obj_cir does.
            let (alt, az) = hadec_aa(stat.now.lat, ha, dec);
            let app_alt = tel_astro::refraction::refract(
                stat.now.pressure,
                stat.now.temp,
                alt,
            );
            let (ha_app, dec_app) = aa_hadec(stat.now.lat, app_alt, az);

            let (x, y, _r) = hd2xyr(&stat, &mesh, ha_app, dec_app);
            stat.minfo[MotorId::Hour.index()].cpos = x;
            stat.minfo[MotorId::Dec.index()].cpos = y;
            mk_cook(&mut stat, &mesh);

            // mk_cook backs refraction out again, so the cooked apparent
            // place closes on the true input to a few arcseconds.
            assert!(
                delra(stat.caha - ha) < 1e-4,
                "ha {ha}: cooked {}",
                stat.caha
            );
            assert!((stat.cadec - dec).abs() < 1e-4, "dec {dec}");
        }
    }

    #[test]
    fn rotator_angle_zero_without_rotator() {
        let stat = stat_with_mount();
        let mesh = MeshMap::empty();
        let (_, _, r) = hd2xyr(&stat, &mesh, 0.5, 0.3);
        assert_eq!(r, 0.0);
    }

    #[test]
    fn chk_limits_wraps_into_range() {
        let mut stat = stat_with_mount();
        stat.minfo[MotorId::Hour.index()].neglim = -1.0;
        stat.minfo[MotorId::Hour.index()].poslim = 2.0 + TAU;

        let (mut x, mut y, mut r) = (-1.5, 0.0, 0.0);
        chk_limits(&stat, true, &mut x, &mut y, &mut r).unwrap();
        assert!((x - (-1.5 + TAU)).abs() < 1e-12);

        // Idempotent: wrapping a wrapped value changes nothing.
        let (x1, y1, r1) = (x, y, r);
        chk_limits(&stat, true, &mut x, &mut y, &mut r).unwrap();
        assert_eq!((x, y, r), (x1, y1, r1));
    }

    #[test]
    fn chk_limits_refuses_without_wrap() {
        let mut stat = stat_with_mount();
        stat.minfo[MotorId::Hour.index()].neglim = -1.5708;
        stat.minfo[MotorId::Hour.index()].poslim = 1.5708;
        let (mut x, mut y, mut r) = (2.0, 0.0, 0.0);
        let err = chk_limits(&stat, false, &mut x, &mut y, &mut r).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::LimitViolation {
                which: "positive",
                ..
            }
        ));
    }

    #[test]
    fn chk_limits_detects_gap_trap() {
        let mut stat = stat_with_mount();
        // A range narrower than a revolution traps values that wrap past
        // both ends.
        stat.minfo[MotorId::Hour.index()].neglim = -0.1;
        stat.minfo[MotorId::Hour.index()].poslim = 0.1;
        let (mut x, mut y, mut r) = (3.0, 0.0, 0.0);
        let err = chk_limits(&stat, true, &mut x, &mut y, &mut r).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::LimitViolation {
                which: "limit-gap",
                ..
            }
        ));
    }

    #[test]
    fn at_target_debounces_for_one_second() {
        let mut stat = stat_with_mount();
        for id in MotorId::MOUNT {
            stat.minfo[id.index()].cpos = 1.0;
            stat.minfo[id.index()].dpos = 1.0;
        }
        let mut since = None;
        let t0 = stat.now.mjd;

        // First sight of the target arms the debounce only.
        assert!(!at_target(&stat, 0.001, &mut since, t0));
        // Half a second later: still settling.
        assert!(!at_target(&stat, 0.001, &mut since, t0 + 0.5 / SPD));
        // Past a second: locked.
        assert!(at_target(&stat, 0.001, &mut since, t0 + 1.1 / SPD));

        // Wandering off target disarms.
        stat.minfo[MotorId::Hour.index()].cpos = 1.5;
        assert!(!at_target(&stat, 0.001, &mut since, t0 + 1.2 / SPD));
        assert_eq!(since, None);
    }

    #[test]
    fn on_target_reports_offender() {
        let mut stat = stat_with_mount();
        for id in MotorId::MOUNT {
            stat.minfo[id.index()].cpos = 1.0;
            stat.minfo[id.index()].dpos = 1.0;
        }
        assert_eq!(on_target(&stat, 0.001), Ok(()));
        stat.minfo[MotorId::Dec.index()].cpos = 1.01;
        assert_eq!(on_target(&stat, 0.001), Err(1));
    }

    #[test]
    fn dummy_targ_mirrors_cooked() {
        let mut stat = stat_with_mount();
        stat.calt = 0.7;
        stat.caha = -0.3;
        stat.minfo[MotorId::Hour.index()].cpos = 0.42;
        dummy_targ(&mut stat);
        assert_eq!(stat.dalt, 0.7);
        assert_eq!(stat.daha, -0.3);
        assert_eq!(stat.minfo[MotorId::Hour.index()].dpos, 0.42);
    }
}
