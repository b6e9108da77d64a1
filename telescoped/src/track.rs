//! Tracking profile engine.
//!
//! A profile is `PPTRACK` axis-position samples spaced `TRACKINT/PPTRACK`
//! seconds apart, uploaded to each controller against its own clock. The
//! controllers interpolate between samples; the daemon rebuilds the
//! profile when it expires and verifies every cycle that the controller
//! clock has not drifted from the host's.

use crate::cook::{at_target, chk_limits, mk_cook, on_target};
use crate::ctx::Ctx;
use crate::error::DeviceError;
use crate::tel::{limit_code, TelDevice};
use crate::{axisdrv, Respond};
use tel_astro::angles::{ha_range, range};
use tel_astro::coords::aa_hadec;
use tel_astro::obj::{obj_cir, Obj};
use tel_astro::precess::ap_as;
use tel_astro::time::{now_lst, MJD_J2000};
use tel_common::consts::{MAXJITTER, PPTRACK, SPD};
use tel_common::motor::MotorId;
use tel_common::shm::NowShm;
use tel_common::state::TelState;
use tel_hal::{CounterSpace, MotorChannel, Program};
use std::f64::consts::TAU;
use tracing::{debug, info};

/// Compute the axis angles for `op` at the circumstance `now`, applying
/// the device's scheduled offsets.
///
/// Offsets re-target the object: its J2000 place is shifted by
/// `(r_offset, d_offset)` and the result tracked as a fixed object.
pub fn find_axes(
    dev: &TelDevice,
    ctx: &Ctx,
    now: &NowShm,
    op: &mut Obj,
) -> (f64, f64, f64) {
    let mut shifted;
    let op_ref: &mut Obj = if dev.r_offset != 0.0 || dev.d_offset != 0.0 {
        let mut now_j2k = *now;
        now_j2k.epoch = MJD_J2000;
        obj_cir(&now_j2k, op);
        shifted = Obj::fixed(
            &op.name,
            op.s_ra + dev.r_offset,
            op.s_dec + dev.d_offset,
            MJD_J2000,
        );
        &mut shifted
    } else {
        op
    };

    let mut now_eod = *now;
    now_eod.epoch = tel_astro::obj::EOD_EPOCH;
    obj_cir(&now_eod, op_ref);
    let (ha, dec) = aa_hadec(now.lat, op_ref.s_alt, op_ref.s_az);
    crate::cook::hd2xyr(&ctx.stat, &ctx.mesh, ha, dec)
}

/// Build and upload a fresh profile for every installed axis.
fn build_track(
    dev: &mut TelDevice,
    ctx: &mut Ctx,
    now: &NowShm,
    op: &mut Obj,
) -> Result<(), DeviceError> {
    let trackint = dev.trackint;
    let step_ms = (1000.0 * trackint as f64 / PPTRACK as f64 + 0.5) as i64;

    let mut xs = [0.0f64; PPTRACK];
    let mut ys = [0.0f64; PPTRACK];
    let mut rs = [0.0f64; PPTRACK];

    let mjd0 = now.mjd;
    for i in 0..PPTRACK {
        let mut now_i = *now;
        now_i.mjd = mjd0 + i as f64 * trackint as f64 / (PPTRACK as f64 * SPD);
        let (x, y, r) = find_axes(dev, ctx, &now_i, op);
        let (mut x, mut y, mut r) = (x, y, r);
        // Let the limits wrap the samples in; a genuinely unreachable
        // sample is caught by the live check each cycle.
        let _ = chk_limits(&ctx.stat, true, &mut x, &mut y, &mut r);
        xs[i] = x;
        ys[i] = y;
        rs[i] = r;
    }

    for (id, samples) in [
        (MotorId::Hour, &xs),
        (MotorId::Dec, &ys),
        (MotorId::Rot, &rs),
    ] {
        let mip = ctx.stat.minfo[id.index()];
        if !mip.have() {
            continue;
        }
        let space = if mip.haveenc() {
            CounterSpace::Encoder
        } else {
            CounterSpace::Motor
        };
        let scale = mip.counts_per_rad();
        let points: Vec<i64> = samples
            .iter()
            .map(|v| (scale * v).round() as i64)
            .collect();

        if let Some(node) = dev.motor_mut(id) {
            node.run_program(&Program::Track {
                space,
                t0_ms: 0,
                step_ms,
                points,
            })?;
        }
    }

    debug!(step_ms, "tracking profile uploaded");
    Ok(())
}

/// One cycle of the tracking objective.
///
/// On the first call (or after a profile expires) the controller clocks
/// are zeroed and a fresh profile installed. Every cycle re-derives the
/// desired place at the controller's own clock, verifies limits, clock
/// jitter and axis health, and moves between HUNTING and TRACKING.
///
/// `Err(())` means tracking is no longer possible; `Ok(())` keeps going.
pub fn track_obj(
    dev: &mut TelDevice,
    ctx: &mut Ctx,
    first: bool,
    out: &mut dyn Respond,
) -> Result<(), ()> {
    let Some(mut op) = dev.target.clone() else {
        return Err(());
    };
    let now_copy = ctx.stat.now;

    // Upload a new profile if starting or the current one has expired.
    if first || ctx.stat.now.mjd > dev.strack + dev.trackint as f64 / SPD {
        for id in MotorId::MOUNT {
            if !ctx.stat.minfo[id.index()].have() {
                continue;
            }
            if let Some(node) = dev.motor_mut(id) {
                if let Err(e) = node.run_program(&Program::ZeroClock) {
                    out.send(-1, &format!("Error: {e}"));
                    dev.stop_tel(ctx, false);
                    return Err(());
                }
            }
        }

        dev.strack = now_copy.mjd;

        let timeout_ms = dev.trackint * 1000;
        for id in MotorId::MOUNT {
            if !ctx.stat.minfo[id.index()].have() {
                continue;
            }
            if let Some(node) = dev.motor_mut(id) {
                let _ = node.run_program(&Program::SetTimeout { ms: timeout_ms });
            }
        }

        if first {
            for id in MotorId::MOUNT {
                let mip = ctx.stat.minfo[id.index()];
                if !mip.have() {
                    continue;
                }
                if let Err(e) = axisdrv::axis_homed_check(&mip) {
                    out.send(-1, &format!("Error: {e}"));
                    dev.stop_tel(ctx, false);
                    return Err(());
                }
                if let Some(node) = dev.motor_mut(id) {
                    let _ = node.run_program(&Program::TrackingOffset { counts: 0 });
                }
            }
        }

        if let Err(e) = build_track(dev, ctx, &now_copy, &mut op) {
            out.send(-1, &format!("Error: {e}"));
            dev.stop_tel(ctx, false);
            return Err(());
        }
    }

    // Read a representative controller clock so the desired place is
    // computed against controller time, immune to host scheduling jitter.
    let clock_id = if ctx.stat.minfo[MotorId::Hour.index()].have() {
        MotorId::Hour
    } else {
        MotorId::Dec
    };
    let clocknow = match dev.motor_mut(clock_id).map(|n| n.read_clock()) {
        Some(Ok(ms)) => ms,
        _ => {
            // Transport hiccup: try again next poll.
            return Ok(());
        }
    };

    dev.read_raw(ctx);
    mk_cook(&mut ctx.stat, &ctx.mesh);

    if dev.check_axes(ctx, out).is_err() {
        dev.stop_tel(ctx, true);
        return Err(());
    }

    // Desired place at the controller's instant.
    let mut now_ctl = now_copy;
    now_ctl.mjd = dev.strack + clocknow as f64 / (SPD * 1000.0);
    let drift_s = (now_copy.mjd - now_ctl.mjd).abs() * SPD;
    if drift_s > MAXJITTER {
        out.send(
            -5,
            &format!("Motion controller clock drift exceeds {MAXJITTER:.0} sec: {drift_s:.1}"),
        );
        out.send(-5, &format!("clocknow={clocknow}. strack={:.6}", dev.strack));
        dev.stop_tel(ctx, false);
        return Err(());
    }

    let (x, y, r) = find_axes(dev, ctx, &now_ctl, &mut op);
    let (mut x, mut y, mut r) = (x, y, r);
    if let Err(e) = chk_limits(&ctx.stat, true, &mut x, &mut y, &mut r) {
        out.send(limit_code(&e), &e.to_string());
        dev.stop_tel(ctx, false);
        return Err(());
    }

    // Publish the desired frame.
    let stat = &mut ctx.stat;
    stat.dalt = op.s_alt;
    stat.daz = op.s_az;
    let mut ra = op.s_ra;
    let mut dec = op.s_dec;
    stat.dara = ra;
    stat.dadec = dec;
    let lst = now_lst(&now_ctl);
    stat.daha = ha_range(lst - ra);
    ap_as(now_ctl.mjd, MJD_J2000, &mut ra, &mut dec);
    stat.dj2kra = range(ra, TAU);
    stat.dj2kdec = dec;
    stat.minfo[MotorId::Hour.index()].dpos = x;
    stat.minfo[MotorId::Dec.index()].dpos = y;
    stat.minfo[MotorId::Rot.index()].dpos = r;

    // Progress: lock and loss of lock.
    match ctx.stat.telstate() {
        TelState::Hunting => {
            let mut since = dev.at_since_take();
            let locked = at_target(&ctx.stat, dev.trackacc, &mut since, ctx.stat.now.mjd);
            dev.at_since_put(since);
            if locked {
                out.send(3, "All axes have tracking lock");
                out.send(0, "Now tracking");
                ctx.stat.telstate = TelState::Tracking as u8;
                info!("tracking lock acquired");
            }
        }
        TelState::Tracking => {
            if ctx.stat.jogging_ison == 0 {
                if let Err(axis) = on_target(&ctx.stat, dev.trackacc) {
                    out.send(4, &format!("Axis {axis} lost tracking lock"));
                    ctx.stat.telstate = TelState::Hunting as u8;
                    dev.at_since_put(None);
                }
            }
        }
        _ => {}
    }

    dev.target = Some(op);
    Ok(())
}
