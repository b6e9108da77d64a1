//! Mount dispatch and execution.
//!
//! `TelDevice` owns the three mount axes (hour angle, declination,
//! rotator) and runs exactly one active function at a time: homing, limit
//! discovery, a slew, a tracking objective, a stop drain or a mirror-cover
//! run. Each poll advances the active function by one cooperative step.

use crate::axisdrv::{
    axis_homed_check, axis_limit_check, AxisStep, HomeSeq, LimitSeq, MotionCheck,
};
use crate::cook::{at_target, chk_limits, dummy_targ, hd2xyr, mk_cook, on_target};
use crate::ctx::Ctx;
use crate::error::DeviceError;
use crate::{track, Respond};
use std::f64::consts::TAU;
use tel_astro::angles::range;
use tel_astro::coords::{aa_hadec, hadec_aa};
use tel_astro::mount::tel_hadec2pa;
use tel_astro::obj::{db_crack_line, year_to_mjd, Obj};
use tel_astro::precess::ap_as;
use tel_astro::time::{now_lst, MJD_J2000};
use tel_common::config::{ConfigLoader, HomeCfg, MountCfg};
use tel_common::consts::{COVER_TIMEOUT, SPD, VEL_MAX};
use tel_common::motor::{MotorId, MotorInfo};
use tel_common::state::{CoverState, TelState};
use tel_hal::csi::{CsiNode, CSIMCD_PORT};
use tel_hal::virtual_motor::{VirtualConfig, VirtualMotor};
use tel_hal::{parse_progress, CounterSpace, MotorChannel, MotorNode, Program, ProgressLine};
use tracing::{info, warn};

/// Gateway host for CSI nodes.
const CSI_HOST: &str = "127.0.0.1";

/// The mount's active function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelFunc {
    Home,
    Limits,
    Slew,
    Track,
    Stop,
    Cover,
}

/// The mount state machine.
pub struct TelDevice {
    /// Axis channels, indexed like `MotorId::MOUNT`.
    motors: [Option<MotorNode>; 3],

    active: Option<TelFunc>,

    // Cached from telescoped.cfg.
    pub(crate) trackint: i64,
    pub(crate) trackacc: f64,
    fguidevel: f64,
    cguidevel: f64,

    // Home / limit runs.
    want: [bool; 3],
    home_seqs: [Option<HomeSeq>; 3],
    limit_seqs: [Option<LimitSeq>; 3],

    // Tracking.
    pub(crate) target: Option<Obj>,
    pub(crate) r_offset: f64,
    pub(crate) d_offset: f64,
    pub(crate) strack: f64,
    at_since: Option<f64>,
    motion_checks: [MotionCheck; 3],

    // Mirror cover.
    cover_deadline: f64,
    cover_opening: bool,

    /// Filter the stow command wants selected; the main loop forwards it.
    pub stow_filter_request: Option<char>,
}

impl Default for TelDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TelDevice {
    pub fn new() -> Self {
        Self {
            motors: [None, None, None],
            active: None,
            trackint: 60,
            trackacc: 0.0,
            fguidevel: 0.0,
            cguidevel: 0.0,
            want: [false; 3],
            home_seqs: [None, None, None],
            limit_seqs: [None, None, None],
            target: None,
            r_offset: 0.0,
            d_offset: 0.0,
            strack: 0.0,
            at_since: None,
            motion_checks: [MotionCheck::default(); 3],
            cover_deadline: 0.0,
            cover_opening: false,
            stow_filter_request: None,
        }
    }

    /// Advance virtual controllers (no-op on hardware).
    pub fn service(&mut self, dt: std::time::Duration) {
        for node in self.motors.iter_mut().flatten() {
            node.service(dt);
        }
    }

    /// Test hook: direct access to an axis channel.
    pub fn motor_mut(&mut self, id: MotorId) -> Option<&mut MotorNode> {
        self.motors[mount_slot(id)].as_mut()
    }

    pub(crate) fn at_since_take(&mut self) -> Option<f64> {
        self.at_since.take()
    }

    pub(crate) fn at_since_put(&mut self, v: Option<f64>) {
        self.at_since = v;
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    /// Handle one fifo line; unknown text stops the mount.
    pub fn handle_msg(&mut self, ctx: &mut Ctx, msg: &str, out: &mut dyn Respond) {
        let lower = msg.to_ascii_lowercase();

        if lower.starts_with("reset") {
            self.cmd_reset(ctx, out);
        } else if lower.starts_with("home") {
            self.cmd_home(ctx, true, msg, out);
        } else if lower.starts_with("limits") {
            self.cmd_limits(ctx, true, msg, out);
        } else if lower.starts_with("stow") {
            self.cmd_stow(ctx, out);
        } else if msg.starts_with("OpenCover") {
            self.cmd_cover(ctx, true, true, out);
        } else if msg.starts_with("CloseCover") {
            self.cmd_cover(ctx, true, false, out);
        } else if let Some((ra, dec, ep)) = parse_kv3(msg, "RA:", "Dec:", "Epoch:") {
            self.cmd_radecep(ctx, ra, dec, ep, out);
        } else if let Some((ra, dec)) = parse_kv2(msg, "RA:", "Dec:") {
            self.cmd_radeceod(ctx, ra, dec, out);
        } else if let Some((op, dra, ddec)) = parse_db(msg) {
            self.cmd_track_obj(ctx, op, dra, ddec, out);
        } else if let Some((alt, az)) = parse_kv2(msg, "Alt:", "Az:") {
            self.cmd_altaz(ctx, alt, az, out);
        } else if let Some((ha, dec)) = parse_kv2(msg, "HA:", "Dec:") {
            self.cmd_hadec(ctx, ha, dec, out);
        } else if let Some((dirs, vel)) = parse_jog(msg) {
            self.cmd_jog(ctx, &dirs, vel, out);
        } else if let Some((dha, ddec)) = parse_offset(msg) {
            self.cmd_offset_tracking(ctx, dha, ddec, out);
        } else if lower.starts_with("stop") {
            self.cmd_stop(ctx, true, out);
        } else if lower.starts_with("gettelstate") {
            out.send(0, &format!("{}", ctx.stat.telstate));
        } else if lower.starts_with("getaltaz") {
            out.send(
                0,
                &format!(
                    "alt:{:.8} az:{:.8}",
                    ctx.stat.calt.to_degrees(),
                    ctx.stat.caz.to_degrees()
                ),
            );
        } else if lower.starts_with("getradec") {
            out.send(
                0,
                &format!(
                    "ra:{:.8} dec:{:.8}",
                    ctx.stat.cj2kra.to_degrees() / 15.0,
                    ctx.stat.cj2kdec.to_degrees()
                ),
            );
        } else if lower.starts_with("getmjd") {
            out.send(0, &format!("{:.8}", ctx.stat.now.mjd));
        } else {
            warn!(msg, "unknown Tel command, stopping");
            self.cmd_stop(ctx, true, out);
        }
    }

    /// Idle tick: advance the active function or just refresh positions.
    pub fn poll(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        match self.active {
            Some(TelFunc::Home) => self.cmd_home(ctx, false, "", out),
            Some(TelFunc::Limits) => self.cmd_limits(ctx, false, "", out),
            Some(TelFunc::Slew) => self.step_slew(ctx, out),
            Some(TelFunc::Track) => self.step_track(ctx, out),
            Some(TelFunc::Stop) => self.cmd_stop(ctx, false, out),
            Some(TelFunc::Cover) => self.step_cover(ctx, out),
            None => {
                self.read_raw(ctx);
                mk_cook(&mut ctx.stat, &ctx.mesh);
                dummy_targ(&mut ctx.stat);
            }
        }
    }

    // ─── Reset & configuration ──────────────────────────────────────

    fn cmd_reset(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        for node in self.motors.iter_mut().flatten() {
            node.close();
        }
        self.motors = [None, None, None];

        if let Err(e) = self.init_cfg(ctx) {
            out.send(-1, &format!("Reset failed: {e}"));
            return;
        }
        if let Err(e) = ctx.load_site() {
            out.send(-1, &format!("Reset failed: {e}"));
            return;
        }

        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            let mip = ctx.stat.minfo[id.index()];
            if !mip.have() {
                continue;
            }
            let mut node = make_node(ctx.virtual_mode, &mip);
            match node.open().and_then(|()| {
                node.run_program(&Program::SetupAxis {
                    steps: i64::from(mip.step),
                    sign: mip.sign,
                    max_vel_cps: (mip.maxvel * mip.motor_counts_per_rad()).abs() as i64,
                    max_acc_cps2: (mip.maxacc * mip.motor_counts_per_rad()).abs() as i64,
                    lim_acc_cps2: (mip.slimacc * mip.motor_counts_per_rad()).abs() as i64,
                    homelow: mip.homelow != 0,
                })
            }) {
                Ok(()) => self.motors[slot] = Some(node),
                Err(e) => {
                    out.send(-1, &format!("Axis {}: open failed: {e}", mip.axis));
                    return;
                }
            }
        }

        self.stop_tel(ctx, false);
        self.active = None;
        out.send(0, "Reset complete");
    }

    /// Reread `telescoped.cfg` and `home.cfg`, reinstall every motor
    /// record and the pointing model.
    pub(crate) fn init_cfg(&mut self, ctx: &mut Ctx) -> Result<(), DeviceError> {
        let tdc = MountCfg::load(&ctx.cfg_path("telescoped.cfg"))?;
        tdc.validate()?;
        let hc = HomeCfg::load(&ctx.cfg_path("home.cfg"))?;
        hc.validate()?;

        self.trackint = tdc.trackint;
        self.trackacc = tdc.trackacc;
        self.fguidevel = tdc.fguidevel;
        self.cguidevel = tdc.cguidevel;

        // H axis.
        let mip = &mut ctx.stat.minfo[MotorId::Hour.index()];
        let oldhomed = mip.ishomed;
        *mip = MotorInfo::default();
        mip.ishomed = oldhomed;
        mip.axis = tdc.haxis;
        mip.have = u8::from(tdc.hhave != 0);
        mip.haveenc = 1;
        mip.havelim = 1;
        mip.posside = tdc.hposside as u8;
        mip.homelow = tdc.hhomelow as u8;
        mip.step = hc.hstep;
        mip.sign = hc.hsign;
        mip.estep = tdc.hestep;
        mip.esign = tdc.hesign;
        mip.maxvel = tdc.hmaxvel;
        mip.maxacc = tdc.hmaxacc;
        mip.slimacc = tdc.hslimacc;
        mip.poslim = hc.hposlim;
        mip.neglim = hc.hneglim;

        // D axis.
        let mip = &mut ctx.stat.minfo[MotorId::Dec.index()];
        let oldhomed = mip.ishomed;
        *mip = MotorInfo::default();
        mip.ishomed = oldhomed;
        mip.axis = tdc.daxis;
        mip.have = u8::from(tdc.dhave != 0);
        mip.haveenc = 1;
        mip.havelim = 1;
        mip.posside = tdc.dposside as u8;
        mip.homelow = tdc.dhomelow as u8;
        mip.step = hc.dstep;
        mip.sign = hc.dsign;
        mip.estep = tdc.destep;
        mip.esign = tdc.design;
        mip.maxvel = tdc.dmaxvel;
        mip.maxacc = tdc.dmaxacc;
        mip.slimacc = tdc.dslimacc;
        mip.poslim = hc.dposlim;
        mip.neglim = hc.dneglim;

        // R axis: no encoder; motor counters serve both spaces.
        let mip = &mut ctx.stat.minfo[MotorId::Rot.index()];
        let oldhomed = mip.ishomed;
        *mip = MotorInfo::default();
        mip.ishomed = oldhomed;
        mip.axis = tdc.raxis;
        mip.have = u8::from(tdc.rhave != 0);
        mip.haveenc = 0;
        mip.havelim = u8::from(tdc.rhaslim != 0);
        mip.posside = tdc.rposside as u8;
        mip.homelow = tdc.rhomelow as u8;
        mip.step = tdc.rstep;
        mip.sign = tdc.rsign;
        mip.estep = tdc.rstep;
        mip.esign = tdc.rsign;
        mip.maxvel = tdc.rmaxvel;
        mip.maxacc = tdc.rmaxacc;
        mip.slimacc = tdc.rslimacc;
        mip.poslim = hc.rposlim;
        mip.neglim = hc.rneglim;

        // Pointing model.
        let tax = &mut ctx.stat.tax;
        *tax = tel_common::axes::TelAxes::default();
        tax.germeq = u8::from(tdc.germeq != 0);
        tax.zenflip = u8::from(tdc.zenflip != 0);
        tax.ht = hc.ht;
        tax.dt = hc.dt;
        tax.xp = hc.xp;
        tax.yc = hc.yc;
        tax.np = hc.np;
        tax.r0 = hc.r0;
        if hc.largexp != 0 {
            tax.apply_largexp();
        }
        tax.hneglim = hc.hneglim;
        tax.hposlim = hc.hposlim;

        ctx.stat.dt = 100;
        ctx.load_mesh();
        info!("mount configuration installed");
        Ok(())
    }

    // ─── Homing & limits ────────────────────────────────────────────

    fn cmd_home(&mut self, ctx: &mut Ctx, first: bool, msg: &str, out: &mut dyn Respond) {
        self.read_raw(ctx);
        let now_mjd = ctx.stat.now.mjd;

        if first {
            self.stop_tel(ctx, false);
            self.want = wanted_axes(msg, &ctx.stat);
            self.home_seqs = [None, None, None];

            for id in MotorId::MOUNT {
                let slot = mount_slot(id);
                if !self.want[slot] {
                    continue;
                }
                let mip = &mut ctx.stat.minfo[id.index()];
                let Some(node) = self.motors[slot].as_mut() else {
                    out.send(-1, &format!("Axis {}: no channel", mip.axis));
                    return;
                };
                match HomeSeq::start(mip, node, now_mjd) {
                    Ok(seq) => self.home_seqs[slot] = Some(seq),
                    Err(e) => {
                        out.send(-1, &format!("Axis {}: {e}", mip.axis));
                        self.stop_tel(ctx, true);
                        self.active = None;
                        return;
                    }
                }
            }

            self.active = Some(TelFunc::Home);
            ctx.stat.telstate = TelState::Homing as u8;
        }

        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            if !self.want[slot] {
                continue;
            }
            let (Some(seq), Some(node)) =
                (self.home_seqs[slot].as_mut(), self.motors[slot].as_mut())
            else {
                continue;
            };
            let mip = &mut ctx.stat.minfo[id.index()];
            match seq.tick(mip, node, now_mjd, out) {
                AxisStep::InProgress => {}
                AxisStep::Done => {
                    out.send(1, &format!("Axis {}: home complete", mip.axis));
                    self.want[slot] = false;
                    self.home_seqs[slot] = None;
                }
                AxisStep::Failed(text) => {
                    out.send(-1, &text);
                    self.stop_tel(ctx, true);
                    self.active = None;
                    return;
                }
            }
        }

        if !self.want.iter().any(|w| *w) {
            ctx.stat.telstate = TelState::Stopped as u8;
            self.active = None;
            out.send(0, "Scope homing complete");
        }
    }

    fn cmd_limits(&mut self, ctx: &mut Ctx, first: bool, msg: &str, out: &mut dyn Respond) {
        self.read_raw(ctx);
        mk_cook(&mut ctx.stat, &ctx.mesh);
        let now_mjd = ctx.stat.now.mjd;

        if first {
            self.stop_tel(ctx, false);
            self.want = wanted_axes(msg, &ctx.stat);
            self.limit_seqs = [None, None, None];

            for id in MotorId::MOUNT {
                let slot = mount_slot(id);
                if !self.want[slot] {
                    continue;
                }
                let mip = &mut ctx.stat.minfo[id.index()];
                let Some(node) = self.motors[slot].as_mut() else {
                    out.send(-1, &format!("Axis {}: no channel", mip.axis));
                    return;
                };
                match LimitSeq::start(mip, node, now_mjd) {
                    Ok(seq) => self.limit_seqs[slot] = Some(seq),
                    Err(e) => {
                        out.send(-1, &format!("Axis {}: {e}", mip.axis));
                        self.stop_tel(ctx, true);
                        self.active = None;
                        return;
                    }
                }
            }

            self.active = Some(TelFunc::Limits);
            ctx.stat.telstate = TelState::Limiting as u8;
        }

        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            if !self.want[slot] {
                continue;
            }
            let (Some(seq), Some(node)) =
                (self.limit_seqs[slot].as_mut(), self.motors[slot].as_mut())
            else {
                continue;
            };
            let mip = &mut ctx.stat.minfo[id.index()];
            match seq.tick(mip, node, now_mjd, out) {
                AxisStep::InProgress => {}
                AxisStep::Done => {
                    out.send(2, &format!("Axis {}: limits complete", mip.axis));
                    mip.cvel = 0.0;
                    self.want[slot] = false;
                    self.limit_seqs[slot] = None;
                }
                AxisStep::Failed(text) => {
                    out.send(-1, &text);
                    self.stop_tel(ctx, true);
                    self.active = None;
                    return;
                }
            }
        }

        if !self.want.iter().any(|w| *w) {
            self.stop_tel(ctx, false);
            if let Err(e) = self.persist_limits(ctx) {
                out.send(-1, &format!("Saving limits failed: {e}"));
                self.active = None;
                return;
            }
            if let Err(e) = self.init_cfg(ctx) {
                out.send(-1, &format!("Rereading limits failed: {e}"));
                self.active = None;
                return;
            }
            // Limit discovery passes through home on every axis.
            for id in MotorId::MOUNT {
                if ctx.stat.minfo[id.index()].have() {
                    ctx.stat.minfo[id.index()].ishomed = 1;
                }
            }
            ctx.stat.tax.hneglim = ctx.stat.minfo[MotorId::Hour.index()].neglim;
            ctx.stat.tax.hposlim = ctx.stat.minfo[MotorId::Hour.index()].poslim;
            self.active = None;
            out.send(0, "All Scope limits are complete.");
        }
    }

    /// Write the freshly discovered limits back to `home.cfg`.
    fn persist_limits(&self, ctx: &Ctx) -> Result<(), DeviceError> {
        let path = ctx.cfg_path("home.cfg");
        let mut hc = HomeCfg::load(&path)?;
        let h = &ctx.stat.minfo[MotorId::Hour.index()];
        let d = &ctx.stat.minfo[MotorId::Dec.index()];
        let r = &ctx.stat.minfo[MotorId::Rot.index()];
        if h.have() {
            hc.hneglim = h.neglim;
            hc.hposlim = h.poslim;
        }
        if d.have() {
            hc.dneglim = d.neglim;
            hc.dposlim = d.poslim;
        }
        if r.have() {
            hc.rneglim = r.neglim;
            hc.rposlim = r.poslim;
        }
        hc.save(&path)?;
        Ok(())
    }

    // ─── Stow ───────────────────────────────────────────────────────

    fn cmd_stow(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        out.send(1, "Telescope stow underway");
        let alt = ctx.stowalt;
        let az = ctx.stowaz;
        if let Some(filter) = ctx.stowfilter.chars().next() {
            self.stow_filter_request = Some(filter);
        }
        self.cmd_altaz(ctx, alt, az, out);
    }

    // ─── Tracking targets ───────────────────────────────────────────

    fn cmd_radecep(&mut self, ctx: &mut Ctx, ra: f64, dec: f64, ep: f64, out: &mut dyn Respond) {
        let op = Obj::fixed("<Anon>", ra, dec, year_to_mjd(ep));
        self.start_track(ctx, op, 0.0, 0.0, out);
    }

    fn cmd_radeceod(&mut self, ctx: &mut Ctx, ra: f64, dec: f64, out: &mut dyn Respond) {
        // An apparent place: shift it to J2000 and track the fixed object.
        let (mut ra, mut dec) = (ra, dec);
        ap_as(ctx.stat.now.mjd, MJD_J2000, &mut ra, &mut dec);
        let op = Obj::fixed("<Anon>", ra, dec, MJD_J2000);
        self.start_track(ctx, op, 0.0, 0.0, out);
    }

    fn cmd_track_obj(&mut self, ctx: &mut Ctx, op: Obj, dra: f64, ddec: f64, out: &mut dyn Respond) {
        self.start_track(ctx, op, dra, ddec, out);
    }

    fn start_track(&mut self, ctx: &mut Ctx, op: Obj, dra: f64, ddec: f64, out: &mut dyn Respond) {
        info!(name = %op.name, "new tracking target");
        self.target = Some(op);
        self.r_offset = dra;
        self.d_offset = ddec;
        self.active = Some(TelFunc::Track);
        self.at_since = None;
        ctx.stat.telstate = TelState::Hunting as u8;
        ctx.stat.paddle_active = 0;
        ctx.stat.tracking_offset_applied = 0;
        ctx.stat.refresh_jogging_flag();

        if track::track_obj(self, ctx, true, out).is_err() {
            self.active = None;
        }
    }

    fn step_track(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if track::track_obj(self, ctx, false, out).is_err() {
            self.active = None;
        }
    }

    // ─── Positional targets ─────────────────────────────────────────

    fn cmd_altaz(&mut self, ctx: &mut Ctx, alt: f64, az: f64, out: &mut dyn Respond) {
        let (ha, dec) = aa_hadec(ctx.stat.now.lat, alt, az);
        self.slew_to(ctx, ha, dec, out);
    }

    fn cmd_hadec(&mut self, ctx: &mut Ctx, ha: f64, dec: f64, out: &mut dyn Respond) {
        self.slew_to(ctx, ha, dec, out);
    }

    fn slew_to(&mut self, ctx: &mut Ctx, ha: f64, dec: f64, out: &mut dyn Respond) {
        ctx.stat.paddle_active = 0;
        ctx.stat.tracking_offset_applied = 0;
        ctx.stat.refresh_jogging_flag();
        self.r_offset = 0.0;
        self.d_offset = 0.0;
        self.target = None;

        let (mut x, mut y, mut r) = hd2xyr(&ctx.stat, &ctx.mesh, ha, dec);
        if let Err(e) = chk_limits(&ctx.stat, true, &mut x, &mut y, &mut r) {
            out.send(limit_code(&e), &e.to_string());
            self.active = None;
            return;
        }

        for id in MotorId::MOUNT {
            let mip = &ctx.stat.minfo[id.index()];
            if mip.have() {
                if let Err(e) = axis_homed_check(mip) {
                    self.active = None;
                    self.stop_tel(ctx, false);
                    out.send(-1, &format!("Error: {e}"));
                    return;
                }
            }
        }

        ctx.stat.telstate = TelState::Slewing as u8;
        self.active = Some(TelFunc::Slew);
        self.at_since = None;

        ctx.stat.minfo[MotorId::Hour.index()].dpos = x;
        ctx.stat.minfo[MotorId::Dec.index()].dpos = y;
        ctx.stat.minfo[MotorId::Rot.index()].dpos = r;
        self.set_desired_from_hadec(ctx, ha, dec);

        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            let mip = &mut ctx.stat.minfo[id.index()];
            if !mip.have() {
                continue;
            }
            let Some(node) = self.motors[slot].as_mut() else {
                continue;
            };
            let space = if mip.haveenc() {
                CounterSpace::Encoder
            } else {
                CounterSpace::Motor
            };
            let counts = mip.pos_to_counts(mip.dpos);
            if let Err(e) = node.set_pos(space, counts) {
                out.send(-1, &format!("Axis {}: {e}", mip.axis));
                self.stop_tel(ctx, true);
                self.active = None;
                return;
            }
            mip.cvel = mip.maxvel; // nominal; cooked each poll
        }
    }

    fn step_slew(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        self.read_raw(ctx);
        mk_cook(&mut ctx.stat, &ctx.mesh);

        if self.check_axes(ctx, out).is_err() {
            self.stop_tel(ctx, true);
            self.active = None;
            return;
        }

        if at_target(&ctx.stat, self.trackacc, &mut self.at_since, ctx.stat.now.mjd) {
            self.stop_tel(ctx, false);
            out.send(0, "Slew complete");
            self.active = None;
        }
    }

    /// Publish the desired-frame coordinate set for a fixed pointing.
    fn set_desired_from_hadec(&self, ctx: &mut Ctx, ha: f64, dec: f64) {
        let stat = &mut ctx.stat;
        let (alt, az) = hadec_aa(stat.now.lat, ha, dec);
        stat.dalt = alt;
        stat.daz = az;
        stat.daha = ha;
        stat.dadec = dec;
        stat.dpa = tel_hadec2pa(ha, dec, &stat.tax, stat.now.lat);
        let lst = now_lst(&stat.now);
        let mut ra = range(lst - ha, TAU);
        stat.dara = ra;
        let mut dec_j2k = dec;
        ap_as(stat.now.mjd, MJD_J2000, &mut ra, &mut dec_j2k);
        stat.dj2kra = ra;
        stat.dj2kdec = dec_j2k;
    }

    // ─── Stop ───────────────────────────────────────────────────────

    pub fn cmd_stop(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        if first {
            self.stop_tel(ctx, false);
            self.active = Some(TelFunc::Stop);
        }

        // Wait until every axis reports zero velocity.
        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            if !ctx.stat.minfo[id.index()].have() {
                continue;
            }
            if let Some(node) = self.motors[slot].as_mut() {
                match node.read_vel() {
                    Ok(0) => {}
                    Ok(_) => return,
                    Err(_) => return, // retry next poll
                }
            }
        }

        ctx.stat.telstate = TelState::Stopped as u8;
        self.active = None;
        out.send(0, "Stop complete");
        self.read_raw(ctx);
    }

    /// Issue stops to every axis and clear motion bookkeeping.
    pub(crate) fn stop_tel(&mut self, ctx: &mut Ctx, fast: bool) {
        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            let mip = &mut ctx.stat.minfo[id.index()];
            if !mip.have() {
                continue;
            }
            if let Some(node) = self.motors[slot].as_mut() {
                if fast {
                    let _ = node.interrupt();
                }
                let _ = node.interrupt();
                let _ = node.set_vel(0);
            }
            mip.cvel = 0.0;
            mip.limiting = 0;
            mip.homing = 0;
            self.motion_checks[slot].reset();
        }

        self.target = None;
        self.at_since = None;
        ctx.stat.paddle_active = 0;
        ctx.stat.tracking_offset_applied = 0;
        ctx.stat.refresh_jogging_flag();
        ctx.stat.telstate = TelState::Stopped as u8; // well, soon anyway
    }

    // ─── Jogging ────────────────────────────────────────────────────

    fn cmd_jog(&mut self, ctx: &mut Ctx, dirs: &str, velocity: i32, out: &mut dyn Respond) {
        let Some(dircode) = dirs.chars().next() else {
            return;
        };
        if ctx.stat.telstate() == TelState::Tracking {
            self.jog_track(ctx, dircode, out);
        } else {
            self.jog_slew(ctx, dircode, velocity, out);
        }
    }

    fn jog_track(&mut self, ctx: &mut Ctx, dircode: char, out: &mut dyn Respond) {
        let (id, gvel) = match dircode {
            'N' => (MotorId::Dec, self.cguidevel),
            'n' => (MotorId::Dec, self.fguidevel),
            'S' => (MotorId::Dec, -self.cguidevel),
            's' => (MotorId::Dec, -self.fguidevel),
            'E' => (MotorId::Hour, self.cguidevel),
            'e' => (MotorId::Hour, self.fguidevel),
            'W' => (MotorId::Hour, -self.cguidevel),
            'w' => (MotorId::Hour, -self.fguidevel),
            '0' => {
                // Hold here: kill the offset loops on both axes.
                for id in [MotorId::Hour, MotorId::Dec] {
                    if let Some(node) = self.motors[mount_slot(id)].as_mut() {
                        let _ = node.interrupt();
                    }
                }
                ctx.stat.paddle_active = 0;
                ctx.stat.refresh_jogging_flag();
                out.send(0, "Guide stop");
                return;
            }
            other => {
                warn!("bogus jog direction code '{other}'");
                return;
            }
        };

        let mip = &ctx.stat.minfo[id.index()];
        if !mip.have() {
            warn!("no axis to move {dircode}");
            return;
        }
        let stpv = (gvel * mip.counts_per_rad()).round() as i64;
        if let Some(node) = self.motors[mount_slot(id)].as_mut() {
            let _ = node.run_program(&Program::TrackingOffsetRate { counts_per_s: stpv });
        }
        ctx.stat.paddle_active = 1;
        ctx.stat.refresh_jogging_flag();
        out.send(5, &format!("Guide {dircode}"));
    }

    fn jog_slew(&mut self, ctx: &mut Ctx, dircode: char, velocity: i32, out: &mut dyn Respond) {
        if !(0..=VEL_MAX).contains(&velocity) {
            return;
        }
        let vel_pct = velocity * 100 / VEL_MAX;
        ctx.stat.jdha = 0.0;
        ctx.stat.jddec = 0.0;

        let (id, cvel, desc) = match dircode {
            'N' => (
                MotorId::Dec,
                ctx.stat.minfo[MotorId::Dec.index()].maxvel * f64::from(velocity)
                    / f64::from(VEL_MAX),
                format!("up, velocity = {vel_pct}%"),
            ),
            'n' => (MotorId::Dec, self.cguidevel, "up, slow".to_string()),
            'S' => (
                MotorId::Dec,
                -ctx.stat.minfo[MotorId::Dec.index()].maxvel * f64::from(velocity)
                    / f64::from(VEL_MAX),
                format!("down, velocity = {vel_pct}%"),
            ),
            's' => (MotorId::Dec, -self.cguidevel, "down, slow".to_string()),
            'E' => (
                MotorId::Hour,
                ctx.stat.minfo[MotorId::Hour.index()].maxvel * f64::from(velocity)
                    / f64::from(VEL_MAX),
                format!("CCW, velocity = {vel_pct}%"),
            ),
            'e' => (MotorId::Hour, self.cguidevel, "CCW, slow".to_string()),
            'W' => (
                MotorId::Hour,
                -ctx.stat.minfo[MotorId::Hour.index()].maxvel * f64::from(velocity)
                    / f64::from(VEL_MAX),
                format!("CW, velocity = {vel_pct}%"),
            ),
            'w' => (MotorId::Hour, -self.cguidevel, "CW, slow".to_string()),
            '0' => {
                self.stop_tel(ctx, false);
                out.send(0, "Paddle command stop");
                return;
            }
            other => {
                warn!("bogus jog direction code '{other}'");
                return;
            }
        };

        let mip = &mut ctx.stat.minfo[id.index()];
        if !mip.have() {
            warn!("no axis to move {dircode}");
            return;
        }
        mip.cvel = cvel;
        let counts = (cvel * mip.motor_counts_per_rad()).round() as i64;
        if let Some(node) = self.motors[mount_slot(id)].as_mut() {
            let _ = node.set_vel(counts);
        }
        ctx.stat.telstate = TelState::Slewing as u8;
        ctx.stat.paddle_active = 1;
        ctx.stat.refresh_jogging_flag();
        out.send(5, &format!("Paddle command {desc}"));
    }

    /// Apply an absolute tracking offset, arc-seconds on each axis.
    fn cmd_offset_tracking(&mut self, ctx: &mut Ctx, dha_as: f64, ddec_as: f64, out: &mut dyn Respond) {
        if ctx.stat.telstate() != TelState::Tracking {
            out.send(-1, "Telescope is not tracking -- offset ignored");
            return;
        }

        let h = &ctx.stat.minfo[MotorId::Hour.index()];
        let d = &ctx.stat.minfo[MotorId::Dec.index()];
        let hcounts =
            (dha_as * f64::from(h.estep) * f64::from(h.esign) / 1_296_000.0) as i64;
        let dcounts =
            (ddec_as * f64::from(d.estep) * f64::from(d.esign) / 1_296_000.0) as i64;

        for (id, counts) in [(MotorId::Hour, hcounts), (MotorId::Dec, dcounts)] {
            if let Some(node) = self.motors[mount_slot(id)].as_mut() {
                let _ = node.run_program(&Program::TrackingOffset { counts });
            }
        }

        ctx.stat.jdha = (dha_as / 3600.0).to_radians();
        ctx.stat.jddec = (ddec_as / 3600.0).to_radians();
        ctx.stat.tracking_offset_applied = 1;
        ctx.stat.refresh_jogging_flag();
        out.send(
            0,
            &format!(
                "Tracking offset by {dha_as:.3} x {ddec_as:.3} arcseconds ({hcounts} x {dcounts} steps)"
            ),
        );
    }

    // ─── Mirror cover ───────────────────────────────────────────────

    fn cmd_cover(&mut self, ctx: &mut Ctx, first: bool, open: bool, out: &mut dyn Respond) {
        let slot = mount_slot(MotorId::Hour);

        if first {
            let Some(node) = self.motors[slot].as_mut() else {
                out.send(-1, "Cover: no controller channel");
                return;
            };
            if let Err(e) = node.run_program(&Program::Cover { open }) {
                out.send(-1, &format!("Cover: {e}"));
                return;
            }
            self.cover_opening = open;
            self.cover_deadline = ctx.stat.now.mjd + COVER_TIMEOUT / SPD;
            self.active = Some(TelFunc::Cover);
            ctx.stat.coverstate = if open {
                CoverState::Opening as u8
            } else {
                CoverState::Closing as u8
            };
            return;
        }

        self.step_cover(ctx, out);
    }

    fn step_cover(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if ctx.stat.now.mjd > self.cover_deadline {
            out.send(-5, "Cover script has timed out");
            ctx.stat.coverstate = CoverState::Idle as u8;
            self.active = None;
            return;
        }

        let slot = mount_slot(MotorId::Hour);
        let Some(node) = self.motors[slot].as_mut() else {
            self.active = None;
            return;
        };
        if !node.is_ready() {
            return;
        }
        let Ok(Some(line)) = node.read_line() else {
            return;
        };

        match parse_progress(&line) {
            ProgressLine::Progress(n, text) => out.send(n, &format!("Cover {text}")),
            ProgressLine::Error(n, text) => {
                out.send(n, &format!("Cover error: {text}"));
                ctx.stat.coverstate = CoverState::Idle as u8;
                self.active = None;
            }
            ProgressLine::Invalid(text) => {
                warn!("invalid cover reply: '{text}'");
                out.send(-1, "Cover error: bogus controller reply");
                ctx.stat.coverstate = CoverState::Idle as u8;
                self.active = None;
            }
            ProgressLine::Success(_) => {
                ctx.stat.coverstate = if self.cover_opening {
                    CoverState::Open as u8
                } else {
                    CoverState::Closed as u8
                };
                self.active = None;
                out.send(0, "Mirror cover command complete");
            }
        }
    }

    // ─── Shared plumbing ────────────────────────────────────────────

    /// Refresh raw counters and cooked positions for every axis.
    pub(crate) fn read_raw(&mut self, ctx: &mut Ctx) {
        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            let mip = &mut ctx.stat.minfo[id.index()];
            if !mip.have() {
                continue;
            }
            let Some(node) = self.motors[slot].as_mut() else {
                continue;
            };
            let space = if mip.haveenc() {
                CounterSpace::Encoder
            } else {
                CounterSpace::Motor
            };
            match node.read_pos(space) {
                Ok(raw) => mip.update_from_raw(raw),
                Err(e) => warn!(axis = mip.axis, "position read failed: {e}"),
            }
        }
    }

    /// Per-poll axis health: limit overruns and stuck motors.
    pub(crate) fn check_axes(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) -> Result<(), ()> {
        let mut bad = false;
        for id in MotorId::MOUNT {
            let slot = mount_slot(id);
            let mip = &ctx.stat.minfo[id.index()];
            if let Err(text) = axis_limit_check(mip) {
                out.send(-8, &text);
                bad = true;
            } else if let Err(text) = self.motion_checks[slot].check(mip) {
                out.send(-9, &text);
                bad = true;
            }
        }
        if bad { Err(()) } else { Ok(()) }
    }
}

/// Slot in the per-mount arrays for a mount axis.
fn mount_slot(id: MotorId) -> usize {
    id.index() // MotorId::MOUNT occupy indices 0..3
}

/// Map a limit violation onto its historical fifo code.
pub(crate) fn limit_code(e: &DeviceError) -> i32 {
    match e {
        DeviceError::LimitViolation { which, .. } => match *which {
            "negative" => -2,
            "positive" => -3,
            _ => -4,
        },
        _ => -1,
    }
}

/// Build the appropriate channel for a motor.
fn make_node(virtual_mode: bool, mip: &MotorInfo) -> MotorNode {
    if virtual_mode {
        let neg = mip.pos_to_counts(mip.neglim);
        let pos = mip.pos_to_counts(mip.poslim);
        MotorNode::Virtual(VirtualMotor::new(VirtualConfig {
            steps: i64::from(if mip.haveenc() { mip.estep } else { mip.step }),
            sign: mip.sign,
            max_vel_cps: (mip.maxvel * mip.counts_per_rad()).abs().max(1.0),
            neglim_counts: neg.min(pos),
            poslim_counts: neg.max(pos),
            home_counts: 0,
        }))
    } else {
        MotorNode::Csi(CsiNode::new(mip.axis, CSI_HOST, CSIMCD_PORT))
    }
}

/// Which mount axes a `home`/`limits` command names; none means all
/// installed axes.
fn wanted_axes(msg: &str, stat: &tel_common::shm::TelStatShm) -> [bool; 3] {
    let mut want = [
        msg.contains('H'),
        msg.contains('D'),
        msg.contains('R'),
    ];
    if !want.iter().any(|w| *w) {
        want = [true, true, true];
    }
    for (slot, id) in MotorId::MOUNT.iter().enumerate() {
        if !stat.minfo[id.index()].have() {
            want[slot] = false;
        }
    }
    want
}

// ─── Command parsing ────────────────────────────────────────────────

fn token_value(msg: &str, key: &str) -> Option<f64> {
    msg.split_whitespace()
        .find_map(|tok| tok.strip_prefix(key))
        .and_then(|v| v.parse().ok())
}

fn parse_kv2(msg: &str, k1: &str, k2: &str) -> Option<(f64, f64)> {
    Some((token_value(msg, k1)?, token_value(msg, k2)?))
}

fn parse_kv3(msg: &str, k1: &str, k2: &str, k3: &str) -> Option<(f64, f64, f64)> {
    Some((
        token_value(msg, k1)?,
        token_value(msg, k2)?,
        token_value(msg, k3)?,
    ))
}

/// `dRA:x dDec:y # <db line>` or a bare db line.
fn parse_db(msg: &str) -> Option<(Obj, f64, f64)> {
    let (dra, ddec, line) = if let Some(hash) = msg.find('#') {
        let head = &msg[..hash];
        let dra = token_value(head, "dRA:")?;
        let ddec = token_value(head, "dDec:")?;
        (dra, ddec, &msg[hash + 1..])
    } else {
        (0.0, 0.0, msg)
    };
    db_crack_line(line).ok().map(|op| (op, dra, ddec))
}

/// `j<dirs> [velocity]`, dirs from `[NSEWnsew0]`.
fn parse_jog(msg: &str) -> Option<(String, i32)> {
    let rest = msg.strip_prefix('j')?;
    let dirs: String = rest
        .chars()
        .take_while(|c| "NSEWnsew0".contains(*c))
        .collect();
    if dirs.is_empty() {
        return None;
    }
    let vel = rest[dirs.len()..]
        .trim()
        .parse()
        .unwrap_or(VEL_MAX);
    Some((dirs, vel))
}

/// `Offset <dha">,<ddec">` (comma or whitespace separated).
fn parse_offset(msg: &str) -> Option<(f64, f64)> {
    let rest = msg.strip_prefix("Offset")?.trim();
    let mut parts = rest.split([',', ' ']).filter(|s| !s.is_empty());
    let a = parts.next()?.trim().parse().ok()?;
    let b = parts.next()?.trim().parse().ok()?;
    Some((a, b))
}
