//! Focus state machine and temperature-driven autofocus.
//!
//! The focuser runs behind one of three drivers: a controller node
//! (hardware or virtual) or the FLI vendor driver. All motion flows
//! through the same uniform steps (reset, home, read position, stop,
//! goto, jog) so the command handlers never branch on the backend.
//!
//! Autofocus keeps the focus position matched to the active filter and
//! the focus temperature. The position comes from the tabulated
//! `FocusTemp.dat` (or, when `ONOFOCUSTEMPDAT` is set, from the two-point
//! form in `filter.cfg`), plus a settable operator offset.

use crate::axisdrv::{axis_homed_check, axis_limit_check, AxisStep, HomeSeq, LimitSeq};
use crate::ctx::Ctx;
use crate::error::DeviceError;
use crate::focustemp::FocusTable;
use crate::Respond;
use tel_common::config::{ConfigLoader, FilterCfg, FilterEntry, FocusCfg, HomeCfg};
use tel_common::motor::{MotorId, MotorInfo};
use tel_hal::csi::{CsiNode, CSIMCD_PORT};
use tel_hal::fli::{DriverStep, FliFocuser, FliHandle, SimFli};
use tel_hal::virtual_motor::{VirtualConfig, VirtualMotor};
use tel_hal::{CounterSpace, MotorChannel, MotorNode, Program};
use tracing::{info, warn};

/// External temperature sensors are re-read this often, s.
const EXT_TEMP_REFRESH_S: i64 = 5;

/// Factory producing vendor focuser handles; installations with the real
/// SDK install their own, everything else gets the simulated device.
pub type FliFactory = Box<dyn FnMut() -> Box<dyn FliHandle>>;

enum FocusDriver {
    Node(MotorNode),
    Fli(FliFocuser<Box<dyn FliHandle>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FocusFunc {
    Home,
    Limits,
    Stop,
    Offset,
    Jog,
}

/// The focus device.
pub struct FocusDevice {
    driver: Option<FocusDriver>,
    active: Option<FocusFunc>,

    cfg: Option<FocusCfg>,
    filters: Option<FilterCfg>,
    table: FocusTable,

    home_seq: Option<HomeSeq>,
    limit_seq: Option<LimitSeq>,

    /// Raw-count goal of the motion in flight.
    rawgoal: i64,
    /// Goal handed to the external driver (kept nudging it along).
    ext_goal: i64,

    /// Operator offset added to the interpolated autofocus position, µm.
    auto_offset: f64,
    last_filter: char,
    last_temp: f64,
    last_auto_offset: f64,
    next_temp_refresh: i64,

    /// Motor calibration is incomplete; skip the post-home move.
    no_offset_on_home: bool,

    fli_factory: FliFactory,
    /// Setup deferred to the dome's reset (`OSHAREDNODE`).
    pub shared_setup_request: Option<Program>,
}

impl Default for FocusDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusDevice {
    pub fn new() -> Self {
        Self {
            driver: None,
            active: None,
            cfg: None,
            filters: None,
            table: FocusTable::empty(),
            home_seq: None,
            limit_seq: None,
            rawgoal: 0,
            ext_goal: 0,
            auto_offset: 0.0,
            last_filter: '\0',
            last_temp: 0.0,
            last_auto_offset: 0.0,
            next_temp_refresh: 0,
            no_offset_on_home: false,
            fli_factory: Box::new(|| Box::new(SimFli::new(100_000))),
            shared_setup_request: None,
        }
    }

    /// Install the vendor-device factory (real SDK handles).
    pub fn set_fli_factory(&mut self, factory: FliFactory) {
        self.fli_factory = factory;
    }

    pub fn service(&mut self, dt: std::time::Duration) {
        if let Some(FocusDriver::Node(node)) = self.driver.as_mut() {
            node.service(dt);
        }
    }

    pub fn node_mut(&mut self) -> Option<&mut MotorNode> {
        match self.driver.as_mut() {
            Some(FocusDriver::Node(node)) => Some(node),
            _ => None,
        }
    }

    fn is_ext(&self) -> bool {
        matches!(self.driver, Some(FocusDriver::Fli(_)))
    }

    fn mip<'a>(&self, ctx: &'a Ctx) -> &'a MotorInfo {
        &ctx.stat.minfo[MotorId::Focus.index()]
    }

    fn mip_mut<'a>(&self, ctx: &'a mut Ctx) -> &'a mut MotorInfo {
        &mut ctx.stat.minfo[MotorId::Focus.index()]
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    pub fn handle_msg(&mut self, ctx: &mut Ctx, msg: &str, out: &mut dyn Respond) {
        let lower = msg.to_ascii_lowercase();

        if lower.starts_with("reset") {
            self.cmd_reset(ctx, out);
            return;
        }

        if !self.mip(ctx).have() {
            out.send(0, "Ok, but focuser not really installed");
            return;
        }
        if self.driver.is_none() {
            warn!(msg, "Focus command before initial Reset");
            return;
        }

        if lower.starts_with("home") {
            self.cmd_home(ctx, true, out);
        } else if lower.starts_with("stop") {
            self.cmd_stop(ctx, true, out);
        } else if lower.starts_with("limits") {
            self.cmd_limits(ctx, true, out);
        } else if lower.starts_with("aoreset") {
            self.auto_offset = 0.0;
            out.send(0, "Auto focus offset reset complete");
        } else if let Some(um) = lower.strip_prefix("ao").and_then(|v| v.parse().ok()) {
            self.auto_offset = um;
            self.cmd_auto(ctx, out);
        } else if lower.starts_with("auto") {
            self.cmd_auto(ctx, out);
        } else if let Some(dir) = msg.strip_prefix('j').and_then(|r| r.chars().next()) {
            self.cmd_jog(ctx, true, dir, out);
        } else if let Ok(delta) = msg.trim().parse::<f64>() {
            self.cmd_offset(ctx, true, delta, out);
        } else {
            out.send(-1, &format!("Unknown command: {:.20}", msg));
        }
    }

    pub fn poll(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if self.driver.is_none() {
            return;
        }

        if ctx.unix_time() > self.next_temp_refresh {
            self.refresh_ext_temp(ctx);
            self.next_temp_refresh = ctx.unix_time() + EXT_TEMP_REFRESH_S;
        }

        match self.active {
            Some(FocusFunc::Home) => self.cmd_home(ctx, false, out),
            Some(FocusFunc::Limits) => self.cmd_limits(ctx, false, out),
            Some(FocusFunc::Stop) => self.cmd_stop(ctx, false, out),
            Some(FocusFunc::Offset) => self.cmd_offset(ctx, false, 0.0, out),
            Some(FocusFunc::Jog) => self.cmd_jog(ctx, false, ' ', out),
            None => {
                if ctx.stat.autofocus != 0 {
                    self.auto_focus(ctx, out);
                }
            }
        }
    }

    // ─── Reset & configuration ──────────────────────────────────────

    fn cmd_reset(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        let cfg = match self.init_cfg(ctx) {
            Ok(cfg) => cfg,
            Err(e) => {
                out.send(-1, &format!("Reset failed: {e}"));
                return;
            }
        };

        if !self.mip(ctx).have() {
            self.driver = None;
            out.send(0, "Not installed");
            return;
        }

        let mip = *self.mip(ctx);
        if cfg.oflifocus != 0 {
            match FliFocuser::new((self.fli_factory)()) {
                Ok(foc) => self.driver = Some(FocusDriver::Fli(foc)),
                Err(e) => {
                    out.send(-1, &format!("FLI focuser error: {e}"));
                    return;
                }
            }
        } else {
            let mut node = make_focus_node(ctx.virtual_mode, &mip);
            if let Err(e) = node.open() {
                out.send(-1, &format!("Focus channel open failed: {e}"));
                return;
            }
            let setup = Program::SetupAxis {
                steps: i64::from(mip.step),
                sign: mip.sign,
                max_vel_cps: (mip.maxvel * mip.motor_counts_per_rad()).abs() as i64,
                max_acc_cps2: (mip.maxacc * mip.motor_counts_per_rad()).abs() as i64,
                lim_acc_cps2: (mip.slimacc * mip.motor_counts_per_rad()).abs() as i64,
                homelow: mip.homelow != 0,
            };
            if cfg.osharednode != 0 {
                // The dome owns this controller node; it pushes our setup
                // during its own reset.
                self.shared_setup_request = Some(setup);
            } else if let Err(e) = node.run_program(&setup) {
                out.send(-1, &format!("Focus setup failed: {e}"));
                return;
            }
            self.driver = Some(FocusDriver::Node(node));
        }

        if cfg.osharednode != 0 {
            out.send(0, "Reset deferred on Dome shared node");
        } else {
            self.stop_focus(ctx);
            self.read_focus(ctx);
            out.send(0, "Reset complete");
        }
    }

    fn init_cfg(&mut self, ctx: &mut Ctx) -> Result<FocusCfg, DeviceError> {
        let cfg = FocusCfg::load(&ctx.cfg_path("focus.cfg"))?;
        cfg.validate()?;
        let hc = HomeCfg::load(&ctx.cfg_path("home.cfg"))?;
        hc.validate()?;
        let filters = FilterCfg::load(&ctx.cfg_path("filter.cfg"))?;
        filters.validate()?;

        // When an encoder is fitted, OSTEP/OSIGN in focus.cfg describe the
        // encoder and the motor calibration comes from home.cfg (written
        // by a limit run). Until that run happens, skip post-home moves.
        let (step, sign, estep, esign) = if cfg.ohaveenc != 0 {
            match (hc.ostep, hc.osign) {
                (Some(ms), Some(msn)) => (ms, msn, cfg.ostep, cfg.osign),
                _ => {
                    self.no_offset_on_home = true;
                    (cfg.ostep, cfg.osign, cfg.ostep, cfg.osign)
                }
            }
        } else {
            (cfg.ostep, cfg.osign, cfg.ostep, cfg.osign)
        };

        let mip = self.mip_mut(ctx);
        let oldhomed = mip.ishomed;
        *mip = MotorInfo::default();
        mip.ishomed = oldhomed;
        mip.axis = cfg.oaxis;
        mip.have = u8::from(cfg.ohave != 0);
        mip.haveenc = u8::from(cfg.ohaveenc != 0);
        mip.havelim = u8::from(cfg.ohaslim != 0);
        mip.posside = u8::from(cfg.oposside != 0);
        mip.homelow = u8::from(cfg.ohomelow != 0);
        mip.step = step;
        mip.sign = sign;
        mip.estep = estep;
        mip.esign = esign;
        mip.maxvel = cfg.omaxvel.abs();
        mip.maxacc = cfg.omaxacc;
        mip.slimacc = cfg.oslimacc;
        mip.poslim = hc.oposlim;
        mip.neglim = hc.oneglim;
        mip.focscale = cfg.oscale;

        self.table = FocusTable::load(&ctx.cfg_path("FocusTemp.dat")).unwrap_or_else(|e| {
            warn!("focus table unusable: {e}");
            FocusTable::empty()
        });
        self.filters = Some(filters);
        self.cfg = Some(cfg.clone());
        info!("focus configuration installed");
        Ok(cfg)
    }

    fn cfg(&self) -> &FocusCfg {
        self.cfg.as_ref().expect("focus cfg installed at reset")
    }

    // ─── Home ───────────────────────────────────────────────────────

    fn cmd_home(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        if self.is_ext() {
            self.ext_home(ctx, first, out);
            return;
        }

        if first {
            self.stop_focus(ctx);
            let mjd = ctx.stat.now.mjd;
            let mip = &mut ctx.stat.minfo[MotorId::Focus.index()];
            let Some(FocusDriver::Node(node)) = self.driver.as_mut() else {
                return;
            };
            match HomeSeq::start(mip, node, mjd) {
                Ok(seq) => self.home_seq = Some(seq),
                Err(e) => {
                    out.send(-1, &format!("Focus home failed: {e}"));
                    return;
                }
            }
            self.active = Some(FocusFunc::Home);
        }

        let mjd = ctx.stat.now.mjd;
        let step = {
            let mip = &mut ctx.stat.minfo[MotorId::Focus.index()];
            let (Some(seq), Some(FocusDriver::Node(node))) =
                (self.home_seq.as_mut(), self.driver.as_mut())
            else {
                return;
            };
            seq.tick(mip, node, mjd, out)
        };

        match step {
            AxisStep::InProgress => {}
            AxisStep::Failed(text) => {
                self.stop_focus(ctx);
                out.send(-1, &text);
                self.active = None;
                self.home_seq = None;
            }
            AxisStep::Done => {
                self.active = None;
                self.home_seq = None;
                self.finish_home(ctx, out);
            }
        }
    }

    fn ext_home(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        let result = {
            let Some(FocusDriver::Fli(foc)) = self.driver.as_mut() else {
                return;
            };
            foc.home_step(first)
        };
        if first {
            self.mip_mut(ctx).ishomed = 0;
            self.mip_mut(ctx).homing = 1;
            self.active = Some(FocusFunc::Home);
        }
        match result {
            Ok(DriverStep::InProgress) => self.read_focus(ctx),
            Ok(DriverStep::Done) => {
                let mip = self.mip_mut(ctx);
                mip.homing = 0;
                mip.ishomed = 1;
                self.active = None;
                self.finish_home(ctx, out);
            }
            Err(e) => {
                self.stop_focus(ctx);
                self.mip_mut(ctx).homing = 0;
                out.send(-1, &format!("Focus home error: {e}"));
                self.active = None;
            }
        }
    }

    /// After home: move to the filter/temperature start position.
    fn finish_home(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        self.read_focus(ctx);
        if self.no_offset_on_home {
            out.send(0, "Homing complete.");
            return;
        }

        let temp = self.focus_temp(ctx);
        let entry = self.find_filter(ctx.stat.filter as char).cloned();
        let ugoal = entry
            .map(|fip| self.target_position(&fip, temp))
            .unwrap_or(0.0);
        out.send(1, &format!("Homing complete. Now going to {ugoal:.1}um"));

        let unow = self.mip(ctx).focus_rad_to_um(self.mip(ctx).cpos);
        self.cmd_offset(ctx, true, ugoal - unow, out);
    }

    // ─── Limits ─────────────────────────────────────────────────────

    fn cmd_limits(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        if self.is_ext() {
            out.send(
                0,
                "Find Limits not currently supported for external focus drivers. Please configure manually.",
            );
            self.stop_focus(ctx);
            self.active = None;
            return;
        }

        if first {
            let mjd = ctx.stat.now.mjd;
            let mip = &mut ctx.stat.minfo[MotorId::Focus.index()];
            let Some(FocusDriver::Node(node)) = self.driver.as_mut() else {
                return;
            };
            match LimitSeq::start(mip, node, mjd) {
                Ok(seq) => self.limit_seq = Some(seq),
                Err(e) => {
                    out.send(-1, &format!("Focus limits failed: {e}"));
                    self.stop_focus(ctx);
                    return;
                }
            }
            self.active = Some(FocusFunc::Limits);
        }

        let mjd = ctx.stat.now.mjd;
        let step = {
            let mip = &mut ctx.stat.minfo[MotorId::Focus.index()];
            let (Some(seq), Some(FocusDriver::Node(node))) =
                (self.limit_seq.as_mut(), self.driver.as_mut())
            else {
                return;
            };
            seq.tick(mip, node, mjd, out)
        };

        match step {
            AxisStep::InProgress => {}
            AxisStep::Failed(text) => {
                self.stop_focus(ctx);
                out.send(-1, &text);
                self.active = None;
                self.limit_seq = None;
            }
            AxisStep::Done => {
                self.stop_focus(ctx);
                self.active = None;
                self.limit_seq = None;
                if let Err(e) = self.persist_limits(ctx) {
                    out.send(-1, &format!("Saving focus limits failed: {e}"));
                    return;
                }
                if let Err(e) = self.init_cfg(ctx) {
                    out.send(-1, &format!("Rereading focus limits failed: {e}"));
                    return;
                }
                self.mip_mut(ctx).ishomed = 1;
                out.send(0, "Limits found");
            }
        }
    }

    fn persist_limits(&self, ctx: &Ctx) -> Result<(), DeviceError> {
        let path = ctx.cfg_path("home.cfg");
        let mut hc = HomeCfg::load(&path)?;
        let mip = self.mip(ctx);
        hc.oneglim = mip.neglim;
        hc.oposlim = mip.poslim;
        hc.save(&path)?;
        Ok(())
    }

    // ─── Stop ───────────────────────────────────────────────────────

    fn cmd_stop(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        self.read_focus(ctx);

        if first {
            self.stop_focus(ctx);
            self.active = Some(FocusFunc::Stop);
        }

        // External focusers stop essentially at once; a node must report
        // zero velocity first.
        if let Some(FocusDriver::Node(node)) = self.driver.as_mut() {
            match node.read_vel() {
                Ok(0) => {}
                _ => return,
            }
        }

        self.active = None;
        self.read_focus(ctx);
        out.send(0, "Stop complete");
    }

    fn stop_focus(&mut self, ctx: &mut Ctx) {
        match self.driver.as_mut() {
            Some(FocusDriver::Node(node)) => {
                let _ = node.interrupt();
                let _ = node.set_vel(0);
            }
            Some(FocusDriver::Fli(foc)) => {
                let _ = foc.stop();
            }
            None => {}
        }

        ctx.stat.autofocus = 0;
        let mip = self.mip_mut(ctx);
        mip.homing = 0;
        mip.limiting = 0;
        mip.cvel = 0.0;
        mip.dpos = mip.cpos;

        // Force the next autofocus pass to recompute from scratch.
        self.last_filter = '\0';
        self.last_temp = 0.0;
        self.last_auto_offset = 0.0;
    }

    // ─── Auto ───────────────────────────────────────────────────────

    fn cmd_auto(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        self.stop_focus(ctx);
        ctx.stat.autofocus = 1;
        self.auto_focus(ctx, out);
        if ctx.stat.autofocus != 0 {
            out.send(0, "Auto-focus enabled");
        }
    }

    /// Track scan filter (else wheel filter) and temperature.
    fn auto_focus(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if self.cfg().ousetempfoc == 0 {
            return;
        }

        // A move in flight: nurse it along, then keep monitoring.
        if self.mip(ctx).cvel != 0.0 {
            self.read_focus(ctx);
            if self.is_ext() {
                let goal = self.ext_goal;
                match self.ext_goto(false, goal) {
                    Ok(DriverStep::InProgress) => return,
                    Ok(DriverStep::Done) => self.mip_mut(ctx).cvel = 0.0,
                    Err(_) => return,
                }
            } else {
                let mip = self.mip_mut(ctx);
                if (mip.cpos - mip.dpos).abs()
                    <= 2.0 * std::f64::consts::TAU / f64::from(mip.step.max(1))
                {
                    mip.cvel = 0.0;
                } else {
                    return;
                }
            }
        }

        if let Err(e) = axis_homed_check(self.mip(ctx)) {
            ctx.stat.autofocus = 0;
            out.send(-1, &format!("Focus error: {e}"));
            return;
        }

        // Expected filter: the running scan's, else the wheel's.
        let newfilter = if ctx.stat.scan.starttm != 0 {
            ctx.stat.scan.filter as char
        } else {
            ctx.stat.filter as char
        };
        if !newfilter.is_ascii_alphanumeric() {
            return; // wheel turning
        }
        let newfilter = newfilter.to_ascii_uppercase();

        let newtemp = self.focus_temp(ctx);

        // Nothing to do for the same filter at about the same temperature.
        if newfilter == self.last_filter
            && self.auto_offset == self.last_auto_offset
            && (newtemp - self.last_temp).abs() <= self.cfg().minafdt
        {
            return;
        }

        let Some(fip) = self.find_filter(newfilter).cloned() else {
            out.send(-8, &format!("Autofocus failed: no filter named {newfilter}"));
            ctx.stat.autofocus = 0;
            return;
        };

        let baseugoal = self.target_position(&fip, newtemp);
        let ugoal = baseugoal + self.auto_offset;
        let mut goal = self.mip(ctx).focus_um_to_rad(ugoal);

        // Clamp to the travel range.
        let mip = *self.mip(ctx);
        if goal > mip.poslim {
            out.send(
                -3,
                &format!(
                    "Auto move hits positive limit for {} at {newtemp:.1}C",
                    fip.name
                ),
            );
            goal = mip.poslim;
        }
        if goal < mip.neglim {
            out.send(
                -4,
                &format!(
                    "Auto move hits negative limit for {} at {newtemp:.1}C",
                    fip.name
                ),
            );
            goal = mip.neglim;
        }

        if let Err(e) = self.issue_goto(ctx, goal) {
            out.send(-1, &format!("Focus error: {e}"));
            ctx.stat.autofocus = 0;
            return;
        }
        let mip = self.mip_mut(ctx);
        mip.cvel = mip.maxvel * if goal > mip.cpos { 1.0 } else { -1.0 };
        mip.dpos = goal;

        out.send(
            4,
            &format!(
                "Auto moving to {ugoal:.1}um ({baseugoal:.1} base + {:.1} offset) for {} at {newtemp:.1}C",
                self.auto_offset, fip.name
            ),
        );

        self.last_temp = newtemp;
        self.last_filter = newfilter;
        self.last_auto_offset = self.auto_offset;
    }

    /// Interpolated position for a filter at a temperature, µm.
    fn target_position(&self, fip: &FilterEntry, newtemp: f64) -> f64 {
        if self.cfg().onofocustempdat != 0 {
            // The two-point filter.cfg form.
            if fip.t1 != fip.t0 {
                (newtemp - fip.t0) * (fip.f1 - fip.f0) / (fip.t1 - fip.t0) + fip.f0
            } else {
                fip.f0
            }
        } else {
            self.table
                .find(
                    fip.name.chars().next().unwrap_or('\0'),
                    newtemp,
                    self.cfg().maxinterp,
                )
                .unwrap_or(fip.f0)
        }
    }

    /// The focus temperature: highest-priority aux sensor else ambient.
    fn focus_temp(&self, ctx: &Ctx) -> f64 {
        ctx.stat.wxs.aux_temp().unwrap_or(ctx.stat.now.temp)
    }

    /// An external focuser with a built-in sensor feeds aux slot 0.
    fn refresh_ext_temp(&mut self, ctx: &mut Ctx) {
        let unix = ctx.unix_time();
        if let Some(FocusDriver::Fli(foc)) = self.driver.as_mut() {
            if let Ok(temp) = foc.temperature() {
                ctx.stat.wxs.set_aux_temp(0, temp, unix);
            }
        }
    }

    fn find_filter(&self, ch: char) -> Option<&FilterEntry> {
        self.filters.as_ref()?.find(ch)
    }

    // ─── Relative moves ─────────────────────────────────────────────

    fn cmd_offset(&mut self, ctx: &mut Ctx, first: bool, delta_um: f64, out: &mut dyn Respond) {
        self.read_focus(ctx);

        if first {
            if let Err(e) = axis_homed_check(self.mip(ctx)) {
                self.active = None;
                self.stop_focus(ctx);
                out.send(-1, &format!("Focus error: {e}"));
                return;
            }

            let mip = *self.mip(ctx);
            let goal = mip.cpos + mip.focus_um_to_rad(delta_um);
            if goal > mip.poslim {
                out.send(-1, "Move is beyond positive limit");
                self.active = None;
                return;
            }
            if goal < mip.neglim {
                out.send(-2, "Move is beyond negative limit");
                self.active = None;
                return;
            }

            if let Err(e) = self.issue_goto(ctx, goal) {
                out.send(-1, &format!("Focus error: {e}"));
                self.active = None;
                return;
            }
            let mip = self.mip_mut(ctx);
            mip.cvel = mip.maxvel;
            mip.dpos = goal;
            self.active = Some(FocusFunc::Offset);
            ctx.stat.autofocus = 0;
        }

        let reached = if self.is_ext() {
            let goal = self.ext_goal;
            match self.ext_goto(false, goal) {
                Err(e) => {
                    self.active = None;
                    out.send(-1, &format!("Focus offset failed: {e}"));
                    return;
                }
                Ok(DriverStep::InProgress) => false,
                Ok(DriverStep::Done) => true,
            }
        } else {
            let mip = *self.mip(ctx);
            if mip.haveenc() {
                let working = match self.node_mut().map(|n| n.read_working()) {
                    Some(Ok(w)) => w,
                    _ => true,
                };
                (mip.raw - self.rawgoal).abs() < 2 && !working
            } else {
                mip.raw == self.rawgoal
            }
        };

        if reached {
            self.active = None;
            self.stop_focus(ctx);
            out.send(0, "Focus offset complete");
        }
    }

    /// Issue an absolute goal (rad from home) on whichever driver.
    fn issue_goto(&mut self, ctx: &mut Ctx, goal: f64) -> Result<(), DeviceError> {
        let mip = *self.mip(ctx);
        if self.is_ext() {
            let rawgoal = (mip.motor_counts_per_rad() * goal).round() as i64;
            self.ext_goal = rawgoal;
            self.rawgoal = rawgoal;
            self.ext_goto(true, rawgoal)
                .map_err(|e| DeviceError::Script {
                    code: -1,
                    text: e.to_string(),
                })?;
            Ok(())
        } else {
            let space = if mip.haveenc() {
                CounterSpace::Encoder
            } else {
                CounterSpace::Motor
            };
            self.rawgoal = mip.pos_to_counts(goal);
            let rawgoal = self.rawgoal;
            if let Some(node) = self.node_mut() {
                node.set_pos(space, rawgoal)?;
            }
            Ok(())
        }
    }

    fn ext_goto(&mut self, first: bool, target: i64) -> Result<DriverStep, tel_hal::fli::FliError> {
        match self.driver.as_mut() {
            Some(FocusDriver::Fli(foc)) => foc.goto_step(first, target),
            _ => Ok(DriverStep::Done),
        }
    }

    // ─── Jog ────────────────────────────────────────────────────────

    fn cmd_jog(&mut self, ctx: &mut Ctx, first: bool, dir: char, out: &mut dyn Respond) {
        self.read_focus(ctx);
        {
            let mip = self.mip_mut(ctx);
            mip.dpos = mip.cpos; // just for looks
        }

        if first {
            ctx.stat.autofocus = 0;
            let ojogf = self.cfg().ojogf;
            let mip = *self.mip(ctx);

            match dir {
                '0' => {
                    self.cmd_stop(ctx, true, out);
                    return;
                }
                '+' => {
                    if mip.cpos >= mip.poslim {
                        out.send(-4, "At positive limit");
                        return;
                    }
                    match self.driver.as_mut() {
                        Some(FocusDriver::Fli(foc)) => {
                            let _ = foc.jog(1);
                        }
                        Some(FocusDriver::Node(node)) => {
                            let cps = (f64::from(mip.sign)
                                * mip.maxvel
                                * mip.motor_counts_per_rad().abs()
                                * ojogf)
                                .round() as i64;
                            let _ = node.set_vel(cps);
                        }
                        None => return,
                    }
                    self.mip_mut(ctx).cvel = mip.maxvel * ojogf;
                    self.active = Some(FocusFunc::Jog);
                    out.send(1, "Paddle command in");
                }
                '-' => {
                    if mip.cpos <= mip.neglim {
                        out.send(-5, "At negative limit");
                        return;
                    }
                    match self.driver.as_mut() {
                        Some(FocusDriver::Fli(foc)) => {
                            let _ = foc.jog(-1);
                        }
                        Some(FocusDriver::Node(node)) => {
                            let cps = (-f64::from(mip.sign)
                                * mip.maxvel
                                * mip.motor_counts_per_rad().abs()
                                * ojogf)
                                .round() as i64;
                            let _ = node.set_vel(cps);
                        }
                        None => return,
                    }
                    self.mip_mut(ctx).cvel = -mip.maxvel * ojogf;
                    self.active = Some(FocusFunc::Jog);
                    out.send(2, "Paddle command out");
                }
                other => {
                    warn!("focus jog: bogus dircode {other:?}");
                    self.active = None;
                    return;
                }
            }
        }

        // Under user control: watch the travel limits.
        if let Err(text) = axis_limit_check(self.mip(ctx)) {
            self.stop_focus(ctx);
            self.active = None;
            out.send(-7, &text);
            return;
        }

        // The external driver needs nudging to keep jogging.
        if self.is_ext() {
            if let Some(FocusDriver::Fli(foc)) = self.driver.as_mut() {
                let _ = foc.jog(0);
            }
        }
    }

    // ─── Position readout ───────────────────────────────────────────

    /// Refresh raw counter and cooked position.
    pub(crate) fn read_focus(&mut self, ctx: &mut Ctx) {
        if !self.mip(ctx).have() {
            return;
        }
        let raw = match self.driver.as_mut() {
            Some(FocusDriver::Node(node)) => {
                let space = if ctx.stat.minfo[MotorId::Focus.index()].haveenc() {
                    CounterSpace::Encoder
                } else {
                    CounterSpace::Motor
                };
                match node.read_pos(space) {
                    Ok(raw) => raw,
                    Err(_) => return,
                }
            }
            Some(FocusDriver::Fli(foc)) => match foc.read_position() {
                Ok(raw) => raw,
                Err(_) => return,
            },
            None => return,
        };
        self.mip_mut(ctx).update_from_raw(raw);
    }
}

/// Build the focuser channel for a non-FLI installation.
fn make_focus_node(virtual_mode: bool, mip: &MotorInfo) -> MotorNode {
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
        MotorNode::Csi(CsiNode::new(mip.axis, "127.0.0.1", CSIMCD_PORT))
    }
}
