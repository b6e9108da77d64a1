//! Dome and shutter state machine.
//!
//! Functions that answer the fifo sit on `DomeDevice`; the `d_`-layer
//! helpers (auto follow, telescope-azimuth geometry, stop plumbing) live
//! below them. Weather alerts and the emergency-stop guard pre-empt every
//! message and every poll.

use crate::ctx::Ctx;
use crate::guard::{EmergencyGuard, InertGuard};
use crate::Respond;
use std::f64::consts::TAU;
use tel_astro::angles::{delra, ha_range, range};
use tel_astro::domegeom::DomeGeometry;
use tel_common::config::{ConfigLoader, DomeCfg};
use tel_common::consts::{SPD, WX_ALERT_WINDOW};
use tel_common::state::{DomeState, ShutterState, TelState};
use tel_hal::csi::{CsiNode, CSIMCD_PORT};
use tel_hal::tty_dome::TtyDome;
use tel_hal::virtual_motor::{VirtualConfig, VirtualMotor};
use tel_hal::{parse_progress, CounterSpace, MotorChannel, MotorNode, Program, ProgressLine};
use tracing::{info, warn};

/// Position readout cadence while idle, s.
const POLL_DELAY_S: f64 = 1.5;

/// Dome target azimuth leads the telescope by this much hour angle while
/// slewing, minutes of time.
const HA_LEAD_MINUTES: f64 = 3.0;

/// Above this wall altitude the dome holds its azimuth instead of
/// twirling under the zenith.
const ZENITH_HOLD_ALT: f64 = 85.0 * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomeFunc {
    Open,
    Close,
    Home,
    SetAz,
    Jog,
}

/// The dome + shutter device.
pub struct DomeDevice {
    node: Option<MotorNode>,
    active: Option<DomeFunc>,
    guard: Box<dyn EmergencyGuard>,

    cfg: Option<DomeCfg>,
    geometry: Option<DomeGeometry>,

    /// Active-function deadline, mjd.
    dome_to: f64,
    /// Next idle position readout, mjd.
    nextread_mjd: f64,
    /// A shutter-power alignment seek is in flight.
    aligning: bool,
    /// The last azimuth command failed.
    setaz_error: bool,

    /// Focus setup deferred to this node (`OSHAREDNODE`).
    pub focus_shared_setup: Option<Program>,
}

impl Default for DomeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DomeDevice {
    pub fn new() -> Self {
        Self {
            node: None,
            active: None,
            guard: Box::new(InertGuard),
            cfg: None,
            geometry: None,
            dome_to: 0.0,
            nextread_mjd: 0.0,
            aligning: false,
            setaz_error: false,
            focus_shared_setup: None,
        }
    }

    /// Replace the emergency-stop input (the default never asserts).
    pub fn set_guard(&mut self, guard: Box<dyn EmergencyGuard>) {
        self.guard = guard;
    }

    /// Advance a virtual controller (no-op on hardware).
    pub fn service(&mut self, dt: std::time::Duration) {
        if let Some(node) = self.node.as_mut() {
            node.service(dt);
        }
    }

    /// Test hook.
    pub fn node_mut(&mut self) -> Option<&mut MotorNode> {
        self.node.as_mut()
    }

    fn dhave(&self, ctx: &Ctx) -> bool {
        ctx.stat.domestate().is_present()
    }

    fn shave(&self, ctx: &Ctx) -> bool {
        ctx.stat.shutterstate().is_present()
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    pub fn handle_msg(&mut self, ctx: &mut Ctx, msg: &str, out: &mut dyn Respond) {
        let lower = msg.to_ascii_lowercase();

        // Reset first, so a new config file can bring the dome to life.
        if lower.starts_with("reset") {
            self.cmd_reset(ctx, out);
            return;
        }

        if !self.dhave(ctx) && !self.shave(ctx) {
            out.send(0, "Ok, but dome really not installed");
            return;
        }

        if self.node.is_none() {
            warn!(msg, "Dome command before initial Reset");
            return;
        }

        if self.check_emgstop(ctx, true, out) || self.check_weather(ctx, true, out) {
            return;
        }

        if lower.starts_with("stop") {
            self.cmd_stop(ctx, out);
        } else if lower.starts_with("open") {
            self.cmd_open(ctx, true, out);
        } else if lower.starts_with("close") {
            self.cmd_close(ctx, true, out);
        } else if lower.starts_with("auto") {
            self.cmd_auto_on(ctx, out);
        } else if lower.starts_with("off") {
            self.cmd_auto_off(ctx, out);
        } else if lower.starts_with("home") {
            self.cmd_home(ctx, true, out);
        } else if let Some(az) = msg
            .split_whitespace()
            .find_map(|tok| tok.strip_prefix("Az:"))
            .and_then(|v| v.parse::<f64>().ok())
        {
            self.cmd_setaz(ctx, true, az, out);
        } else if let Some(dir) = parse_dome_jog(msg) {
            self.cmd_jog(ctx, dir, out);
        } else {
            out.send(-1, &format!("Unknown command: {:.20}", msg));
            self.cmd_stop(ctx, out);
        }
    }

    /// Idle tick.
    pub fn poll(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if self.node.is_none() {
            return;
        }
        // Gates may initiate a close or stop; the active function still
        // steps this poll so those very operations make progress.
        let _ = self.check_emgstop(ctx, false, out) || self.check_weather(ctx, false, out);

        match self.active {
            Some(DomeFunc::Open) => self.cmd_open(ctx, false, out),
            Some(DomeFunc::Close) => self.cmd_close(ctx, false, out),
            Some(DomeFunc::Home) => self.cmd_home(ctx, false, out),
            Some(DomeFunc::SetAz) => self.step_setaz(ctx, out),
            Some(DomeFunc::Jog) | None => {}
        }

        if self.dhave(ctx) {
            if ctx.stat.autodome != 0 {
                self.d_auto(ctx, out);
            }
            if ctx.stat.now.mjd > self.nextread_mjd {
                self.read_position(ctx);
                self.nextread_mjd = ctx.stat.now.mjd + POLL_DELAY_S / SPD;
            }
        }
    }

    // ─── Reset & configuration ──────────────────────────────────────

    fn cmd_reset(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        self.setaz_error = true;
        self.active = None;
        self.aligning = false;

        let cfg = match self.init_cfg(ctx) {
            Ok(cfg) => cfg,
            Err(e) => {
                out.send(-1, &format!("Reset failed: {e}"));
                return;
            }
        };

        if !self.dhave(ctx) && !self.shave(ctx) {
            if let Some(node) = self.node.as_mut() {
                node.close();
            }
            self.node = None;
            out.send(0, "Not installed");
            return;
        }

        if self.node.is_none() {
            let mut node = make_dome_node(ctx.virtual_mode, &cfg);
            if let Err(e) = node.open() {
                out.send(-1, &format!("Dome channel open failed: {e}"));
                return;
            }
            self.node = Some(node);
        }

        // Push the script parameters the controller programs rely on.
        if let Some(node) = self.node.as_mut() {
            let params = Program::DomeParams {
                steps: cfg.domestep,
                sign: cfg.domesign,
                motor_only: cfg.motoronly != 0,
                dome_to_ms: (cfg.dometo * 1000.0) as i64,
                shutter_run_ms: (cfg.shutterto * 750.0) as i64,
                shutter_to_ms: (cfg.shutterto * 1000.0) as i64,
            };
            if let Err(e) = node.run_program(&params) {
                out.send(-2, &format!("Reset failed: {e}"));
                return;
            }

            // A focuser on this node gets its deferred setup now.
            if let Some(setup) = self.focus_shared_setup.clone() {
                out.send(1, "Setting shared focus reset parameters");
                if let Err(e) = node.run_program(&setup) {
                    out.send(-2, &format!("Shared focus setup failed: {e}"));
                    return;
                }
            }
        }

        // A shutter caught mid-travel by a restart reads as Idle.
        if self.shave(ctx) && ctx.stat.shutterstate().is_moving() {
            ctx.stat.shutterstate = ShutterState::Idle as u8;
        }

        self.setaz_error = false;
        out.send(0, "Reset complete");
    }

    fn init_cfg(&mut self, ctx: &mut Ctx) -> Result<DomeCfg, crate::error::DeviceError> {
        let cfg = DomeCfg::load(&ctx.cfg_path("dome.cfg"))?;
        cfg.validate()?;

        self.geometry = Some(
            DomeGeometry::new(
                cfg.domeoffsetnorth,
                cfg.domeoffseteast,
                cfg.domeoffsetheight,
                cfg.domeoffsetoptical,
                cfg.domeradius,
            )
            .map_err(|e| {
                crate::error::DeviceError::Config(
                    tel_common::config::ConfigError::ValidationError(e.to_string()),
                )
            })?,
        );

        // Presence effects on published state, preserving useful info.
        if cfg.domehave == 0 {
            ctx.stat.domestate = DomeState::Absent as u8;
        } else if ctx.stat.domestate() == DomeState::Absent {
            ctx.stat.domestate = DomeState::Stopped as u8;
        }
        if cfg.shutterhave == 0 {
            ctx.stat.shutterstate = ShutterState::Absent as u8;
        } else if ctx.stat.shutterstate() == ShutterState::Absent {
            ctx.stat.shutterstate = ShutterState::Idle as u8;
        }

        // Auto mode never survives a reset.
        ctx.stat.autodome = 0;

        info!(
            dome = cfg.domehave != 0,
            shutter = cfg.shutterhave != 0,
            "dome configuration installed"
        );
        self.cfg = Some(cfg.clone());
        Ok(cfg)
    }

    fn cfg(&self) -> &DomeCfg {
        self.cfg.as_ref().expect("dome cfg installed at reset")
    }

    // ─── Pre-emption gates ──────────────────────────────────────────

    /// Emergency stop: stops everything while asserted.
    fn check_emgstop(&mut self, ctx: &mut Ctx, msg: bool, out: &mut dyn Respond) -> bool {
        let moving =
            ctx.stat.domestate().is_moving() || ctx.stat.shutterstate().is_moving();
        if !moving || !self.guard.is_active() {
            return false;
        }

        if msg || self.active.is_some() {
            out.send(-15, "Command cancelled.. emergency stop is active");
        }
        if ctx.stat.domestate() != DomeState::Stopped {
            out.send(8, "Emergency stop asserted -- stopping dome");
            ctx.stat.autodome = 0;
            self.cmd_stop(ctx, out);
        }
        true
    }

    /// Weather alert: forces the shutter closed while fresh.
    fn check_weather(&mut self, ctx: &mut Ctx, msg: bool, out: &mut dyn Respond) -> bool {
        let fresh = ctx
            .stat
            .wxs
            .alert_active(ctx.unix_time(), WX_ALERT_WINDOW);
        if !fresh || !self.shave(ctx) {
            return false;
        }

        if msg || (self.active.is_some() && self.active != Some(DomeFunc::Close)) {
            out.send(-16, "Command cancelled.. weather alert in progress");
        }
        if self.active != Some(DomeFunc::Close)
            && ctx.stat.shutterstate() != ShutterState::Closed
        {
            out.send(9, "Weather alert asserted -- closing shutter");
            ctx.stat.autodome = 0;
            self.cmd_close(ctx, true, out);
        }
        true
    }

    // ─── Shutter power gating ───────────────────────────────────────

    /// Rotate the dome to the shutter-power azimuth before driving the
    /// shutter. True once aligned (or no alignment required).
    fn go_shutter_power(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) -> bool {
        if !self.dhave(ctx) {
            return true; // just a roof
        }
        let cfg = self.cfg();
        if cfg.shutteraz == 0.0 && cfg.shutteraztol == 0.0 {
            return true;
        }
        let (shutteraz, tol) = (cfg.shutteraz, cfg.shutteraztol);

        if self.aligning {
            // The seek machinery is running under our feet; check it.
            self.step_setaz_inner(ctx, out);
            if self.setaz_error {
                self.aligning = false;
                self.active = None;
                return false;
            }
            if ctx.stat.domestate() == DomeState::Stopped && !self.aligning {
                return delra(ctx.stat.domeaz - shutteraz) <= tol;
            }
            return false;
        }

        if ctx.stat.domestate() == DomeState::Stopped {
            self.read_position(ctx);
            if delra(ctx.stat.domeaz - shutteraz) <= tol {
                return true;
            }
            out.send(1, "Aligning Dome for shutter power");
            // The alignment must land inside the power tolerance even
            // when it is tighter than the ordinary seek tolerance.
            let seek_tol = tol.min(self.cfg().dometol);
            self.start_seek_with_tol(ctx, shutteraz, seek_tol);
            self.aligning = true;
        }
        false
    }

    // ─── Shutter ────────────────────────────────────────────────────

    fn cmd_open(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        self.door_run(ctx, first, true, out);
    }

    fn cmd_close(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        self.door_run(ctx, first, false, out);
    }

    fn door_run(&mut self, ctx: &mut Ctx, first: bool, open: bool, out: &mut dyn Respond) {
        if !self.shave(ctx) {
            out.send(-3, if open { "No shutter to open" } else { "No shutter to close" });
            return;
        }

        if first {
            self.dome_to = ctx.stat.now.mjd + self.cfg().shutterto / SPD;
            self.active = Some(if open { DomeFunc::Open } else { DomeFunc::Close });
            ctx.stat.autodome = 0;
            self.aligning = false;
        }

        if !self.go_shutter_power(ctx, out) {
            return;
        }

        let (running_state, verb) = if open {
            (ShutterState::Opening, "open")
        } else {
            (ShutterState::Closing, "close")
        };

        if ctx.stat.shutterstate() != running_state {
            let dir = if open { 1 } else { -1 };
            if let Some(node) = self.node.as_mut() {
                if let Err(e) = node.run_program(&Program::RoofSeek { dir }) {
                    out.send(-5, &format!("Shutter drive failed: {e}"));
                    self.active = None;
                    return;
                }
            }
            // The alignment seek may have consumed the deadline; the
            // shutter run gets its own.
            self.dome_to = ctx.stat.now.mjd + self.cfg().shutterto / SPD;
            ctx.stat.shutterstate = running_state as u8;
            out.send(2, &format!("Starting {verb}"));
            return;
        }

        if ctx.stat.now.mjd > self.dome_to {
            out.send(-5, &format!("{} timed out", title(verb)));
            self.d_stop();
            ctx.stat.shutterstate = ShutterState::Idle as u8;
            self.active = None;
            return;
        }

        let Some(line) = self.next_line() else { return };
        match parse_progress(&line) {
            ProgressLine::Invalid(text) => {
                warn!("bogus roofseek() string: '{text}'");
                self.fail_door(ctx, -1, verb, &text, out);
            }
            ProgressLine::Error(n, text) => {
                self.fail_door(ctx, n, verb, &text, out);
            }
            ProgressLine::Progress(n, text) => out.send(n, &text),
            ProgressLine::Success(_) => {
                out.send(0, &format!("{} complete", title(verb)));
                ctx.stat.shutterstate = if open {
                    ShutterState::Open as u8
                } else {
                    ShutterState::Closed as u8
                };
                self.active = None;
            }
        }
    }

    fn fail_door(&mut self, ctx: &mut Ctx, code: i32, verb: &str, text: &str, out: &mut dyn Respond) {
        self.d_stop();
        out.send(code, &format!("{} error: {text}", title(verb)));
        ctx.stat.shutterstate = ShutterState::Idle as u8;
        self.active = None;
    }

    // ─── Auto mode ──────────────────────────────────────────────────

    fn cmd_auto_on(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if !self.dhave(ctx) {
            out.send(0, "Ok, but no dome really");
        } else {
            ctx.stat.autodome = 1;
            out.send(0, "Auto dome on");
        }
    }

    fn cmd_auto_off(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if !self.dhave(ctx) {
            out.send(0, "Ok, but no dome really");
        } else {
            ctx.stat.autodome = 0;
            self.d_stop();
            out.send(0, "Auto dome off");
        }
    }

    /// Keep the dome within `DOMETOL` of the telescope's wall azimuth.
    fn d_auto(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        // The door must be open first.
        if self.shave(ctx) && ctx.stat.shutterstate() != ShutterState::Open {
            if ctx.stat.shutterstate() != ShutterState::Opening && self.active.is_none() {
                self.cmd_open(ctx, true, out);
            }
            // The open path clears the flag; auto mode keeps it.
            ctx.stat.autodome = 1;
            return;
        }

        if ctx.stat.domestate() != DomeState::Rotating {
            // Compare the last commanded target against the freshly
            // computed one; `dometaz` stays put until a reseek is due.
            let telaz = self.d_telaz(ctx);
            let diff = delra(ctx.stat.dometaz - telaz);
            if diff < self.cfg().dometol {
                self.d_stop();
                return; // already there
            }

            ctx.stat.dometaz = telaz;
            if self.active != Some(DomeFunc::SetAz) {
                self.d_stop();
                self.cmd_setaz(ctx, true, telaz, out);
            }
            ctx.stat.autodome = 1;
        }
    }

    /// The azimuth the dome wall should sit at for the current pointing.
    fn d_telaz(&mut self, ctx: &Ctx) -> f64 {
        let Some(geometry) = self.geometry else {
            return ctx.stat.domeaz;
        };
        let stat = &ctx.stat;

        let telstate = stat.telstate();
        let use_current = !matches!(telstate, TelState::Slewing | TelState::Hunting)
            || stat.jogging_ison != 0;

        let (ha, dec) = if use_current {
            (stat.caha, stat.cadec)
        } else {
            let lead = ha_range(stat.daha + (HA_LEAD_MINUTES / 60.0 * 15.0).to_radians());
            (lead, stat.dadec)
        };

        let (alt, az) = geometry.alt_az(ha, dec, stat.now.lat);
        if alt > ZENITH_HOLD_ALT {
            // Keep at current azimuth to prevent twirl at zenith.
            return stat.domeaz;
        }
        az
    }

    // ─── Home ───────────────────────────────────────────────────────

    fn cmd_home(&mut self, ctx: &mut Ctx, first: bool, out: &mut dyn Respond) {
        if !self.dhave(ctx) {
            out.send(0, "Ok, but really no dome to home");
            return;
        }

        if first {
            if let Some(node) = self.node.as_mut() {
                if let Err(e) = node.run_program(&Program::FindDomeHome) {
                    out.send(-5, &format!("Home failed: {e}"));
                    return;
                }
            }
            self.dome_to = ctx.stat.now.mjd + self.cfg().dometo / SPD;
            self.active = Some(DomeFunc::Home);
            ctx.stat.domestate = DomeState::Homing as u8;
            ctx.stat.autodome = 0;
            ctx.stat.dometaz = self.cfg().domezero;
            return;
        }

        if ctx.stat.now.mjd > self.dome_to {
            out.send(-5, "Home timed out");
            self.d_stop();
            ctx.stat.domestate = DomeState::Stopped as u8;
            self.active = None;
            return;
        }

        let Some(line) = self.next_line() else { return };
        match parse_progress(&line) {
            ProgressLine::Invalid(text) => {
                warn!("bogus finddomehome() string: '{text}'");
                self.fail_dome(ctx, -1, "Home", &text, out);
            }
            ProgressLine::Error(n, text) => self.fail_dome(ctx, n, "Home", &text, out),
            ProgressLine::Progress(n, text) => out.send(n, &text),
            ProgressLine::Success(_) => {
                out.send(0, "Home complete");
                ctx.stat.domestate = DomeState::Stopped as u8;
                ctx.stat.domeaz = self.cfg().domezero;
                self.active = None;
            }
        }
    }

    // ─── Azimuth seek ───────────────────────────────────────────────

    fn cmd_setaz(&mut self, ctx: &mut Ctx, first: bool, az: f64, out: &mut dyn Respond) {
        self.setaz_error = false;

        if !self.dhave(ctx) {
            out.send(-10, "No dome to turn");
            self.setaz_error = true;
            return;
        }

        if first {
            let taz = range(az, TAU);
            ctx.stat.dometaz = taz;
            self.start_seek(ctx, taz);
            ctx.stat.autodome = 0;
            self.active = Some(DomeFunc::SetAz);
            return;
        }

        self.step_setaz(ctx, out);
    }

    /// Issue the controller seek for a target azimuth.
    fn start_seek(&mut self, ctx: &mut Ctx, taz: f64) {
        let tol = self.cfg().dometol;
        self.start_seek_with_tol(ctx, taz, tol);
    }

    fn start_seek_with_tol(&mut self, ctx: &mut Ctx, taz: f64, tol_rad: f64) {
        let (domestep, domesign, dometol, domezero, dometo) = {
            let c = self.cfg();
            (c.domestep, c.domesign, tol_rad, c.domezero, c.dometo)
        };
        // Offset by the home azimuth so encoder zero lines up.
        let enc_az = taz - domezero;
        let tenc = (f64::from(domesign) * domestep * enc_az / TAU).round() as i64;
        let tol = (domestep * dometol / TAU).abs().round() as i64;
        if let Some(node) = self.node.as_mut() {
            let _ = node.run_program(&Program::DomeSeek {
                target_counts: tenc,
                tol_counts: tol,
            });
        }
        self.dome_to = ctx.stat.now.mjd + dometo / SPD;
        ctx.stat.domestate = DomeState::Rotating as u8;
    }

    fn step_setaz(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        self.step_setaz_inner(ctx, out);
        if self.active == Some(DomeFunc::SetAz) && ctx.stat.domestate() == DomeState::Stopped
        {
            self.active = None;
        }
    }

    /// Shared seek stepping, also used while aligning for shutter power.
    fn step_setaz_inner(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if ctx.stat.now.mjd > self.dome_to {
            out.send(-5, "Azimuth timed out");
            self.d_stop();
            ctx.stat.domestate = DomeState::Stopped as u8;
            self.setaz_error = true;
            self.aligning = false;
            if self.active == Some(DomeFunc::SetAz) {
                self.active = None;
            }
            return;
        }

        let Some(line) = self.next_line() else { return };
        match parse_progress(&line) {
            ProgressLine::Invalid(text) => {
                warn!("bogus domeseek() string: '{text}'");
                self.setaz_error = true;
                self.aligning = false;
                self.fail_dome(ctx, -1, "Az", &text, out);
            }
            ProgressLine::Error(n, text) => {
                self.setaz_error = true;
                self.aligning = false;
                self.fail_dome(ctx, n, "Az", &text, out);
            }
            ProgressLine::Progress(n, text) => out.send(n, &text),
            ProgressLine::Success(_) => {
                self.read_position(ctx);
                ctx.stat.domestate = DomeState::Stopped as u8;
                self.aligning = false;
                if self.active == Some(DomeFunc::SetAz) {
                    out.send(0, "Azimuth command complete");
                }
                self.setaz_error = false;
            }
        }
    }

    fn fail_dome(&mut self, ctx: &mut Ctx, code: i32, what: &str, text: &str, out: &mut dyn Respond) {
        self.d_stop();
        out.send(code, &format!("{what} error: {text}"));
        ctx.stat.domestate = DomeState::Stopped as u8;
        self.active = None;
    }

    // ─── Stop & jog ─────────────────────────────────────────────────

    fn cmd_stop(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if !self.dhave(ctx) && !self.shave(ctx) {
            out.send(0, "Ok, but nothing to stop really");
            return;
        }
        self.d_stop();
        ctx.stat.autodome = 0;
        self.aligning = false;
        self.active = None;
        ctx.stat.domestate = DomeState::Stopped as u8;
        ctx.stat.dometaz = ctx.stat.domeaz;
        if ctx.stat.shutterstate().is_moving() {
            ctx.stat.shutterstate = ShutterState::Idle as u8;
        }
        out.send(0, "Stop complete");
    }

    fn cmd_jog(&mut self, ctx: &mut Ctx, dir: char, out: &mut dyn Respond) {
        if !self.dhave(ctx) {
            out.send(-13, "No Dome to jog");
            return;
        }
        ctx.stat.autodome = 0;

        let sign = self.cfg().domesign;
        match dir {
            '+' => {
                out.send(5, "Paddle command CW");
                if let Some(node) = self.node.as_mut() {
                    let _ = node.run_program(&Program::DomeJog { dir: sign as i8 });
                }
                self.active = Some(DomeFunc::Jog);
                ctx.stat.domestate = DomeState::Rotating as u8;
            }
            '-' => {
                out.send(6, "Paddle command CCW");
                if let Some(node) = self.node.as_mut() {
                    let _ = node.run_program(&Program::DomeJog { dir: -sign as i8 });
                }
                self.active = Some(DomeFunc::Jog);
                ctx.stat.domestate = DomeState::Rotating as u8;
            }
            '0' => {
                out.send(7, "Paddle command stop");
                self.d_stop();
                self.active = None;
                ctx.stat.domestate = DomeState::Stopped as u8;
            }
            other => {
                out.send(-14, &format!("Bogus jog code: {other}"));
                self.active = None;
                self.cmd_stop(ctx, out);
            }
        }
    }

    /// Bring all dome motion to a halt at the controller.
    fn d_stop(&mut self) {
        if let Some(node) = self.node.as_mut() {
            let _ = node.interrupt();
            let _ = node.run_program(&Program::DomeStop);
            let _ = node.run_program(&Program::RoofSeek { dir: 0 });
        }
    }

    // ─── Position readout ───────────────────────────────────────────

    /// Refresh the published dome azimuth from the controller counter.
    pub(crate) fn read_position(&mut self, ctx: &mut Ctx) {
        let cfg = match self.cfg.as_ref() {
            Some(cfg) => cfg.clone(),
            None => return,
        };
        let space = if cfg.motoronly != 0 {
            CounterSpace::Motor
        } else {
            CounterSpace::Encoder
        };
        let Some(node) = self.node.as_mut() else { return };
        match node.read_pos(space) {
            Ok(pos) => {
                let pos = pos * i64::from(cfg.domesign);
                let az = TAU * pos as f64 / cfg.domestep + cfg.domezero;
                ctx.stat.domeaz = range(az, TAU);
            }
            Err(e) => warn!("dome position read failed: {e}"),
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let node = self.node.as_mut()?;
        if !node.is_ready() {
            return None;
        }
        node.read_line().ok().flatten()
    }
}

fn title(verb: &str) -> String {
    let mut s = verb.to_string();
    if let Some(first) = s.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    s
}

/// `j+`, `j-`, `j0`.
fn parse_dome_jog(msg: &str) -> Option<char> {
    let rest = msg.strip_prefix('j')?;
    rest.chars().next().filter(|c| "+-0".contains(*c))
}

/// Build the dome channel for the configured backend.
fn make_dome_node(virtual_mode: bool, cfg: &DomeCfg) -> MotorNode {
    if virtual_mode {
        MotorNode::Virtual(VirtualMotor::new(VirtualConfig {
            steps: cfg.domestep.max(1.0) as i64,
            sign: cfg.domesign,
            max_vel_cps: cfg.domestep / 20.0, // one revolution in ~20 s
            neglim_counts: i64::MIN / 4,
            poslim_counts: i64::MAX / 4,
            home_counts: 0,
        }))
    } else if cfg.domeaxis < 0 {
        // Negative axis selects the serial dome controller.
        MotorNode::Tty(TtyDome::new("/dev/ttyS1"))
    } else {
        MotorNode::Csi(CsiNode::new(cfg.domeaxis, "127.0.0.1", CSIMCD_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dome_jog_parse() {
        assert_eq!(parse_dome_jog("j+"), Some('+'));
        assert_eq!(parse_dome_jog("j-"), Some('-'));
        assert_eq!(parse_dome_jog("j0"), Some('0'));
        assert_eq!(parse_dome_jog("jN"), None);
        assert_eq!(parse_dome_jog("open"), None);
    }

    #[test]
    fn title_case() {
        assert_eq!(title("open"), "Open");
        assert_eq!(title("close"), "Close");
    }
}
