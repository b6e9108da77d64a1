//! Filter wheel state machine.
//!
//! One uniform driver interface over the two wheel backends: a scripted
//! controller node (hardware or virtual) and the FLI vendor wheel. The
//! FLI wheel is re-homed after a fixed number of selections so slot
//! positioning cannot drift.

use crate::ctx::Ctx;
use crate::Respond;
use tel_common::config::{ConfigLoader, FilterCfg};
use tel_common::consts::{FLI_REHOME_AFTER_MOVES, SPD};
use tel_common::state::FilterState;
use tel_hal::csi::{CsiNode, CSIMCD_PORT};
use tel_hal::fli::{FliFilterWheel, FliHandle, SimFli};
use tel_hal::virtual_motor::{VirtualConfig, VirtualMotor};
use tel_hal::{parse_progress, MotorChannel, MotorNode, Program, ProgressLine};
use tracing::{info, warn};

/// A wheel selection must land within this long, s.
const FILTER_TIMEOUT: f64 = 60.0;

/// Factory for vendor wheel handles; mirrors the focuser arrangement.
pub type FliWheelFactory = Box<dyn FnMut() -> Box<dyn FliHandle>>;

enum FilterDriver {
    Scripted(MotorNode),
    Fli(FliFilterWheel<Box<dyn FliHandle>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterFunc {
    Home,
    Select,
}

/// The filter-wheel device.
pub struct FilterDevice {
    driver: Option<FilterDriver>,
    active: Option<FilterFunc>,
    filters: Option<FilterCfg>,

    /// Slot and name character of the selection in flight.
    pending_slot: i64,
    pending_char: char,
    /// A rehome pre-empted the selection; reissue once settled.
    reissue_select: bool,
    deadline_mjd: f64,

    /// Use the FLI vendor wheel instead of a scripted node.
    use_fli: bool,
    fli_factory: FliWheelFactory,
}

impl FilterDevice {
    pub fn new(use_fli: bool) -> Self {
        Self {
            driver: None,
            active: None,
            filters: None,
            pending_slot: 0,
            pending_char: '\0',
            reissue_select: false,
            deadline_mjd: 0.0,
            use_fli,
            fli_factory: Box::new(|| Box::new(SimFli::new(0))),
        }
    }

    /// Install the vendor-device factory (real SDK handles).
    pub fn set_fli_factory(&mut self, factory: FliWheelFactory) {
        self.fli_factory = factory;
    }

    pub fn service(&mut self, dt: std::time::Duration) {
        if let Some(FilterDriver::Scripted(node)) = self.driver.as_mut() {
            node.service(dt);
        }
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    pub fn handle_msg(&mut self, ctx: &mut Ctx, msg: &str, out: &mut dyn Respond) {
        let lower = msg.to_ascii_lowercase();

        if lower.starts_with("reset") {
            self.cmd_reset(ctx, out);
            return;
        }

        if self.driver.is_none() || self.filters.is_none() {
            out.send(0, "Ok, but filter wheel not really installed");
            return;
        }

        if lower.starts_with("stop") {
            self.active = None;
            ctx.stat.filterstate = FilterState::Idle as u8;
            out.send(0, "Stop complete");
        } else if lower.starts_with("home") {
            self.cmd_home(ctx, out);
        } else if let Some(ch) = msg.trim().chars().next() {
            self.cmd_select(ctx, ch, out);
        } else {
            out.send(-1, "Empty filter command");
        }
    }

    pub fn poll(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        match self.active {
            Some(FilterFunc::Home) => self.step_home(ctx, out),
            Some(FilterFunc::Select) => self.step_select(ctx, out),
            None => {}
        }
    }

    // ─── Reset ──────────────────────────────────────────────────────

    fn cmd_reset(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        let filters = match FilterCfg::load(&ctx.cfg_path("filter.cfg"))
            .and_then(|f| f.validate().map(|()| f))
        {
            Ok(f) => f,
            Err(e) => {
                warn!("filter.cfg unusable: {e}");
                self.filters = None;
                self.driver = None;
                ctx.stat.filterstate = FilterState::Absent as u8;
                out.send(0, "Not installed");
                return;
            }
        };

        if self.use_fli {
            let wheel =
                FliFilterWheel::new((self.fli_factory)(), FLI_REHOME_AFTER_MOVES);
            self.driver = Some(FilterDriver::Fli(wheel));
        } else {
            let mut node = make_wheel_node(ctx.virtual_mode);
            if let Err(e) = node.open() {
                out.send(-1, &format!("Filter channel open failed: {e}"));
                return;
            }
            self.driver = Some(FilterDriver::Scripted(node));
        }

        // Assume the first configured filter until a selection says
        // otherwise.
        if ctx.stat.filter == 0 {
            ctx.stat.filter = filters.filters[0]
                .name
                .chars()
                .next()
                .unwrap_or('C') as u8;
        }
        ctx.stat.filterstate = FilterState::Idle as u8;
        info!(filters = filters.filters.len(), "filter wheel ready");
        self.filters = Some(filters);
        self.active = None;
        out.send(0, "Reset complete");
    }

    // ─── Home ───────────────────────────────────────────────────────

    fn cmd_home(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        let started = match self.driver.as_mut() {
            Some(FilterDriver::Scripted(node)) => {
                node.run_program(&Program::FilterHome).is_ok()
            }
            Some(FilterDriver::Fli(wheel)) => wheel.home().is_ok(),
            None => false,
        };
        if !started {
            out.send(-1, "Filter home failed to start");
            return;
        }
        self.deadline_mjd = ctx.stat.now.mjd + FILTER_TIMEOUT / SPD;
        self.active = Some(FilterFunc::Home);
        ctx.stat.filterstate = FilterState::Moving as u8;
    }

    fn step_home(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if ctx.stat.now.mjd > self.deadline_mjd {
            out.send(-5, "Filter home timed out");
            self.active = None;
            ctx.stat.filterstate = FilterState::Idle as u8;
            return;
        }

        match self.driver.as_mut() {
            Some(FilterDriver::Scripted(node)) => {
                if !node.is_ready() {
                    return;
                }
                let Ok(Some(line)) = node.read_line() else { return };
                match parse_progress(&line) {
                    ProgressLine::Progress(n, text) => out.send(n, &text),
                    ProgressLine::Success(_) => {
                        self.active = None;
                        ctx.stat.filterstate = FilterState::Idle as u8;
                        out.send(0, "Filter home complete");
                    }
                    ProgressLine::Error(n, text) => {
                        self.active = None;
                        ctx.stat.filterstate = FilterState::Idle as u8;
                        out.send(n, &format!("Filter home error: {text}"));
                    }
                    ProgressLine::Invalid(text) => {
                        warn!("bogus filthome() string: '{text}'");
                        self.active = None;
                        ctx.stat.filterstate = FilterState::Idle as u8;
                        out.send(-1, "Filter home error: bogus controller reply");
                    }
                }
            }
            Some(FilterDriver::Fli(wheel)) => match wheel.busy() {
                Ok(true) => {}
                Ok(false) => {
                    self.active = None;
                    ctx.stat.filterstate = FilterState::Idle as u8;
                    out.send(0, "Filter home complete");
                }
                Err(e) => {
                    self.active = None;
                    ctx.stat.filterstate = FilterState::Idle as u8;
                    out.send(-1, &format!("Filter home error: {e}"));
                }
            },
            None => self.active = None,
        }
    }

    // ─── Select ─────────────────────────────────────────────────────

    fn cmd_select(&mut self, ctx: &mut Ctx, ch: char, out: &mut dyn Respond) {
        let Some(slot) = self.filters.as_ref().and_then(|f| f.position_of(ch)) else {
            out.send(-1, &format!("No filter named {ch}"));
            return;
        };

        self.pending_slot = slot as i64;
        self.pending_char = ch.to_ascii_uppercase();
        self.reissue_select = false;
        self.deadline_mjd = ctx.stat.now.mjd + FILTER_TIMEOUT / SPD;

        if !self.issue_select(out) {
            return;
        }
        self.active = Some(FilterFunc::Select);
        ctx.stat.filterstate = FilterState::Moving as u8;
        out.send(1, &format!("Selecting filter {}", self.pending_char));
    }

    /// Push the selection to the driver. False on a hard failure.
    fn issue_select(&mut self, out: &mut dyn Respond) -> bool {
        let slot = self.pending_slot;
        match self.driver.as_mut() {
            Some(FilterDriver::Scripted(node)) => {
                if let Err(e) = node.run_program(&Program::FilterSelect { slot }) {
                    out.send(-1, &format!("Filter select failed: {e}"));
                    return false;
                }
                true
            }
            Some(FilterDriver::Fli(wheel)) => match wheel.select(slot) {
                Ok(rehomed) => {
                    self.reissue_select = rehomed;
                    true
                }
                Err(e) => {
                    out.send(-1, &format!("Filter select failed: {e}"));
                    false
                }
            },
            None => false,
        }
    }

    fn step_select(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        if ctx.stat.now.mjd > self.deadline_mjd {
            out.send(-5, "Filter selection timed out");
            self.active = None;
            ctx.stat.filterstate = FilterState::Idle as u8;
            return;
        }

        match self.driver.as_mut() {
            Some(FilterDriver::Scripted(node)) => {
                if !node.is_ready() {
                    return;
                }
                let Ok(Some(line)) = node.read_line() else { return };
                match parse_progress(&line) {
                    ProgressLine::Progress(n, text) => out.send(n, &text),
                    ProgressLine::Success(_) => self.finish_select(ctx, out),
                    ProgressLine::Error(n, text) => {
                        self.active = None;
                        ctx.stat.filterstate = FilterState::Idle as u8;
                        out.send(n, &format!("Filter error: {text}"));
                    }
                    ProgressLine::Invalid(text) => {
                        warn!("bogus filtseek() string: '{text}'");
                        self.active = None;
                        ctx.stat.filterstate = FilterState::Idle as u8;
                        out.send(-1, "Filter error: bogus controller reply");
                    }
                }
            }
            Some(FilterDriver::Fli(wheel)) => match wheel.busy() {
                Ok(true) => {}
                Ok(false) => {
                    if self.reissue_select {
                        // The drift rehome is done; run the real selection.
                        out.send(2, "Rehoming complete");
                        let _ = self.issue_select(out);
                        self.reissue_select = false;
                    } else {
                        self.finish_select(ctx, out);
                    }
                }
                Err(e) => {
                    self.active = None;
                    ctx.stat.filterstate = FilterState::Idle as u8;
                    out.send(-1, &format!("Filter error: {e}"));
                }
            },
            None => self.active = None,
        }
    }

    fn finish_select(&mut self, ctx: &mut Ctx, out: &mut dyn Respond) {
        ctx.stat.filter = self.pending_char as u8;
        ctx.stat.filterstate = FilterState::Idle as u8;
        self.active = None;
        let name = self
            .filters
            .as_ref()
            .and_then(|f| f.find(self.pending_char))
            .map(|f| f.name.clone())
            .unwrap_or_else(|| self.pending_char.to_string());
        out.send(0, &format!("Filter {name} in position"));
    }
}

/// Build the scripted wheel channel.
fn make_wheel_node(virtual_mode: bool) -> MotorNode {
    if virtual_mode {
        MotorNode::Virtual(VirtualMotor::new(VirtualConfig {
            steps: 8,
            sign: 1,
            max_vel_cps: 10.0,
            neglim_counts: -1,
            poslim_counts: 8,
            home_counts: 0,
        }))
    } else {
        // The scripted wheel rides the declination node's script engine
        // by convention; dedicated installations change the address here.
        MotorNode::Csi(CsiNode::new(8, "127.0.0.1", CSIMCD_PORT))
    }
}
