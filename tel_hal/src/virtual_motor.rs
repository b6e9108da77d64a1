//! Deterministic in-process motion controller.
//!
//! Substitutes for real controller nodes in `--virtual` runs and in tests.
//! Time only advances through [`VirtualMotor::service`], so a test that
//! steps the simulation with fixed increments sees identical motion every
//! run.
//!
//! The simulated axis has trapezoid-free first-order kinematics (velocity
//! clamps, no modelled acceleration lag), hardware limit switches that
//! stop motion at the travel ends, a home switch, a millisecond clock and
//! the tracking machinery (`Track`, `TrackingOffset`, offset rate). The
//! controller scripts the daemon invokes (`findhome`, `findlim`,
//! `domeseek`, `roofseek`, `finddomehome`, `cover`, `domejog`) are emulated
//! with the same progress-line protocol the real scripts use.

use crate::transport::{CounterSpace, MotorChannel, Program, TransportError};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Construction parameters for one virtual axis.
#[derive(Debug, Clone)]
pub struct VirtualConfig {
    /// Counts per revolution.
    pub steps: i64,
    /// Direction sense, +1/-1.
    pub sign: i32,
    /// Maximum speed, counts/s.
    pub max_vel_cps: f64,
    /// Negative limit switch position, counts.
    pub neglim_counts: i64,
    /// Positive limit switch position, counts.
    pub poslim_counts: i64,
    /// Home switch position, counts (in the power-up frame).
    pub home_counts: i64,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            steps: 1_000_000,
            sign: 1,
            max_vel_cps: 250_000.0,
            neglim_counts: -450_000,
            poslim_counts: 450_000,
            home_counts: 0,
        }
    }
}

/// A running controller-side script.
#[derive(Debug, Clone, PartialEq)]
enum Script {
    FindHome,
    FindLimits { phase: LimitPhase },
    DomeSeek { target: f64, tol: f64 },
    FindDomeHome,
    Roof { dir: i8 },
    Cover { open: bool },
    FilterSeek { slot: i64, ticks_left: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LimitPhase {
    Negative,
    Positive { neg_found: i64 },
}

/// One simulated controller node.
pub struct VirtualMotor {
    cfg: VirtualConfig,
    open: bool,

    /// Position counter, counts. Shared by both counter spaces.
    pos: f64,
    /// Active velocity, counts/s.
    vel: f64,
    /// Absolute position target, if seeking.
    target: Option<f64>,

    clock_ms: f64,
    timeout_ms: i64,

    /// Tracking profile playback.
    track: Option<TrackPath>,
    toffset: f64,
    toffset_rate: f64,

    script: Option<Script>,
    /// Shutter/roof travel, 0 = closed, 1 = open.
    roof_pos: f64,
    /// Mirror cover travel, 0 = closed, 1 = open.
    cover_pos: f64,

    outbox: VecDeque<String>,
    homed: bool,
}

#[derive(Debug, Clone)]
struct TrackPath {
    t0_ms: f64,
    step_ms: f64,
    points: Vec<i64>,
}

impl TrackPath {
    /// Profile position at controller time `t_ms`, linearly interpolated,
    /// clamped to the profile ends.
    fn position_at(&self, t_ms: f64) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let rel = (t_ms - self.t0_ms) / self.step_ms;
        if rel <= 0.0 {
            return self.points[0] as f64;
        }
        let last = self.points.len() - 1;
        if rel >= last as f64 {
            return self.points[last] as f64;
        }
        let i = rel.floor() as usize;
        let frac = rel - i as f64;
        let a = self.points[i] as f64;
        let b = self.points[i + 1] as f64;
        a + (b - a) * frac
    }
}

/// Roof and cover full-travel times in simulated seconds.
const ROOF_TRAVEL_S: f64 = 8.0;
const COVER_TRAVEL_S: f64 = 2.0;

impl VirtualMotor {
    pub fn new(cfg: VirtualConfig) -> Self {
        Self {
            cfg,
            open: false,
            pos: 0.0,
            vel: 0.0,
            target: None,
            clock_ms: 0.0,
            timeout_ms: 0,
            track: None,
            toffset: 0.0,
            toffset_rate: 0.0,
            script: None,
            roof_pos: 0.0,
            cover_pos: 0.0,
            outbox: VecDeque::new(),
            homed: false,
        }
    }

    /// Current position counter, counts (test hook).
    pub fn position(&self) -> i64 {
        self.pos.round() as i64
    }

    /// Place the axis somewhere (test hook).
    pub fn set_position(&mut self, counts: i64) {
        self.pos = counts as f64;
    }

    /// Force the controller clock (test hook for jitter scenarios).
    pub fn set_clock_ms(&mut self, ms: i64) {
        self.clock_ms = ms as f64;
    }

    /// Shutter travel fraction (test hook).
    pub fn roof_travel(&self) -> f64 {
        self.roof_pos
    }

    /// Whether a home search has completed since power-up.
    pub fn is_homed(&self) -> bool {
        self.homed
    }

    /// Advance the simulation.
    pub fn service(&mut self, dt: Duration) {
        if !self.open {
            return;
        }
        let dt_s = dt.as_secs_f64();
        self.clock_ms += dt_s * 1000.0;
        self.toffset += self.toffset_rate * dt_s;

        if let Some(script) = self.script.clone() {
            self.service_script(&script, dt_s);
            return;
        }

        if let Some(track) = &self.track {
            // Follow the profile; snap-chase with velocity clamp.
            let want = track.position_at(self.clock_ms) + self.toffset;
            self.chase(want, dt_s);
            return;
        }

        if let Some(target) = self.target {
            self.chase(target, dt_s);
            if (self.pos - target).abs() < 0.5 {
                self.pos = target;
                self.vel = 0.0;
                self.target = None;
            }
            return;
        }

        if self.vel != 0.0 {
            self.integrate(self.vel, dt_s);
        }
    }

    fn chase(&mut self, want: f64, dt_s: f64) {
        let err = want - self.pos;
        let max_step = self.cfg.max_vel_cps * dt_s;
        let step = err.clamp(-max_step, max_step);
        self.vel = if dt_s > 0.0 { step / dt_s } else { 0.0 };
        self.integrate_step(step);
        if (self.pos - want).abs() < 0.5 {
            self.vel = 0.0;
        }
    }

    fn integrate(&mut self, vel: f64, dt_s: f64) {
        let v = vel.clamp(-self.cfg.max_vel_cps, self.cfg.max_vel_cps);
        self.integrate_step(v * dt_s);
    }

    /// Move by `step` counts, stopping dead on a limit switch.
    fn integrate_step(&mut self, step: f64) {
        self.pos += step;
        if self.pos >= self.cfg.poslim_counts as f64 {
            self.pos = self.cfg.poslim_counts as f64;
            self.vel = 0.0;
        } else if self.pos <= self.cfg.neglim_counts as f64 {
            self.pos = self.cfg.neglim_counts as f64;
            self.vel = 0.0;
        }
    }

    fn service_script(&mut self, script: &Script, dt_s: f64) {
        match script {
            Script::FindHome => {
                let home = self.cfg.home_counts as f64;
                self.chase(home, dt_s);
                if (self.pos - home).abs() < 0.5 {
                    // Counter is re-zeroed at the switch.
                    self.pos = 0.0;
                    self.vel = 0.0;
                    self.homed = true;
                    self.script = None;
                    self.outbox.push_back("0: home found".into());
                }
            }
            Script::FindLimits { phase } => match phase {
                LimitPhase::Negative => {
                    let neg = self.cfg.neglim_counts as f64;
                    self.chase(neg, dt_s);
                    if (self.pos - neg).abs() < 0.5 {
                        let neg_found = self.pos.round() as i64;
                        self.outbox.push_back("1: negative limit found".into());
                        self.script = Some(Script::FindLimits {
                            phase: LimitPhase::Positive { neg_found },
                        });
                    }
                }
                LimitPhase::Positive { neg_found } => {
                    let pos = self.cfg.poslim_counts as f64;
                    self.chase(pos, dt_s);
                    if (self.pos - pos).abs() < 0.5 {
                        let msg = format!(
                            "0: neglim={} poslim={}",
                            neg_found,
                            self.pos.round() as i64
                        );
                        self.script = None;
                        self.vel = 0.0;
                        self.outbox.push_back(msg);
                    }
                }
            },
            Script::DomeSeek { target, tol } => {
                self.chase_wrapped(*target, dt_s);
                if (self.pos - target).abs() <= tol.max(0.5) {
                    self.vel = 0.0;
                    self.script = None;
                    self.outbox.push_back("0: azimuth reached".into());
                } else if self.timed_out() {
                    self.vel = 0.0;
                    self.script = None;
                    self.outbox.push_back("-1: dome seek timed out".into());
                }
            }
            Script::FindDomeHome => {
                self.chase_wrapped(self.cfg.home_counts as f64, dt_s);
                if (self.pos - self.cfg.home_counts as f64).abs() < 0.5 {
                    self.pos = 0.0;
                    self.vel = 0.0;
                    self.homed = true;
                    self.script = None;
                    self.outbox.push_back("0: dome home found".into());
                }
            }
            Script::Roof { dir } => {
                let rate = dt_s / ROOF_TRAVEL_S;
                match dir {
                    1 => {
                        self.roof_pos = (self.roof_pos + rate).min(1.0);
                        if self.roof_pos >= 1.0 {
                            self.script = None;
                            self.outbox.push_back("0: open".into());
                        }
                    }
                    -1 => {
                        self.roof_pos = (self.roof_pos - rate).max(0.0);
                        if self.roof_pos <= 0.0 {
                            self.script = None;
                            self.outbox.push_back("0: closed".into());
                        }
                    }
                    _ => {
                        self.script = None;
                        self.outbox.push_back("0: stopped".into());
                    }
                }
            }
            Script::FilterSeek { slot, ticks_left } => {
                if *ticks_left == 0 {
                    self.pos = *slot as f64;
                    self.script = None;
                    self.outbox.push_back("0: filter in place".into());
                } else {
                    self.script = Some(Script::FilterSeek {
                        slot: *slot,
                        ticks_left: ticks_left - 1,
                    });
                }
            }
            Script::Cover { open } => {
                let rate = dt_s / COVER_TRAVEL_S;
                if *open {
                    self.cover_pos = (self.cover_pos + rate).min(1.0);
                    if self.cover_pos >= 1.0 {
                        self.script = None;
                        self.outbox.push_back("0: cover open".into());
                    }
                } else {
                    self.cover_pos = (self.cover_pos - rate).max(0.0);
                    if self.cover_pos <= 0.0 {
                        self.script = None;
                        self.outbox.push_back("0: cover closed".into());
                    }
                }
            }
        }
    }

    /// Dome rotation is continuous: no limit switches on the ring.
    fn chase_wrapped(&mut self, want: f64, dt_s: f64) {
        let steps = self.cfg.steps as f64;
        let mut err = (want - self.pos) % steps;
        if err > steps / 2.0 {
            err -= steps;
        } else if err < -steps / 2.0 {
            err += steps;
        }
        let max_step = self.cfg.max_vel_cps * dt_s;
        let step = err.clamp(-max_step, max_step);
        self.pos += step;
        self.vel = if dt_s > 0.0 { step / dt_s } else { 0.0 };
    }

    fn timed_out(&self) -> bool {
        self.timeout_ms > 0 && self.clock_ms > self.timeout_ms as f64
    }
}

impl MotorChannel for VirtualMotor {
    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_pos(&mut self, _space: CounterSpace, counts: i64) -> Result<(), TransportError> {
        self.require_open()?;
        self.track = None;
        self.script = None;
        self.target = Some(counts as f64);
        Ok(())
    }

    fn set_vel(&mut self, counts_per_s: i64) -> Result<(), TransportError> {
        self.require_open()?;
        self.track = None;
        self.script = None;
        self.target = None;
        self.vel = counts_per_s as f64;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.require_open()?;
        self.target = None;
        self.track = None;
        self.script = None;
        self.vel = 0.0;
        self.toffset_rate = 0.0;
        Ok(())
    }

    fn read_pos(&mut self, _space: CounterSpace) -> Result<i64, TransportError> {
        self.require_open()?;
        Ok(self.pos.round() as i64)
    }

    fn read_vel(&mut self) -> Result<i64, TransportError> {
        self.require_open()?;
        Ok(self.vel.round() as i64)
    }

    fn read_clock(&mut self) -> Result<i64, TransportError> {
        self.require_open()?;
        Ok(self.clock_ms.round() as i64)
    }

    fn read_working(&mut self) -> Result<bool, TransportError> {
        self.require_open()?;
        Ok(self.target.is_some() || self.script.is_some() || self.vel != 0.0)
    }

    fn run_program(&mut self, prog: &Program) -> Result<(), TransportError> {
        self.require_open()?;
        debug!(wire = %prog.wire(), "virtual program");
        match prog {
            Program::SetTargetPos { space, counts } => return self.set_pos(*space, *counts),
            Program::SetVelocity { counts_per_s } => return self.set_vel(*counts_per_s),
            Program::Track {
                t0_ms,
                step_ms,
                points,
                ..
            } => {
                self.target = None;
                self.script = None;
                self.track = Some(TrackPath {
                    t0_ms: *t0_ms as f64,
                    step_ms: (*step_ms).max(1) as f64,
                    points: points.clone(),
                });
            }
            Program::ZeroClock => self.clock_ms = 0.0,
            Program::SetTimeout { ms } => self.timeout_ms = *ms,
            Program::TrackingOffset { counts } => {
                self.toffset_rate = 0.0;
                self.toffset = *counts as f64;
            }
            Program::TrackingOffsetRate { counts_per_s } => {
                self.toffset_rate = *counts_per_s as f64;
            }
            Program::FindHome { .. } => {
                self.homed = false;
                self.target = None;
                self.track = None;
                self.script = Some(Script::FindHome);
            }
            Program::FindLimits => {
                self.target = None;
                self.track = None;
                self.script = Some(Script::FindLimits {
                    phase: LimitPhase::Negative,
                });
            }
            Program::SetupAxis {
                steps,
                sign,
                max_vel_cps,
                ..
            } => {
                self.cfg.steps = *steps;
                self.cfg.sign = *sign;
                self.cfg.max_vel_cps = *max_vel_cps as f64;
            }
            Program::DomeParams { steps, sign, .. } => {
                self.cfg.steps = *steps as i64;
                self.cfg.sign = *sign;
            }
            Program::DomeSeek {
                target_counts,
                tol_counts,
            } => {
                self.script = Some(Script::DomeSeek {
                    target: *target_counts as f64,
                    tol: *tol_counts as f64,
                });
            }
            Program::RoofSeek { dir } => {
                if *dir == 0 {
                    if matches!(self.script, Some(Script::Roof { .. })) {
                        self.script = None;
                    }
                } else {
                    self.script = Some(Script::Roof { dir: *dir });
                }
            }
            Program::FindDomeHome => {
                self.script = Some(Script::FindDomeHome);
            }
            Program::DomeJog { dir } => {
                self.script = None;
                self.vel = f64::from(*dir as i32) * self.cfg.max_vel_cps;
            }
            Program::DomeStop => {
                self.script = None;
                self.vel = 0.0;
            }
            Program::Cover { open } => {
                self.script = Some(Script::Cover { open: *open });
            }
            Program::FilterSelect { slot } => {
                self.script = Some(Script::FilterSeek {
                    slot: *slot,
                    ticks_left: 3,
                });
            }
            Program::FilterHome => {
                self.homed = false;
                self.script = Some(Script::FindHome);
            }
        }
        Ok(())
    }

    fn is_ready(&mut self) -> bool {
        !self.outbox.is_empty()
    }

    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        self.require_open()?;
        Ok(self.outbox.pop_front())
    }

    fn interrupt(&mut self) -> Result<(), TransportError> {
        self.require_open()?;
        self.script = None;
        self.toffset_rate = 0.0;
        self.outbox.clear();
        Ok(())
    }
}

impl VirtualMotor {
    fn require_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{parse_progress, ProgressLine};

    fn open_motor() -> VirtualMotor {
        let mut m = VirtualMotor::new(VirtualConfig::default());
        m.open().unwrap();
        m
    }

    fn run_until_line(m: &mut VirtualMotor, max_steps: usize) -> Option<String> {
        for _ in 0..max_steps {
            m.service(Duration::from_millis(100));
            if let Some(line) = m.read_line().unwrap() {
                return Some(line);
            }
        }
        None
    }

    #[test]
    fn position_seek_reaches_target() {
        let mut m = open_motor();
        m.set_pos(CounterSpace::Encoder, 50_000).unwrap();
        for _ in 0..100 {
            m.service(Duration::from_millis(100));
        }
        assert_eq!(m.position(), 50_000);
        assert_eq!(m.read_vel().unwrap(), 0);
        assert!(!m.read_working().unwrap());
    }

    #[test]
    fn velocity_run_stops_at_limit_switch() {
        let mut m = open_motor();
        m.set_vel(300_000).unwrap();
        for _ in 0..100 {
            m.service(Duration::from_millis(100));
        }
        assert_eq!(m.position(), 450_000); // clamped at poslim
        assert_eq!(m.read_vel().unwrap(), 0);
    }

    #[test]
    fn findhome_zeroes_counter_and_reports() {
        let mut m = open_motor();
        m.set_position(120_000);
        m.run_program(&Program::FindHome {
            homelow: true,
            posside: false,
        })
        .unwrap();
        let line = run_until_line(&mut m, 200).expect("no completion line");
        assert_eq!(parse_progress(&line), ProgressLine::Success("home found".into()));
        assert_eq!(m.position(), 0);
    }

    #[test]
    fn findlim_reports_both_limits() {
        let mut m = open_motor();
        m.run_program(&Program::FindLimits).unwrap();

        let first = run_until_line(&mut m, 500).expect("no negative-limit line");
        assert!(matches!(parse_progress(&first), ProgressLine::Progress(1, _)));

        let done = run_until_line(&mut m, 500).expect("no completion line");
        match parse_progress(&done) {
            ProgressLine::Success(text) => {
                assert!(text.contains("neglim=-450000"), "{text}");
                assert!(text.contains("poslim=450000"), "{text}");
            }
            other => panic!("unexpected line {other:?}"),
        }
    }

    #[test]
    fn clock_zero_and_advance() {
        let mut m = open_motor();
        m.service(Duration::from_millis(1500));
        assert_eq!(m.read_clock().unwrap(), 1500);
        m.run_program(&Program::ZeroClock).unwrap();
        assert_eq!(m.read_clock().unwrap(), 0);
    }

    #[test]
    fn track_playback_follows_profile() {
        let mut m = open_motor();
        m.run_program(&Program::Track {
            space: CounterSpace::Encoder,
            t0_ms: 0,
            step_ms: 1000,
            points: vec![0, 1000, 2000, 3000],
        })
        .unwrap();
        // After 2 simulated seconds the profile position is 2000.
        for _ in 0..20 {
            m.service(Duration::from_millis(100));
        }
        assert!((m.position() - 2000).abs() <= 2, "pos {}", m.position());
    }

    #[test]
    fn tracking_offset_shifts_playback() {
        let mut m = open_motor();
        m.run_program(&Program::Track {
            space: CounterSpace::Encoder,
            t0_ms: 0,
            step_ms: 1000,
            points: vec![500, 500, 500],
        })
        .unwrap();
        m.run_program(&Program::TrackingOffset { counts: 250 }).unwrap();
        for _ in 0..15 {
            m.service(Duration::from_millis(100));
        }
        assert!((m.position() - 750).abs() <= 2);
    }

    #[test]
    fn offset_rate_accumulates() {
        let mut m = open_motor();
        m.run_program(&Program::Track {
            space: CounterSpace::Encoder,
            t0_ms: 0,
            step_ms: 1000,
            points: vec![0, 0, 0, 0, 0],
        })
        .unwrap();
        m.run_program(&Program::TrackingOffsetRate { counts_per_s: 100 })
            .unwrap();
        for _ in 0..20 {
            m.service(Duration::from_millis(100));
        }
        // ~2 s at 100 counts/s
        assert!((m.position() - 200).abs() <= 5, "pos {}", m.position());
        m.interrupt().unwrap();
        let frozen = m.position();
        for _ in 0..5 {
            m.service(Duration::from_millis(100));
        }
        assert!((m.position() - frozen).abs() <= 1);
    }

    #[test]
    fn dome_seek_and_roof_scripts() {
        let mut m = open_motor();
        m.run_program(&Program::DomeSeek {
            target_counts: 40_000,
            tol_counts: 50,
        })
        .unwrap();
        let line = run_until_line(&mut m, 200).expect("no domeseek line");
        assert_eq!(
            parse_progress(&line),
            ProgressLine::Success("azimuth reached".into())
        );
        assert!((m.position() - 40_000).abs() <= 50);

        m.run_program(&Program::RoofSeek { dir: 1 }).unwrap();
        let line = run_until_line(&mut m, 200).expect("roof never opened");
        assert_eq!(parse_progress(&line), ProgressLine::Success("open".into()));
        assert!((m.roof_travel() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dome_seek_timeout_reports_error() {
        let mut m = open_motor();
        m.run_program(&Program::ZeroClock).unwrap();
        m.run_program(&Program::SetTimeout { ms: 300 }).unwrap();
        // Target is far, and the timeout is far shorter than travel time.
        m.run_program(&Program::DomeSeek {
            target_counts: 400_000,
            tol_counts: 10,
        })
        .unwrap();
        let line = run_until_line(&mut m, 200).expect("no timeout line");
        assert!(matches!(parse_progress(&line), ProgressLine::Error(-1, _)));
    }

    #[test]
    fn cover_script_runs_both_ways() {
        let mut m = open_motor();
        m.run_program(&Program::Cover { open: true }).unwrap();
        let line = run_until_line(&mut m, 100).unwrap();
        assert_eq!(parse_progress(&line), ProgressLine::Success("cover open".into()));
        m.run_program(&Program::Cover { open: false }).unwrap();
        let line = run_until_line(&mut m, 100).unwrap();
        assert_eq!(
            parse_progress(&line),
            ProgressLine::Success("cover closed".into())
        );
    }

    #[test]
    fn closed_channel_refuses_io() {
        let mut m = VirtualMotor::new(VirtualConfig::default());
        assert!(matches!(
            m.read_pos(CounterSpace::Encoder),
            Err(TransportError::NotOpen)
        ));
    }
}
