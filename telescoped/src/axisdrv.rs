//! Per-axis homing and limit-discovery sequences, plus the axis health
//! checks every motion loop runs.
//!
//! The sequences are cooperative: `tick()` once per poll, never blocking.
//! The controller runs the real search; the daemon consumes its progress
//! lines and folds the outcome into the published `MotorInfo`.

use crate::error::DeviceError;
use crate::Respond;
use tel_common::motor::MotorInfo;
use tel_hal::{parse_progress, CounterSpace, MotorChannel, Program, ProgressLine};
use tracing::debug;

use tel_common::consts::SPD;

/// Outcome of one sequence tick.
#[derive(Debug, Clone, PartialEq)]
pub enum AxisStep {
    InProgress,
    Done,
    Failed(String),
}

/// Homing search timeout, s.
pub const HOME_TIMEOUT: f64 = 120.0;
/// Limit search covers both travel ends.
pub const LIMIT_TIMEOUT: f64 = 300.0;

// ─── Homing ─────────────────────────────────────────────────────────

/// One axis's home-switch search.
#[derive(Debug)]
pub struct HomeSeq {
    deadline_mjd: f64,
}

impl HomeSeq {
    /// Kick off the controller-side search.
    pub fn start(
        mip: &mut MotorInfo,
        node: &mut dyn MotorChannel,
        now_mjd: f64,
    ) -> Result<Self, DeviceError> {
        node.run_program(&Program::FindHome {
            homelow: mip.homelow != 0,
            posside: mip.posside != 0,
        })?;
        mip.ishomed = 0;
        mip.homing = 1;
        debug!(axis = mip.axis, "homing started");
        Ok(Self {
            deadline_mjd: now_mjd + HOME_TIMEOUT / SPD,
        })
    }

    /// Advance the search one poll.
    pub fn tick(
        &mut self,
        mip: &mut MotorInfo,
        node: &mut dyn MotorChannel,
        now_mjd: f64,
        out: &mut dyn Respond,
    ) -> AxisStep {
        if now_mjd > self.deadline_mjd {
            mip.homing = 0;
            return AxisStep::Failed(format!("Axis {}: home search timed out", mip.axis));
        }

        if !node.is_ready() {
            return AxisStep::InProgress;
        }
        let line = match node.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return AxisStep::InProgress,
            Err(e) => {
                mip.homing = 0;
                return AxisStep::Failed(format!("Axis {}: {e}", mip.axis));
            }
        };

        match parse_progress(&line) {
            ProgressLine::Progress(n, text) => {
                out.send(n, &format!("Axis {}: {text}", mip.axis));
                AxisStep::InProgress
            }
            ProgressLine::Success(_) => {
                // Counter was zeroed at the switch.
                mip.raw = 0;
                mip.cpos = 0.0;
                mip.cvel = 0.0;
                mip.homing = 0;
                mip.ishomed = 1;
                AxisStep::Done
            }
            ProgressLine::Error(n, text) => {
                mip.homing = 0;
                AxisStep::Failed(format!("Axis {}: home error {n}: {text}", mip.axis))
            }
            ProgressLine::Invalid(text) => {
                mip.homing = 0;
                AxisStep::Failed(format!("Axis {}: bogus home reply '{text}'", mip.axis))
            }
        }
    }
}

// ─── Limit discovery ────────────────────────────────────────────────

/// Limits discovered by a completed search, rad from home.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoundLimits {
    pub neglim: f64,
    pub poslim: f64,
}

/// One axis's travel-limit discovery.
#[derive(Debug)]
pub struct LimitSeq {
    deadline_mjd: f64,
}

impl LimitSeq {
    pub fn start(
        mip: &mut MotorInfo,
        node: &mut dyn MotorChannel,
        now_mjd: f64,
    ) -> Result<Self, DeviceError> {
        node.run_program(&Program::FindLimits)?;
        mip.limiting = 1;
        debug!(axis = mip.axis, "limit search started");
        Ok(Self {
            deadline_mjd: now_mjd + LIMIT_TIMEOUT / SPD,
        })
    }

    /// Advance the search; `Done` leaves the limits in `mip` and returns
    /// them for persistence.
    pub fn tick(
        &mut self,
        mip: &mut MotorInfo,
        node: &mut dyn MotorChannel,
        now_mjd: f64,
        out: &mut dyn Respond,
    ) -> AxisStep {
        if now_mjd > self.deadline_mjd {
            mip.limiting = 0;
            return AxisStep::Failed(format!("Axis {}: limit search timed out", mip.axis));
        }

        if !node.is_ready() {
            return AxisStep::InProgress;
        }
        let line = match node.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return AxisStep::InProgress,
            Err(e) => {
                mip.limiting = 0;
                return AxisStep::Failed(format!("Axis {}: {e}", mip.axis));
            }
        };

        match parse_progress(&line) {
            ProgressLine::Progress(n, text) => {
                out.send(n, &format!("Axis {}: {text}", mip.axis));
                AxisStep::InProgress
            }
            ProgressLine::Success(text) => match Self::crack_limits(&text) {
                Some((neg_counts, pos_counts)) => {
                    let a = mip.counts_to_pos(neg_counts as f64);
                    let b = mip.counts_to_pos(pos_counts as f64);
                    mip.neglim = a.min(b);
                    mip.poslim = a.max(b);
                    mip.limiting = 0;
                    mip.ishomed = 1;
                    mip.cvel = 0.0;
                    AxisStep::Done
                }
                None => {
                    mip.limiting = 0;
                    AxisStep::Failed(format!(
                        "Axis {}: limit reply carries no limits: '{text}'",
                        mip.axis
                    ))
                }
            },
            ProgressLine::Error(n, text) => {
                mip.limiting = 0;
                AxisStep::Failed(format!("Axis {}: limit error {n}: {text}", mip.axis))
            }
            ProgressLine::Invalid(text) => {
                mip.limiting = 0;
                AxisStep::Failed(format!("Axis {}: bogus limit reply '{text}'", mip.axis))
            }
        }
    }

    /// Pull `neglim=<counts> poslim=<counts>` out of the completion text.
    fn crack_limits(text: &str) -> Option<(i64, i64)> {
        let mut neg = None;
        let mut pos = None;
        for tok in text.split_whitespace() {
            if let Some(v) = tok.strip_prefix("neglim=") {
                neg = v.parse().ok();
            } else if let Some(v) = tok.strip_prefix("poslim=") {
                pos = v.parse().ok();
            }
        }
        Some((neg?, pos?))
    }
}

// ─── Health checks ──────────────────────────────────────────────────

/// Refuse motion on an unhomed axis.
pub fn axis_homed_check(mip: &MotorInfo) -> Result<(), DeviceError> {
    if mip.have() && !mip.ishomed() {
        Err(DeviceError::NotHomed(mip.axis))
    } else {
        Ok(())
    }
}

/// Fault when the position has run past a discovered travel limit.
pub fn axis_limit_check(mip: &MotorInfo) -> Result<(), String> {
    if !mip.have() || !mip.ishomed() {
        return Ok(());
    }
    if mip.cpos >= mip.poslim {
        Err(format!("Axis {}: hit positive limit", mip.axis))
    } else if mip.cpos <= mip.neglim {
        Err(format!("Axis {}: hit negative limit", mip.axis))
    } else {
        Ok(())
    }
}

/// Stuck-axis watchdog: a commanded velocity must move the counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct MotionCheck {
    last_raw: i64,
    stale_polls: u32,
}

/// Polls of commanded motion with a frozen counter before declaring a
/// stuck axis (a few seconds at the main loop rate).
const STUCK_POLLS: u32 = 50;

/// Within this of the desired position a frozen counter is arrival, not
/// a stall.
const ARRIVED_TOL: f64 = 2e-4;

impl MotionCheck {
    pub fn reset(&mut self) {
        self.stale_polls = 0;
    }

    /// Call once per poll with the motor's current state.
    pub fn check(&mut self, mip: &MotorInfo) -> Result<(), String> {
        let arrived = tel_astro::angles::delra(mip.cpos - mip.dpos) < ARRIVED_TOL;
        if !mip.have() || mip.cvel == 0.0 || arrived {
            self.last_raw = mip.raw;
            self.stale_polls = 0;
            return Ok(());
        }
        if mip.raw == self.last_raw {
            self.stale_polls += 1;
            if self.stale_polls >= STUCK_POLLS {
                return Err(format!("Axis {}: motor is stuck", mip.axis));
            }
        } else {
            self.last_raw = mip.raw;
            self.stale_polls = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Replies;
    use std::time::Duration;
    use tel_hal::virtual_motor::{VirtualConfig, VirtualMotor};

    fn motor() -> MotorInfo {
        MotorInfo {
            axis: 1,
            have: 1,
            haveenc: 1,
            step: 1_000_000,
            estep: 1_000_000,
            sign: 1,
            esign: 1,
            neglim: -3.0,
            poslim: 3.0,
            ..MotorInfo::default()
        }
    }

    fn virtual_node() -> VirtualMotor {
        let mut v = VirtualMotor::new(VirtualConfig::default());
        v.open().unwrap();
        v
    }

    fn drive(
        seq: &mut HomeSeq,
        mip: &mut MotorInfo,
        node: &mut VirtualMotor,
        out: &mut Replies,
    ) -> AxisStep {
        let mut mjd = 0.0;
        for _ in 0..500 {
            node.service(Duration::from_millis(100));
            mjd += 0.1 / SPD;
            match seq.tick(mip, node, mjd, out) {
                AxisStep::InProgress => continue,
                done => return done,
            }
        }
        panic!("sequence never finished");
    }

    #[test]
    fn home_seq_completes_and_marks_homed() {
        let mut mip = motor();
        let mut node = virtual_node();
        node.set_position(100_000);
        let mut out = Replies::new();

        let mut seq = HomeSeq::start(&mut mip, &mut node, 0.0).unwrap();
        assert_eq!(mip.homing, 1);
        assert_eq!(mip.ishomed, 0);

        let step = drive(&mut seq, &mut mip, &mut node, &mut out);
        assert_eq!(step, AxisStep::Done);
        assert_eq!(mip.ishomed, 1);
        assert_eq!(mip.homing, 0);
        assert_eq!(mip.cpos, 0.0);
    }

    #[test]
    fn home_seq_times_out() {
        let mut mip = motor();
        let mut node = virtual_node();
        let mut out = Replies::new();
        let mut seq = HomeSeq::start(&mut mip, &mut node, 0.0).unwrap();
        // Jump host time past the deadline without servicing the motor.
        let step = seq.tick(&mut mip, &mut node, (HOME_TIMEOUT + 1.0) / SPD, &mut out);
        assert!(matches!(step, AxisStep::Failed(ref m) if m.contains("timed out")));
        assert_eq!(mip.homing, 0);
    }

    #[test]
    fn limit_seq_discovers_and_orders_limits() {
        let mut mip = motor();
        mip.esign = -1; // flipped encoder: discovered order must still hold
        let mut node = virtual_node();
        let mut out = Replies::new();

        let mut seq = LimitSeq::start(&mut mip, &mut node, 0.0).unwrap();
        let mut mjd = 0.0;
        let step = loop {
            node.service(Duration::from_millis(100));
            mjd += 0.1 / SPD;
            match seq.tick(&mut mip, &mut node, mjd, &mut out) {
                AxisStep::InProgress => continue,
                done => break done,
            }
        };
        assert_eq!(step, AxisStep::Done);
        assert!(mip.neglim < mip.poslim);
        assert_eq!(mip.ishomed, 1);
        assert_eq!(mip.limiting, 0);
        // The search reported intermediate progress.
        assert!(out.0.iter().any(|(code, _)| *code > 0));
    }

    #[test]
    fn crack_limits_parses_completion_text() {
        assert_eq!(
            LimitSeq::crack_limits("neglim=-450000 poslim=450000"),
            Some((-450_000, 450_000))
        );
        assert_eq!(LimitSeq::crack_limits("all done"), None);
    }

    #[test]
    fn homed_check_refuses_unhomed() {
        let mut mip = motor();
        assert!(axis_homed_check(&mip).is_err());
        mip.ishomed = 1;
        assert!(axis_homed_check(&mip).is_ok());
        mip.have = 0;
        mip.ishomed = 0;
        assert!(axis_homed_check(&mip).is_ok()); // absent axes don't care
    }

    #[test]
    fn limit_check_detects_overrun() {
        let mut mip = motor();
        mip.ishomed = 1;
        mip.cpos = 0.0;
        assert!(axis_limit_check(&mip).is_ok());
        mip.cpos = 3.5;
        assert!(axis_limit_check(&mip).unwrap_err().contains("positive"));
        mip.cpos = -3.5;
        assert!(axis_limit_check(&mip).unwrap_err().contains("negative"));
    }

    #[test]
    fn motion_check_flags_frozen_counter() {
        let mut mip = motor();
        mip.cvel = 0.1;
        mip.raw = 500;
        mip.dpos = 1.0; // well away from cpos: this axis should be moving
        let mut chk = MotionCheck::default();
        chk.check(&mip).unwrap(); // primes last_raw

        for _ in 0..STUCK_POLLS - 1 {
            assert!(chk.check(&mip).is_ok());
        }
        assert!(chk.check(&mip).unwrap_err().contains("stuck"));

        // Movement clears the watchdog.
        mip.raw = 501;
        assert!(chk.check(&mip).is_ok());
    }

    #[test]
    fn motion_check_tolerates_arrival() {
        let mut mip = motor();
        mip.cvel = 0.1;
        mip.cpos = 1.0;
        mip.dpos = 1.0;
        let mut chk = MotionCheck::default();
        // Frozen counter at the destination is not a stall.
        for _ in 0..STUCK_POLLS + 5 {
            assert!(chk.check(&mip).is_ok());
        }
    }
}
