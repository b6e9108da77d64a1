//! FLI-style focuser and filter-wheel drivers.
//!
//! The vendor SDK is consumed through [`FliHandle`]; real installations
//! implement it over the vendor library, virtual runs and tests use
//! [`SimFli`]. Two quirks of the hardware shape the drivers:
//!
//! - the stepper only accepts relative moves of at most 4095 counts, so
//!   long slews are chains of jumps ([`FliFocuser::goto_step`]);
//! - the filter wheel accumulates positioning drift, so it is re-homed
//!   after a fixed number of selections ([`FliFilterWheel`]).

use thiserror::Error;
use tracing::{debug, info};

/// Bits of the device status word that mean "still moving".
pub const FLI_MOVING_MASK: u64 = 0x7;

/// Largest relative move the stepper accepts, counts.
const MAX_RELATIVE_STEP: i64 = 4095;

/// Vendor-library error.
#[derive(Debug, Clone, Error)]
pub enum FliError {
    #[error("FLI device error: {0}")]
    Device(String),
    #[error("no FLI device connected")]
    NotConnected,
}

/// The slice of the vendor SDK these drivers consume.
pub trait FliHandle {
    /// Start the homing routine.
    fn home_device(&mut self) -> Result<(), FliError>;
    /// Device status word; moving while `FLI_MOVING_MASK` bits set.
    fn device_status(&mut self) -> Result<u64, FliError>;
    /// Absolute stepper position, counts.
    fn stepper_position(&mut self) -> Result<i64, FliError>;
    /// Steps left in the current relative move.
    fn steps_remaining(&mut self) -> Result<i64, FliError>;
    /// Start a relative move; returns immediately.
    fn step_motor_async(&mut self, steps: i64) -> Result<(), FliError>;
    /// Internal temperature, °C.
    fn read_internal_temp(&mut self) -> Result<f64, FliError>;
    /// Select a filter slot.
    fn set_filter_pos(&mut self, pos: i64) -> Result<(), FliError>;
    /// Highest reachable stepper position.
    fn focuser_extent(&mut self) -> Result<i64, FliError>;
}

impl FliHandle for Box<dyn FliHandle> {
    fn home_device(&mut self) -> Result<(), FliError> {
        (**self).home_device()
    }
    fn device_status(&mut self) -> Result<u64, FliError> {
        (**self).device_status()
    }
    fn stepper_position(&mut self) -> Result<i64, FliError> {
        (**self).stepper_position()
    }
    fn steps_remaining(&mut self) -> Result<i64, FliError> {
        (**self).steps_remaining()
    }
    fn step_motor_async(&mut self, steps: i64) -> Result<(), FliError> {
        (**self).step_motor_async(steps)
    }
    fn read_internal_temp(&mut self) -> Result<f64, FliError> {
        (**self).read_internal_temp()
    }
    fn set_filter_pos(&mut self, pos: i64) -> Result<(), FliError> {
        (**self).set_filter_pos(pos)
    }
    fn focuser_extent(&mut self) -> Result<i64, FliError> {
        (**self).focuser_extent()
    }
}

/// Result of one cooperative driver step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStep {
    InProgress,
    Done,
}

// ─── Focuser ────────────────────────────────────────────────────────

/// Cooperative focuser driver over a vendor handle.
pub struct FliFocuser<H: FliHandle> {
    dev: H,
    max_position: i64,
    jog_dir: i8,
}

impl<H: FliHandle> FliFocuser<H> {
    pub fn new(mut dev: H) -> Result<Self, FliError> {
        let max_position = dev.focuser_extent()?;
        Ok(Self {
            dev,
            max_position,
            jog_dir: 0,
        })
    }

    pub fn max_position(&self) -> i64 {
        self.max_position
    }

    /// Home; call with `first = true` once, then poll.
    pub fn home_step(&mut self, first: bool) -> Result<DriverStep, FliError> {
        if first {
            debug!("FLI focuser homing");
            self.dev.home_device()?;
        }
        if self.dev.device_status()? & FLI_MOVING_MASK == 0 {
            Ok(DriverStep::Done)
        } else {
            Ok(DriverStep::InProgress)
        }
    }

    pub fn read_position(&mut self) -> Result<i64, FliError> {
        self.dev.stepper_position()
    }

    /// Stop by issuing a zero-length relative move.
    pub fn stop(&mut self) -> Result<(), FliError> {
        self.jog_dir = 0;
        self.dev.step_motor_async(0)
    }

    /// Drive toward `target` counts; chains ≤4095-count jumps.
    pub fn goto_step(&mut self, first: bool, target: i64) -> Result<DriverStep, FliError> {
        if first {
            debug!(target, "FLI focuser move");
        }

        if self.dev.steps_remaining()? > 0 {
            return Ok(DriverStep::InProgress); // mid-jump
        }

        let here = self.dev.stepper_position()?;
        if here == target {
            return Ok(DriverStep::Done);
        }

        let rel = (target - here).clamp(-MAX_RELATIVE_STEP, MAX_RELATIVE_STEP);
        self.dev.step_motor_async(rel)?;
        Ok(DriverStep::InProgress)
    }

    /// Jog: `+1` toward the far limit, `-1` toward zero, `0` keep nudging
    /// the previous direction.
    pub fn jog(&mut self, cmd: i8) -> Result<(), FliError> {
        if cmd != 0 {
            self.jog_dir = cmd;
        }
        let target = if self.jog_dir > 0 {
            self.max_position
        } else {
            0
        };
        self.goto_step(false, target).map(|_| ())
    }

    pub fn temperature(&mut self) -> Result<f64, FliError> {
        self.dev.read_internal_temp()
    }
}

// ─── Filter wheel ───────────────────────────────────────────────────

/// Cooperative filter-wheel driver over a vendor handle.
pub struct FliFilterWheel<H: FliHandle> {
    dev: H,
    rehome_after: u32,
    moves_until_rehome: u32,
}

impl<H: FliHandle> FliFilterWheel<H> {
    pub fn new(dev: H, rehome_after: u32) -> Self {
        Self {
            dev,
            rehome_after,
            moves_until_rehome: rehome_after,
        }
    }

    /// Start the wheel's homing routine (poll [`Self::busy`] after).
    pub fn home(&mut self) -> Result<(), FliError> {
        self.dev.home_device()?;
        self.moves_until_rehome = self.rehome_after;
        Ok(())
    }

    /// Select a slot; re-homes first when the drift budget is spent.
    /// Returns true when a rehome was issued (selection must be retried
    /// once the wheel settles).
    pub fn select(&mut self, pos: i64) -> Result<bool, FliError> {
        if self.moves_until_rehome == 0 {
            info!("rehoming FLI wheel to prevent drift");
            self.home()?;
            return Ok(true);
        }
        self.dev.set_filter_pos(pos)?;
        self.moves_until_rehome -= 1;
        Ok(false)
    }

    /// Wheel still turning.
    pub fn busy(&mut self) -> Result<bool, FliError> {
        Ok(self.dev.device_status()? & FLI_MOVING_MASK != 0)
    }
}

// ─── Simulated vendor device ────────────────────────────────────────

/// Software stand-in for the vendor device.
///
/// Motion completes `moves_per_poll` counts each `device_status` /
/// `steps_remaining` call, so cooperative drivers progress exactly as they
/// poll. Deterministic: no wall clock involved.
pub struct SimFli {
    pub position: i64,
    pub remaining: i64,
    pub extent: i64,
    pub temp: f64,
    pub filter_pos: i64,
    pub homing_polls_left: u32,
    moves_per_poll: i64,
}

impl SimFli {
    pub fn new(extent: i64) -> Self {
        Self {
            position: 0,
            remaining: 0,
            extent,
            temp: 10.0,
            filter_pos: 0,
            homing_polls_left: 0,
            moves_per_poll: 1500,
        }
    }

    fn advance(&mut self) {
        if self.homing_polls_left > 0 {
            self.homing_polls_left -= 1;
            if self.homing_polls_left == 0 {
                self.position = 0;
            }
            return;
        }
        if self.remaining != 0 {
            let step = self.remaining.clamp(-self.moves_per_poll, self.moves_per_poll);
            self.position = (self.position + step).clamp(0, self.extent);
            self.remaining -= step;
        }
    }
}

impl FliHandle for SimFli {
    fn home_device(&mut self) -> Result<(), FliError> {
        self.homing_polls_left = 3;
        self.remaining = 0;
        Ok(())
    }

    fn device_status(&mut self) -> Result<u64, FliError> {
        self.advance();
        let moving = self.homing_polls_left > 0 || self.remaining != 0;
        Ok(if moving { FLI_MOVING_MASK } else { 0 })
    }

    fn stepper_position(&mut self) -> Result<i64, FliError> {
        Ok(self.position)
    }

    fn steps_remaining(&mut self) -> Result<i64, FliError> {
        self.advance();
        Ok(self.remaining.abs())
    }

    fn step_motor_async(&mut self, steps: i64) -> Result<(), FliError> {
        self.remaining = steps;
        Ok(())
    }

    fn read_internal_temp(&mut self) -> Result<f64, FliError> {
        Ok(self.temp)
    }

    fn set_filter_pos(&mut self, pos: i64) -> Result<(), FliError> {
        self.filter_pos = pos;
        Ok(())
    }

    fn focuser_extent(&mut self) -> Result<i64, FliError> {
        Ok(self.extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_completes_after_polls() {
        let mut foc = FliFocuser::new(SimFli::new(100_000)).unwrap();
        assert_eq!(foc.home_step(true).unwrap(), DriverStep::InProgress);
        let mut done = false;
        for _ in 0..10 {
            if foc.home_step(false).unwrap() == DriverStep::Done {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(foc.read_position().unwrap(), 0);
    }

    #[test]
    fn long_moves_are_chained_jumps() {
        let mut foc = FliFocuser::new(SimFli::new(100_000)).unwrap();
        let target = 10_000;
        assert_eq!(foc.goto_step(true, target).unwrap(), DriverStep::InProgress);
        let mut polls = 0;
        loop {
            polls += 1;
            assert!(polls < 100, "never converged");
            if foc.goto_step(false, target).unwrap() == DriverStep::Done {
                break;
            }
        }
        assert_eq!(foc.read_position().unwrap(), target);
        // 10000 counts at <=4095 per jump needs at least three jumps.
        assert!(polls >= 3);
    }

    #[test]
    fn negative_moves_clamp_too() {
        let mut foc = FliFocuser::new(SimFli::new(100_000)).unwrap();
        foc.dev.position = 9_000;
        loop {
            if foc.goto_step(false, 500).unwrap() == DriverStep::Done {
                break;
            }
        }
        assert_eq!(foc.read_position().unwrap(), 500);
    }

    #[test]
    fn jog_remembers_direction() {
        let mut foc = FliFocuser::new(SimFli::new(20_000)).unwrap();
        foc.jog(1).unwrap();
        for _ in 0..5 {
            foc.jog(0).unwrap();
        }
        assert!(foc.read_position().unwrap() > 0);
        let high = foc.read_position().unwrap();
        foc.jog(-1).unwrap();
        for _ in 0..3 {
            foc.jog(0).unwrap();
        }
        assert!(foc.read_position().unwrap() < high);
    }

    #[test]
    fn wheel_rehomes_after_budget() {
        let mut wheel = FliFilterWheel::new(SimFli::new(0), 2);
        assert!(!wheel.select(1).unwrap());
        assert!(!wheel.select(2).unwrap());
        // Budget spent: next select triggers a rehome instead.
        assert!(wheel.select(3).unwrap());
        // After the rehome the budget is fresh.
        assert!(!wheel.select(3).unwrap());
        assert_eq!(wheel.dev.filter_pos, 3);
    }

    #[test]
    fn wheel_busy_tracks_homing() {
        let mut wheel = FliFilterWheel::new(SimFli::new(0), 5);
        wheel.home().unwrap();
        assert!(wheel.busy().unwrap());
        while wheel.busy().unwrap() {}
        assert!(!wheel.busy().unwrap());
    }
}
