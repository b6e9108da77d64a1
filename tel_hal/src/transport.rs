//! The transport operation set, typed controller programs, and the shared
//! progress-line protocol.

use crate::csi::CsiNode;
use crate::tty_dome::TtyDome;
use crate::virtual_motor::VirtualMotor;
use std::time::Duration;
use thiserror::Error;

/// Transport-layer error type.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel is not open")]
    NotOpen,

    #[error("timed out waiting for controller reply")]
    ReplyTimeout,

    #[error("unparseable controller reply: {0:?}")]
    BadReply(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Which counter a position refers to on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSpace {
    /// Encoder counts (`epos` / `etpos` / `etrack`).
    Encoder,
    /// Motor steps (`mpos` / `mtpos` / `mtrack`).
    Motor,
}

// ─── Typed controller programs ──────────────────────────────────────

/// A controller-side program invocation.
///
/// The daemon never builds wire strings; backends serialize these to
/// whatever their controller speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum Program {
    /// Seek an absolute position on the given counter.
    SetTargetPos { space: CounterSpace, counts: i64 },
    /// Run at a constant velocity, counts/s; 0 stops.
    SetVelocity { counts_per_s: i64 },
    /// Upload a tracking profile: positions at `t0 + i*step_ms` on the
    /// controller clock.
    Track {
        space: CounterSpace,
        t0_ms: i64,
        step_ms: i64,
        points: Vec<i64>,
    },
    /// Zero the controller's millisecond clock.
    ZeroClock,
    /// Motion watchdog timeout, ms.
    SetTimeout { ms: i64 },
    /// Absolute tracking offset, counts.
    TrackingOffset { counts: i64 },
    /// Continuous tracking-offset accumulation, counts/s.
    TrackingOffsetRate { counts_per_s: i64 },
    /// Home-switch seek.
    FindHome { homelow: bool, posside: bool },
    /// Travel-limit discovery. The completion line reports the counters:
    /// `0: neglim=<counts> poslim=<counts>`.
    FindLimits,
    /// Configure node kinematics before first use.
    SetupAxis {
        steps: i64,
        sign: i32,
        max_vel_cps: i64,
        max_acc_cps2: i64,
        lim_acc_cps2: i64,
        homelow: bool,
    },
    /// Push dome script parameters after a reset.
    DomeParams {
        steps: f64,
        sign: i32,
        motor_only: bool,
        dome_to_ms: i64,
        shutter_run_ms: i64,
        shutter_to_ms: i64,
    },
    /// Rotate the dome to an encoder target within a tolerance.
    DomeSeek { target_counts: i64, tol_counts: i64 },
    /// Drive the shutter/roof: +1 open, -1 close, 0 stop.
    RoofSeek { dir: i8 },
    /// Seek the dome home switch.
    FindDomeHome,
    /// Constant dome rotation, +1/-1; no target.
    DomeJog { dir: i8 },
    /// Stop dome rotation.
    DomeStop,
    /// Drive the mirror cover open (true) or closed (false).
    Cover { open: bool },
    /// Seek a filter-wheel slot (scripted wheels).
    FilterSelect { slot: i64 },
    /// Home the filter wheel (scripted wheels).
    FilterHome,
}

impl Program {
    /// CSI wire form of this program.
    pub fn wire(&self) -> String {
        match self {
            Program::SetTargetPos { space, counts } => match space {
                CounterSpace::Encoder => format!("etpos={counts};"),
                CounterSpace::Motor => format!("mtpos={counts};"),
            },
            Program::SetVelocity { counts_per_s } => format!("mtvel={counts_per_s};"),
            Program::Track {
                space,
                t0_ms,
                step_ms,
                points,
            } => {
                let name = match space {
                    CounterSpace::Encoder => "etrack",
                    CounterSpace::Motor => "mtrack",
                };
                let mut s = format!("{name}({t0_ms},{step_ms}");
                for p in points {
                    s.push(',');
                    s.push_str(&p.to_string());
                }
                s.push_str(");");
                s
            }
            Program::ZeroClock => "clock=0;".into(),
            Program::SetTimeout { ms } => format!("timeout={ms};"),
            Program::TrackingOffset { counts } => format!("toffset={counts};"),
            Program::TrackingOffsetRate { counts_per_s } => {
                format!("while(1) {{toffset += {counts_per_s}/5; pause(200);}}")
            }
            Program::FindHome { homelow, posside } => {
                format!("findhome({},{});", u8::from(*homelow), u8::from(*posside))
            }
            Program::FindLimits => "findlim();".into(),
            Program::SetupAxis {
                steps,
                sign,
                max_vel_cps,
                max_acc_cps2,
                lim_acc_cps2,
                homelow,
            } => {
                let polar = if *homelow {
                    "ipolar |= homebit;"
                } else {
                    "ipolar &= ~homebit;"
                };
                format!(
                    "{polar} maxvel={max_vel_cps}; maxacc={max_acc_cps2}; \
                     limacc={lim_acc_cps2}; msteps={steps}; esign={sign};"
                )
            }
            Program::DomeParams {
                steps,
                sign,
                motor_only,
                dome_to_ms,
                shutter_run_ms,
                shutter_to_ms,
            } => {
                let steps_var = if *motor_only { "msteps" } else { "esteps" };
                format!(
                    "{steps_var}={steps:.0}; s={sign}; w=w?w:{dome_to_ms}; \
                     r=r?r:{shutter_run_ms}; v=v?v:{shutter_run_ms}; \
                     t=t?t:{shutter_to_ms}; u=u?u:{shutter_to_ms};"
                )
            }
            Program::DomeSeek {
                target_counts,
                tol_counts,
            } => format!("domeseek({target_counts},{tol_counts});"),
            Program::RoofSeek { dir } => format!("roofseek({dir});"),
            Program::FindDomeHome => "finddomehome();".into(),
            Program::DomeJog { dir } => format!("domejog({dir});"),
            Program::DomeStop => "dome_stop();".into(),
            Program::Cover { open } => format!("cover({});", u8::from(*open)),
            Program::FilterSelect { slot } => format!("filtseek({slot});"),
            Program::FilterHome => "filthome();".into(),
        }
    }
}

// ─── Progress-line protocol ─────────────────────────────────────────

/// A parsed controller status line of the form `"N: text"`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// N > 0: still working.
    Progress(i32, String),
    /// N = 0: done.
    Success(String),
    /// N < 0: failed.
    Error(i32, String),
    /// No leading number: a bug in the controller script.
    Invalid(String),
}

/// Parse one status line.
pub fn parse_progress(line: &str) -> ProgressLine {
    let line = line.trim();
    let num_end = line
        .char_indices()
        .take_while(|&(i, c)| c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);

    let Ok(n) = line[..num_end].parse::<i32>() else {
        return ProgressLine::Invalid(line.to_string());
    };

    let text = line[num_end..]
        .trim_start_matches([':', ' '])
        .trim()
        .to_string();

    match n {
        0 => ProgressLine::Success(text),
        n if n > 0 => ProgressLine::Progress(n, text),
        n => ProgressLine::Error(n, text),
    }
}

// ─── The operation set ──────────────────────────────────────────────

/// Uniform controller channel operations.
///
/// All reads are a readiness check plus a short bounded read; no method
/// may stall the caller's poll loop.
pub trait MotorChannel {
    /// Establish the connection. Idempotent.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Tear down the connection.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Command an absolute position seek.
    fn set_pos(&mut self, space: CounterSpace, counts: i64) -> Result<(), TransportError>;

    /// Command a constant velocity, counts/s.
    fn set_vel(&mut self, counts_per_s: i64) -> Result<(), TransportError>;

    /// Zero the commanded velocity.
    fn stop(&mut self) -> Result<(), TransportError>;

    /// Read the position counter.
    fn read_pos(&mut self, space: CounterSpace) -> Result<i64, TransportError>;

    /// Read the current velocity, counts/s.
    fn read_vel(&mut self) -> Result<i64, TransportError>;

    /// Read the controller millisecond clock.
    fn read_clock(&mut self) -> Result<i64, TransportError>;

    /// True while the controller is executing a motion.
    fn read_working(&mut self) -> Result<bool, TransportError>;

    /// Start a controller-side program.
    fn run_program(&mut self, prog: &Program) -> Result<(), TransportError>;

    /// Non-destructive check whether a status line is waiting.
    fn is_ready(&mut self) -> bool;

    /// Fetch one status line if available. Never blocks beyond the
    /// backend's bounded read.
    fn read_line(&mut self) -> Result<Option<String>, TransportError>;

    /// Abort the running program.
    fn interrupt(&mut self) -> Result<(), TransportError>;
}

/// Tagged transport variants.
pub enum MotorNode {
    Csi(CsiNode),
    Virtual(VirtualMotor),
    Tty(TtyDome),
}

impl MotorNode {
    /// Advance simulation time on a virtual backend; no-op otherwise.
    ///
    /// The daemon calls this once per poll so virtual motion proceeds at
    /// the loop's pace (and tests can step it deterministically).
    pub fn service(&mut self, dt: Duration) {
        if let MotorNode::Virtual(v) = self {
            v.service(dt);
        }
    }

    pub fn as_virtual_mut(&mut self) -> Option<&mut VirtualMotor> {
        match self {
            MotorNode::Virtual(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! delegate {
    ($self:ident, $m:ident $(, $a:expr)*) => {
        match $self {
            MotorNode::Csi(n) => n.$m($($a),*),
            MotorNode::Virtual(n) => n.$m($($a),*),
            MotorNode::Tty(n) => n.$m($($a),*),
        }
    };
}

impl MotorChannel for MotorNode {
    fn open(&mut self) -> Result<(), TransportError> {
        delegate!(self, open)
    }
    fn close(&mut self) {
        delegate!(self, close)
    }
    fn is_open(&self) -> bool {
        delegate!(self, is_open)
    }
    fn set_pos(&mut self, space: CounterSpace, counts: i64) -> Result<(), TransportError> {
        delegate!(self, set_pos, space, counts)
    }
    fn set_vel(&mut self, counts_per_s: i64) -> Result<(), TransportError> {
        delegate!(self, set_vel, counts_per_s)
    }
    fn stop(&mut self) -> Result<(), TransportError> {
        delegate!(self, stop)
    }
    fn read_pos(&mut self, space: CounterSpace) -> Result<i64, TransportError> {
        delegate!(self, read_pos, space)
    }
    fn read_vel(&mut self) -> Result<i64, TransportError> {
        delegate!(self, read_vel)
    }
    fn read_clock(&mut self) -> Result<i64, TransportError> {
        delegate!(self, read_clock)
    }
    fn read_working(&mut self) -> Result<bool, TransportError> {
        delegate!(self, read_working)
    }
    fn run_program(&mut self, prog: &Program) -> Result<(), TransportError> {
        delegate!(self, run_program, prog)
    }
    fn is_ready(&mut self) -> bool {
        delegate!(self, is_ready)
    }
    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        delegate!(self, read_line)
    }
    fn interrupt(&mut self) -> Result<(), TransportError> {
        delegate!(self, interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_forms_match_controller_grammar() {
        assert_eq!(
            Program::SetTargetPos {
                space: CounterSpace::Encoder,
                counts: -1234
            }
            .wire(),
            "etpos=-1234;"
        );
        assert_eq!(
            Program::SetTargetPos {
                space: CounterSpace::Motor,
                counts: 88
            }
            .wire(),
            "mtpos=88;"
        );
        assert_eq!(Program::SetVelocity { counts_per_s: -5 }.wire(), "mtvel=-5;");
        assert_eq!(Program::ZeroClock.wire(), "clock=0;");
        assert_eq!(Program::SetTimeout { ms: 60_000 }.wire(), "timeout=60000;");
        assert_eq!(
            Program::DomeSeek {
                target_counts: 1435,
                tol_counts: 36
            }
            .wire(),
            "domeseek(1435,36);"
        );
        assert_eq!(Program::RoofSeek { dir: -1 }.wire(), "roofseek(-1);");
        assert_eq!(Program::Cover { open: true }.wire(), "cover(1);");
        assert_eq!(Program::Cover { open: false }.wire(), "cover(0);");
    }

    #[test]
    fn track_wire_lists_every_point() {
        let w = Program::Track {
            space: CounterSpace::Encoder,
            t0_ms: 0,
            step_ms: 1000,
            points: vec![10, 20, 30],
        }
        .wire();
        assert_eq!(w, "etrack(0,1000,10,20,30);");
    }

    #[test]
    fn offset_rate_embeds_pause_loop() {
        let w = Program::TrackingOffsetRate { counts_per_s: 42 }.wire();
        assert!(w.contains("toffset += 42/5"));
        assert!(w.contains("pause(200)"));
    }

    #[test]
    fn parse_progress_codes() {
        assert_eq!(
            parse_progress("3: almost there"),
            ProgressLine::Progress(3, "almost there".into())
        );
        assert_eq!(
            parse_progress("0: done"),
            ProgressLine::Success("done".into())
        );
        assert_eq!(
            parse_progress("-2: jammed"),
            ProgressLine::Error(-2, "jammed".into())
        );
        assert_eq!(parse_progress("0"), ProgressLine::Success(String::new()));
        assert_eq!(
            parse_progress("whoops"),
            ProgressLine::Invalid("whoops".into())
        );
        // A bare "text without number" is the script-bug case.
        assert!(matches!(
            parse_progress(": no number"),
            ProgressLine::Invalid(_)
        ));
    }
}
