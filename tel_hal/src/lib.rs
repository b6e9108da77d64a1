//! Motor-controller transport abstraction.
//!
//! One operation set (open, close, set position, set velocity, stop, read
//! position/velocity, run a typed controller program, read a status line,
//! interrupt) polymorphic over the three backends:
//!
//! - [`csi::CsiNode`] - a controller node reached through the CSI daemon
//! - [`virtual_motor::VirtualMotor`] - deterministic in-process simulation
//! - [`tty_dome::TtyDome`] - a vendor dome controller on a serial line
//!
//! Controller scripts are modelled as typed [`transport::Program`] values;
//! each backend owns its wire form. Script feedback follows the shared
//! progress-line protocol parsed by [`transport::parse_progress`].
//!
//! The FLI-style vendor SDK for focusers and filter wheels is consumed
//! through [`fli::FliHandle`]; [`fli::SimFli`] stands in for it in virtual
//! runs and tests.

pub mod csi;
pub mod fli;
pub mod transport;
pub mod tty_dome;
pub mod virtual_motor;

pub use transport::{
    parse_progress, CounterSpace, MotorChannel, MotorNode, Program, ProgressLine, TransportError,
};
