//! Coordinate kernel for the telescope daemon.
//!
//! Pure functions over `(NowShm, Obj)`. Everything here is deterministic,
//! side-effect-free and cheap enough to call once per tracking sample.
//!
//! - [`angles`] - range folding and angular differences
//! - [`time`] - MJD and sidereal time
//! - [`coords`] - HA/Dec ↔ Alt/Az at a given latitude
//! - [`precess`] - epoch shifts (`ap_as` / `as_ap`)
//! - [`refraction`] - atmospheric refraction and its inverse
//! - [`obj`] - target objects and `obj_cir`
//! - [`mount`] - pointing model and mesh correction
//! - [`domegeom`] - dome wall-intercept geometry

pub mod angles;
pub mod coords;
pub mod domegeom;
pub mod mount;
pub mod obj;
pub mod precess;
pub mod refraction;
pub mod time;

pub use obj::{obj_cir, Obj};
