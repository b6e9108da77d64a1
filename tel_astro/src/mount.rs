//! Mount pointing model and mesh correction.
//!
//! Axis coordinates (`x`, `y`) are the HA- and Dec-axis angles, rad from
//! home. The forward map [`tel_hadec2xy`] and inverse [`tel_xy2hadec`] are
//! exact mutual inverses: the pointing model is a rigid rotation to the
//! mount pole (`HT`, `DT`), zero-point offsets (`XP`, `YC`) and the
//! configured pier/zenith flips. The non-perpendicularity `NP` is applied
//! separately by the `ideal2real` pair so persisted models keep their
//! meaning.

use crate::angles::{delra, ha_range, hd_range};
use std::f64::consts::{FRAC_PI_2, PI};
use std::path::Path;
use tel_common::axes::TelAxes;
use thiserror::Error;

// ─── Small vector helpers ───────────────────────────────────────────

#[inline]
fn sphcart(a: f64, b: f64) -> [f64; 3] {
    let (sa, ca) = a.sin_cos();
    let (sb, cb) = b.sin_cos();
    [cb * ca, cb * sa, sb]
}

#[inline]
fn cartsph(v: [f64; 3]) -> (f64, f64) {
    let b = v[2].clamp(-1.0, 1.0).asin();
    let a = v[1].atan2(v[0]);
    (a, b)
}

#[inline]
fn rot_z(v: [f64; 3], t: f64) -> [f64; 3] {
    let (s, c) = t.sin_cos();
    [c * v[0] - s * v[1], s * v[0] + c * v[1], v[2]]
}

#[inline]
fn rot_y(v: [f64; 3], t: f64) -> [f64; 3] {
    let (s, c) = t.sin_cos();
    [c * v[0] + s * v[2], v[1], -s * v[0] + c * v[2]]
}

// ─── Pointing model ─────────────────────────────────────────────────

/// Apparent HA/Dec to axis angles.
pub fn tel_hadec2xy(ha: f64, dec: f64, tax: &TelAxes) -> (f64, f64) {
    // Rotate the sky so the mount pole (HT, DT) sits at +z.
    let v = sphcart(ha, dec);
    let v = rot_z(v, -tax.ht);
    let v = rot_y(v, -(FRAC_PI_2 - tax.dt));
    let (mut x0, mut y0) = cartsph(v);

    if tax.germeq != 0 && tax.germeq_flip != 0 {
        x0 += PI;
        y0 = PI - y0;
    }
    if tax.zenflip != 0 {
        x0 += PI;
        y0 = PI - y0;
    }

    (ha_range(x0 + tax.xp), y0 + tax.yc)
}

/// Axis angles back to apparent HA/Dec. Inverse of [`tel_hadec2xy`].
pub fn tel_xy2hadec(x: f64, y: f64, tax: &TelAxes) -> (f64, f64) {
    let mut x0 = x - tax.xp;
    let mut y0 = y - tax.yc;

    if tax.zenflip != 0 {
        y0 = PI - y0;
        x0 -= PI;
    }
    if tax.germeq != 0 && tax.germeq_flip != 0 {
        y0 = PI - y0;
        x0 -= PI;
    }

    let v = sphcart(x0, y0);
    let v = rot_y(v, FRAC_PI_2 - tax.dt);
    let v = rot_z(v, tax.ht);
    let (ha, dec) = cartsph(v);
    hd_range(ha, dec)
}

/// Parallactic angle at (ha, dec) for the given latitude.
pub fn tel_hadec2pa(ha: f64, dec: f64, _tax: &TelAxes, lat: f64) -> f64 {
    let (sh, ch) = ha.sin_cos();
    let (sd, cd) = dec.sin_cos();
    sh.atan2(cd * lat.tan() - sd * ch)
}

// `NP` couples the Dec-axis angle into the HA axis. tan is clamped so a
// pointing near the pole cannot command an unbounded correction.
const NP_TAN_CLAMP: f64 = 10.0;

#[inline]
fn np_term(tax: &TelAxes, y: f64) -> f64 {
    tax.np * y.tan().clamp(-NP_TAN_CLAMP, NP_TAN_CLAMP)
}

/// Ideal axis angles to real (non-perpendicular) axis angles.
pub fn tel_ideal2realxy(tax: &TelAxes, x: f64, y: f64) -> (f64, f64) {
    (x + np_term(tax, y), y)
}

/// Real axis angles back to ideal. Inverse of [`tel_ideal2realxy`].
pub fn tel_realxy2ideal(tax: &TelAxes, x: f64, y: f64) -> (f64, f64) {
    (x - np_term(tax, y), y)
}

// ─── Mesh correction ────────────────────────────────────────────────

/// Error loading a mesh file.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("mesh I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mesh line {0}: expected `ha dec dha ddec`")]
    BadLine(usize),
}

#[derive(Debug, Clone, Copy)]
struct MeshNode {
    ha: f64,
    dec: f64,
    dha: f64,
    ddec: f64,
}

/// Tabulated pointing offsets measured across the sky.
///
/// Rows are `ha dec dha ddec`, radians, `#` comments allowed. The
/// correction at a pointing is that of the nearest measured node; an empty
/// map is the identity.
#[derive(Debug, Clone, Default)]
pub struct MeshMap {
    nodes: Vec<MeshNode>,
}

impl MeshMap {
    /// A map with no nodes: zero correction everywhere.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a mesh file; a missing file yields the empty map.
    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty());
            }
            Err(e) => return Err(e.into()),
        };

        let mut nodes = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut it = line.split_whitespace();
            let mut next = || -> Result<f64, MeshError> {
                it.next()
                    .and_then(|t| t.parse().ok())
                    .ok_or(MeshError::BadLine(i + 1))
            };
            nodes.push(MeshNode {
                ha: next()?,
                dec: next()?,
                dha: next()?,
                ddec: next()?,
            });
        }
        Ok(Self { nodes })
    }

    /// Number of measured nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pointing offset `(dha, ddec)` to add to a requested (ha, dec).
    pub fn correction(&self, ha: f64, dec: f64) -> (f64, f64) {
        let mut best: Option<(f64, &MeshNode)> = None;
        for n in &self.nodes {
            let dh = delra(ha - n.ha) * dec.cos();
            let dd = dec - n.dec;
            let d2 = dh * dh + dd * dd;
            if best.map(|(b, _)| d2 < b).unwrap_or(true) {
                best = Some((d2, n));
            }
        }
        best.map(|(_, n)| (n.dha, n.ddec)).unwrap_or((0.0, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn grid() -> impl Iterator<Item = (f64, f64)> {
        let has = [-2.8, -1.5, -0.3, 0.0, 0.7, 1.9, 3.0];
        let decs = [-1.2, -0.6, 0.0, 0.5, 1.1, 1.45];
        has.into_iter()
            .flat_map(move |h| decs.into_iter().map(move |d| (h, d)))
    }

    fn roundtrip_with(tax: &TelAxes) {
        for (ha, dec) in grid() {
            let (x, y) = tel_hadec2xy(ha, dec, tax);
            let (ha2, dec2) = tel_xy2hadec(x, y, tax);
            assert!(
                delra(ha2 - ha) < 1e-10 && (dec2 - dec).abs() < 1e-10,
                "roundtrip failed at ha={ha} dec={dec}: got ha={ha2} dec={dec2}"
            );
        }
    }

    #[test]
    fn xy_hadec_inverse_ideal_mount() {
        roundtrip_with(&TelAxes {
            dt: FRAC_PI_2, // pole on the pole
            ..TelAxes::default()
        });
    }

    #[test]
    fn xy_hadec_inverse_misaligned_mount() {
        roundtrip_with(&TelAxes {
            ht: 0.01,
            dt: FRAC_PI_2 - 0.004,
            xp: -2.3,
            yc: 0.12,
            ..TelAxes::default()
        });
    }

    #[test]
    fn xy_hadec_inverse_german_flipped() {
        roundtrip_with(&TelAxes {
            ht: -0.006,
            dt: FRAC_PI_2 - 0.002,
            xp: 1.0,
            yc: -0.05,
            germeq: 1,
            germeq_flip: 1,
            ..TelAxes::default()
        });
    }

    #[test]
    fn xy_hadec_inverse_zenith_flipped() {
        roundtrip_with(&TelAxes {
            dt: FRAC_PI_2,
            zenflip: 1,
            ..TelAxes::default()
        });
    }

    #[test]
    fn perfect_mount_is_identity_plus_offsets() {
        let tax = TelAxes {
            dt: FRAC_PI_2,
            xp: 0.5,
            yc: -0.25,
            ..TelAxes::default()
        };
        let (x, y) = tel_hadec2xy(0.8, 0.3, &tax);
        assert!(delra(x - (0.8 + 0.5)) < 1e-10);
        assert!((y - (0.3 - 0.25)).abs() < 1e-10);
    }

    #[test]
    fn ideal_real_pair_inverse() {
        let tax = TelAxes {
            np: 0.002,
            ..TelAxes::default()
        };
        for (x, y) in grid() {
            let (xr, yr) = tel_ideal2realxy(&tax, x, y);
            let (xi, yi) = tel_realxy2ideal(&tax, xr, yr);
            assert!((xi - x).abs() < 1e-12 && (yi - y).abs() < 1e-12);
        }
    }

    #[test]
    fn np_correction_is_bounded_at_pole() {
        let tax = TelAxes {
            np: 0.002,
            ..TelAxes::default()
        };
        let (xr, _) = tel_ideal2realxy(&tax, 0.0, FRAC_PI_2 - 1e-9);
        assert!((xr).abs() <= 0.002 * NP_TAN_CLAMP + 1e-12);
    }

    #[test]
    fn parallactic_angle_signs() {
        let tax = TelAxes::default();
        let lat = 0.7;
        // On the meridian, below the pole: zero.
        assert!(tel_hadec2pa(0.0, 0.2, &tax, lat).abs() < 1e-12);
        // West of the meridian: positive; east: negative.
        assert!(tel_hadec2pa(0.3, 0.2, &tax, lat) > 0.0);
        assert!(tel_hadec2pa(-0.3, 0.2, &tax, lat) < 0.0);
    }

    #[test]
    fn mesh_missing_file_is_identity() {
        let map = MeshMap::load(Path::new("/nonexistent/mesh.cfg")).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.correction(1.0, 0.5), (0.0, 0.0));
    }

    #[test]
    fn mesh_nearest_node_lookup() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# ha dec dha ddec").unwrap();
        writeln!(f, "0.0 0.0  0.001 -0.002").unwrap();
        writeln!(f, "1.0 0.5  -0.003 0.004").unwrap();
        f.flush().unwrap();

        let map = MeshMap::load(f.path()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.correction(0.1, 0.05), (0.001, -0.002));
        assert_eq!(map.correction(0.9, 0.6), (-0.003, 0.004));
    }

    #[test]
    fn mesh_rejects_short_rows() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "0.0 0.0 0.001").unwrap();
        f.flush().unwrap();
        assert!(matches!(
            MeshMap::load(f.path()),
            Err(MeshError::BadLine(1))
        ));
    }
}
