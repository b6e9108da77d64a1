//! Configuration loading and validation.
//!
//! Every file keeps its historical name and UPPERCASE key set
//! (`telsched.cfg`, `telescoped.cfg`, `home.cfg`, `focus.cfg`,
//! `filter.cfg`, `dome.cfg`). The `KEY = value` format is parsed as TOML.
//!
//! Angles are radians, velocities rad/s, timeouts seconds unless a field
//! says otherwise. `validate()` enforces the range rules that are fatal at
//! startup (sign fields must be ±1, `TRACKINT > 0`, `DOMERADIUS > 0`, ...).

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    /// Writing a config file back failed.
    #[error("failed to write configuration: {0}")]
    WriteError(String),
}

/// Trait for loading configuration from key-value TOML files.
///
/// Blanket-implemented for every deserializable type.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::ParseError(format!("{}: {}", path.display(), e))
            }
        })?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

fn sign_ok(v: i32) -> bool {
    v == 1 || v == -1
}

fn flag_ok(v: i32) -> bool {
    v == 0 || v == 1
}

// ─── telsched.cfg ───────────────────────────────────────────────────

/// Site parameters from `telsched.cfg`.
///
/// `LONGITUDE` is positive west of Greenwich as entered; consumers negate
/// it to the internal +east convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct SiteCfg {
    /// Site longitude, rad +W.
    pub longitude: f64,
    /// Site latitude, rad +N.
    pub latitude: f64,
    /// Site elevation above sea level, m.
    pub elevation: f64,
    /// Default ambient temperature, °C.
    pub temperature: f64,
    /// Default atmospheric pressure, mB.
    pub pressure: f64,
    /// Stow altitude, rad.
    pub stowalt: f64,
    /// Stow azimuth, rad.
    pub stowaz: f64,
    /// Filter selected on stow; empty disables.
    #[serde(default)]
    pub stowfilter: String,
    /// Site banner shown by UIs.
    #[serde(default)]
    pub banner: String,
}

impl SiteCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-std::f64::consts::FRAC_PI_2..=std::f64::consts::FRAC_PI_2).contains(&self.latitude) {
            return Err(ConfigError::ValidationError(format!(
                "LATITUDE={} out of range [-pi/2, pi/2]",
                self.latitude
            )));
        }
        if self.pressure < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "PRESSURE={} must be >= 0",
                self.pressure
            )));
        }
        Ok(())
    }
}

// ─── telescoped.cfg ─────────────────────────────────────────────────

/// Mount axis and tracking parameters from `telescoped.cfg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct MountCfg {
    pub hhave: i32,
    pub haxis: i32,
    pub hhomelow: i32,
    pub hposside: i32,
    pub hestep: i32,
    pub hesign: i32,
    pub hmaxvel: f64,
    pub hmaxacc: f64,
    pub hslimacc: f64,

    pub dhave: i32,
    pub daxis: i32,
    pub dhomelow: i32,
    pub dposside: i32,
    pub destep: i32,
    pub design: i32,
    pub dmaxvel: f64,
    pub dmaxacc: f64,
    pub dslimacc: f64,

    pub rhave: i32,
    pub raxis: i32,
    #[serde(default)]
    pub rhaslim: i32,
    pub rhomelow: i32,
    pub rposside: i32,
    pub rstep: i32,
    pub rsign: i32,
    pub rmaxvel: f64,
    pub rmaxacc: f64,
    pub rslimacc: f64,

    /// Seconds covered by one uploaded tracking profile.
    pub trackint: i64,
    /// Tracking tolerance, rad; 0 means 1.5 feedback counts.
    pub trackacc: f64,
    /// Fine guide velocity, rad/s.
    pub fguidevel: f64,
    /// Coarse guide velocity, rad/s.
    pub cguidevel: f64,
    pub germeq: i32,
    pub zenflip: i32,
}

impl MountCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trackint <= 0 {
            return Err(ConfigError::ValidationError(
                "TRACKINT must be > 0".into(),
            ));
        }
        for (key, v) in [
            ("HESIGN", self.hesign),
            ("DESIGN", self.design),
            ("RSIGN", self.rsign),
        ] {
            if !sign_ok(v) {
                return Err(ConfigError::ValidationError(format!(
                    "{key} must be +-1, got {v}"
                )));
            }
        }
        for (key, v) in [
            ("HHOMELOW", self.hhomelow),
            ("DHOMELOW", self.dhomelow),
            ("RHOMELOW", self.rhomelow),
            ("HPOSSIDE", self.hposside),
            ("DPOSSIDE", self.dposside),
            ("RPOSSIDE", self.rposside),
        ] {
            if !flag_ok(v) {
                return Err(ConfigError::ValidationError(format!(
                    "{key} must be 0 or 1, got {v}"
                )));
            }
        }
        for (key, have, v) in [
            ("HMAXVEL", self.hhave, self.hmaxvel),
            ("DMAXVEL", self.dhave, self.dmaxvel),
            ("RMAXVEL", self.rhave, self.rmaxvel),
        ] {
            if have != 0 && v <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{key} must be > 0, got {v}"
                )));
            }
        }
        Ok(())
    }
}

// ─── home.cfg ───────────────────────────────────────────────────────

/// Discovered limits, motor calibration and the pointing model, from
/// `home.cfg`. Rewritten after a successful limit-discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct HomeCfg {
    pub ht: f64,
    pub dt: f64,
    pub xp: f64,
    pub yc: f64,
    pub np: f64,
    pub r0: f64,

    pub hposlim: f64,
    pub hneglim: f64,
    pub dposlim: f64,
    pub dneglim: f64,
    pub rposlim: f64,
    pub rneglim: f64,

    pub hstep: i32,
    pub hsign: i32,
    pub dstep: i32,
    pub dsign: i32,

    /// HA home switch is more than 180 degrees from north.
    #[serde(default)]
    pub largexp: i32,

    /// Focus travel limits, rad from home.
    pub oposlim: f64,
    pub oneglim: f64,
    /// Focus motor calibration discovered by limit runs; absent until the
    /// first run on encoder-equipped focusers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ostep: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osign: Option<i32>,
}

impl HomeCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, v) in [("HSIGN", self.hsign), ("DSIGN", self.dsign)] {
            if !sign_ok(v) {
                return Err(ConfigError::ValidationError(format!(
                    "{key} must be +-1, got {v}"
                )));
            }
        }
        for (key, neg, pos) in [
            ("H", self.hneglim, self.hposlim),
            ("D", self.dneglim, self.dposlim),
            ("R", self.rneglim, self.rposlim),
            ("O", self.oneglim, self.oposlim),
        ] {
            if neg >= pos {
                return Err(ConfigError::ValidationError(format!(
                    "{key}NEGLIM ({neg}) must be < {key}POSLIM ({pos})"
                )));
            }
        }
        Ok(())
    }

    /// Persist back to disk after a limit-discovery run.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string(self).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| ConfigError::WriteError(format!("{}: {}", path.display(), e)))
    }
}

// ─── focus.cfg ──────────────────────────────────────────────────────

fn default_minafdt() -> f64 {
    2.0
}
fn default_one() -> i32 {
    1
}

/// Focuser parameters from `focus.cfg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct FocusCfg {
    pub ohave: i32,
    pub oaxis: i32,
    #[serde(default)]
    pub ohaslim: i32,
    pub oposside: i32,
    pub ohomelow: i32,
    /// Steps per revolution; encoder counts when `OHAVEENC` is set.
    pub ostep: i32,
    /// Direction sense; encoder sense when `OHAVEENC` is set.
    pub osign: i32,
    pub omaxvel: f64,
    pub omaxacc: f64,
    pub oslimacc: f64,
    /// Optical scale, µm of focus travel per rad of motor.
    pub oscale: f64,
    /// Fraction of `OMAXVEL` used for paddle jogs.
    pub ojogf: f64,
    #[serde(default)]
    pub ohaveenc: i32,
    /// Temperature-driven autofocus enabled.
    #[serde(default = "default_one")]
    pub ousetempfoc: i32,
    /// Focuser shares its controller node with the dome.
    #[serde(default)]
    pub osharednode: i32,
    /// Use the FLI vendor driver instead of a controller node.
    #[serde(default)]
    pub oflifocus: i32,
    /// Skip `FocusTemp.dat` and use the two-point `filter.cfg` form.
    #[serde(default)]
    pub onofocustempdat: i32,
    /// Maximum temperature distance the table interpolation will bridge.
    #[serde(default)]
    pub maxinterp: i32,
    /// Minimum temperature change to trigger an autofocus move, °C.
    #[serde(default = "default_minafdt")]
    pub minafdt: f64,
}

impl FocusCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !sign_ok(self.osign) {
            return Err(ConfigError::ValidationError(format!(
                "OSIGN must be +-1, got {}",
                self.osign
            )));
        }
        if self.osharednode != 0 && self.ohaveenc != 0 {
            return Err(ConfigError::ValidationError(
                "OSHAREDNODE is not compatible with OHAVEENC".into(),
            ));
        }
        if self.ohave != 0 && self.oscale == 0.0 {
            return Err(ConfigError::ValidationError(
                "OSCALE must be non-zero".into(),
            ));
        }
        if self.ohave != 0 && self.omaxvel == 0.0 {
            return Err(ConfigError::ValidationError(
                "OMAXVEL must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ─── filter.cfg ─────────────────────────────────────────────────────

/// One filter's temperature-focus calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct FilterEntry {
    /// Filter name; selection goes by first character.
    pub name: String,
    /// Focus position at `T0`, µm.
    pub f0: f64,
    /// First calibration temperature, °C.
    pub t0: f64,
    /// Focus position at `T1`, µm.
    pub f1: f64,
    /// Second calibration temperature, °C.
    pub t1: f64,
}

/// Filter table from `filter.cfg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCfg {
    #[serde(rename = "FILTER")]
    pub filters: Vec<FilterEntry>,
}

impl FilterCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filters.is_empty() {
            return Err(ConfigError::ValidationError(
                "filter.cfg defines no filters".into(),
            ));
        }
        for f in &self.filters {
            if f.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "filter with empty NAME".into(),
                ));
            }
        }
        Ok(())
    }

    /// Find a filter by its first character, case-insensitively.
    pub fn find(&self, ch: char) -> Option<&FilterEntry> {
        let want = ch.to_ascii_uppercase();
        self.filters.iter().find(|f| {
            f.name
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase() == want)
                .unwrap_or(false)
        })
    }

    /// Zero-based wheel position of a filter character.
    pub fn position_of(&self, ch: char) -> Option<usize> {
        let want = ch.to_ascii_uppercase();
        self.filters.iter().position(|f| {
            f.name
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase() == want)
                .unwrap_or(false)
        })
    }
}

// ─── dome.cfg ───────────────────────────────────────────────────────

fn default_dome_radius() -> f64 {
    99_999_999.0
}

/// Dome and shutter parameters from `dome.cfg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct DomeCfg {
    pub domehave: i32,
    pub domeaxis: i32,
    /// Dome motion timeout, s.
    pub dometo: f64,
    /// Auto-mode azimuth tolerance, rad.
    pub dometol: f64,
    /// Azimuth of the dome home position, rad.
    pub domezero: f64,
    /// Encoder counts per dome revolution.
    pub domestep: f64,
    pub domesign: i32,
    pub shutterhave: i32,
    /// Shutter open/close timeout, s.
    pub shutterto: f64,
    /// Azimuth at which shutter power engages, rad. 0 together with
    /// `SHUTTERAZTOL = 0` disables alignment gating.
    pub shutteraz: f64,
    /// Alignment tolerance for shutter power, rad.
    pub shutteraztol: f64,
    /// Use motor counters instead of encoder counters on the controller.
    #[serde(default)]
    pub motoronly: i32,
    #[serde(default)]
    pub domeoffsetnorth: f64,
    #[serde(default)]
    pub domeoffseteast: f64,
    #[serde(default)]
    pub domeoffsetheight: f64,
    #[serde(default)]
    pub domeoffsetoptical: f64,
    #[serde(default = "default_dome_radius")]
    pub domeradius: f64,
}

impl DomeCfg {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !sign_ok(self.domesign) {
            return Err(ConfigError::ValidationError(format!(
                "DOMESIGN must be +-1, got {}",
                self.domesign
            )));
        }
        if self.domeradius <= 0.0 {
            return Err(ConfigError::ValidationError(
                "DOMERADIUS must be greater than zero".into(),
            ));
        }
        if self.domehave != 0 {
            if self.dometo <= 0.0 {
                return Err(ConfigError::ValidationError(
                    "DOMETO must be > 0".into(),
                ));
            }
            if self.domestep <= 0.0 {
                return Err(ConfigError::ValidationError(
                    "DOMESTEP must be > 0".into(),
                ));
            }
        }
        if self.shutterhave != 0 && self.shutterto <= 0.0 {
            return Err(ConfigError::ValidationError(
                "SHUTTERTO must be > 0".into(),
            ));
        }
        Ok(())
    }
}
