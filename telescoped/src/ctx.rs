//! Shared daemon context.

use crate::error::DeviceError;
use std::path::{Path, PathBuf};
use tel_astro::mount::MeshMap;
use tel_astro::obj::EOD_EPOCH;
use tel_astro::time::{mjd_to_unix, unix_to_mjd};
use tel_common::config::{ConfigLoader, SiteCfg};
use tel_common::shm::TelStatShm;
use tracing::info;

/// Mean earth radius, m. Converts the configured elevation to earth radii.
const ERAD: f64 = 6.378_16e6;

/// State shared by every device machine: the live status record plus the
/// site constants that do not belong to any single device.
pub struct Ctx {
    /// The record published to shared memory each poll.
    pub stat: TelStatShm,
    /// Virtual motion controllers instead of hardware.
    pub virtual_mode: bool,
    /// Directory holding the config files.
    pub cfg_dir: PathBuf,
    /// Mount mesh-correction table.
    pub mesh: MeshMap,

    /// Stow position, rad.
    pub stowalt: f64,
    pub stowaz: f64,
    /// Filter selected on stow; empty disables.
    pub stowfilter: String,
}

impl Ctx {
    pub fn new(cfg_dir: &Path, virtual_mode: bool) -> Self {
        let mut stat = TelStatShm::default();
        stat.now.epoch = EOD_EPOCH;
        stat.dt = 100; // reader poll hint, ms
        Self {
            stat,
            virtual_mode,
            cfg_dir: cfg_dir.to_path_buf(),
            mesh: MeshMap::empty(),
            stowalt: 0.0,
            stowaz: 0.0,
            stowfilter: String::new(),
        }
    }

    /// Path of a config file.
    pub fn cfg_path(&self, name: &str) -> PathBuf {
        self.cfg_dir.join(name)
    }

    /// (Re)read the site file into the published circumstance.
    pub fn load_site(&mut self) -> Result<(), DeviceError> {
        let site = SiteCfg::load(&self.cfg_path("telsched.cfg"))?;
        site.validate()?;

        let now = &mut self.stat.now;
        now.lng = -site.longitude; // file is +W, we keep +E
        now.lat = site.latitude;
        now.temp = site.temperature;
        now.pressure = site.pressure;
        now.elev = site.elevation / ERAD;

        self.stowalt = site.stowalt;
        self.stowaz = site.stowaz;
        self.stowfilter = site.stowfilter;
        info!(
            lat = now.lat,
            lng = now.lng,
            "site configuration loaded"
        );
        Ok(())
    }

    /// Load the mesh table beside the other config files.
    pub fn load_mesh(&mut self) {
        match MeshMap::load(&self.cfg_path("telmesh.cfg")) {
            Ok(map) => {
                if !map.is_empty() {
                    info!(nodes = map.len(), "mount mesh loaded");
                }
                self.mesh = map;
            }
            Err(e) => {
                tracing::warn!("mesh file unusable, corrections disabled: {e}");
                self.mesh = MeshMap::empty();
            }
        }
    }

    /// Current MJD as carried in the published record.
    #[inline]
    pub fn mjd(&self) -> f64 {
        self.stat.now.mjd
    }

    /// Unix time derived from the published MJD (keeps tests clock-free).
    #[inline]
    pub fn unix_time(&self) -> i64 {
        mjd_to_unix(self.stat.now.mjd) as i64
    }

    /// Refresh the published MJD from the wall clock (daemon only).
    pub fn refresh_now(&mut self) {
        let unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.stat.now.mjd = unix_to_mjd(unix);
    }
}
