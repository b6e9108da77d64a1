//! Cross-module checks: a config set loaded through the public API and a
//! status record published and re-read through the seqlock.

use std::io::Write;
use tel_common::config::{ConfigLoader, DomeCfg, FilterCfg, HomeCfg, SiteCfg};
use tel_common::motor::MotorId;
use tel_common::shm::{ShmReader, ShmWriter, TelStatShm};
use tel_common::state::TelState;

fn write_file(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
fn config_set_loads_and_cross_validates() {
    let dir = tempfile::tempdir().unwrap();

    let site = write_file(
        dir.path(),
        "telsched.cfg",
        r#"
LONGITUDE = 1.59307
LATITUDE = 0.55803
ELEVATION = 230.0
TEMPERATURE = 10.0
PRESSURE = 1010.0
STOWALT = 1.396
STOWAZ = 3.14159
STOWFILTER = "C"
"#,
    );
    let home = write_file(
        dir.path(),
        "home.cfg",
        r#"
HT = 0.0
DT = 1.570796
XP = 0.0
YC = 0.0
NP = 0.0
R0 = 0.0
HPOSLIM = 1.6
HNEGLIM = -1.6
DPOSLIM = 1.9
DNEGLIM = -0.5
RPOSLIM = 3.0
RNEGLIM = -3.0
HSTEP = 1024000
HSIGN = 1
DSTEP = 1024000
DSIGN = 1
OPOSLIM = 1.4
ONEGLIM = -0.1
"#,
    );
    let dome = write_file(
        dir.path(),
        "dome.cfg",
        r#"
DOMEHAVE = 1
DOMEAXIS = 5
DOMETO = 180.0
DOMETOL = 0.08
DOMEZERO = 0.0
DOMESTEP = 36000.0
DOMESIGN = -1
SHUTTERHAVE = 1
SHUTTERTO = 120.0
SHUTTERAZ = 0.0
SHUTTERAZTOL = 0.0
"#,
    );
    let filters = write_file(
        dir.path(),
        "filter.cfg",
        r#"
[[FILTER]]
NAME = "Clear"
F0 = 1500.0
T0 = 20.0
F1 = 1530.0
T1 = 0.0
"#,
    );

    let site = SiteCfg::load(&site).unwrap();
    site.validate().unwrap();
    assert_eq!(site.stowfilter, "C");

    let home = HomeCfg::load(&home).unwrap();
    home.validate().unwrap();
    assert!(home.ostep.is_none()); // no encoder calibration yet

    let dome = DomeCfg::load(&dome).unwrap();
    dome.validate().unwrap();
    assert_eq!(dome.domesign, -1);
    assert!(dome.domeradius > 1e6); // defaulted

    let filters = FilterCfg::load(&filters).unwrap();
    filters.validate().unwrap();
    assert_eq!(filters.position_of('c'), Some(0));
}

#[test]
fn record_published_through_seqlock_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("telstat");

    let mut writer = ShmWriter::create(&path).unwrap();

    let mut stat = TelStatShm::default();
    stat.now.mjd = 60_300.5;
    stat.now.lat = 0.558;
    stat.telstate = TelState::Hunting as u8;
    let hm = &mut stat.minfo[MotorId::Hour.index()];
    hm.have = 1;
    hm.haveenc = 1;
    hm.estep = 1_024_000;
    hm.esign = 1;
    hm.sign = 1;
    hm.step = 1_024_000;
    hm.cpos = 0.25;
    hm.dpos = 0.26;
    stat.refresh_jogging_flag();
    writer.publish(&stat);

    // A separately attached reader sees the same record.
    let reader = ShmReader::attach(&path).unwrap();
    let snap = reader.snapshot().unwrap();
    assert_eq!(snap.telstate(), TelState::Hunting);
    assert_eq!(snap.now.mjd, 60_300.5);
    let hm = &snap.minfo[MotorId::Hour.index()];
    assert_eq!(hm.cpos, 0.25);
    assert!(hm.have());
    assert_eq!(snap.jogging_ison, 0);

    // Publishes are counted for staleness detection.
    writer.publish(&stat);
    assert_eq!(reader.heartbeat(), 2);
}
