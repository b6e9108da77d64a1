//! The telescope control daemon.
//!
//! Listens on per-device command fifos, steps every device state machine
//! each poll, and publishes the live status record to shared memory.
//! `-v` runs against virtual motion controllers instead of hardware.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info};

use telescoped::ctx::Ctx;
use telescoped::dome::DomeDevice;
use telescoped::fifos::{wait_readable, FifoPair, FIFO_NAMES};
use telescoped::filter::FilterDevice;
use telescoped::focus::FocusDevice;
use telescoped::tel::TelDevice;
use telescoped::Respond;

use tel_common::shm::{default_segment_path, ShmWriter};

/// Idle poll interval; also the fifo wait timeout.
const POLL_MS: u16 = 50;

#[derive(Parser, Debug)]
#[command(name = "telescoped", about = "Telescope control daemon")]
struct Args {
    /// Run in virtual mode without actual hardware attached.
    #[arg(short = 'v', long = "virtual")]
    virtual_mode: bool,

    /// Directory holding the config files.
    #[arg(short = 'c', long = "config", default_value = "config")]
    config: PathBuf,

    /// Directory for the command fifos and the lock file.
    #[arg(short = 'r', long = "rundir", default_value = "comm")]
    rundir: PathBuf,

    /// Status shared-memory segment path (default: the well-known key).
    #[arg(long = "shm")]
    shm: Option<PathBuf>,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signals() -> Result<(), nix::errno::Errno> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let stop = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // SAFETY: the handler only stores to an atomic flag.
    unsafe {
        sigaction(Signal::SIGINT, &stop)?;
        sigaction(Signal::SIGTERM, &stop)?;
        sigaction(Signal::SIGHUP, &stop)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Hours west of UTC for the published record.
fn detect_timezone() -> f64 {
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: localtime_r fills the tm we own; now is a valid time_t.
    if unsafe { libc::localtime_r(&now, &mut tm) }.is_null() {
        return 0.0;
    }
    -(tm.tm_gmtoff as f64) / 3600.0
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = std::fs::create_dir_all(&args.rundir) {
        error!("cannot create run directory {}: {e}", args.rundir.display());
        return ExitCode::from(1);
    }

    // Only ever one.
    let lock_path = args.rundir.join("telescoped.pid");
    let lock_file = match std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_path)
    {
        Ok(f) => f,
        Err(e) => {
            error!("cannot open lock file {}: {e}", lock_path.display());
            return ExitCode::from(1);
        }
    };
    let _lock = match nix::fcntl::Flock::lock(
        lock_file,
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    ) {
        Ok(lock) => {
            use std::io::Write;
            let mut f = lock;
            let _ = writeln!(&mut *f, "{}", std::process::id());
            f
        }
        Err((_, _)) => {
            error!("telescoped: already running");
            return ExitCode::from(1);
        }
    };

    let shm_path = args.shm.clone().unwrap_or_else(default_segment_path);
    let mut writer = match ShmWriter::create(&shm_path) {
        Ok(w) => w,
        Err(e) => {
            error!("cannot create status segment {}: {e}", shm_path.display());
            return ExitCode::from(1);
        }
    };

    if let Err(e) = install_signals() {
        error!("cannot install signal handlers: {e}");
        return ExitCode::from(1);
    }

    let mut fifos: Vec<FifoPair> = Vec::new();
    for name in FIFO_NAMES {
        match FifoPair::create(&args.rundir, name) {
            Ok(pair) => fifos.push(pair),
            Err(e) => {
                error!("cannot create fifo pair {name}: {e}");
                return ExitCode::from(1);
            }
        }
    }

    // Configuration problems are fatal at startup; later rereads merely
    // refuse the reset.
    if let Err(e) = preflight_configs(&args.config) {
        error!("fatal configuration error: {e}");
        return ExitCode::from(2);
    }

    let mut ctx = Ctx::new(&args.config, args.virtual_mode);
    ctx.refresh_now();
    ctx.stat.now.tz = detect_timezone();

    let mut tel = TelDevice::new();
    let mut dome = DomeDevice::new();
    let mut focus = FocusDevice::new();
    let mut filter = FilterDevice::new(!args.virtual_mode);

    info!(
        virtual_mode = args.virtual_mode,
        config = %args.config.display(),
        "telescoped starting"
    );

    // Bring every subsystem up from its config files.
    all_reset(
        &mut ctx, &mut tel, &mut dome, &mut focus, &mut filter, &mut fifos,
    );
    writer.publish(&ctx.stat);

    let mut last_tick = Instant::now();
    while !STOP.load(Ordering::SeqCst) {
        // Drain incoming commands.
        let ready = wait_readable(&fifos, POLL_MS);
        for idx in ready {
            while let Some(line) = fifos[idx].try_read_line() {
                dispatch(
                    idx, &line, &mut ctx, &mut tel, &mut dome, &mut focus, &mut filter,
                    &mut fifos,
                );
            }
        }

        // Advance simulations and the clock, then tick every machine.
        let dt = last_tick.elapsed();
        last_tick = Instant::now();
        tel.service(dt);
        dome.service(dt);
        focus.service(dt);
        filter.service(dt);
        ctx.refresh_now();

        tel.poll(&mut ctx, &mut fifos[0]);
        dome.poll(&mut ctx, &mut fifos[1]);
        focus.poll(&mut ctx, &mut fifos[2]);
        filter.poll(&mut ctx, &mut fifos[3]);

        // Cross-device plumbing.
        if let Some(ch) = tel.stow_filter_request.take() {
            let msg = ch.to_string();
            dispatch(
                3, &msg, &mut ctx, &mut tel, &mut dome, &mut focus, &mut filter,
                &mut fifos,
            );
        }
        if let Some(setup) = focus.shared_setup_request.take() {
            dome.focus_shared_setup = Some(setup);
        }

        ctx.stat.refresh_jogging_flag();
        writer.publish(&ctx.stat);
    }

    info!("signal received, stopping all devices");
    all_stop(
        &mut ctx, &mut tel, &mut dome, &mut focus, &mut filter, &mut fifos,
    );
    writer.publish(&ctx.stat);
    ExitCode::SUCCESS
}

/// Validate every config file once before bringing hardware up.
fn preflight_configs(dir: &std::path::Path) -> Result<(), tel_common::config::ConfigError> {
    use tel_common::config::{
        ConfigLoader, DomeCfg, FilterCfg, FocusCfg, HomeCfg, MountCfg, SiteCfg,
    };

    SiteCfg::load(&dir.join("telsched.cfg"))?.validate()?;
    MountCfg::load(&dir.join("telescoped.cfg"))?.validate()?;
    HomeCfg::load(&dir.join("home.cfg"))?.validate()?;
    FocusCfg::load(&dir.join("focus.cfg"))?.validate()?;
    FilterCfg::load(&dir.join("filter.cfg"))?.validate()?;
    DomeCfg::load(&dir.join("dome.cfg"))?.validate()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    idx: usize,
    line: &str,
    ctx: &mut Ctx,
    tel: &mut TelDevice,
    dome: &mut DomeDevice,
    focus: &mut FocusDevice,
    filter: &mut FilterDevice,
    fifos: &mut [FifoPair],
) {
    match idx {
        0 => tel.handle_msg(ctx, line, &mut fifos[0]),
        1 => dome.handle_msg(ctx, line, &mut fifos[1]),
        2 => focus.handle_msg(ctx, line, &mut fifos[2]),
        3 => filter.handle_msg(ctx, line, &mut fifos[3]),
        4 => fifos[4].send(0, "Ok, but lights not really installed"),
        5 => handle_power(line, ctx, tel, dome, focus, fifos),
        _ => {}
    }
}

/// The Power channel: a powerfail message parks everything.
fn handle_power(
    line: &str,
    ctx: &mut Ctx,
    tel: &mut TelDevice,
    dome: &mut DomeDevice,
    focus: &mut FocusDevice,
    fifos: &mut [FifoPair],
) {
    let lower = line.to_ascii_lowercase();
    if lower.starts_with("powerfail") {
        fifos[5].send(1, "Power failure: stopping all devices");
        tel.cmd_stop(ctx, true, &mut fifos[0]);
        focus.handle_msg(ctx, "stop", &mut fifos[2]);
        dome.handle_msg(ctx, "close", &mut fifos[1]);
        fifos[5].send(0, "Power failure handling complete");
    } else if lower.starts_with("powerok") {
        fifos[5].send(0, "Power restored");
    } else {
        fifos[5].send(-1, &format!("Unknown power message: {:.20}", line));
    }
}

#[allow(clippy::too_many_arguments)]
fn all_reset(
    ctx: &mut Ctx,
    tel: &mut TelDevice,
    dome: &mut DomeDevice,
    focus: &mut FocusDevice,
    filter: &mut FilterDevice,
    fifos: &mut [FifoPair],
) {
    tel.handle_msg(ctx, "Reset", &mut fifos[0]);
    filter.handle_msg(ctx, "Reset", &mut fifos[3]);
    focus.handle_msg(ctx, "Reset", &mut fifos[2]);
    // The dome resets last so a shared focus node picks up its setup.
    if let Some(setup) = focus.shared_setup_request.take() {
        dome.focus_shared_setup = Some(setup);
    }
    dome.handle_msg(ctx, "Reset", &mut fifos[1]);
}

fn all_stop(
    ctx: &mut Ctx,
    tel: &mut TelDevice,
    dome: &mut DomeDevice,
    focus: &mut FocusDevice,
    filter: &mut FilterDevice,
    fifos: &mut [FifoPair],
) {
    tel.cmd_stop(ctx, true, &mut fifos[0]);
    filter.handle_msg(ctx, "stop", &mut fifos[3]);
    focus.handle_msg(ctx, "stop", &mut fifos[2]);
    dome.handle_msg(ctx, "stop", &mut fifos[1]);
}
