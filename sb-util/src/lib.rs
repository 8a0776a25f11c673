// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use log::{info, warn};
use simplelog as sl;
use std::collections::VecDeque;
use std::env;
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, UNIX_EPOCH};

pub mod json_file;

pub use json_file::{JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave};

pub const SYSCTL_ROOT: &str = "/proc/sys";

lazy_static::lazy_static! {
    pub static ref NR_SYSTEM_CPUS: usize = ::num_cpus::get();
    pub static ref HOSTNAME: String =
        sysinfo::System::host_name().unwrap_or_else(|| "localhost".into());
}

/// `SEMVER [SHA[-dirty]] [TARGET]` from the build data vergen emitted.
pub fn full_version(semver: &str) -> String {
    let mut parts = vec![semver.to_string()];
    if let Some(sha) = option_env!("VERGEN_GIT_SHA")
        .filter(|sha| sha.len() >= 7 && *sha != "VERGEN_IDEMPOTENT_OUTPUT")
    {
        let dirty = option_env!("VERGEN_GIT_DIRTY") == Some("true");
        parts.push(format!("{}{}", &sha[..7], if dirty { "-dirty" } else { "" }));
    }
    if let Some(triple) = option_env!("VERGEN_CARGO_TARGET_TRIPLE") {
        parts.push(triple.to_string());
    }
    parts.join(" ")
}

// (seconds per unit, bound before moving on to the next unit, suffix)
const DURATION_UNITS: &[(f64, f64, &str)] = &[
    (1e-9, 1000.0, "n"),
    (1e-6, 1000.0, "u"),
    (1e-3, 1000.0, "m"),
    (1.0, 60.0, "s"),
    (60.0, 60.0, "M"),
    (3600.0, 24.0, "H"),
    (86400.0, 365.0, "D"),
];

/// Short human readable duration, three significant digits at most.
pub fn format_duration(secs: f64) -> String {
    if secs < 0.5e-9 {
        return "0".into();
    }
    for (scale, bound, suffix) in DURATION_UNITS.iter() {
        let v = secs / scale;
        if v < 99.95 {
            return format!("{:.1}{}", v.max(0.1), suffix);
        } else if v < *bound {
            return format!("{:.0}{}", v, suffix);
        }
    }
    "INF".into()
}

/// Splits "2M_30s" into `[("2", Some('M')), ("30", Some('s'))]`. A number
/// without a unit comes last with `None`.
fn split_terms<F>(input: &str, is_unit: F) -> Vec<(String, Option<char>)>
where
    F: Fn(char) -> bool,
{
    let mut terms = vec![];
    let mut num = String::new();
    for ch in input.chars().filter(|ch| *ch != '_') {
        if is_unit(ch) {
            terms.push((num.trim().to_string(), Some(ch)));
            num.clear();
        } else {
            num.push(ch);
        }
    }
    if !num.trim().is_empty() {
        terms.push((num.trim().to_string(), None));
    }
    terms
}

fn duration_unit(ch: char) -> Option<f64> {
    DURATION_UNITS
        .iter()
        .find(|(_, _, suffix)| suffix.starts_with(ch))
        .map(|(scale, _, _)| *scale)
}

/// Parses "1.5M", "10s", "2M30s" and plain seconds into seconds.
pub fn parse_duration(input: &str) -> Result<f64> {
    let mut secs = 0.0;
    for (num, unit) in split_terms(input, |ch| duration_unit(ch).is_some()) {
        let v = num
            .parse::<f64>()
            .with_context(|| format!("invalid duration {:?}", input))?;
        secs += v * unit.and_then(duration_unit).unwrap_or(1.0);
    }
    Ok(secs)
}

fn size_shift(ch: char) -> Option<u32> {
    match ch.to_ascii_uppercase() {
        'B' => Some(0),
        'K' => Some(10),
        'M' => Some(20),
        'G' => Some(30),
        'T' => Some(40),
        _ => None,
    }
}

/// Parses binary sizes like "4G" or "2G_16.5M" into bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let mut bytes = 0;
    for (num, unit) in split_terms(input, |ch| size_shift(ch).is_some()) {
        let shift = unit.and_then(size_shift).unwrap_or(0);
        bytes += if num.contains('.') {
            let v = num
                .parse::<f64>()
                .with_context(|| format!("invalid size {:?}", input))?;
            (v * (1u64 << shift) as f64).round() as u64
        } else {
            let v = num
                .parse::<u64>()
                .with_context(|| format!("invalid size {:?}", input))?;
            v << shift
        };
    }
    Ok(bytes)
}

/// Looks `name` up in `PATH`.
pub fn find_bin(name: &str) -> Option<PathBuf> {
    let dirs = env::var_os("PATH")?;
    env::split_paths(&dirs).map(|dir| dir.join(name)).find(|cand| {
        cand.metadata()
            .map(|md| md.is_file() && md.mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

/// "net.ipv4.tcp_syncookies" -> "ROOT/net/ipv4/tcp_syncookies"
pub fn sysctl_path<P: AsRef<Path>>(root: P, name: &str) -> PathBuf {
    root.as_ref().join(name.replace('.', "/"))
}

/// Returns up to the last `nr` lines of the file at `path`.
pub fn tail_lines<P: AsRef<Path>>(path: P, nr: usize) -> Result<Vec<String>> {
    let f = fs::File::open(path)?;
    let mut tail = VecDeque::with_capacity(nr + 1);
    for line in BufReader::new(f).lines() {
        tail.push_back(line?);
        if tail.len() > nr {
            tail.pop_front();
        }
    }
    Ok(tail.into_iter().collect())
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}

pub fn format_unix_time(time: u64) -> String {
    DateTime::<Local>::from(UNIX_EPOCH + Duration::from_secs(time))
        .format("%x %T")
        .to_string()
}

fn log_level(verbosity: u32) -> sl::LevelFilter {
    match verbosity {
        0 => sl::LevelFilter::Info,
        1 => sl::LevelFilter::Debug,
        _ => sl::LevelFilter::Trace,
    }
}

/// `RUST_LOG` hands logging over to env_logger. Otherwise each `-v` raises
/// the level, logging to the terminal when stderr is attended.
pub fn init_logging(verbosity: u32) {
    if env::var_os("RUST_LOG").is_some() {
        env_logger::init();
        return;
    }

    let level = log_level(verbosity);
    let config = sl::ConfigBuilder::new()
        .set_time_level(sl::LevelFilter::Error)
        .set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off)
        .build();

    let on_term = console::user_attended_stderr()
        && sl::TermLogger::init(
            level,
            config.clone(),
            sl::TerminalMode::Stderr,
            sl::ColorChoice::Auto,
        )
        .is_ok();
    if !on_term {
        if let Err(e) = sl::SimpleLogger::init(level, config) {
            eprintln!("Failed to initialize logging ({:?})", &e);
        }
    }
}

/// Runs `cmd` and returns its stdout. Failures carry `emsg` and stderr.
pub fn run_command_output(cmd: &mut Command, emsg: &str) -> Result<String> {
    let out = match cmd.output() {
        Ok(v) => v,
        Err(e) => bail!("{}: {:?} ({})", emsg, &cmd, &e),
    };
    if !out.status.success() {
        bail!(
            "{}: {:?} ({}): {}",
            emsg,
            &cmd,
            &out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

lazy_static::lazy_static! {
    static ref EXITING: Mutex<bool> = Mutex::new(false);
    static ref EXITING_CV: Condvar = Condvar::new();
}

/// SIGINT and SIGTERM flip the program into the exiting state.
pub fn setup_prog_state() {
    if let Err(e) = ctrlc::set_handler(|| {
        info!("Signal received, exiting...");
        set_prog_exiting();
    }) {
        warn!("Failed to install signal handler ({})", &e);
    }
}

pub fn set_prog_exiting() {
    *EXITING.lock().unwrap() = true;
    EXITING_CV.notify_all();
}

pub fn prog_exiting() -> bool {
    *EXITING.lock().unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

/// Sleeps for `dur` unless the program starts exiting in the meantime.
pub fn wait_prog_state(dur: Duration) -> ProgState {
    let exiting = EXITING.lock().unwrap();
    let (exiting, _) = EXITING_CV
        .wait_timeout_while(exiting, dur, |exiting| !*exiting)
        .unwrap();
    if *exiting {
        ProgState::Exiting
    } else {
        ProgState::Running
    }
}
