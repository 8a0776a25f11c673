// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::{Display, Write};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use sb_util::*;

/// Every flag can also be set through `SENSBENCH_<FLAG_UPPER_SNAKE>`.
pub const ENV_PREFIX: &str = "SENSBENCH_";

/// Flags which never leave the process: not serialized, dumped or recorded.
pub const SECRET_FLAGS: &[&str] = &["kube-password"];

pub const DFL_AGGRESSORS: &[&str] = &[
    "None",
    "stress-ng-cache-l3",
    "stress-ng-memcpy",
    "stress-ng-stream",
];

// (usage, help) pairs. The long name of each entry which is also a field of
// Args gets its default value appended to the help text.
const FLAGS: &[(&str, &str)] = &[
    ("-d, --dir=[TOPDIR]", "Top dir for experiment output"),
    ("-r, --result=[RESULTFILE]", "Result summary json file"),
    ("-s, --sweep=[KIND]", "sensitivity, qps, cat, nice or threads"),
    ("--stop-on-error", "Abort the experiment on the first failed phase"),
    ("--slo=[USECS]", "Latency SLO in microseconds used when tuning peak load"),
    ("--load-points=[NR]", "Number of load points per aggressor"),
    ("--load-duration=[DUR]", "Load generation duration of each phase"),
    ("--repetitions=[NR]", "Number of repetitions of each load point"),
    ("--peak-load=[QPS]", "Peak load, 0 runs the tuning phase first"),
    ("--load-generator-wait-timeout=[DUR]", "Load generator wait timeout, 0 waits forever"),
    ("--telemetry-flush=[DUR]", "Delay after the load telemetry session before stopping it"),
    ("--qps=[LIST]", "Comma separated load points for the qps, cat and nice sweeps"),
    ("--aggressors=[LIST]", "Comma separated aggressors, None is the baseline"),
    ("--output-lines=[NR]", "Number of output lines to log when a task fails"),
    ("--hp-cpus=[NR]", "Number of HP cores on the shared cache"),
    ("--be-cpus=[NR]", "Number of BE cores on the shared cache"),
    ("--hp-range=[CPUS]", "Manual HP cpu range, e.g. 0-3,8"),
    ("--be-range=[CPUS]", "Manual BE cpu range for LLC aggressors"),
    ("--be-l1-range=[CPUS]", "Manual BE cpu range for L1 aggressors"),
    ("--cpuset", "Place HP and BE tasks in cpuset cgroups instead of taskset"),
    ("--numa-node=[NODE]", "Memory node for the HP and BE cpusets"),
    ("--cat-max-cache-ways=[NR]", "Largest number of cache ways given to BE"),
    ("--cat-min-cache-ways=[NR]", "Smallest number of cache ways given to BE"),
    ("--cat-max-be-cpus=[NR]", "Largest number of BE cpus, 0 uses all non-HP cpus"),
    ("--cat-min-be-cpus=[NR]", "Smallest number of BE cpus"),
    ("--nice-min=[PRIO]", "Lowest BE niceness of the nice sweep"),
    ("--nice-max=[PRIO]", "Highest BE niceness of the nice sweep"),
    ("--min-thread-count=[NR]", "Smallest HP thread count of the threads sweep"),
    ("--max-thread-count=[NR]", "Largest HP thread count of the threads sweep"),
    ("--memcached-path=[PATH]", "memcached binary"),
    ("--memcached-ip=[IP]", "memcached listen address"),
    ("--memcached-port=[PORT]", "memcached port"),
    ("--memcached-user=[USER]", "memcached user"),
    ("--memcached-threads=[NR]", "memcached worker threads"),
    ("--memcached-threads-affinity", "Pin memcached worker threads"),
    ("--memcached-connections=[NR]", "memcached max connections"),
    ("--memcached-max-memory=[MB]", "memcached memory in megabytes"),
    ("--mutilate-path=[PATH]", "mutilate binary"),
    ("--mutilate-master=[HOST]", "Host running the mutilate master"),
    ("--mutilate-agents=[LIST]", "Comma separated hosts running mutilate agents"),
    ("--mutilate-percentile=[PCT]", "Tail latency percentile"),
    ("--mutilate-warmup=[DUR]", "Warmup before each measurement"),
    ("--mutilate-tuning-time=[DUR]", "Duration of the peak load search"),
    ("--mutilate-records=[NR]", "Number of records to populate"),
    ("--mutilate-agent-threads=[NR]", "Threads of each agent"),
    ("--mutilate-agent-port=[PORT]", "Agent port"),
    ("--mutilate-agent-connections=[NR]", "Connections per agent thread"),
    ("--mutilate-agent-connections-depth=[NR]", "Outstanding requests per agent connection"),
    ("--mutilate-master-threads=[NR]", "Threads of the master"),
    ("--mutilate-master-connections=[NR]", "Connections per master thread"),
    ("--mutilate-master-connections-depth=[NR]", "Outstanding requests per master connection"),
    ("--mutilate-master-qps=[QPS]", "QPS of the master when agents are used, 0 for none"),
    ("--mutilate-key-size=[BYTES]", "Key size"),
    ("--mutilate-value-size=[BYTES]", "Value size"),
    ("--ssh-user=[USER]", "Remote shell user"),
    ("--ssh-port=[PORT]", "Remote shell port"),
    ("--ssh-key=[PATH]", "Private key for remote shells"),
    ("--kubernetes", "Run HP and BE tasks as pods"),
    ("--kube-address=[ADDR]", "Cluster API endpoint"),
    ("--kube-namespace=[NS]", "Pod namespace"),
    ("--kube-image=[IMAGE]", "Pod image"),
    ("--kube-node=[NAME]", "Node to schedule pods on, defaults to this host"),
    ("--kube-hp-cpu=[MILLIS]", "HP pod cpu request in millicores"),
    ("--kube-hp-memory=[SIZE]", "HP pod memory request"),
    ("--kube-hp-guaranteed", "Set HP pod limits equal to requests"),
    ("--kube-launch-timeout=[DUR]", "Pod launch timeout, 0 waits forever"),
    ("--kube-username=[USER]", "Cluster API basic auth user"),
    ("--kube-password=[PASS]", "Cluster API basic auth password"),
    ("--l1d-processes=[NR]", "Number of l1d aggressor processes"),
    ("--l1i-processes=[NR]", "Number of l1i aggressor processes"),
    ("--l3-processes=[NR]", "Number of l3 aggressor processes"),
    ("--membw-processes=[NR]", "Number of membw aggressor processes"),
    ("--stream-threads=[NR]", "stream OpenMP threads, 0 uses the BE cpu count"),
    ("--stressng-processes=[NR]", "stress-ng stressor instances"),
    ("--caffe-path=[PATH]", "caffe wrapper"),
    ("--be-as-service=[BOOL]", "Treat premature aggressor exit as an error"),
    ("--telemetry=[URL]", "Telemetry collector endpoint, empty disables sessions"),
    ("--metadata=[FILE]", "Metadata log, defaults to EXPDIR/metadata.jsonl"),
    ("-a, --args=[FILE]", "Loads base command line arguments from FILE"),
    ("-c, --config=[FILE]", "Loads KEY=VALUE lines into the environment"),
    ("--dump-config", "Print the configuration and exit"),
    ("-v...", "Sets the level of verbosity"),
];

lazy_static::lazy_static! {
    static ref TOP_ARGS_STR: String = {
        let dfl = serde_json::to_value(Args::default()).unwrap_or_default();
        let mut buf = String::new();
        for (usage, help) in FLAGS.iter() {
            let dfl_str = flag_long_name(usage)
                .and_then(|name| dfl.get(&field_name(name)))
                .map(render_value)
                .filter(|v| v.len() > 0);
            match dfl_str {
                Some(v) => writeln!(buf, "{} '{} (dfl: {})'", usage, help, v).unwrap(),
                None => writeln!(buf, "{} '{}'", usage, help).unwrap(),
            }
        }
        buf
    };
}

fn flag_long_name(usage: &str) -> Option<&str> {
    let start = usage.find("--")? + 2;
    let rest = &usage[start..];
    let end = rest.find(|c: char| c == '=' || c.is_whitespace()).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn field_name(flag: &str) -> String {
    flag.replace('-', "_")
}

pub fn env_name(flag: &str) -> String {
    format!("{}{}", ENV_PREFIX, field_name(flag).to_uppercase())
}

fn render_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "".into(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(vals) => vals
            .iter()
            .map(render_value)
            .collect::<Vec<String>>()
            .join(","),
        v => v.to_string(),
    }
}

/// Parses `KEY=VALUE` lines. Blank lines and `#` comments are skipped and
/// keys are normalized to the prefixed environment variable name.
pub fn parse_config(input: &str) -> Vec<(String, String)> {
    let mut pairs = vec![];
    for line in input.lines() {
        let line = line.trim();
        if line.len() == 0 || line.starts_with('#') {
            continue;
        }
        let (key, val) = match line.find('=') {
            Some(idx) => (line[..idx].trim(), line[idx + 1..].trim()),
            None => continue,
        };
        let key = key.to_uppercase().replace('-', "_");
        let key = if key.starts_with(ENV_PREFIX) {
            key
        } else {
            format!("{}{}", ENV_PREFIX, key)
        };
        pairs.push((key, val.to_string()));
    }
    pairs
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<usize> {
    let path = path.as_ref();
    let buf = fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
    let pairs = parse_config(&buf);
    for (key, val) in pairs.iter() {
        debug!("config: {}={:?}", key, val);
        env::set_var(key, val);
    }
    info!("config: Loaded {} entries from {:?}", pairs.len(), path);
    Ok(pairs.len())
}

pub fn parse_bool(input: &str) -> Result<bool> {
    match input.trim().to_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        v => bail!("invalid boolean {:?}", v),
    }
}

pub fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim())
        .filter(|s| s.len() > 0)
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Sweep {
    Sensitivity,
    Qps,
    Cat,
    Nice,
    Threads,
}

impl FromStr for Sweep {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input {
            "sensitivity" => Self::Sensitivity,
            "qps" => Self::Qps,
            "cat" => Self::Cat,
            "nice" => Self::Nice,
            "threads" => Self::Threads,
            v => bail!("unknown sweep {:?}", v),
        })
    }
}

impl std::fmt::Display for Sweep {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Sensitivity => "sensitivity",
            Self::Qps => "qps",
            Self::Cat => "cat",
            Self::Nice => "nice",
            Self::Threads => "threads",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub dir: String,
    pub result: Option<String>,
    pub sweep: Sweep,
    pub stop_on_error: bool,
    pub slo: u64,
    pub load_points: u32,
    pub load_duration: f64,
    pub repetitions: u32,
    pub peak_load: u64,
    pub load_generator_wait_timeout: f64,
    pub telemetry_flush: f64,
    pub qps: Vec<u64>,
    pub aggressors: Vec<String>,
    pub output_lines: usize,

    pub hp_cpus: usize,
    pub be_cpus: usize,
    pub hp_range: Option<String>,
    pub be_range: Option<String>,
    pub be_l1_range: Option<String>,
    pub cpuset: bool,
    pub numa_node: u32,

    pub cat_max_cache_ways: u32,
    pub cat_min_cache_ways: u32,
    pub cat_max_be_cpus: usize,
    pub cat_min_be_cpus: usize,
    pub nice_min: i32,
    pub nice_max: i32,
    pub min_thread_count: u32,
    pub max_thread_count: u32,

    pub memcached_path: String,
    pub memcached_ip: String,
    pub memcached_port: u16,
    pub memcached_user: String,
    pub memcached_threads: u32,
    pub memcached_threads_affinity: bool,
    pub memcached_connections: u32,
    pub memcached_max_memory: u64,

    pub mutilate_path: String,
    pub mutilate_master: String,
    pub mutilate_agents: Vec<String>,
    pub mutilate_percentile: String,
    pub mutilate_warmup: f64,
    pub mutilate_tuning_time: f64,
    pub mutilate_records: u64,
    pub mutilate_agent_threads: u32,
    pub mutilate_agent_port: u16,
    pub mutilate_agent_connections: u32,
    pub mutilate_agent_connections_depth: u32,
    pub mutilate_master_threads: u32,
    pub mutilate_master_connections: u32,
    pub mutilate_master_connections_depth: u32,
    pub mutilate_master_qps: u64,
    pub mutilate_key_size: u32,
    pub mutilate_value_size: u32,

    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_key: String,

    pub kubernetes: bool,
    pub kube_address: String,
    pub kube_namespace: String,
    pub kube_image: String,
    pub kube_node: Option<String>,
    pub kube_hp_cpu: u64,
    pub kube_hp_memory: u64,
    pub kube_hp_guaranteed: bool,
    pub kube_launch_timeout: f64,
    pub kube_username: Option<String>,
    #[serde(skip)]
    pub kube_password: Option<String>,

    pub l1d_processes: u32,
    pub l1i_processes: u32,
    pub l3_processes: u32,
    pub membw_processes: u32,
    pub stream_threads: u32,
    pub stressng_processes: u32,
    pub caffe_path: String,
    pub be_as_service: bool,

    pub telemetry: Option<String>,
    pub metadata: Option<String>,

    #[serde(skip)]
    pub dump_config: bool,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            dir: "sensbench-out".into(),
            result: None,
            sweep: Sweep::Sensitivity,
            stop_on_error: false,
            slo: 500,
            load_points: 10,
            load_duration: 15.0,
            repetitions: 1,
            peak_load: 0,
            load_generator_wait_timeout: 0.0,
            telemetry_flush: 5.0,
            qps: vec![],
            aggressors: DFL_AGGRESSORS.iter().map(|s| s.to_string()).collect(),
            output_lines: 5,

            hp_cpus: 1,
            be_cpus: 1,
            hp_range: None,
            be_range: None,
            be_l1_range: None,
            cpuset: false,
            numa_node: 0,

            cat_max_cache_ways: 11,
            cat_min_cache_ways: 1,
            cat_max_be_cpus: 0,
            cat_min_be_cpus: 1,
            nice_min: -20,
            nice_max: 19,
            min_thread_count: 1,
            max_thread_count: 4,

            memcached_path: "memcached".into(),
            memcached_ip: "127.0.0.1".into(),
            memcached_port: 11211,
            memcached_user: "root".into(),
            memcached_threads: 4,
            memcached_threads_affinity: false,
            memcached_connections: 2048,
            memcached_max_memory: 4096,

            mutilate_path: "mutilate".into(),
            mutilate_master: "127.0.0.1".into(),
            mutilate_agents: vec![],
            mutilate_percentile: "99".into(),
            mutilate_warmup: 10.0,
            mutilate_tuning_time: 10.0,
            mutilate_records: 10000,
            mutilate_agent_threads: 8,
            mutilate_agent_port: 5556,
            mutilate_agent_connections: 1,
            mutilate_agent_connections_depth: 1,
            mutilate_master_threads: 8,
            mutilate_master_connections: 4,
            mutilate_master_connections_depth: 4,
            mutilate_master_qps: 1000,
            mutilate_key_size: 30,
            mutilate_value_size: 200,

            ssh_user: "root".into(),
            ssh_port: 22,
            ssh_key: format!(
                "{}/.ssh/id_rsa",
                env::var("HOME").unwrap_or_else(|_| "/root".into())
            ),

            kubernetes: false,
            kube_address: "127.0.0.1:8080".into(),
            kube_namespace: "default".into(),
            kube_image: "sensbench-workloads:latest".into(),
            kube_node: None,
            kube_hp_cpu: *NR_SYSTEM_CPUS as u64 * 1000,
            kube_hp_memory: 4_000_000_000,
            kube_hp_guaranteed: false,
            kube_launch_timeout: 60.0,
            kube_username: None,
            kube_password: None,

            l1d_processes: 1,
            l1i_processes: 1,
            l3_processes: 1,
            membw_processes: 1,
            stream_threads: 0,
            stressng_processes: 1,
            caffe_path: "caffe.sh".into(),
            be_as_service: true,

            telemetry: None,
            metadata: None,

            dump_config: false,
            verbosity: 0,
        }
    }
}

/// Command line value of `name`, falling back to its environment variable.
fn flag_str(matches: &clap::ArgMatches, name: &str) -> Option<String> {
    match matches.value_of(name) {
        Some(v) => Some(v.to_string()),
        None => env::var(env_name(name)).ok(),
    }
}

fn flag_parse<T>(matches: &clap::ArgMatches, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    match flag_str(matches, name) {
        Some(v) => match v.trim().parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => bail!("invalid --{} {:?} ({})", name, &v, &e),
        },
        None => Ok(None),
    }
}

fn flag_dur(matches: &clap::ArgMatches, name: &str) -> Result<Option<f64>> {
    match flag_str(matches, name) {
        Some(v) => Ok(Some(
            parse_duration(&v).with_context(|| format!("invalid --{}", name))?,
        )),
        None => Ok(None),
    }
}

fn flag_size(matches: &clap::ArgMatches, name: &str) -> Result<Option<u64>> {
    match flag_str(matches, name) {
        Some(v) => Ok(Some(
            parse_size(&v).with_context(|| format!("invalid --{}", name))?,
        )),
        None => Ok(None),
    }
}

fn flag_bool(matches: &clap::ArgMatches, name: &str) -> Result<Option<bool>> {
    match flag_str(matches, name) {
        Some(v) => Ok(Some(
            parse_bool(&v).with_context(|| format!("invalid --{}", name))?,
        )),
        None => Ok(None),
    }
}

/// Switches turn on by presence. `SENSBENCH_<NAME>` can set either value.
fn flag_switch(matches: &clap::ArgMatches, name: &str) -> Result<Option<bool>> {
    if matches.is_present(name) {
        return Ok(Some(true));
    }
    match env::var(env_name(name)) {
        Ok(v) => Ok(Some(
            parse_bool(&v).with_context(|| format!("invalid {}", env_name(name)))?,
        )),
        Err(_) => Ok(None),
    }
}

fn flag_opt_str(matches: &clap::ArgMatches, name: &str) -> Option<Option<String>> {
    flag_str(matches, name).map(|v| if v.len() > 0 { Some(v) } else { None })
}

fn flag_list(matches: &clap::ArgMatches, name: &str) -> Option<Vec<String>> {
    flag_str(matches, name).map(|v| parse_list(&v))
}

impl Args {
    #[allow(dangerous_implicit_autorefs)]
    pub fn build_app() -> clap::App<'static, 'static> {
        clap::App::new("sensbench")
            .version((*super::FULL_VERSION).as_str())
            .author(clap::crate_authors!("\n"))
            .about("Sensitivity of latency critical services to co-located aggressors")
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .args_from_usage(&TOP_ARGS_STR)
    }

    /// Renders the current configuration in the `--config` file format.
    pub fn dump_config(&self) -> Result<String> {
        let dfl = serde_json::to_value(Args::default())?;
        let cur = serde_json::to_value(self)?;
        let mut buf = String::new();

        for (usage, help) in FLAGS.iter() {
            let name = match flag_long_name(usage) {
                Some(v) => v,
                None => continue,
            };
            let field = field_name(name);
            let val = match cur.get(&field) {
                Some(v) => render_value(v),
                None => continue,
            };
            writeln!(buf, "# {}", help)?;
            if let Some(v) = dfl.get(&field) {
                writeln!(buf, "# Default: {}", render_value(v))?;
            }
            writeln!(buf, "{}={}", env_name(name), val)?;
        }
        Ok(buf)
    }

    pub fn is_secret_env(key: &str) -> bool {
        SECRET_FLAGS.iter().any(|flag| env_name(flag) == key)
    }

    pub fn aggressor_is_baseline(name: &str) -> bool {
        name.len() == 0 || name.eq_ignore_ascii_case("none")
    }

    fn verify(&self) -> Result<()> {
        if self.load_points == 0 {
            bail!("--load-points must be positive");
        }
        if self.repetitions == 0 {
            bail!("--repetitions must be positive");
        }
        if self.load_duration <= 0.0 {
            bail!("--load-duration must be positive");
        }
        if self.hp_cpus == 0 || self.be_cpus == 0 {
            bail!("--hp-cpus and --be-cpus must be positive");
        }
        if self.cat_min_cache_ways == 0 || self.cat_min_cache_ways > self.cat_max_cache_ways {
            bail!(
                "invalid cache way range {}-{}",
                self.cat_min_cache_ways,
                self.cat_max_cache_ways
            );
        }
        if self.cat_max_be_cpus > 0 && self.cat_min_be_cpus > self.cat_max_be_cpus {
            bail!(
                "invalid BE cpu range {}-{}",
                self.cat_min_be_cpus,
                self.cat_max_be_cpus
            );
        }
        if self.nice_min < -20 || self.nice_max > 19 || self.nice_min > self.nice_max {
            bail!("invalid niceness range {}..{}", self.nice_min, self.nice_max);
        }
        if self.min_thread_count == 0 || self.min_thread_count > self.max_thread_count {
            bail!(
                "invalid thread count range {}-{}",
                self.min_thread_count,
                self.max_thread_count
            );
        }
        if self.memcached_ip == "0.0.0.0" {
            bail!("--memcached-ip must not be 0.0.0.0");
        }
        Ok(())
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some(
            "// sensbench base arguments, command line and SENSBENCH_ environment win\n//\n"
                .into(),
        )
    }
}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        Self::build_app().get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated = false;

        // Must come first so that the loaded entries act as flag fallbacks.
        if let Some(path) = flag_str(matches, "config") {
            load_config(&path)?;
        }

        if let Some(v) = flag_str(matches, "dir") {
            self.dir = if v.len() > 0 { v } else { dfl.dir.clone() };
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "result") {
            self.result = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "sweep")? {
            self.sweep = v;
            updated = true;
        }
        if let Some(v) = flag_switch(matches, "stop-on-error")? {
            self.stop_on_error = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "slo")? {
            self.slo = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "load-points")? {
            self.load_points = v;
            updated = true;
        }
        if let Some(v) = flag_dur(matches, "load-duration")? {
            self.load_duration = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "repetitions")? {
            self.repetitions = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "peak-load")? {
            self.peak_load = v;
            updated = true;
        }
        if let Some(v) = flag_dur(matches, "load-generator-wait-timeout")? {
            self.load_generator_wait_timeout = v;
            updated = true;
        }
        if let Some(v) = flag_dur(matches, "telemetry-flush")? {
            self.telemetry_flush = v;
            updated = true;
        }
        if let Some(v) = flag_list(matches, "qps") {
            let mut qps = vec![];
            for tok in v.iter() {
                qps.push(
                    tok.parse::<u64>()
                        .with_context(|| format!("invalid --qps entry {:?}", tok))?,
                );
            }
            self.qps = qps;
            updated = true;
        }
        if let Some(v) = flag_list(matches, "aggressors") {
            self.aggressors = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "output-lines")? {
            self.output_lines = v;
            updated = true;
        }

        if let Some(v) = flag_parse(matches, "hp-cpus")? {
            self.hp_cpus = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "be-cpus")? {
            self.be_cpus = v;
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "hp-range") {
            self.hp_range = v;
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "be-range") {
            self.be_range = v;
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "be-l1-range") {
            self.be_l1_range = v;
            updated = true;
        }
        if let Some(v) = flag_switch(matches, "cpuset")? {
            self.cpuset = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "numa-node")? {
            self.numa_node = v;
            updated = true;
        }

        if let Some(v) = flag_parse(matches, "cat-max-cache-ways")? {
            self.cat_max_cache_ways = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "cat-min-cache-ways")? {
            self.cat_min_cache_ways = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "cat-max-be-cpus")? {
            self.cat_max_be_cpus = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "cat-min-be-cpus")? {
            self.cat_min_be_cpus = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "nice-min")? {
            self.nice_min = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "nice-max")? {
            self.nice_max = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "min-thread-count")? {
            self.min_thread_count = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "max-thread-count")? {
            self.max_thread_count = v;
            updated = true;
        }

        if let Some(v) = flag_str(matches, "memcached-path") {
            self.memcached_path = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "memcached-ip") {
            self.memcached_ip = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "memcached-port")? {
            self.memcached_port = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "memcached-user") {
            self.memcached_user = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "memcached-threads")? {
            self.memcached_threads = v;
            updated = true;
        }
        if let Some(v) = flag_switch(matches, "memcached-threads-affinity")? {
            self.memcached_threads_affinity = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "memcached-connections")? {
            self.memcached_connections = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "memcached-max-memory")? {
            self.memcached_max_memory = v;
            updated = true;
        }

        if let Some(v) = flag_str(matches, "mutilate-path") {
            self.mutilate_path = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "mutilate-master") {
            self.mutilate_master = v;
            updated = true;
        }
        if let Some(v) = flag_list(matches, "mutilate-agents") {
            self.mutilate_agents = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "mutilate-percentile") {
            self.mutilate_percentile = v;
            updated = true;
        }
        if let Some(v) = flag_dur(matches, "mutilate-warmup")? {
            self.mutilate_warmup = v;
            updated = true;
        }
        if let Some(v) = flag_dur(matches, "mutilate-tuning-time")? {
            self.mutilate_tuning_time = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-records")? {
            self.mutilate_records = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-agent-threads")? {
            self.mutilate_agent_threads = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-agent-port")? {
            self.mutilate_agent_port = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-agent-connections")? {
            self.mutilate_agent_connections = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-agent-connections-depth")? {
            self.mutilate_agent_connections_depth = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-master-threads")? {
            self.mutilate_master_threads = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-master-connections")? {
            self.mutilate_master_connections = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-master-connections-depth")? {
            self.mutilate_master_connections_depth = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-master-qps")? {
            self.mutilate_master_qps = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-key-size")? {
            self.mutilate_key_size = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "mutilate-value-size")? {
            self.mutilate_value_size = v;
            updated = true;
        }

        if let Some(v) = flag_str(matches, "ssh-user") {
            self.ssh_user = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "ssh-port")? {
            self.ssh_port = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "ssh-key") {
            self.ssh_key = if v.len() > 0 { v } else { dfl.ssh_key.clone() };
            updated = true;
        }

        if let Some(v) = flag_switch(matches, "kubernetes")? {
            self.kubernetes = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "kube-address") {
            self.kube_address = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "kube-namespace") {
            self.kube_namespace = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "kube-image") {
            self.kube_image = v;
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "kube-node") {
            self.kube_node = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "kube-hp-cpu")? {
            self.kube_hp_cpu = v;
            updated = true;
        }
        if let Some(v) = flag_size(matches, "kube-hp-memory")? {
            self.kube_hp_memory = v;
            updated = true;
        }
        if let Some(v) = flag_switch(matches, "kube-hp-guaranteed")? {
            self.kube_hp_guaranteed = v;
            updated = true;
        }
        if let Some(v) = flag_dur(matches, "kube-launch-timeout")? {
            self.kube_launch_timeout = v;
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "kube-username") {
            self.kube_username = v;
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "kube-password") {
            self.kube_password = v;
            updated = true;
        }

        if let Some(v) = flag_parse(matches, "l1d-processes")? {
            self.l1d_processes = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "l1i-processes")? {
            self.l1i_processes = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "l3-processes")? {
            self.l3_processes = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "membw-processes")? {
            self.membw_processes = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "stream-threads")? {
            self.stream_threads = v;
            updated = true;
        }
        if let Some(v) = flag_parse(matches, "stressng-processes")? {
            self.stressng_processes = v;
            updated = true;
        }
        if let Some(v) = flag_str(matches, "caffe-path") {
            self.caffe_path = v;
            updated = true;
        }
        if let Some(v) = flag_bool(matches, "be-as-service")? {
            self.be_as_service = v;
            updated = true;
        }

        if let Some(v) = flag_opt_str(matches, "telemetry") {
            self.telemetry = v;
            updated = true;
        }
        if let Some(v) = flag_opt_str(matches, "metadata") {
            self.metadata = v;
            updated = true;
        }

        self.dump_config = matches.is_present("dump-config");
        self.verbosity = Self::verbosity(matches);

        self.verify()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(argv: &[&str]) -> Result<Args> {
        let mut full = vec!["sensbench"];
        full.extend_from_slice(argv);
        let matches = Args::build_app().get_matches_from_safe(full)?;
        let mut args = Args::default();
        args.process_cmdline(&matches)?;
        Ok(args)
    }

    #[test]
    fn test_env_name() {
        for pair in &[
            ("slo", "SENSBENCH_SLO"),
            ("mutilate-agent-port", "SENSBENCH_MUTILATE_AGENT_PORT"),
            ("be-l1-range", "SENSBENCH_BE_L1_RANGE"),
        ] {
            assert_eq!(env_name(pair.0), pair.1);
        }
    }

    #[test]
    fn test_every_flag_is_a_field() {
        let dfl = serde_json::to_value(Args::default()).unwrap();
        for (usage, _) in FLAGS.iter() {
            let name = match flag_long_name(usage) {
                Some(v) => v,
                None => continue,
            };
            if ["args", "config", "dump-config"].contains(&name) || SECRET_FLAGS.contains(&name) {
                continue;
            }
            assert!(dfl.get(&field_name(name)).is_some(), "{} has no field", name);
        }
    }

    #[test]
    fn test_cmdline() {
        let _ = ::env_logger::try_init();
        let args = process(&[
            "--slo",
            "700",
            "--aggressors",
            "l1d, None,stress-ng-stream",
            "--load-duration",
            "2M",
            "--qps",
            "1000,2000",
            "--sweep",
            "qps",
            "--kube-hp-memory",
            "1G",
        ])
        .unwrap();
        assert_eq!(args.slo, 700);
        assert_eq!(args.aggressors, vec!["l1d", "None", "stress-ng-stream"]);
        assert_eq!(args.load_duration, 120.0);
        assert_eq!(args.qps, vec![1000, 2000]);
        assert_eq!(args.sweep, Sweep::Qps);
        assert_eq!(args.kube_hp_memory, 1 << 30);
        assert_eq!(args.memcached_port, 11211);

        assert!(process(&["--sweep", "bogus"]).is_err());
        assert!(process(&["--load-points", "0"]).is_err());
        assert!(process(&["--memcached-ip", "0.0.0.0"]).is_err());
        assert!(process(&["--qps", "10,abc"]).is_err());
    }

    #[test]
    fn test_env_fallback() {
        env::set_var("SENSBENCH_NICE_MIN", "-5");
        env::set_var("SENSBENCH_NICE_MAX", "5");
        let args = process(&["--nice-max", "10"]).unwrap();
        env::remove_var("SENSBENCH_NICE_MIN");
        env::remove_var("SENSBENCH_NICE_MAX");
        assert_eq!(args.nice_min, -5);
        assert_eq!(args.nice_max, 10);
    }

    #[test]
    fn test_parse_config() {
        let pairs = parse_config(
            "# comment\n\
             \n\
             SLO=800\n\
             SENSBENCH_LOAD_POINTS = 3\n\
             memcached-threads=2\n\
             garbage\n",
        );
        assert_eq!(
            pairs,
            vec![
                ("SENSBENCH_SLO".to_string(), "800".to_string()),
                ("SENSBENCH_LOAD_POINTS".to_string(), "3".to_string()),
                ("SENSBENCH_MEMCACHED_THREADS".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_dump_config() {
        let mut args = Args::default();
        args.slo = 900;
        args.qps = vec![10, 20];
        let dump = args.dump_config().unwrap();
        assert!(dump.contains("# Default: 500\nSENSBENCH_SLO=900\n"));
        assert!(dump.contains("SENSBENCH_QPS=10,20\n"));
        assert!(dump.contains("SENSBENCH_HP_RANGE=\n"));
        assert!(!dump.contains("SENSBENCH_DUMP_CONFIG"));

        let pairs = parse_config(&dump);
        assert!(pairs.contains(&("SENSBENCH_SWEEP".to_string(), "sensitivity".to_string())));
    }

    #[test]
    fn test_switches() {
        let args = process(&["--stop-on-error", "--cpuset", "--be-as-service", "false"]).unwrap();
        assert!(args.stop_on_error);
        assert!(args.cpuset);
        assert!(!args.be_as_service);
        assert!(!args.kubernetes);
        assert!(process(&["--kubernetes", "true"]).is_err());

        env::set_var("SENSBENCH_KUBE_HP_GUARANTEED", "yes");
        let args = process(&[]).unwrap();
        env::remove_var("SENSBENCH_KUBE_HP_GUARANTEED");
        assert!(args.kube_hp_guaranteed);
    }

    #[test]
    fn test_password_stays_private() {
        let args = process(&["--kube-username", "admin", "--kube-password", "hunter2"]).unwrap();
        assert_eq!(args.kube_password.as_deref(), Some("hunter2"));

        assert!(!serde_json::to_string(&args).unwrap().contains("hunter2"));
        let dump = args.dump_config().unwrap();
        assert!(!dump.contains("hunter2"));
        assert!(!dump.contains("SENSBENCH_KUBE_PASSWORD"));
        assert!(dump.contains("SENSBENCH_KUBE_USERNAME=admin\n"));

        assert!(Args::is_secret_env("SENSBENCH_KUBE_PASSWORD"));
        assert!(!Args::is_secret_env("SENSBENCH_KUBE_USERNAME"));
    }

    #[test]
    fn test_parse_bool() {
        for pair in &[("1", true), ("True", true), ("off", false), ("0", false)] {
            assert_eq!(parse_bool(pair.0).unwrap(), pair.1);
        }
        assert!(parse_bool("maybe").is_err());
    }
}
