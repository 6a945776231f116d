/// In-memory representations of the records read from the store.
///
/// Space is at a premium because we hold very many of these, so fields are no wider than they need
/// to be, all repeated strings are interned `Ustr`, and times are Unix seconds (UTC) in an i64.
///
/// Records are immutable once they have been handed out by a store: they are shared between the
/// cache and any number of concurrent queries.  Per-query derived data live in wrappers (see
/// `Sample` in postprocess.rs).
use anyhow::{bail, Result};
use rustutils::{ustr_empty, GpuSet};
use std::mem::size_of;
use ustr::Ustr;

/// Set in `LogEntry::flags` for records whose command is `_heartbeat_`.
pub const FLAG_HEARTBEAT: u8 = 1;

/// One process-level (or rolled-up job-level) sample.
///
/// Any discrepancies between the documentation in this structure and the documentation for Sonar
/// should be considered a bug.

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Common to all records created by the same sonar invocation.  No subsecond precision.
    pub timestamp: i64,

    /// Total memory installed on the node, zero if unknown.
    pub memtotal_kb: u64,

    /// Virtual memory used by the process at the time of sampling, data+stack.
    pub cpu_kb: u64,

    /// Resident memory, owned exclusively by the process.  RssAnon is not a perfect measure of
    /// that, but a compromise; see comments in Sonar.
    pub rssanon_kb: u64,

    /// GPU memory used by the process across all the cards in `gpus`.
    ///
    /// Semi-computed field.  Not always reliable in its raw form; the sample rectifier tidies it up
    /// when there is a node configuration.
    pub gpu_kb: u64,

    /// Accumulated CPU time since the start, including time for any of its children that have
    /// terminated.
    pub cputime_sec: u64,

    /// Format "major.minor.bugfix".
    pub version: Ustr,

    /// Empty for data that do not carry a cluster name.
    pub cluster: Ustr,

    /// Fully qualified domain name.
    pub hostname: Ustr,

    /// Unix user name, or `_zombie_<PID>`.
    pub user: Ustr,

    /// The executable name, possibly with more stuff.  `_unknown_` for zombies, `_noinfo_` when the
    /// command could not be found, `_heartbeat_` for heartbeats.
    pub command: Ustr,

    /// Cores on the node, zero if unknown.
    pub num_cores: u32,

    pub job_id: u32,

    /// For untagged data this is the job ID.
    pub pid: u32,

    pub ppid: u32,

    /// Running average of the CPU usage of the process over its lifetime.  IT IS NOT A SAMPLE.
    /// 100.0 = one core's worth.
    pub cpu_pct: f32,

    /// Sum of card utilization across `gpus`, 100.0 = one card's worth.
    pub gpu_pct: f32,

    /// Memory as a percentage of one card's memory, summed across `gpus`.  Semi-computed, see
    /// `gpu_kb`.
    pub gpumem_pct: f32,

    pub gpus: GpuSet,

    /// Number of *other* processes with the same parent and command that were rolled into this one.
    pub rolledup: u32,

    /// Nonzero if some GPU was observed to be failing.
    pub gpu_fail: u8,

    pub flags: u8,
}

impl LogEntry {
    pub fn is_heartbeat(&self) -> bool {
        (self.flags & FLAG_HEARTBEAT) != 0
    }

    /// A zeroed record with the given time and host.  The user and command are "_zero_", so that
    /// the record can be recognized as intentional.
    pub fn empty(timestamp: i64, hostname: Ustr) -> LogEntry {
        let zero = Ustr::from("_zero_");
        LogEntry {
            timestamp,
            memtotal_kb: 0,
            cpu_kb: 0,
            rssanon_kb: 0,
            gpu_kb: 0,
            cputime_sec: 0,
            version: ustr_empty(),
            cluster: ustr_empty(),
            hostname,
            user: zero,
            command: zero,
            num_cores: 0,
            job_id: 0,
            pid: 0,
            ppid: 0,
            cpu_pct: 0.0,
            gpu_pct: 0.0,
            gpumem_pct: 0.0,
            gpus: GpuSet::empty(),
            rolledup: 0,
            gpu_fail: 0,
            flags: 0,
        }
    }
}

/// Parse a version string "major.minor.bugfix".  Missing or malformed parts are zero.  Avoid
/// allocation here, we parse *a lot* of these.

pub fn parse_version(v: &str) -> (u16, u16, u16) {
    let mut parts = v.splitn(3, '.').map(|p| {
        let digits = p.len() - p.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        p[..digits].parse::<u16>().unwrap_or(0)
    });
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let bugfix = parts.next().unwrap_or(0);
    (major, minor, bugfix)
}

/// Per-CPU load for all cores on a host at a point in time.

#[derive(Debug, Clone, PartialEq)]
pub struct CpuSamples {
    pub timestamp: i64,
    pub hostname: Ustr,
    pub encoded: EncodedCpuSamples,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodedCpuSamples {
    /// Base-45 delta encoding from CSV sample files, see `decode_cpu_samples`.
    Bytes(Box<[u8]>),
    /// Already-decoded per-core cumulative CPU seconds from JSON sample files.
    Values(Vec<u64>),
}

impl CpuSamples {
    pub fn decode(&self) -> Result<Vec<u64>> {
        match &self.encoded {
            EncodedCpuSamples::Bytes(bs) => decode_cpu_samples(bs),
            EncodedCpuSamples::Values(vs) => Ok(vs.clone()),
        }
    }

    pub fn size(&self) -> usize {
        size_of::<CpuSamples>()
            + match &self.encoded {
                EncodedCpuSamples::Bytes(bs) => bs.len(),
                EncodedCpuSamples::Values(vs) => vs.len() * size_of::<u64>(),
            }
    }
}

// The encoding is an array of u64 values written as base-45 numbers, with the digits of each
// number little-endian.  The first digit of a number is taken from INITIAL and the remaining ones
// from SUBSEQUENT, so numbers are self-delimiting.  The first number is a base that is added to all
// the following numbers, which are the values.

const INITIAL: &[u8] = b"(){}[]<>+-abcdefghijklmnopqrstuvwxyz!@#$%^&*_";
const SUBSEQUENT: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ~|';:.?/`";

pub fn decode_cpu_samples(bs: &[u8]) -> Result<Vec<u64>> {
    let mut vals: Vec<u64> = vec![];
    let mut val = 0u64;
    let mut shift = 1u64;
    let mut started = false;
    for c in bs {
        if let Some(ix) = INITIAL.iter().position(|x| x == c) {
            if started {
                vals.push(val);
            }
            val = ix as u64;
            shift = 45;
            started = true;
        } else if let Some(ix) = SUBSEQUENT.iter().position(|x| x == c) {
            if !started {
                bail!("Continuation digit without a number in load data")
            }
            val = val.wrapping_add((ix as u64).wrapping_mul(shift));
            shift = shift.wrapping_mul(45);
        } else {
            bail!("Invalid character in load data: {}", *c as char)
        }
    }
    if !started {
        bail!("Empty load data")
    }
    vals.push(val);
    let base = vals[0];
    Ok(vals[1..].iter().map(|v| v + base).collect())
}

/// GPU sample data for all the cards on a host at a point in time.

#[derive(Debug, Clone, PartialEq)]
pub struct GpuSamples {
    pub timestamp: i64,
    pub hostname: Ustr,
    pub encoded: EncodedGpuSamples,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodedGpuSamples {
    /// Old-style "tag=x|y|z,tag=..." from CSV sample files.
    Bytes(Box<[u8]>),
    Values(Vec<PerGpuSample>),
}

// Bits in PerGpuSample::attr telling which of the optional fields are present.
pub const GPU_HAS_UUID: u8 = 1;
pub const GPU_HAS_COMPUTE_MODE: u8 = 2;
pub const GPU_HAS_UTIL: u8 = 4;
pub const GPU_HAS_FAILING: u8 = 8;

/// Sample data for one card.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerGpuSample {
    pub attr: u8,
    pub index: u64,
    pub uuid: Ustr,
    pub failing: u64,
    /// Percent of max fan speed; may exceed 100.
    pub fan: u64,
    pub compute_mode: Ustr,
    /// The "P" number, eg 2 for P2.
    pub performance_state: i64,
    /// KiB of memory in use.
    pub memory: u64,
    pub ce_util: u64,
    pub memory_util: u64,
    /// Degrees Celsius.
    pub temperature: i64,
    /// Watts.
    pub power: u64,
    pub power_limit: u64,
    /// MHz.
    pub ce_clock: u64,
    pub memory_clock: u64,
}

impl GpuSamples {
    pub fn decode(&self) -> Result<Vec<PerGpuSample>> {
        match &self.encoded {
            EncodedGpuSamples::Bytes(bs) => decode_gpu_samples(bs),
            EncodedGpuSamples::Values(vs) => Ok(vs.clone()),
        }
    }

    pub fn size(&self) -> usize {
        size_of::<GpuSamples>()
            + match &self.encoded {
                EncodedGpuSamples::Bytes(bs) => bs.len(),
                EncodedGpuSamples::Values(vs) => vs.len() * size_of::<PerGpuSample>(),
            }
    }
}

/// Decode old-style GPU data:
///
///   fan%=27|28,perf=P8|P8,musekib=1024|1024,tempc=26|27,poww=5|2,powlimw=250|250,cez=300|300,memz=405|405
///
/// All the arrays must have the same length.  Unknown tags are ignored.

pub fn decode_gpu_samples(bs: &[u8]) -> Result<Vec<PerGpuSample>> {
    let Ok(s) = std::str::from_utf8(bs) else {
        bail!("Invalid UTF-8 in GPU data")
    };
    let mut result: Option<Vec<PerGpuSample>> = None;
    for field in s.split(',') {
        let (tag, values) = field.split_once('=').unwrap_or((field, ""));
        let values = values.split('|').collect::<Vec<&str>>();
        let cards = result.get_or_insert_with(|| {
            (0..values.len())
                .map(|i| PerGpuSample {
                    index: i as u64,
                    ..Default::default()
                })
                .collect()
        });
        if cards.len() != values.len() {
            bail!("Inconsistent number of cards in GPU data")
        }
        for (card, v) in cards.iter_mut().zip(values) {
            match tag {
                "fan%" => card.fan = v.parse().unwrap_or(0),
                "perf" => {
                    card.performance_state = v
                        .strip_prefix('P')
                        .and_then(|n| n.parse().ok())
                        .unwrap_or(0)
                }
                "musekib" => card.memory = v.parse().unwrap_or(0),
                "tempc" => card.temperature = v.parse().unwrap_or(0),
                "poww" => card.power = v.parse().unwrap_or(0),
                "powlimw" => card.power_limit = v.parse().unwrap_or(0),
                "cez" => card.ce_clock = v.parse().unwrap_or(0),
                "memz" => card.memory_clock = v.parse().unwrap_or(0),
                _ => {}
            }
        }
    }
    Ok(result.unwrap_or_default())
}

/// Node description from sysinfo data.  Times are kept as the RFC3339 text they came in as, the
/// node-configuration view parses them when it needs them.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SysinfoNodeData {
    pub time: String,
    pub cluster: String,
    pub node: String,
    pub os_name: String,
    pub os_release: String,
    pub architecture: String,
    pub sockets: u64,
    pub cores_per_socket: u64,
    pub threads_per_core: u64,
    pub cpu_model: String,
    /// KiB
    pub memory: u64,
    pub topo_svg: String,
    pub topo_text: String,
    pub distances: Vec<Vec<u64>>,
}

impl SysinfoNodeData {
    pub fn size(&self) -> usize {
        size_of::<SysinfoNodeData>()
            + self.time.len()
            + self.cluster.len()
            + self.node.len()
            + self.os_name.len()
            + self.os_release.len()
            + self.architecture.len()
            + self.cpu_model.len()
            + self.topo_svg.len()
            + self.topo_text.len()
            + self.distances.iter().map(|d| d.len() * 8).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SysinfoCardData {
    pub time: String,
    pub node: String,
    pub index: u64,
    pub uuid: String,
    pub address: String,
    pub manufacturer: String,
    pub model: String,
    pub architecture: String,
    pub driver: String,
    pub firmware: String,
    /// KiB
    pub memory: u64,
    pub power_limit: u64,
    pub max_power_limit: u64,
    pub min_power_limit: u64,
    pub max_ce_clock: u64,
    pub max_memory_clock: u64,
}

impl SysinfoCardData {
    pub fn size(&self) -> usize {
        size_of::<SysinfoCardData>()
            + self.time.len()
            + self.node.len()
            + self.uuid.len()
            + self.address.len()
            + self.manufacturer.len()
            + self.model.len()
            + self.architecture.len()
            + self.driver.len()
            + self.firmware.len()
    }
}

/// One sacct row.  The "main" record for a job has a nonempty `user`; the other rows are steps.
/// Memory-ish quantities are GiB, rounded up; times are seconds.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SacctInfo {
    /// Time the record was obtained, zero if unknown.
    pub time: i64,
    pub start: i64,
    pub end: i64,
    pub submit: i64,
    pub system_cpu: u64,
    pub user_cpu: u64,
    pub ave_cpu: u64,
    pub min_cpu: u64,
    pub version: Ustr,
    pub user: Ustr,
    pub job_name: Ustr,
    /// First word of the state, "CANCELLED by 1234" is "CANCELLED".
    pub state: Ustr,
    pub account: Ustr,
    pub layout: Ustr,
    pub reservation: Ustr,
    pub job_step: Ustr,
    pub array_step: Ustr,
    pub het_step: Ustr,
    pub node_list: Ustr,
    pub partition: Ustr,
    /// Comma-separated "model=n" for the GPUs allocated, "*=n" when the model is not known.
    pub req_gpus: Ustr,
    pub job_id: u32,
    pub array_job_id: u32,
    pub array_index: u32,
    pub het_job_id: u32,
    pub het_offset: u32,
    pub ave_disk_read: u32,
    pub ave_disk_write: u32,
    pub ave_rss: u32,
    pub ave_vm_size: u32,
    pub elapsed_raw: u32,
    pub max_rss: u32,
    pub max_vm_size: u32,
    pub req_cpus: u32,
    pub req_mem: u32,
    pub req_nodes: u32,
    pub suspended: u32,
    pub timelimit_raw: u32,
    pub exit_code: u8,
    pub exit_signal: u8,
}

impl SacctInfo {
    pub fn is_main(&self) -> bool {
        !self.user.is_empty()
    }
}

/// Cluster-level facts from a cluzter snapshot.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterAttributes {
    pub time: String,
    pub cluster: String,
    pub slurm: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterPartition {
    pub name: String,
    /// Host name patterns, eg "c1-[5-8]".
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterPartitions {
    pub time: String,
    pub cluster: String,
    pub partitions: Vec<CluzterPartition>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterNodeStates {
    pub names: Vec<String>,
    pub states: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterNodes {
    pub time: String,
    pub cluster: String,
    pub nodes: Vec<CluzterNodeStates>,
}

fn strings_size(ss: &[String]) -> usize {
    ss.iter().map(|s| size_of::<String>() + s.len()).sum()
}

impl CluzterAttributes {
    pub fn size(&self) -> usize {
        size_of::<CluzterAttributes>() + self.time.len() + self.cluster.len()
    }
}

impl CluzterPartitions {
    pub fn size(&self) -> usize {
        size_of::<CluzterPartitions>()
            + self.time.len()
            + self.cluster.len()
            + self
                .partitions
                .iter()
                .map(|p| size_of::<CluzterPartition>() + p.name.len() + strings_size(&p.nodes))
                .sum::<usize>()
    }
}

impl CluzterNodes {
    pub fn size(&self) -> usize {
        size_of::<CluzterNodes>()
            + self.time.len()
            + self.cluster.len()
            + self
                .nodes
                .iter()
                .map(|n| size_of::<CluzterNodeStates>() + strings_size(&n.names) + strings_size(&n.states))
                .sum::<usize>()
    }
}

#[test]
fn test_parse_version() {
    assert_eq!(parse_version("0.7.0"), (0, 7, 0));
    assert_eq!(parse_version("0.11.1-devel"), (0, 11, 1));
    assert_eq!(parse_version("1.2"), (1, 2, 0));
    assert_eq!(parse_version(""), (0, 0, 0));
}

#[test]
fn test_decode_cpu_samples() {
    // Base 4 ("["), then 20 ("k") and 48 ("}" is 3 and "1" continues it with 1*45).
    assert_eq!(decode_cpu_samples(b"[k}1").unwrap(), vec![24, 52]);
    assert_eq!(decode_cpu_samples(b"((").unwrap(), vec![0]);
    assert_eq!(decode_cpu_samples(b"(").unwrap(), Vec::<u64>::new());
    assert!(decode_cpu_samples(b"").is_err());
    assert!(decode_cpu_samples(b"1(").is_err());
    assert!(decode_cpu_samples(b"(,").is_err());

    // Three continuation digits: 2 + 1*45 + 0*45^2 + 1*45^3.
    assert_eq!(
        decode_cpu_samples(b"({101").unwrap(),
        vec![2 + 45 + 45 * 45 * 45]
    );
}

#[test]
fn test_decode_gpu_samples() {
    let data = b"fan%=27|28,perf=P8|P2,musekib=1024|2048,tempc=26|27,poww=5|2,powlimw=250|300,cez=300|301,memz=405|406,zappa=1|2";
    let cards = decode_gpu_samples(data).unwrap();
    assert_eq!(cards.len(), 2);
    assert_eq!(cards[0].index, 0);
    assert_eq!(cards[0].fan, 27);
    assert_eq!(cards[0].performance_state, 8);
    assert_eq!(cards[1].index, 1);
    assert_eq!(cards[1].performance_state, 2);
    assert_eq!(cards[1].memory, 2048);
    assert_eq!(cards[1].temperature, 27);
    assert_eq!(cards[1].power, 2);
    assert_eq!(cards[1].power_limit, 300);
    assert_eq!(cards[1].ce_clock, 301);
    assert_eq!(cards[1].memory_clock, 406);
    assert_eq!(cards[0].attr, 0);

    assert!(decode_gpu_samples(b"fan%=1|2,perf=P1").is_err());
}
