/// Compute jobs aggregates.
///
/// The input is the set of sample streams from postprocessing, together with the per-host time
/// bounds of the data.  Streams are merged into jobs according to the merge policy, each job's
/// samples are aggregated into a `JobAggregate`, and the aggregates are filtered by the options.
///
/// All the aggregate fields are computed from the synthesized job stream.  Averages divide by the
/// number of samples.  The relative fields ("rcpu" and so on) are normalized against the node's
/// capacity and are only defined when there is a node configuration for the job's host; the "s"
/// fields (sgpu, sgpumem) are relative to the cards the job actually used.
///
/// A job is "live at start" if its first sample has the earliest timestamp seen for its host in
/// the data, and "live at end" if its last sample has the latest such timestamp.  Such a job may
/// have started before or may continue after the window of data we have.
use crate::nodeconfig::HostConfigSource;
use crate::query::{
    build_sample_filter, read_sample_streams_and_maybe_bounds, QueryError, QueryFilter,
};

use anyhow::Result;
use itertools::Itertools;
use rustutils::{log, ClusterConfig, GpuSet};
use sonarlog::{
    merge_by_host_and_job, merge_by_job, DataProvider, InputStreamSet, SacctInfo, SampleStream,
    SampleStreams, Timebounds,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use ustr::Ustr;

// Classification bits, for presentation.
pub const LIVE_AT_END: u32 = 1;
pub const LIVE_AT_START: u32 = 2;

// Computed flag bits in JobAggregate::flags.  Positive and negative forms are both present so
// that a filter is just a set of bits that must all be set.
pub const USES_GPU: u32 = 1;
pub const DOES_NOT_USE_GPU: u32 = 2;
pub const GPU_FAIL: u32 = 4;
pub const IS_LIVE_AT_START: u32 = 8;
pub const IS_NOT_LIVE_AT_START: u32 = 16;
pub const IS_LIVE_AT_END: u32 = 32;
pub const IS_NOT_LIVE_AT_END: u32 = 64;
pub const IS_ZOMBIE: u32 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    CpuAvg,
    CpuPeak,
    RcpuAvg,
    RcpuPeak,
    MemAvg,
    MemPeak,
    RmemAvg,
    RmemPeak,
    ResAvg,
    ResPeak,
    RresAvg,
    RresPeak,
    GpuAvg,
    GpuPeak,
    RgpuAvg,
    RgpuPeak,
    SgpuAvg,
    SgpuPeak,
    GpumemAvg,
    GpumemPeak,
    RgpumemAvg,
    RgpumemPeak,
    SgpumemAvg,
    SgpumemPeak,
    Duration,
}

const NUM_FIELDS: usize = Field::Duration as usize + 1;

impl Field {
    /// True for fields that need the node configuration.
    pub fn is_relative(self) -> bool {
        matches!(
            self,
            Field::RcpuAvg
                | Field::RcpuPeak
                | Field::RmemAvg
                | Field::RmemPeak
                | Field::RresAvg
                | Field::RresPeak
                | Field::RgpuAvg
                | Field::RgpuPeak
                | Field::SgpuAvg
                | Field::SgpuPeak
                | Field::RgpumemAvg
                | Field::RgpumemPeak
                | Field::SgpumemAvg
                | Field::SgpumemPeak
        )
    }
}

#[derive(Clone, Debug)]
pub struct JobAggregate {
    pub first: i64,
    pub last: i64,
    pub duration: i64,
    pub gpus: GpuSet,
    pub uses_gpu: bool,
    pub gpu_fail: u8,
    pub is_zombie: bool,

    /// The distinct commands of the job, in order of appearance.
    pub cmd: String,

    /// Total CPU and GPU time, in seconds, estimated from the average utilization.
    pub cpu_time: i64,
    pub gpu_time: i64,

    pub classification: u32,
    pub flags: u32,

    computed: [f64; NUM_FIELDS],
    has_config: bool,
}

impl JobAggregate {
    /// The value of a computed field.  Relative fields are None when the job's host had no
    /// configuration.
    pub fn get(&self, f: Field) -> Option<f64> {
        if f.is_relative() && !self.has_config {
            None
        } else {
            Some(self.computed[f as usize])
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobSummary {
    pub job_id: u32,
    pub user: Ustr,
    pub host: Ustr,
    pub aggregate: JobAggregate,
    pub job: SampleStream,
    pub sacct: Option<SacctInfo>,
}

impl JobSummary {
    /// The job ID with a marker: "!" if the job is live at both ends of the data, "<" if only at
    /// the start, ">" if only at the end.
    pub fn job_and_mark(&self) -> String {
        let c = self.aggregate.classification;
        let mark = if c & (LIVE_AT_START | LIVE_AT_END) == (LIVE_AT_START | LIVE_AT_END) {
            "!"
        } else if c & LIVE_AT_START != 0 {
            "<"
        } else if c & LIVE_AT_END != 0 {
            ">"
        } else {
            ""
        };
        format!("{}{mark}", self.job_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Hosts whose configuration says job IDs are cluster-wide are merged across hosts, the rest
    /// per host.  Without a configuration this is `None`.
    #[default]
    ByConfig,

    /// One job per job ID across all hosts, as for jobs under a batch system.
    All,

    /// One job per job ID and host.
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldRange {
    pub field: Field,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Selection on the sacct data joined to the jobs.  Each nonempty set must contain the job's
/// value.  GPU types are matched against the models in the job's GPU request.
#[derive(Clone, Debug, Default)]
pub struct SacctFilter {
    pub account: Vec<String>,
    pub partition: Vec<String>,
    pub reservation: Vec<String>,
    pub state: Vec<String>,
    pub gpu_type: Vec<String>,
}

impl SacctFilter {
    pub fn is_active(&self) -> bool {
        !self.account.is_empty()
            || !self.partition.is_empty()
            || !self.reservation.is_empty()
            || !self.state.is_empty()
            || !self.gpu_type.is_empty()
    }

    pub fn matches(&self, s: &SacctInfo) -> bool {
        fn ok(set: &[String], v: Ustr) -> bool {
            set.is_empty() || set.iter().any(|x| x == v.as_str())
        }
        ok(&self.account, s.account)
            && ok(&self.partition, s.partition)
            && ok(&self.reservation, s.reservation)
            && ok(&self.state, s.state)
            && (self.gpu_type.is_empty()
                || s.req_gpus
                    .split(',')
                    .filter_map(|g| g.split_once('=').map(|(model, _)| model))
                    .any(|model| self.gpu_type.iter().any(|t| t == model)))
    }
}

#[derive(Clone, Debug)]
pub struct JobsOptions {
    pub merge: MergePolicy,
    pub min_samples: usize,
    pub min_runtime: Option<i64>,
    pub ranges: Vec<FieldRange>,
    pub no_gpu: bool,
    pub some_gpu: bool,
    pub completed: bool,
    pub running: bool,
    pub zombie: bool,

    /// Keep only the most recent n jobs per user.
    pub numjobs: Option<usize>,

    /// Join with sacct data.  Also implied by an active `sacct_filter`.
    pub want_sacct: bool,
    pub sacct_filter: SacctFilter,
}

impl Default for JobsOptions {
    fn default() -> JobsOptions {
        JobsOptions {
            merge: MergePolicy::default(),
            min_samples: 2,
            min_runtime: None,
            ranges: vec![],
            no_gpu: false,
            some_gpu: false,
            completed: false,
            running: false,
            zombie: false,
            numjobs: None,
            want_sacct: false,
            sacct_filter: SacctFilter::default(),
        }
    }
}

impl JobsOptions {
    fn required_flags(&self) -> u32 {
        let mut flags = 0;
        if self.no_gpu {
            flags |= DOES_NOT_USE_GPU;
        }
        if self.some_gpu {
            flags |= USES_GPU;
        }
        if self.completed {
            flags |= IS_NOT_LIVE_AT_END;
        }
        if self.running {
            flags |= IS_LIVE_AT_END;
        }
        if self.zombie {
            flags |= IS_ZOMBIE;
        }
        flags
    }

    fn accepts(&self, a: &JobAggregate) -> bool {
        let required = self.required_flags();
        if a.flags & required != required {
            return false;
        }
        if let Some(min) = self.min_runtime {
            if a.duration < min {
                return false;
            }
        }
        // An undefined relative value is taken to be zero.
        self.ranges.iter().all(|r| {
            let v = a.get(r.field).unwrap_or(0.0);
            r.min.map_or(true, |min| v >= min) && r.max.map_or(true, |max| v <= max)
        })
    }
}

/// Read, merge, aggregate and filter: the whole jobs query.  `cfg` is the static cluster
/// configuration (for the excluded users), `config` the source of per-host capacities.

pub fn query_jobs(
    provider: &dyn DataProvider,
    cfg: Option<&ClusterConfig>,
    config: Option<&dyn HostConfigSource>,
    filter: &QueryFilter,
    opts: &JobsOptions,
    verbose: bool,
) -> Result<Vec<JobSummary>> {
    let (hosts, sample_filter) = build_sample_filter(cfg, filter, verbose)?;
    let (streams, bounds, _) = read_sample_streams_and_maybe_bounds(
        provider,
        filter.from_time(),
        filter.to_time(),
        &hosts,
        Some(&sample_filter),
        true,
        verbose,
    )?;
    let jobs = aggregate_and_filter_jobs(streams, &bounds, config, opts, verbose)?;
    if opts.want_sacct || opts.sacct_filter.is_active() {
        let (sacct, soft_errors) =
            provider.read_sacct_data(filter.from_time(), filter.to_time(), verbose)?;
        if verbose {
            slog::info!(log(), "Sacct: {} blobs, {} soft errors", sacct.len(), soft_errors);
        }
        Ok(join_sacct(jobs, &sacct, &opts.sacct_filter))
    } else {
        Ok(jobs)
    }
}

/// Merge the streams into jobs, aggregate, and filter.  The result is sorted ascending by start
/// time and then job ID.

pub fn aggregate_and_filter_jobs(
    streams: InputStreamSet,
    bounds: &Timebounds,
    config: Option<&dyn HostConfigSource>,
    opts: &JobsOptions,
    verbose: bool,
) -> Result<Vec<JobSummary>> {
    if config.is_none() {
        if let Some(r) = opts.ranges.iter().find(|r| r.field.is_relative()) {
            return Err(QueryError::ConfigRequired(format!(
                "relative value {:?} requested",
                r.field
            ))
            .into());
        }
    }

    let (jobs, bounds) = merge_jobs(streams, bounds, config, opts.merge)?;
    if verbose {
        slog::info!(log(), "Jobs constructed by merging: {}", jobs.len());
    }

    let mut summaries = vec![];
    let mut discarded = 0;
    for job in jobs {
        if job.len() < opts.min_samples {
            discarded += 1;
            continue;
        }
        let host = job[0].hostname;
        let bound = match bounds.get(&host) {
            Some(b) => *b,
            None => panic!("Expected to find bound for {host}"),
        };
        let sys = match config {
            Some(c) => c.lookup_host_by_time(&host, job[0].timestamp)?,
            None => None,
        };
        let aggregate = aggregate_job(&job, sys.as_deref(), bound.earliest, bound.latest);
        if !opts.accepts(&aggregate) {
            discarded += 1;
            continue;
        }
        summaries.push(JobSummary {
            job_id: job[0].job_id,
            user: job[0].user,
            host,
            aggregate,
            job,
            sacct: None,
        });
    }
    if verbose {
        slog::info!(log(), "Jobs discarded by aggregation filtering: {discarded}");
    }

    // Ascending by start time, and if those are equal (which happens when we start reading logs at
    // some arbitrary date), by job number.
    summaries.sort_by(|a, b| {
        (a.aggregate.first, a.job_id).cmp(&(b.aggregate.first, b.job_id))
    });

    if let Some(n) = opts.numjobs {
        let mut counts: HashMap<Ustr, usize> = HashMap::new();
        let mut keep = vec![false; summaries.len()];
        for (i, s) in summaries.iter().enumerate().rev() {
            let c = counts.entry(s.user).or_insert(0);
            if *c < n {
                *c += 1;
                keep[i] = true;
            }
        }
        let mut ix = 0;
        summaries.retain(|_| {
            ix += 1;
            keep[ix - 1]
        });
    }

    Ok(summaries)
}

fn merge_jobs(
    streams: InputStreamSet,
    bounds: &Timebounds,
    config: Option<&dyn HostConfigSource>,
    policy: MergePolicy,
) -> Result<(SampleStreams, Timebounds)> {
    match (policy, config) {
        (MergePolicy::All, _) => Ok(merge_by_job(streams, bounds)),
        (MergePolicy::ByConfig, Some(config)) => {
            let mut cross_node: HashMap<Ustr, bool> = HashMap::new();
            for (k, v) in &streams {
                if !cross_node.contains_key(&k.host) {
                    let flag = config
                        .lookup_host_by_time(&k.host, v[0].timestamp)?
                        .map_or(false, |s| s.cross_node_jobs);
                    cross_node.insert(k.host, flag);
                }
            }
            if cross_node.values().any(|x| *x) {
                Ok(merge_across_some_nodes(&cross_node, streams, bounds))
            } else {
                Ok((merge_by_host_and_job(streams), bounds.clone()))
            }
        }
        _ => Ok((merge_by_host_and_job(streams), bounds.clone())),
    }
}

// Streams on hosts with cross-node job IDs are merged as if by MergePolicy::All, the others as if
// by MergePolicy::None, and the two sets of jobs are combined.
fn merge_across_some_nodes(
    cross_node: &HashMap<Ustr, bool>,
    streams: InputStreamSet,
    bounds: &Timebounds,
) -> (SampleStreams, Timebounds) {
    let mut mergeable = InputStreamSet::new();
    let mut m_bounds = Timebounds::new();
    let mut solo = InputStreamSet::new();
    let mut s_bounds = Timebounds::new();
    for (k, v) in streams {
        let bound = match bounds.get(&k.host) {
            Some(b) => *b,
            None => panic!("Expected to find bound for {}", k.host),
        };
        if cross_node.get(&k.host).copied().unwrap_or(false) {
            m_bounds.insert(k.host, bound);
            mergeable.insert(k, v);
        } else {
            s_bounds.insert(k.host, bound);
            solo.insert(k, v);
        }
    }
    let (mut jobs, mut merged_bounds) = merge_by_job(mergeable, &m_bounds);
    jobs.extend(merge_by_host_and_job(solo));
    merged_bounds.extend(s_bounds);
    (jobs, merged_bounds)
}

const KB2GB: f64 = 1.0 / (1024.0 * 1024.0);

fn aggregate_job(
    job: &SampleStream,
    sys: Option<&rustutils::System>,
    earliest: i64,
    latest: i64,
) -> JobAggregate {
    let mut gpus = GpuSet::empty();
    let mut gpu_fail = 0u8;
    let mut is_zombie = false;
    let mut c = [0.0f64; NUM_FIELDS];
    let mut cmds: Vec<Ustr> = vec![];
    let mut seen = HashSet::new();

    for s in job {
        gpus.union(s.gpus);
        gpu_fail = gpu_fail.max(s.gpu_fail);
        let cpu = s.cpu_util_pct as f64;
        let gpu = s.gpu_pct as f64;
        let mem = s.cpu_kb as f64 * KB2GB;
        let res = s.rssanon_kb as f64 * KB2GB;
        let gpumem = s.gpu_kb as f64 * KB2GB;
        c[Field::CpuAvg as usize] += cpu;
        c[Field::CpuPeak as usize] = c[Field::CpuPeak as usize].max(cpu);
        c[Field::GpuAvg as usize] += gpu;
        c[Field::GpuPeak as usize] = c[Field::GpuPeak as usize].max(gpu);
        c[Field::MemAvg as usize] += mem;
        c[Field::MemPeak as usize] = c[Field::MemPeak as usize].max(mem);
        c[Field::ResAvg as usize] += res;
        c[Field::ResPeak as usize] = c[Field::ResPeak as usize].max(res);
        c[Field::GpumemAvg as usize] += gpumem;
        c[Field::GpumemPeak as usize] = c[Field::GpumemPeak as usize].max(gpumem);

        let cmd = s.command.as_str();
        if !is_zombie {
            is_zombie = cmd.contains("<defunct>") || cmd.starts_with("_zombie_");
        }
        if seen.insert(s.command) {
            cmds.push(s.command);
        }
    }
    let uses_gpu = !gpus.is_empty() && !gpus.is_unknown();

    // Relative values.  Quantities can be zero in surprising ways, so always guard divisions.
    if let Some(sys) = sys {
        let relative = |c: &mut [f64; NUM_FIELDS], from: Field, to: Field, div: f64, mul: f64| {
            if div > 0.0 {
                c[to as usize] = c[from as usize] * mul / div;
            }
        };
        let cores = sys.cpu_cores as f64;
        let memory = sys.mem_gb as f64;
        let cards = sys.gpu_cards as f64;
        let gpu_memory = sys.gpumem_gb as f64;
        relative(&mut c, Field::CpuAvg, Field::RcpuAvg, cores, 1.0);
        relative(&mut c, Field::CpuPeak, Field::RcpuPeak, cores, 1.0);
        relative(&mut c, Field::MemAvg, Field::RmemAvg, memory, 100.0);
        relative(&mut c, Field::MemPeak, Field::RmemPeak, memory, 100.0);
        relative(&mut c, Field::ResAvg, Field::RresAvg, memory, 100.0);
        relative(&mut c, Field::ResPeak, Field::RresPeak, memory, 100.0);
        relative(&mut c, Field::GpuAvg, Field::RgpuAvg, cards, 1.0);
        relative(&mut c, Field::GpuPeak, Field::RgpuPeak, cards, 1.0);
        relative(&mut c, Field::GpumemAvg, Field::RgpumemAvg, gpu_memory, 100.0);
        relative(&mut c, Field::GpumemPeak, Field::RgpumemPeak, gpu_memory, 100.0);
        if uses_gpu {
            let n_cards = gpus.size() as f64;
            relative(&mut c, Field::GpuAvg, Field::SgpuAvg, n_cards, 1.0);
            relative(&mut c, Field::GpuPeak, Field::SgpuPeak, n_cards, 1.0);
            if cards > 0.0 {
                let job_gpu_memory = n_cards * (gpu_memory / cards);
                relative(&mut c, Field::GpumemAvg, Field::SgpumemAvg, job_gpu_memory, 100.0);
                relative(&mut c, Field::GpumemPeak, Field::SgpumemPeak, job_gpu_memory, 100.0);
            }
        }
    }

    // Averages.  The relative averages were computed from sums above, so they are divided too.
    let n = job.len() as f64;
    for f in [
        Field::CpuAvg,
        Field::RcpuAvg,
        Field::MemAvg,
        Field::RmemAvg,
        Field::ResAvg,
        Field::RresAvg,
        Field::GpuAvg,
        Field::RgpuAvg,
        Field::SgpuAvg,
        Field::GpumemAvg,
        Field::RgpumemAvg,
        Field::SgpumemAvg,
    ] {
        c[f as usize] /= n;
    }

    let first = job[0].timestamp;
    let last = job[job.len() - 1].timestamp;
    let duration = last - first;
    c[Field::Duration as usize] = duration as f64;

    let mut flags = 0;
    flags |= if uses_gpu { USES_GPU } else { DOES_NOT_USE_GPU };
    if gpu_fail != 0 {
        flags |= GPU_FAIL;
    }
    flags |= if first == earliest {
        IS_LIVE_AT_START
    } else {
        IS_NOT_LIVE_AT_START
    };
    flags |= if last == latest {
        IS_LIVE_AT_END
    } else {
        IS_NOT_LIVE_AT_END
    };
    if is_zombie {
        flags |= IS_ZOMBIE;
    }
    let mut classification = 0;
    if flags & IS_LIVE_AT_START != 0 {
        classification |= LIVE_AT_START;
    }
    if flags & IS_LIVE_AT_END != 0 {
        classification |= LIVE_AT_END;
    }

    JobAggregate {
        first,
        last,
        duration,
        gpus,
        uses_gpu,
        gpu_fail,
        is_zombie,
        cmd: cmds.iter().join(", "),
        cpu_time: (c[Field::CpuAvg as usize] * duration as f64 / 100.0).round() as i64,
        gpu_time: (c[Field::GpuAvg as usize] * duration as f64 / 100.0).round() as i64,
        classification,
        flags,
        computed: c,
        has_config: sys.is_some(),
    }
}

/// Attach the main sacct record for each job, if there is one; with several, the most recently
/// obtained wins.  If the filter is active, jobs without a matching record are removed.

pub fn join_sacct(
    jobs: Vec<JobSummary>,
    sacct: &[Arc<Vec<SacctInfo>>],
    filter: &SacctFilter,
) -> Vec<JobSummary> {
    let mut index: HashMap<u32, &SacctInfo> = HashMap::new();
    for s in sacct.iter().flat_map(|b| b.iter()).filter(|s| s.is_main()) {
        match index.get(&s.job_id) {
            Some(prev) if prev.time >= s.time => {}
            _ => {
                index.insert(s.job_id, s);
            }
        }
    }
    let active = filter.is_active();
    jobs.into_iter()
        .filter_map(|mut j| {
            let s = index.get(&j.job_id).copied();
            if active && !s.map_or(false, |s| filter.matches(s)) {
                return None;
            }
            j.sacct = s.cloned();
            Some(j)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarlog::{postprocess, LogEntry};

    const T: i64 = 1_700_000_000;

    fn entry(host: &str, pid: u32, job: u32, t: i64, cpu_pct: f32, cpu_kb: u64) -> LogEntry {
        LogEntry {
            version: Ustr::from("0.6.0"),
            user: Ustr::from("user"),
            command: Ustr::from("cmd"),
            pid,
            job_id: job,
            cpu_pct,
            cpu_kb,
            ..LogEntry::empty(t, Ustr::from(host))
        }
    }

    fn streams(entries: Vec<LogEntry>) -> (InputStreamSet, Timebounds) {
        postprocess(&[Arc::new(entries)], None, true)
    }

    fn one_job<'a>(jobs: &'a [JobSummary], id: u32) -> &'a JobSummary {
        jobs.iter().find(|j| j.job_id == id).unwrap()
    }

    fn config() -> ClusterConfig {
        ClusterConfig::from_json_str(
            r#"{"name":"c","nodes":[
                {"hostname":"a","cpu_cores":4,"mem_gb":16,"gpu_cards":2,"gpumem_gb":32,"cross_node_jobs":true},
                {"hostname":"b","cpu_cores":4,"mem_gb":16,"cross_node_jobs":true},
                {"hostname":"c","cpu_cores":8,"mem_gb":64}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_job_marks() {
        let (s, b) = streams(vec![
            entry("a", 10, 7, T, 50.0, 1024),
            entry("a", 10, 7, T + 60, 50.0, 1024),
            entry("a", 11, 8, T + 30, 50.0, 1024),
            entry("a", 12, 9, T, 50.0, 1024),
            entry("a", 13, 10, T + 60, 50.0, 1024),
        ]);
        let opts = JobsOptions {
            min_samples: 1,
            ..Default::default()
        };
        let jobs = aggregate_and_filter_jobs(s, &b, None, &opts, false).unwrap();
        assert_eq!(jobs.len(), 4);
        assert_eq!(one_job(&jobs, 7).job_and_mark(), "7!");
        assert_eq!(one_job(&jobs, 8).job_and_mark(), "8");
        assert_eq!(one_job(&jobs, 9).job_and_mark(), "9<");
        assert_eq!(one_job(&jobs, 10).job_and_mark(), "10>");

        // Sorted by start time, then job.
        assert_eq!(
            jobs.iter().map(|j| j.job_id).collect::<Vec<u32>>(),
            vec![7, 9, 8, 10]
        );

        // Classification agrees with the bounds.
        for j in &jobs {
            let bound = b[&j.host];
            assert_eq!(
                j.aggregate.classification & LIVE_AT_START != 0,
                j.aggregate.first == bound.earliest
            );
            assert_eq!(
                j.aggregate.classification & LIVE_AT_END != 0,
                j.aggregate.last == bound.latest
            );
        }

        // The default minimum of two samples leaves only job 7.
        let (s, b) = streams(vec![
            entry("a", 10, 7, T, 50.0, 1024),
            entry("a", 10, 7, T + 60, 50.0, 1024),
            entry("a", 11, 8, T + 30, 50.0, 1024),
        ]);
        let jobs = aggregate_and_filter_jobs(s, &b, None, &JobsOptions::default(), false).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, 7);
    }

    #[test]
    fn test_aggregate_values() {
        let (s, b) = streams(vec![
            entry("a", 10, 7, T, 100.0, 2 * 1024 * 1024),
            entry("a", 10, 7, T + 100, 300.0, 6 * 1024 * 1024),
        ]);
        let cfg = config();
        let cfg: &dyn HostConfigSource = &cfg;
        let jobs =
            aggregate_and_filter_jobs(s, &b, Some(cfg), &JobsOptions::default(), false).unwrap();
        let a = &jobs[0].aggregate;
        assert_eq!(a.get(Field::CpuAvg), Some(200.0));
        assert_eq!(a.get(Field::CpuPeak), Some(300.0));
        assert_eq!(a.get(Field::RcpuAvg), Some(50.0));
        assert_eq!(a.get(Field::RcpuPeak), Some(75.0));
        assert_eq!(a.get(Field::MemAvg), Some(4.0));
        assert_eq!(a.get(Field::RmemPeak), Some(6.0 * 100.0 / 16.0));
        assert_eq!(a.get(Field::Duration), Some(100.0));
        assert_eq!(a.cpu_time, 200);
        assert!(!a.uses_gpu);
        assert_eq!(a.flags & DOES_NOT_USE_GPU, DOES_NOT_USE_GPU);
        assert_eq!(a.cmd, "cmd");

        // Without a config the relative values are undefined.
        let (s, b) = streams(vec![
            entry("a", 10, 7, T, 100.0, 0),
            entry("a", 10, 7, T + 100, 300.0, 0),
        ]);
        let jobs = aggregate_and_filter_jobs(s, &b, None, &JobsOptions::default(), false).unwrap();
        assert_eq!(jobs[0].aggregate.get(Field::RcpuAvg), None);
        assert_eq!(jobs[0].aggregate.get(Field::CpuAvg), Some(200.0));
    }

    #[test]
    fn test_relative_filter_needs_config() {
        let (s, b) = streams(vec![entry("a", 10, 7, T, 100.0, 0)]);
        let opts = JobsOptions {
            ranges: vec![FieldRange {
                field: Field::RcpuAvg,
                min: Some(10.0),
                max: None,
            }],
            ..Default::default()
        };
        let err = aggregate_and_filter_jobs(s, &b, None, &opts, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueryError>(),
            Some(QueryError::ConfigRequired(_))
        ));
        assert!(err.to_string().starts_with("configuration file required: "));
    }

    #[test]
    fn test_filters() {
        let mut zombie = entry("a", 12, 9, T + 10, 5.0, 0);
        zombie.command = Ustr::from("python <defunct>");
        let mut zombie2 = entry("a", 12, 9, T + 20, 5.0, 0);
        zombie2.command = Ustr::from("python <defunct>");
        let mut gpu1 = entry("a", 13, 10, T, 5.0, 0);
        gpu1.gpus = GpuSet::singleton(1);
        let mut gpu2 = entry("a", 13, 10, T + 60, 5.0, 0);
        gpu2.gpus = GpuSet::singleton(1);
        let input = vec![
            entry("a", 10, 7, T, 100.0, 0),
            entry("a", 10, 7, T + 60, 100.0, 0),
            entry("a", 11, 8, T + 10, 10.0, 0),
            entry("a", 11, 8, T + 30, 10.0, 0),
            zombie,
            zombie2,
            gpu1,
            gpu2,
        ];
        let run = |opts: JobsOptions| -> Vec<u32> {
            let (s, b) = streams(input.clone());
            aggregate_and_filter_jobs(s, &b, None, &opts, false)
                .unwrap()
                .iter()
                .map(|j| j.job_id)
                .collect()
        };
        assert_eq!(run(JobsOptions::default()), vec![7, 10, 8, 9]);
        assert_eq!(
            run(JobsOptions {
                completed: true,
                ..Default::default()
            }),
            vec![8, 9]
        );
        assert_eq!(
            run(JobsOptions {
                running: true,
                ..Default::default()
            }),
            vec![7, 10]
        );
        assert_eq!(
            run(JobsOptions {
                zombie: true,
                ..Default::default()
            }),
            vec![9]
        );
        assert_eq!(
            run(JobsOptions {
                some_gpu: true,
                ..Default::default()
            }),
            vec![10]
        );
        assert_eq!(
            run(JobsOptions {
                min_runtime: Some(30),
                ..Default::default()
            }),
            vec![7, 10]
        );
        assert_eq!(
            run(JobsOptions {
                ranges: vec![FieldRange {
                    field: Field::CpuPeak,
                    min: Some(50.0),
                    max: None
                }],
                ..Default::default()
            }),
            vec![7]
        );
        assert_eq!(
            run(JobsOptions {
                numjobs: Some(1),
                ..Default::default()
            }),
            vec![9]
        );
    }

    fn merged_hosts(
        input: &[LogEntry],
        merge: MergePolicy,
        config: Option<&dyn HostConfigSource>,
    ) -> Vec<String> {
        let (s, b) = streams(input.to_vec());
        let opts = JobsOptions {
            merge,
            ..Default::default()
        };
        let mut hosts = aggregate_and_filter_jobs(s, &b, config, &opts, false)
            .unwrap()
            .iter()
            .map(|j| j.host.to_string())
            .collect::<Vec<String>>();
        hosts.sort();
        hosts
    }

    #[test]
    fn test_merge_policies() {
        let input = vec![
            entry("c1-1", 10, 5, T, 100.0, 0),
            entry("c1-1", 10, 5, T + 60, 100.0, 0),
            entry("c1-2", 20, 5, T, 100.0, 0),
            entry("c1-2", 20, 5, T + 60, 100.0, 0),
            entry("c1-3", 30, 5, T, 100.0, 0),
            entry("c1-3", 30, 5, T + 60, 100.0, 0),
        ];
        let cfg = ClusterConfig::from_json_str(
            r#"{"name":"c","nodes":[
                {"hostname":"c1-[1-2]","cpu_cores":4,"mem_gb":16,"cross_node_jobs":true},
                {"hostname":"c1-3","cpu_cores":8,"mem_gb":64}]}"#,
        )
        .unwrap();
        let cfg: &dyn HostConfigSource = &cfg;
        assert_eq!(
            merged_hosts(&input, MergePolicy::None, Some(cfg)),
            vec!["c1-1", "c1-2", "c1-3"]
        );
        assert_eq!(merged_hosts(&input, MergePolicy::All, None), vec!["c1-[1-3]"]);
        assert_eq!(
            merged_hosts(&input, MergePolicy::ByConfig, Some(cfg)),
            vec!["c1-3", "c1-[1-2]"]
        );
        assert_eq!(
            merged_hosts(&input, MergePolicy::ByConfig, None),
            vec!["c1-1", "c1-2", "c1-3"]
        );
    }

    #[test]
    fn test_sacct_join() {
        let (s, b) = streams(vec![
            entry("a", 10, 5, T, 100.0, 0),
            entry("a", 10, 5, T + 60, 100.0, 0),
            entry("a", 11, 6, T, 100.0, 0),
            entry("a", 11, 6, T + 60, 100.0, 0),
        ]);
        let jobs = aggregate_and_filter_jobs(s, &b, None, &JobsOptions::default(), false).unwrap();
        let sacct = vec![Arc::new(vec![
            SacctInfo {
                job_id: 5,
                user: Ustr::from("user"),
                account: Ustr::from("ec30"),
                req_gpus: Ustr::from("rtx30=2"),
                time: 1,
                ..Default::default()
            },
            SacctInfo {
                job_id: 5,
                user: Ustr::from("user"),
                account: Ustr::from("ec31"),
                time: 2,
                ..Default::default()
            },
            // A step, not a main record.
            SacctInfo {
                job_id: 6,
                job_step: Ustr::from("0"),
                ..Default::default()
            },
        ])];

        let joined = join_sacct(jobs.clone(), &sacct, &SacctFilter::default());
        assert_eq!(joined.len(), 2);
        assert_eq!(one_job(&joined, 5).sacct.as_ref().unwrap().account.as_str(), "ec31");
        assert!(one_job(&joined, 6).sacct.is_none());

        let f = SacctFilter {
            account: vec!["ec31".to_string()],
            ..Default::default()
        };
        let joined = join_sacct(jobs.clone(), &sacct, &f);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].job_id, 5);

        let f = SacctFilter {
            gpu_type: vec!["rtx30".to_string()],
            ..Default::default()
        };
        assert!(join_sacct(jobs, &sacct, &f).is_empty());
    }
}
