/// Compute system load aggregates from a set of sample streams.
///
/// The streams are merged per host, so that each host has one stream of synthesized samples that
/// sums all its processes, and then the samples are averaged into time buckets.  Optionally the
/// per-host streams are merged into one stream for the whole group of hosts, with a configuration
/// that is the sum of the hosts' configurations.
///
/// Unless the output is compact, the bucketed stream is padded with zero records from the start
/// of the window up to the first bucket and from the last bucket to the end of the window, and in
/// the gaps between, so that periods without data are visible.
use crate::nodeconfig::HostConfigSource;
use crate::query::{
    build_sample_filter, read_sample_streams_and_maybe_bounds, QueryError, QueryFilter,
};

use anyhow::{bail, Result};
use rustutils::{
    add_day, add_half_day, add_half_hour, add_hour, add_week, log, to_unix, truncate_to_day,
    truncate_to_half_day, truncate_to_half_hour, truncate_to_hour, truncate_to_week, ClusterConfig,
    GpuSet, System,
};
use sonarlog::{
    fold_samples_daily, fold_samples_half_daily, fold_samples_half_hourly, fold_samples_hourly,
    fold_samples_weekly, merge_across_hosts_by_time, merge_by_host, DataProvider, InputStreamSet,
    Sample, SampleStream,
};
use std::sync::Arc;
use ustr::Ustr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Bucket {
    None,
    HalfHourly,
    #[default]
    Hourly,
    HalfDaily,
    Daily,
    Weekly,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub bucket: Bucket,
    pub group: bool,
    pub compact: bool,

    /// Only the last record for each host.
    pub last_only: bool,

    /// Compute values relative to the host's (or group's) capacity.  Requires configuration.
    pub relative: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadRecord {
    pub timestamp: i64,
    pub cpu_pct: f64,
    pub mem_gb: f64,
    pub res_gb: f64,
    pub gpu_pct: f64,
    pub gpumem_gb: f64,
    pub gpus: GpuSet,
    pub rcpu: Option<f64>,
    pub rmem: Option<f64>,
    pub rgpu: Option<f64>,
    pub rgpumem: Option<f64>,
}

impl LoadRecord {
    fn zero(timestamp: i64, sys: Option<&System>) -> LoadRecord {
        let rel = sys.map(|_| 0.0);
        LoadRecord {
            timestamp,
            cpu_pct: 0.0,
            mem_gb: 0.0,
            res_gb: 0.0,
            gpu_pct: 0.0,
            gpumem_gb: 0.0,
            gpus: GpuSet::empty(),
            rcpu: rel,
            rmem: rel,
            rgpu: rel,
            rgpumem: rel,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoadReport {
    pub host: Ustr,
    pub system: Option<Arc<System>>,
    pub records: Vec<LoadRecord>,
}

pub fn query_load(
    provider: &dyn DataProvider,
    cfg: Option<&ClusterConfig>,
    config: Option<&dyn HostConfigSource>,
    filter: &QueryFilter,
    opts: &LoadOptions,
    verbose: bool,
) -> Result<Vec<LoadReport>> {
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

    // An open-ended window is closed by the data, or the padding would run from the epoch.
    let from = match filter.from {
        Some(t) => to_unix(t),
        None => bounds.values().map(|b| b.earliest).min().unwrap_or(0),
    };
    let to = match filter.to {
        Some(t) => to_unix(t),
        None => bounds.values().map(|b| b.latest).max().unwrap_or(0),
    };
    aggregate_load(streams, from, to, config, opts, verbose)
}

/// One report per host (or one for the group), sorted by host name.

pub fn aggregate_load(
    streams: InputStreamSet,
    from: i64,
    to: i64,
    config: Option<&dyn HostConfigSource>,
    opts: &LoadOptions,
    verbose: bool,
) -> Result<Vec<LoadReport>> {
    if opts.group && opts.bucket == Bucket::None {
        bail!("Grouping across hosts requires first bucketing by time");
    }
    if opts.relative && config.is_none() {
        return Err(QueryError::ConfigRequired("relative load values requested".to_string()).into());
    }

    // One synthesized stream per host, sorted ascending by timestamp.
    let mut merged = merge_by_host(streams);
    if verbose {
        slog::info!(log(), "Load: {} hosts", merged.len());
    }

    let fold: Option<fn(&[Sample]) -> SampleStream> = match opts.bucket {
        Bucket::None => None,
        Bucket::HalfHourly => Some(fold_samples_half_hourly),
        Bucket::Hourly => Some(fold_samples_hourly),
        Bucket::HalfDaily => Some(fold_samples_half_daily),
        Bucket::Daily => Some(fold_samples_daily),
        Bucket::Weekly => Some(fold_samples_weekly),
    };
    if let Some(fold) = fold {
        merged = merged.iter().map(|s| fold(s)).collect();
    }

    // The configuration of each host, as of the end of its data.
    let mut systems = vec![];
    for stream in &merged {
        let host = stream[0].hostname;
        let sys = match config {
            Some(c) => c.lookup_host_by_time(&host, stream[stream.len() - 1].timestamp)?,
            None => None,
        };
        if opts.relative && sys.is_none() {
            bail!("Missing host configuration for {host}");
        }
        systems.push(sys);
    }

    let mut hosts: Vec<(SampleStream, Option<Arc<System>>)> = if opts.group {
        let group_sys = if config.is_some() {
            Some(Arc::new(sum_systems(&systems)))
        } else {
            None
        };
        merge_across_hosts_by_time(merged)
            .into_iter()
            .map(|s| (s, group_sys.clone()))
            .collect()
    } else {
        merged.into_iter().zip(systems).collect()
    };

    // Lexicographic, so c1-10 sorts before c1-5, but at least it's predictable.
    hosts.sort_by(|a, b| a.0[0].hostname.cmp(&b.0[0].hostname));

    let mut reports = vec![];
    for (stream, sys) in hosts {
        let host = stream[0].hostname;
        let mut records = stream
            .iter()
            .map(|s| load_record(s, sys.as_deref()))
            .collect::<Vec<LoadRecord>>();
        if opts.last_only {
            records = records.split_off(records.len() - 1);
        } else if !opts.compact {
            if let Some(steps) = bucket_steps(opts.bucket) {
                records = insert_missing_records(records, from, to, steps, sys.as_deref());
            }
        }
        reports.push(LoadReport {
            host,
            system: sys,
            records,
        });
    }
    Ok(reports)
}

fn sum_systems(systems: &[Option<Arc<System>>]) -> System {
    let mut sum = System::default();
    for sys in systems.iter().flatten() {
        if !sum.description.is_empty() {
            sum.description += "|||";
        }
        sum.description += &sys.description;
        sum.cpu_cores += sys.cpu_cores;
        sum.mem_gb += sys.mem_gb;
        sum.gpu_cards += sys.gpu_cards;
        sum.gpumem_gb += sys.gpumem_gb;
    }
    sum
}

const KB2GB: f64 = 1.0 / (1024.0 * 1024.0);

fn load_record(s: &Sample, sys: Option<&System>) -> LoadRecord {
    let cpu_pct = s.cpu_util_pct as f64;
    let mem_gb = s.cpu_kb as f64 * KB2GB;
    let gpu_pct = s.gpu_pct as f64;
    let gpumem_gb = s.gpu_kb as f64 * KB2GB;
    let ratio = |x: f64, div: usize, mul: f64| -> Option<f64> {
        sys.map(|_| if div > 0 { x * mul / div as f64 } else { 0.0 })
    };
    LoadRecord {
        timestamp: s.timestamp,
        cpu_pct,
        mem_gb,
        res_gb: s.rssanon_kb as f64 * KB2GB,
        gpu_pct,
        gpumem_gb,
        gpus: s.gpus,
        rcpu: ratio(cpu_pct, sys.map_or(0, |s| s.cpu_cores), 1.0),
        rmem: ratio(mem_gb, sys.map_or(0, |s| s.mem_gb), 100.0),
        rgpu: ratio(gpu_pct, sys.map_or(0, |s| s.gpu_cards), 1.0),
        rgpumem: ratio(gpumem_gb, sys.map_or(0, |s| s.gpumem_gb), 100.0),
    }
}

type Steps = (fn(i64) -> i64, fn(i64) -> i64);

fn bucket_steps(bucket: Bucket) -> Option<Steps> {
    match bucket {
        Bucket::None => None,
        Bucket::HalfHourly => Some((truncate_to_half_hour, add_half_hour)),
        Bucket::Hourly => Some((truncate_to_hour, add_hour)),
        Bucket::HalfDaily => Some((truncate_to_half_day, add_half_day)),
        Bucket::Daily => Some((truncate_to_day, add_day)),
        Bucket::Weekly => Some((truncate_to_week, add_week)),
    }
}

// The records are bucketed and sorted; fill every missing bucket in [trunc(from), trunc(to)] with a
// zero record.
fn insert_missing_records(
    records: Vec<LoadRecord>,
    from: i64,
    to: i64,
    (trunc, step): Steps,
    sys: Option<&System>,
) -> Vec<LoadRecord> {
    let mut t = trunc(from);
    let mut result = vec![];
    for r in records {
        while t < r.timestamp {
            result.push(LoadRecord::zero(t, sys));
            t = step(t);
        }
        t = step(r.timestamp);
        result.push(r);
    }
    let ending = trunc(to);
    while t <= ending {
        result.push(LoadRecord::zero(t, sys));
        t = step(t);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarlog::{postprocess, LogEntry};

    // 2023-11-14T21:00:00Z
    const H0: i64 = 1_699_995_600;
    const HOUR: i64 = 3600;

    fn entry(host: &str, pid: u32, t: i64, cpu_pct: f32) -> LogEntry {
        LogEntry {
            version: Ustr::from("0.6.0"),
            user: Ustr::from("user"),
            command: Ustr::from("cmd"),
            pid,
            job_id: pid,
            cpu_pct,
            cpu_kb: 1024 * 1024,
            ..LogEntry::empty(t, Ustr::from(host))
        }
    }

    fn streams(entries: Vec<LogEntry>) -> InputStreamSet {
        postprocess(&[Arc::new(entries)], None, false).0
    }

    fn config() -> ClusterConfig {
        ClusterConfig::from_json_str(
            r#"{"name":"c","nodes":[{"hostname":"c1-[1-2]","description":"node","cpu_cores":4,"mem_gb":16}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_hourly_padding() {
        let input = vec![
            entry("c1-1", 10, H0 + HOUR + 10, 100.0),
            entry("c1-1", 10, H0 + HOUR + 20, 300.0),
        ];
        let opts = LoadOptions::default();
        let reports =
            aggregate_load(streams(input.clone()), H0, H0 + 3 * HOUR, None, &opts, false).unwrap();
        assert_eq!(reports.len(), 1);
        let rs = &reports[0].records;
        assert_eq!(
            rs.iter().map(|r| r.timestamp).collect::<Vec<i64>>(),
            vec![H0, H0 + HOUR, H0 + 2 * HOUR, H0 + 3 * HOUR]
        );
        assert_eq!(rs[0].cpu_pct, 0.0);
        assert_eq!(rs[1].cpu_pct, 200.0);
        assert_eq!(rs[1].mem_gb, 1.0);
        assert!(rs[1].rcpu.is_none());

        let compact = LoadOptions {
            compact: true,
            ..Default::default()
        };
        let reports =
            aggregate_load(streams(input.clone()), H0, H0 + 3 * HOUR, None, &compact, false)
                .unwrap();
        assert_eq!(reports[0].records.len(), 1);

        let unbucketed = LoadOptions {
            bucket: Bucket::None,
            ..Default::default()
        };
        let reports =
            aggregate_load(streams(input), H0, H0 + 3 * HOUR, None, &unbucketed, false).unwrap();
        assert_eq!(reports[0].records.len(), 2);
        assert_eq!(reports[0].records[1].cpu_pct, 300.0);
    }

    #[test]
    fn test_group_and_relative() {
        let input = vec![
            entry("c1-2", 20, H0 + 10, 100.0),
            entry("c1-2", 20, H0 + 20, 100.0),
            entry("c1-1", 10, H0 + 10, 100.0),
            entry("c1-1", 10, H0 + 20, 100.0),
        ];
        let cfg = config();
        let cfg: &dyn HostConfigSource = &cfg;

        let per_host = LoadOptions {
            relative: true,
            compact: true,
            ..Default::default()
        };
        let reports =
            aggregate_load(streams(input.clone()), H0, H0, Some(cfg), &per_host, false).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].host.as_str(), "c1-1");
        assert_eq!(reports[1].host.as_str(), "c1-2");
        assert_eq!(reports[0].records[0].rcpu, Some(25.0));
        assert_eq!(reports[0].records[0].rmem, Some(100.0 / 16.0));

        let grouped = LoadOptions {
            group: true,
            ..per_host.clone()
        };
        let reports =
            aggregate_load(streams(input.clone()), H0, H0, Some(cfg), &grouped, false).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].host.as_str(), "c1-[1-2]");
        let sys = reports[0].system.as_ref().unwrap();
        assert_eq!(sys.cpu_cores, 8);
        assert_eq!(sys.description, "node|||node");
        assert_eq!(reports[0].records.len(), 1);
        assert_eq!(reports[0].records[0].cpu_pct, 200.0);
        assert_eq!(reports[0].records[0].rcpu, Some(25.0));

        let err = aggregate_load(streams(input.clone()), H0, H0, None, &per_host, false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueryError>(),
            Some(QueryError::ConfigRequired(_))
        ));

        let bad = LoadOptions {
            group: true,
            bucket: Bucket::None,
            ..Default::default()
        };
        assert!(aggregate_load(streams(input), H0, H0, None, &bad, false).is_err());
    }

    #[test]
    fn test_last_only() {
        let input = vec![
            entry("c1-1", 10, H0 + 10, 100.0),
            entry("c1-1", 10, H0 + HOUR + 10, 50.0),
        ];
        let opts = LoadOptions {
            last_only: true,
            ..Default::default()
        };
        let reports = aggregate_load(streams(input), H0, H0 + HOUR, None, &opts, false).unwrap();
        assert_eq!(reports[0].records.len(), 1);
        assert_eq!(reports[0].records[0].timestamp, H0 + HOUR);
        assert_eq!(reports[0].records[0].cpu_pct, 50.0);
    }
}
