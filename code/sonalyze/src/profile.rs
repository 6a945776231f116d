// For one particular job, break it down in its component processes and produce individual stats for
// each process for each time slot.
//
// The result is a matrix of per-process-per-point-in-time data, with time running down the column
// and process running across the row.  The matrix is sparse, as processes only have data at points
// in time when they are running; absent cells are None.
//
// The data fields are raw data items from the samples, optionally clamped.  There are no peaks
// because we only have samples at the start and end of the time slot.
//
//   cpu: the cpu_util_pct field
//   mem: the cpu_kb field, in GiB
//   res: the rssanon_kb field, in GiB
//   gpu: the gpu_pct field
//   gpumem: the gpu_kb field, in GiB
//   nproc: the rolledup field + 1
//
// TODO: Remove the single-host restriction, for multi-host jobs.  Every cell would need a host.

use crate::query::{build_sample_filter, read_sample_streams_and_maybe_bounds, QueryFilter};

use anyhow::{bail, Result};
use rustutils::{log, ClusterConfig};
use sonarlog::{DataProvider, InputStreamSet, Sample, SampleStream};
use ustr::Ustr;

#[derive(Clone, Debug, Default)]
pub struct ProfileOptions {
    /// Clamp for all the numeric fields, see `clamp_max`.
    pub max: Option<f64>,

    /// Average this many consecutive rows into one.  0 and 1 mean no bucketing.
    pub bucket: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileDatum {
    pub cpu_util_pct: f64,
    pub mem_gb: f64,
    pub res_gb: f64,
    pub gpu_pct: f64,
    pub gpumem_gb: f64,
    pub nproc: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileProcess {
    pub stream_id: u32,
    pub pid: u32,
    pub command: Ustr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileRow {
    pub timestamp: i64,
    pub cells: Vec<Option<ProfileDatum>>,
}

#[derive(Clone, Debug)]
pub struct Profile {
    pub host: Ustr,
    pub job_id: u32,

    /// The columns, in order of first appearance.
    pub processes: Vec<ProfileProcess>,

    /// The rows, ascending by time.  Every row has one cell per process.
    pub rows: Vec<ProfileRow>,

    /// True if any cell represents more than one process.
    pub has_rolledup: bool,
}

pub fn query_profile(
    provider: &dyn DataProvider,
    cfg: Option<&ClusterConfig>,
    filter: &QueryFilter,
    opts: &ProfileOptions,
    verbose: bool,
) -> Result<Profile> {
    if filter.job.len() != 1 {
        bail!("Exactly one job number is required by profile");
    }
    let (hosts, sample_filter) = build_sample_filter(cfg, filter, verbose)?;
    let (streams, _, _) = read_sample_streams_and_maybe_bounds(
        provider,
        filter.from_time(),
        filter.to_time(),
        &hosts,
        Some(&sample_filter),
        false,
        verbose,
    )?;
    build_profile(filter.job[0], streams, opts, verbose)
}

/// The streams are the filtered streams for the job, each sorted ascending by time without
/// duplicates.  Fails if the streams span more than one host or there are none.

pub fn build_profile(
    job_id: u32,
    mut streams: InputStreamSet,
    opts: &ProfileOptions,
    verbose: bool,
) -> Result<Profile> {
    let mut host: Option<Ustr> = None;
    for key in streams.keys() {
        match host {
            Some(h) if h != key.host => bail!("profile only implemented for single-host jobs"),
            _ => host = Some(key.host),
        }
    }
    let Some(host) = host else {
        bail!("No samples for job {job_id}");
    };

    // Sorting ascending by first timestamp gives the list of processes a natural order at each
    // time step.
    let mut processes = streams
        .drain()
        .map(|(k, v)| (k.stream_id, v))
        .collect::<Vec<(u32, SampleStream)>>();
    processes.sort_by(|a, b| a.1[0].timestamp.cmp(&b.1[0].timestamp).then(a.0.cmp(&b.0)));

    let has_rolledup = processes
        .iter()
        .any(|(_, s)| s.iter().any(|x| x.rolledup > 0));

    // Walk all the streams in parallel.  At each step the time is the minimum timestamp among the
    // unexhausted streams and every stream with a sample at that time contributes a cell.  The
    // number of processes is normally small, so no priority queue.
    let mut indices = vec![0; processes.len()];
    let mut rows = vec![];
    loop {
        let mut mintime = None;
        for (i, (_, s)) in processes.iter().enumerate() {
            if indices[i] < s.len() {
                let t = s[indices[i]].timestamp;
                if mintime.map_or(true, |m| t < m) {
                    mintime = Some(t);
                }
            }
        }
        let Some(mintime) = mintime else {
            break;
        };
        let mut cells = vec![];
        for (i, (_, s)) in processes.iter().enumerate() {
            if indices[i] < s.len() && s[indices[i]].timestamp == mintime {
                cells.push(Some(datum(&s[indices[i]], opts.max)));
                indices[i] += 1;
            } else {
                cells.push(None);
            }
        }
        rows.push(ProfileRow {
            timestamp: mintime,
            cells,
        });
    }

    if verbose {
        slog::info!(log(), "Number of processes: {}", processes.len());
        slog::info!(log(), "Any rolled-up processes: {}", has_rolledup);
        slog::info!(log(), "Number of time steps: {}", rows.len());
    }

    if opts.bucket > 1 {
        rows = bucket_rows(&rows, opts.bucket, processes.len());
    }

    Ok(Profile {
        host,
        job_id,
        processes: processes
            .iter()
            .map(|(stream_id, s)| ProfileProcess {
                stream_id: *stream_id,
                pid: s[0].pid,
                command: s[0].command,
            })
            .collect(),
        rows,
        has_rolledup,
    })
}

const KB2GB: f64 = 1.0 / (1024.0 * 1024.0);

fn datum(s: &Sample, max: Option<f64>) -> ProfileDatum {
    ProfileDatum {
        cpu_util_pct: clamp_max(s.cpu_util_pct as f64, max),
        mem_gb: clamp_max(s.cpu_kb as f64 * KB2GB, max),
        res_gb: clamp_max(s.rssanon_kb as f64 * KB2GB, max),
        gpu_pct: clamp_max(s.gpu_pct as f64, max),
        gpumem_gb: clamp_max(s.gpu_kb as f64 * KB2GB, max),
        nproc: s.rolledup + 1,
    }
}

// Max clamping: If the value is greater than the clamp then return the clamp, except if it is more
// than twice the value of the clamp, in which case return 0 - the assumption is that it's a wild
// outlier / noise.

fn clamp_max(x: f64, c: Option<f64>) -> f64 {
    match c {
        Some(c) if x > 2.0 * c => 0.0,
        Some(c) if x > c => c,
        _ => x,
    }
}

// Average consecutive rows in chunks of `b`, per process, counting only present cells in the
// divisor.  The time of a chunk is the time of its middle row.  The nproc of an averaged cell is
// that of the first present cell.
fn bucket_rows(rows: &[ProfileRow], b: usize, nproc: usize) -> Vec<ProfileRow> {
    rows.chunks(b)
        .map(|chunk| {
            let cells = (0..nproc)
                .map(|i| {
                    let present = chunk
                        .iter()
                        .filter_map(|r| r.cells[i].as_ref())
                        .collect::<Vec<&ProfileDatum>>();
                    if present.is_empty() {
                        return None;
                    }
                    let n = present.len() as f64;
                    let avg = |f: fn(&ProfileDatum) -> f64| {
                        present.iter().map(|d| f(d)).sum::<f64>() / n
                    };
                    Some(ProfileDatum {
                        cpu_util_pct: avg(|d| d.cpu_util_pct),
                        mem_gb: avg(|d| d.mem_gb),
                        res_gb: avg(|d| d.res_gb),
                        gpu_pct: avg(|d| d.gpu_pct),
                        gpumem_gb: avg(|d| d.gpumem_gb),
                        nproc: present[0].nproc,
                    })
                })
                .collect();
            ProfileRow {
                timestamp: chunk[chunk.len() / 2].timestamp,
                cells,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarlog::{postprocess, LogEntry};
    use std::sync::Arc;

    const T: i64 = 1_700_000_000;

    fn entry(host: &str, pid: u32, t: i64, cpu_pct: f32) -> LogEntry {
        LogEntry {
            version: Ustr::from("0.6.0"),
            user: Ustr::from("user"),
            command: Ustr::from(if pid == 1 { "python" } else { "worker" }),
            pid,
            job_id: 5,
            cpu_pct,
            ..LogEntry::empty(t, Ustr::from(host))
        }
    }

    fn streams(entries: Vec<LogEntry>) -> InputStreamSet {
        postprocess(&[Arc::new(entries)], None, false).0
    }

    fn cpu(row: &ProfileRow) -> Vec<Option<f64>> {
        row.cells
            .iter()
            .map(|c| c.as_ref().map(|d| d.cpu_util_pct))
            .collect()
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_max(15.0, Some(10.0)), 10.0);
        assert_eq!(clamp_max(25.0, Some(10.0)), 0.0);
        assert_eq!(clamp_max(8.0, Some(10.0)), 8.0);
        assert_eq!(clamp_max(20.0, Some(10.0)), 10.0);
        assert_eq!(clamp_max(25.0, None), 25.0);
    }

    #[test]
    fn test_profile_matrix() {
        let input = vec![
            entry("a", 2, T + 60, 4.0),
            entry("a", 1, T, 15.0),
            entry("a", 1, T + 60, 25.0),
            entry("a", 2, T + 120, 6.0),
            entry("a", 1, T + 120, 8.0),
        ];
        let opts = ProfileOptions {
            max: Some(10.0),
            bucket: 0,
        };
        let p = build_profile(5, streams(input.clone()), &opts, false).unwrap();
        assert_eq!(p.host.as_str(), "a");
        assert!(!p.has_rolledup);
        assert_eq!(
            p.processes.iter().map(|x| x.pid).collect::<Vec<u32>>(),
            vec![1, 2]
        );
        assert_eq!(p.processes[1].command.as_str(), "worker");
        assert_eq!(
            p.rows.iter().map(|r| r.timestamp).collect::<Vec<i64>>(),
            vec![T, T + 60, T + 120]
        );
        assert_eq!(cpu(&p.rows[0]), vec![Some(10.0), None]);
        assert_eq!(cpu(&p.rows[1]), vec![Some(0.0), Some(4.0)]);
        assert_eq!(cpu(&p.rows[2]), vec![Some(8.0), Some(6.0)]);

        let bucketed = ProfileOptions {
            max: Some(10.0),
            bucket: 2,
        };
        let p = build_profile(5, streams(input), &bucketed, false).unwrap();
        assert_eq!(
            p.rows.iter().map(|r| r.timestamp).collect::<Vec<i64>>(),
            vec![T + 60, T + 120]
        );
        assert_eq!(cpu(&p.rows[0]), vec![Some(5.0), Some(4.0)]);
        assert_eq!(cpu(&p.rows[1]), vec![Some(8.0), Some(6.0)]);
    }

    #[test]
    fn test_profile_rejects() {
        let opts = ProfileOptions::default();
        let input = vec![entry("a", 1, T, 1.0), entry("b", 2, T, 1.0)];
        assert!(build_profile(5, streams(input), &opts, false).is_err());
        assert!(build_profile(5, streams(vec![]), &opts, false).is_err());
    }
}
