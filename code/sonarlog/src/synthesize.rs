/// Helpers for merging and folding sample streams.
use crate::postprocess::{InputStreamSet, Sample, SampleStream, SampleStreams, Timebound, Timebounds};
use crate::repr::LogEntry;

use itertools::Itertools;
use rustutils::{compress_hostnames, GpuSet};
use std::collections::{HashMap, HashSet};
use ustr::Ustr;

/// Merge streams that have the same host and job ID into synthesized data.
///
/// Each output stream is sorted ascending by timestamp.  No two records have exactly the same time.
/// All records within a stream have the same host, command, user, and job ID.  The command name of
/// a merged stream is the sorted, comma-joined set of the commands that went into it.
///
/// Streams with job ID zero can't be merged with anything and are passed through.

pub fn merge_by_host_and_job(mut streams: InputStreamSet) -> SampleStreams {
    let mut collections: HashMap<(Ustr, u32), (HashSet<Ustr>, SampleStreams)> = HashMap::new();
    let mut zero: SampleStreams = vec![];

    for (key, v) in streams.drain() {
        let id = v[0].job_id;
        if id == 0 {
            zero.push(v);
            continue;
        }
        let (cmds, vs) = collections.entry((key.host, id)).or_default();
        cmds.insert(key.cmd);
        vs.push(v);
    }

    let mut vs = zero;
    for ((hostname, job_id), (cmds, streams)) in collections.drain() {
        // Streams are never empty, any user from any record will do.
        let user = streams[0][0].user;
        vs.push(merge_streams(
            hostname,
            join_sorted(cmds),
            user,
            job_id,
            streams,
        ));
    }
    vs
}

/// Merge streams that have the same job ID, across hosts, into synthesized data.
///
/// As for `merge_by_host_and_job`, but the host name of a merged stream is the compressed set of
/// the hosts that went into it, and the bounds for that name are the union of the bounds of those
/// hosts.  Every host in the input must have bounds.

pub fn merge_by_job(mut streams: InputStreamSet, bounds: &Timebounds) -> (SampleStreams, Timebounds) {
    let mut collections: HashMap<u32, (HashSet<Ustr>, HashSet<Ustr>, SampleStreams)> =
        HashMap::new();
    let mut zero: SampleStreams = vec![];

    for (key, v) in streams.drain() {
        let id = v[0].job_id;
        if id == 0 {
            zero.push(v);
            continue;
        }
        let (cmds, hosts, vs) = collections.entry(id).or_default();
        cmds.insert(key.cmd);
        hosts.insert(key.host);
        vs.push(v);
    }

    let mut new_bounds = Timebounds::new();
    for z in &zero {
        let hn = z[0].hostname;
        new_bounds.entry(hn).or_insert_with(|| host_bound(bounds, hn));
    }

    let mut vs = zero;
    for (job_id, (cmds, hosts, streams)) in collections.drain() {
        let hosts = hosts.into_iter().collect::<Vec<Ustr>>();
        let hostname = Ustr::from(compress_hostnames(&hosts).join(",").as_str());
        new_bounds.entry(hostname).or_insert_with(|| {
            hosts.iter().fold(
                Timebound {
                    earliest: i64::MAX,
                    latest: i64::MIN,
                },
                |acc, hn| {
                    let b = host_bound(bounds, *hn);
                    Timebound {
                        earliest: acc.earliest.min(b.earliest),
                        latest: acc.latest.max(b.latest),
                    }
                },
            )
        });
        let user = streams[0][0].user;
        vs.push(merge_streams(hostname, join_sorted(cmds), user, job_id, streams));
    }

    (vs, new_bounds)
}

fn host_bound(bounds: &Timebounds, host: Ustr) -> Timebound {
    match bounds.get(&host) {
        Some(b) => *b,
        None => panic!("Host {host} should be in bounds"),
    }
}

/// Merge streams that have the same host (across jobs) into synthesized data.  The command and user
/// of the merged stream are "_merged_" and the job ID is 0.

pub fn merge_by_host(mut streams: InputStreamSet) -> SampleStreams {
    let mut collections: HashMap<Ustr, SampleStreams> = HashMap::new();
    for (key, v) in streams.drain() {
        collections.entry(key.host).or_default().push(v);
    }

    let merged = Ustr::from("_merged_");
    collections
        .drain()
        .map(|(hostname, streams)| merge_streams(hostname, merged, merged, 0, streams))
        .collect()
}

/// Given already-merged streams, one per host and all hosts different, merge by timeslot into one
/// cross-host stream.

pub fn merge_across_hosts_by_time(streams: SampleStreams) -> SampleStreams {
    if streams.is_empty() {
        return vec![];
    }
    let hostname = Ustr::from(
        &compress_hostnames(&streams.iter().map(|s| s[0].hostname).collect::<Vec<Ustr>>())
            .join(","),
    );
    let merged = Ustr::from("_merged_");
    vec![merge_streams(hostname, merged, merged, 0, streams)]
}

// Samples from different streams are not taken at the same time, so "the job's CPU use at time t"
// has to be reconstructed.  We walk all the streams in parallel.  At each step the earliest
// unconsumed sample time is the time of the synthesized sample; every stream contributes its sample
// in a short window after that time if it has one, else its most recent earlier sample if that is
// recent enough, else nothing.  The synthesized sample sums the contributions.
//
// The synthesized records carry the given host, command, user and job, version "0.0.0", no pid,
// the sum of the contributions' numeric fields, the union of their GPU sets, the max of their GPU
// failure flags, and the number of contributing processes (minus one) in `rolledup`.
//
// Relies on: streams are nonempty, sorted ascending, without duplicate timestamps.
//
// This loop nest is quadratic in the number of time steps in the worst case and is hot for long
// time windows.  Exhausted streams are marked with STREAM_ENDED and `live` tracks the first stream
// that may still contribute, so both inner loops skip dead streams quickly.

fn merge_streams(
    hostname: Ustr,
    command: Ustr,
    username: Ustr,
    job_id: u32,
    streams: SampleStreams,
) -> SampleStream {
    const STREAM_ENDED: usize = usize::MAX;
    const WINDOW: i64 = 10;
    const NEAR_PAST: i64 = 30;
    const DEEP_PAST: i64 = 60;

    let mut records = vec![];
    let mut indices = vec![0usize; streams.len()];
    let mut selected: Vec<&Sample> = Vec::with_capacity(streams.len());
    let mut live = 0;

    loop {
        while live < streams.len() && indices[live] == STREAM_ENDED {
            live += 1;
        }

        let mut min_time = i64::MAX;
        for i in live..streams.len() {
            if indices[i] >= streams[i].len() {
                continue;
            }
            min_time = min_time.min(streams[i][indices[i]].timestamp);
        }
        if min_time == i64::MAX {
            break;
        }

        let lim_time = min_time + WINDOW;
        let near_past = min_time - NEAR_PAST;
        let deep_past = min_time - DEEP_PAST;

        for i in live..streams.len() {
            let s = &streams[i];
            let ix = indices[i];
            let lim = s.len();

            if ix < lim {
                let t = s[ix].timestamp;
                if t >= lim_time {
                    // Not started yet.
                    continue;
                }
                if t >= min_time {
                    selected.push(&s[ix]);
                    indices[i] += 1;
                    continue;
                }
                // The previous sample is still in effect if it is recent.
                if ix > 0 && s[ix - 1].timestamp >= near_past {
                    selected.push(&s[ix - 1]);
                }
            } else if ix != STREAM_ENDED {
                // ix == lim > 0: the last sample may linger for a while.
                let t = s[ix - 1].timestamp;
                if t < deep_past {
                    indices[i] = STREAM_ENDED;
                } else if t < min_time {
                    selected.push(&s[ix - 1]);
                }
            }
        }

        records.push(sum_records(
            min_time, hostname, username, job_id, command, &selected,
        ));
        selected.clear();
    }

    Sample::from_records(records)
}

fn sum_records(
    timestamp: i64,
    hostname: Ustr,
    user: Ustr,
    job_id: u32,
    command: Ustr,
    selected: &[&Sample],
) -> (LogEntry, f32) {
    let mut r = LogEntry {
        version: Ustr::from("0.0.0"),
        user,
        command,
        job_id,
        ..LogEntry::empty(timestamp, hostname)
    };
    let mut gpus = GpuSet::empty();
    let mut cpu_util_pct = 0.0;
    let mut rolledup = 0;
    for s in selected {
        r.cpu_pct += s.cpu_pct;
        r.cpu_kb += s.cpu_kb;
        r.rssanon_kb += s.rssanon_kb;
        r.gpu_pct += s.gpu_pct;
        r.gpumem_pct += s.gpumem_pct;
        r.gpu_kb += s.gpu_kb;
        r.cputime_sec += s.cputime_sec;
        r.gpu_fail = r.gpu_fail.max(s.gpu_fail);
        gpus.union(s.gpus);
        cpu_util_pct += s.cpu_util_pct;
        // rolledup counts *other* processes: one for each record plus the ones rolled into it,
        // less one for this record.
        rolledup += s.rolledup + 1;
    }
    r.rolledup = rolledup.saturating_sub(1);
    r.gpus = gpus;
    (r, cpu_util_pct)
}

pub fn fold_samples_half_hourly(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_half_hour)
}

pub fn fold_samples_hourly(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_hour)
}

pub fn fold_samples_half_daily(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_half_day)
}

pub fn fold_samples_daily(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_day)
}

pub fn fold_samples_weekly(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_week)
}

// Consecutive samples in the same time bucket are averaged into one sample stamped with the start
// of the bucket.  The input must be sorted by time.
fn fold_samples(samples: &[Sample], get_time: fn(i64) -> i64) -> SampleStream {
    let merged = Ustr::from("_merged_");
    let mut result = vec![];
    let mut i = 0;
    while i < samples.len() {
        let s0 = &samples[i];
        let t0 = get_time(s0.timestamp);
        let mut bucket = vec![s0];
        i += 1;
        while i < samples.len() && get_time(samples[i].timestamp) == t0 {
            bucket.push(&samples[i]);
            i += 1;
        }
        let (mut r, mut cpu_util_pct) = sum_records(t0, s0.hostname, merged, 0, merged, &bucket);
        let n = bucket.len();
        r.cpu_pct /= n as f32;
        r.cpu_kb /= n as u64;
        r.rssanon_kb /= n as u64;
        r.gpu_pct /= n as f32;
        r.gpumem_pct /= n as f32;
        r.gpu_kb /= n as u64;
        r.cputime_sec /= n as u64;
        cpu_util_pct /= n as f32;
        result.push((r, cpu_util_pct));
    }
    Sample::from_records(result)
}

fn join_sorted(names: HashSet<Ustr>) -> Ustr {
    Ustr::from(names.iter().map(|n| n.as_str()).sorted().join(",").as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::{postprocess, test_entry};
    use std::sync::Arc;

    const T: i64 = 1_700_000_000;

    fn entry(host: &str, pid: u32, job: u32, t: i64, cmd: &str, cpu_kb: u64) -> LogEntry {
        LogEntry {
            command: Ustr::from(cmd),
            cpu_kb,
            ..test_entry(host, pid, job, t, 0, 10.0)
        }
    }

    #[test]
    fn test_merge_by_host_and_job() {
        let blob = Arc::new(vec![
            entry("a", 1, 5, T, "x", 100),
            entry("a", 2, 5, T, "y", 200),
            entry("a", 1, 5, T + 300, "x", 100),
            entry("a", 2, 5, T + 300, "y", 200),
            entry("b", 3, 5, T, "x", 50),
            entry("a", 4, 0, T, "z", 1),
        ]);
        let (streams, _) = postprocess(&[blob], None, false);
        let mut merged = merge_by_host_and_job(streams);
        merged.sort_by_key(|s| (s[0].hostname, s[0].job_id));
        assert_eq!(merged.len(), 3);
        // Job 0 passes through untouched.
        assert_eq!(merged[0][0].job_id, 0);
        assert_eq!(merged[0][0].command.as_str(), "z");
        let m = &merged[1];
        assert_eq!(m[0].hostname.as_str(), "a");
        assert_eq!(m[0].command.as_str(), "x,y");
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].cpu_kb, 300);
        assert_eq!(m[0].rolledup, 1);
        assert_eq!(m[0].cpu_util_pct, 20.0);
        assert_eq!(merged[2][0].hostname.as_str(), "b");
    }

    #[test]
    fn test_merge_by_job_bounds() {
        let blob = Arc::new(vec![
            entry("c1-1", 1, 5, T, "x", 100),
            entry("c1-2", 1, 5, T + 5, "x", 100),
            entry("c1-2", 9, 6, T + 900, "x", 100),
            entry("c1-1", 1, 5, T + 300, "x", 100),
        ]);
        let (streams, bounds) = postprocess(&[blob], None, true);
        let (merged, new_bounds) = merge_by_job(streams, &bounds);
        assert_eq!(merged.len(), 2);
        let j5 = merged.iter().find(|s| s[0].job_id == 5).unwrap();
        assert_eq!(j5[0].hostname.as_str(), "c1-[1-2]");
        // The two first samples are within the window of each other.
        assert_eq!(j5.len(), 2);
        assert_eq!(j5[0].cpu_kb, 200);
        assert_eq!(
            new_bounds[&Ustr::from("c1-[1-2]")],
            Timebound {
                earliest: T,
                latest: T + 900
            }
        );
    }

    #[test]
    fn test_merge_by_host_lingering_sample() {
        // The sample from pid 2 at T+20 is still in effect at T+40 but not at T+100.  At T+20 the
        // sample from pid 1 at T is not picked up since pid 1 has a sample later than the window.
        let blob = Arc::new(vec![
            entry("a", 1, 5, T, "x", 1),
            entry("a", 1, 5, T + 40, "x", 1),
            entry("a", 1, 5, T + 100, "x", 1),
            entry("a", 2, 6, T + 20, "y", 10),
        ]);
        let (streams, _) = postprocess(&[blob], None, false);
        let merged = merge_by_host(streams);
        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert_eq!(m[0].command.as_str(), "_merged_");
        assert_eq!(
            m.iter().map(|s| (s.timestamp - T, s.cpu_kb)).collect::<Vec<(i64, u64)>>(),
            vec![(0, 1), (20, 10), (40, 11), (100, 1)]
        );
    }

    #[test]
    fn test_fold_hourly() {
        let h = 3600;
        let t0 = (T / h) * h;
        let blob = Arc::new(vec![
            entry("a", 1, 5, t0 + 60, "x", 100),
            entry("a", 1, 5, t0 + 120, "x", 300),
            entry("a", 1, 5, t0 + h + 5, "x", 50),
        ]);
        let (streams, _) = postprocess(&[blob], None, false);
        let merged = merge_by_host(streams);
        let folded = fold_samples_hourly(&merged[0]);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].timestamp, t0);
        assert_eq!(folded[0].cpu_kb, 200);
        assert_eq!(folded[1].timestamp, t0 + h);
        assert_eq!(folded[1].cpu_kb, 50);
    }
}
