/// Reconstruct sample streams from the raw sample blobs returned by the store.
///
/// A stream is identified by (hostname, stream-id, command).  For a process that was not rolled up
/// the stream-id is the pid, which is unique on the host at any one time.  For a rolled-up record
/// (rolledup > 0) there is no meaningful pid, but there is only one record per (job, command) at a
/// time, so the stream-id is JOB_ID_TAG + job.
///
/// The tag is larger than any Linux pid, but job IDs can in principle grow large enough to collide
/// with it and nothing checks that.  Widening the stream-id to 64 bits with a tag bit above the job
/// ID would remove the problem.
///
/// The blobs are shared with the cache and other queries and are never modified.  A `Sample` is a
/// reference to one record plus the fields computed for this query.
use crate::filter::{RecordFilter, SampleFilter};
use crate::repr::{parse_version, LogEntry};

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use ustr::Ustr;

pub const JOB_ID_TAG: u32 = 10_000_000;

#[derive(Clone, Debug)]
pub struct Sample {
    blob: Arc<Vec<LogEntry>>,
    ix: u32,

    /// CPU utilization in percent (100% = one full core) since the previous sample in the stream.
    /// Computed from consecutive `cputime_sec` values when the data carry them; the first sample
    /// of a stream, and all samples from sonar 0.6 and earlier, get `cpu_pct`.
    pub cpu_util_pct: f32,
}

impl Sample {
    pub fn new(blob: &Arc<Vec<LogEntry>>, ix: usize) -> Sample {
        Sample {
            blob: blob.clone(),
            ix: ix as u32,
            cpu_util_pct: blob[ix].cpu_pct,
        }
    }

    /// Wrap synthesized records, which have no blob to live in, in a fresh shared blob.
    pub fn from_records(records: Vec<(LogEntry, f32)>) -> Vec<Sample> {
        let (entries, utils): (Vec<LogEntry>, Vec<f32>) = records.into_iter().unzip();
        let blob = Arc::new(entries);
        utils
            .into_iter()
            .enumerate()
            .map(|(ix, cpu_util_pct)| Sample {
                blob: blob.clone(),
                ix: ix as u32,
                cpu_util_pct,
            })
            .collect()
    }
}

impl Deref for Sample {
    type Target = LogEntry;

    fn deref(&self) -> &LogEntry {
        &self.blob[self.ix as usize]
    }
}

pub type SampleStream = Vec<Sample>;

/// A bag of streams.  Constraints on uniqueness and order depend on how they were merged.
pub type SampleStreams = Vec<SampleStream>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputStreamKey {
    pub host: Ustr,
    pub stream_id: u32,
    pub cmd: Ustr,
}

/// After postprocessing every stream in the set is nonempty, sorted ascending by timestamp, and
/// has no two samples with the same timestamp.
pub type InputStreamSet = HashMap<InputStreamKey, SampleStream>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timebound {
    pub earliest: i64,
    pub latest: i64,
}

/// Map from host name to the earliest and latest times seen for the host.
pub type Timebounds = HashMap<Ustr, Timebound>;

pub fn stream_id(e: &LogEntry) -> u32 {
    if e.rolledup > 0 {
        JOB_ID_TAG + e.job_id
    } else {
        e.pid
    }
}

/// Turn raw blobs into clean streams.  Bounds, if wanted, are computed over all the input before
/// any filtering, so that they describe what the data cover and not what was selected.

pub fn postprocess(
    blobs: &[Arc<Vec<LogEntry>>],
    filter: Option<&SampleFilter>,
    want_bounds: bool,
) -> (InputStreamSet, Timebounds) {
    let record_filter = match filter {
        Some(f) => RecordFilter::compile(f),
        None => RecordFilter::accept_all(),
    };
    let mut streams = InputStreamSet::new();
    let mut bounds = Timebounds::new();

    for blob in blobs {
        for (ix, e) in blob.iter().enumerate() {
            if want_bounds {
                bounds
                    .entry(e.hostname)
                    .and_modify(|b| {
                        b.earliest = b.earliest.min(e.timestamp);
                        b.latest = b.latest.max(e.timestamp);
                    })
                    .or_insert(Timebound {
                        earliest: e.timestamp,
                        latest: e.timestamp,
                    });
            }
            if !record_filter.apply(e) {
                continue;
            }
            let key = InputStreamKey {
                host: e.hostname,
                stream_id: stream_id(e),
                cmd: e.command,
            };
            streams.entry(key).or_default().push(Sample::new(blob, ix));
        }
    }

    for stream in streams.values_mut() {
        // Stable, so that records from the same file stay in file order.
        stream.sort_by_key(|s| s.timestamp);

        // Duplicates come from overlapping uploads and should be identical; keep the first.
        stream.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);

        compute_cpu_util(stream);
    }

    streams.retain(|_, stream| !stream.is_empty());
    (streams, bounds)
}

// For v0.7.0 and later, compute cpu_util_pct from the difference in cputime_sec against the
// previous retained sample.  The difference can be negative (a sonar bug); those samples are
// dropped.  Earlier versions have no cputime_sec, so cpu_pct is all we have.
fn compute_cpu_util(stream: &mut SampleStream) {
    if stream.is_empty() {
        return;
    }
    let (major, minor, _) = parse_version(stream[0].version.as_str());
    if major == 0 && minor <= 6 {
        return;
    }
    let mut retained = 1;
    for src in 1..stream.len() {
        let prev = &stream[retained - 1];
        let dt = (stream[src].timestamp - prev.timestamp) as f64;
        let dc = stream[src].cputime_sec as f64 - prev.cputime_sec as f64;
        let util = ((dc / dt) * 100.0) as f32;
        if util >= 0.0 {
            stream[src].cpu_util_pct = util;
            stream.swap(retained, src);
            retained += 1;
        }
    }
    stream.truncate(retained);
}

#[cfg(test)]
pub(crate) fn test_entry(
    host: &str,
    pid: u32,
    job: u32,
    t: i64,
    cputime_sec: u64,
    cpu_pct: f32,
) -> LogEntry {
    LogEntry {
        version: Ustr::from("0.7.0"),
        user: Ustr::from("user"),
        command: Ustr::from("cmd"),
        pid,
        job_id: job,
        cputime_sec,
        cpu_pct,
        ..LogEntry::empty(t, Ustr::from(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000;

    fn one_stream(streams: &InputStreamSet) -> &SampleStream {
        assert_eq!(streams.len(), 1);
        streams.values().next().unwrap()
    }

    #[test]
    fn test_cpu_util_from_cputime() {
        let blob = Arc::new(vec![
            test_entry("h", 10, 1, T, 100, 50.0),
            test_entry("h", 10, 1, T + 60, 130, 50.0),
            test_entry("h", 10, 1, T + 120, 160, 50.0),
        ]);
        let (streams, _) = postprocess(&[blob], None, false);
        let s = one_stream(&streams);
        assert_eq!(s.len(), 3);
        assert_eq!(
            s.iter().map(|x| x.cpu_util_pct).collect::<Vec<f32>>(),
            vec![50.0, 50.0, 50.0]
        );
    }

    #[test]
    fn test_negative_util_dropped() {
        let blob = Arc::new(vec![
            test_entry("h", 10, 1, T, 100, 50.0),
            test_entry("h", 10, 1, T + 60, 90, 50.0),
            test_entry("h", 10, 1, T + 120, 120, 50.0),
        ]);
        let (streams, _) = postprocess(&[blob], None, false);
        let s = one_stream(&streams);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].timestamp, T);
        assert_eq!(s[1].timestamp, T + 120);
        // Against the first sample, not the dropped one: 20s of cpu over 120s.
        assert!((s[1].cpu_util_pct - 20.0 / 120.0 * 100.0).abs() < 0.001);
    }

    #[test]
    fn test_old_version_copies_cpu_pct() {
        let mut a = test_entry("h", 10, 1, T, 0, 25.0);
        let mut b = test_entry("h", 10, 1, T + 60, 0, 35.0);
        a.version = Ustr::from("0.6.0");
        b.version = Ustr::from("0.6.0");
        let (streams, _) = postprocess(&[Arc::new(vec![b, a])], None, false);
        let s = one_stream(&streams);
        assert_eq!(s[0].cpu_util_pct, 25.0);
        assert_eq!(s[1].cpu_util_pct, 35.0);
    }

    #[test]
    fn test_duplicates_across_files() {
        let a = Arc::new(vec![
            test_entry("h", 10, 1, T, 100, 50.0),
            test_entry("h", 10, 1, T + 60, 130, 50.0),
        ]);
        let b = Arc::new(vec![test_entry("h", 10, 1, T + 60, 130, 50.0)]);
        let (streams, _) = postprocess(&[a, b], None, false);
        let s = one_stream(&streams);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_streams_and_rollups() {
        let mut rolled1 = test_entry("h", 0, 77, T, 10, 1.0);
        rolled1.rolledup = 2;
        let mut rolled2 = test_entry("h", 0, 77, T + 60, 20, 1.0);
        rolled2.rolledup = 3;
        let blob = Arc::new(vec![
            test_entry("h", 10, 1, T + 60, 130, 50.0),
            test_entry("g", 10, 1, T, 100, 50.0),
            test_entry("h", 11, 1, T, 100, 50.0),
            test_entry("h", 10, 1, T, 100, 50.0),
            rolled1,
            rolled2,
        ]);
        let (streams, _) = postprocess(&[blob], None, false);
        assert_eq!(streams.len(), 4);
        let key = InputStreamKey {
            host: Ustr::from("h"),
            stream_id: JOB_ID_TAG + 77,
            cmd: Ustr::from("cmd"),
        };
        assert_eq!(streams[&key].len(), 2);

        // Every stream: one host, one stream id, strictly ascending.
        for (k, s) in &streams {
            assert!(!s.is_empty());
            for w in s.windows(2) {
                assert!(w[0].timestamp < w[1].timestamp);
            }
            for x in s {
                assert_eq!(x.hostname, k.host);
                assert_eq!(stream_id(x), k.stream_id);
            }
        }
    }

    #[test]
    fn test_bounds_ignore_filter() {
        let blob = Arc::new(vec![
            test_entry("h", 10, 1, T, 100, 50.0),
            test_entry("h", 11, 2, T + 600, 100, 50.0),
            test_entry("g", 12, 3, T + 60, 100, 50.0),
        ]);
        let (_, unfiltered) = postprocess(&[blob.clone()], None, true);
        let mut f = SampleFilter::default();
        f.include_jobs.insert(2);
        let (streams, filtered) = postprocess(&[blob.clone()], Some(&f), true);
        assert_eq!(streams.len(), 1);
        assert_eq!(unfiltered, filtered);
        assert_eq!(
            filtered[&Ustr::from("h")],
            Timebound {
                earliest: T,
                latest: T + 600
            }
        );

        let (_, none) = postprocess(&[blob], None, false);
        assert!(none.is_empty());
    }

    #[test]
    fn test_sample_from_records() {
        let xs = Sample::from_records(vec![
            (test_entry("h", 1, 1, T, 0, 0.0), 5.0),
            (test_entry("h", 1, 1, T + 1, 0, 0.0), 6.0),
        ]);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[1].timestamp, T + 1);
        assert_eq!(xs[1].cpu_util_pct, 6.0);
    }
}
