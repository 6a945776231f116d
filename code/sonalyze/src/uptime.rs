// Compute uptime for hosts and their GPUs.
//
// The uptime of a host is computed from gaps in the timeline of its observations, heartbeat records
// included.  Two consecutive observations are in the same "up" window if they are at most
// 2 * interval minutes apart; a larger gap is a "down" window.  Within each up window of a host,
// the GPUs are up while the observations report no GPU failure.
//
// An up window runs from its first to its last observation.  The host windows form a complete
// timeline for [from, to]: there is a down window from `from` to the first observation and from the
// last observation to `to`, and the end of one window equals the start of the next.  GPU windows
// similarly form a complete timeline within each host up window.
//
// Hosts in the cluster configuration that have no observations in the window are down for the
// whole window.
//
// Reports are sorted by host name and then by start time, so that each host's history reads
// top-to-bottom.

use crate::query::QueryFilter;

use anyhow::{bail, Result};
use rustutils::{format_ymdhm, log, to_unix, ClusterConfig, HostGlobber};
use sonarlog::{DataProvider, LogEntry};
use std::collections::HashMap;
use std::sync::Arc;
use ustr::Ustr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Device {
    Host,
    Gpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UptimeReport {
    pub device: Device,
    pub host: Ustr,
    pub state: State,
    pub start: i64,
    pub end: i64,
}

#[derive(Clone, Debug)]
pub struct UptimeOptions {
    /// The maximum sampling interval of the data, in minutes.
    pub interval: u32,
    pub only_up: bool,
    pub only_down: bool,
}

impl Default for UptimeOptions {
    fn default() -> UptimeOptions {
        UptimeOptions {
            interval: 5,
            only_up: false,
            only_down: false,
        }
    }
}

pub fn query_uptime(
    provider: &dyn DataProvider,
    cfg: Option<&ClusterConfig>,
    filter: &QueryFilter,
    opts: &UptimeOptions,
    verbose: bool,
) -> Result<Vec<UptimeReport>> {
    // Every record for the host counts regardless of user and command, so only the host selection
    // and the window are used from the filter.
    let hosts = HostGlobber::from_patterns(&filter.host, true)?;
    if verbose {
        slog::info!(log(), "Uptime hosts: {:?}", hosts.patterns());
    }
    let (blobs, _) = provider.read_samples(filter.from_time(), filter.to_time(), &hosts, verbose)?;
    let config_hosts = cfg.map(|c| c.hosts()).unwrap_or_default();
    compute_uptime(
        &blobs,
        &hosts,
        &config_hosts,
        to_unix(filter.from_time()),
        to_unix(filter.to_time()),
        opts,
        verbose,
    )
}

pub fn compute_uptime(
    blobs: &[Arc<Vec<LogEntry>>],
    hosts: &HostGlobber,
    config_hosts: &[String],
    from: i64,
    to: i64,
    opts: &UptimeOptions,
    verbose: bool,
) -> Result<Vec<UptimeReport>> {
    if opts.interval == 0 {
        bail!("Uptime requires a positive sampling interval");
    }
    let cutoff = opts.interval as i64 * 60 * 2;

    // Per host, the observation times with a flag for whether the GPUs were ok at that time.  All
    // records at one time must agree for the GPUs to be ok.
    let mut observations: HashMap<Ustr, Vec<(i64, bool)>> = HashMap::new();
    for e in blobs.iter().flat_map(|b| b.iter()) {
        if e.timestamp < from || e.timestamp > to {
            continue;
        }
        if !hosts.is_empty() && !hosts.match_hostname(&e.hostname) {
            continue;
        }
        observations
            .entry(e.hostname)
            .or_default()
            .push((e.timestamp, e.gpu_fail == 0));
    }

    let mut reports = vec![];
    for (host, obs) in observations.iter_mut() {
        obs.sort_by_key(|(t, _)| *t);
        obs.dedup_by(|later, earlier| {
            if later.0 == earlier.0 {
                earlier.1 = earlier.1 && later.1;
                true
            } else {
                false
            }
        });
        host_timeline(*host, obs, from, to, cutoff, verbose, &mut reports);
    }

    for h in config_hosts {
        let name = Ustr::from(h.as_str());
        if observations.contains_key(&name) {
            continue;
        }
        if !hosts.is_empty() && !hosts.match_hostname(h) {
            continue;
        }
        if verbose {
            slog::info!(log(), "{h}: no observations, down");
        }
        reports.push(UptimeReport {
            device: Device::Host,
            host: name,
            state: State::Down,
            start: from,
            end: to,
        });
    }

    reports.retain(|r| match r.state {
        State::Up => !opts.only_down,
        State::Down => !opts.only_up,
    });
    reports.sort_by(|a, b| {
        a.host
            .cmp(&b.host)
            .then(a.start.cmp(&b.start))
            .then(a.device.cmp(&b.device))
            .then(a.end.cmp(&b.end))
    });
    Ok(reports)
}

// `obs` is nonempty, sorted, without duplicate times.
fn host_timeline(
    host: Ustr,
    obs: &[(i64, bool)],
    from: i64,
    to: i64,
    cutoff: i64,
    verbose: bool,
    reports: &mut Vec<UptimeReport>,
) {
    let report = |device, state, start, end| UptimeReport {
        device,
        host,
        state,
        start,
        end,
    };

    let first = obs[0].0;
    let last = obs[obs.len() - 1].0;
    if first > from {
        reports.push(report(Device::Host, State::Down, from, first));
    }
    if last < to {
        reports.push(report(Device::Host, State::Down, last, to));
    }

    // Partition into up windows, each given by the indices of its first and last observation.
    let mut windows = vec![];
    let mut start = 0;
    for i in 1..obs.len() {
        if obs[i].0 - obs[i - 1].0 > cutoff {
            windows.push((start, i - 1));
            start = i;
        }
    }
    windows.push((start, obs.len() - 1));

    for (k, (ws, we)) in windows.iter().copied().enumerate() {
        let up_start = obs[ws].0;
        let up_end = obs[we].0;
        if verbose {
            slog::info!(
                log(),
                "{host}: up {} .. {}",
                format_ymdhm(up_start),
                format_ymdhm(up_end)
            );
        }
        reports.push(report(Device::Host, State::Up, up_start, up_end));
        if k + 1 < windows.len() {
            reports.push(report(Device::Host, State::Down, up_end, obs[we + 1].0));
        }

        // GPU windows within the up window, switching state at the observation where it changes.
        let mut gpu_start = up_start;
        let mut gpu_ok = obs[ws].1;
        for (t, ok) in &obs[ws + 1..=we] {
            if *ok != gpu_ok {
                reports.push(report(Device::Gpu, gpu_state(gpu_ok), gpu_start, *t));
                gpu_start = *t;
                gpu_ok = *ok;
            }
        }
        reports.push(report(Device::Gpu, gpu_state(gpu_ok), gpu_start, up_end));
    }
}

fn gpu_state(ok: bool) -> State {
    if ok {
        State::Up
    } else {
        State::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;

    fn obs(host: &str, t: i64, gpu_fail: u8) -> LogEntry {
        LogEntry {
            gpu_fail,
            ..LogEntry::empty(T0 + t, Ustr::from(host))
        }
    }

    fn run(
        entries: Vec<LogEntry>,
        hosts: &[&str],
        config: &[&str],
        opts: &UptimeOptions,
    ) -> Vec<UptimeReport> {
        let hosts = HostGlobber::from_patterns(
            &hosts.iter().map(|h| h.to_string()).collect::<Vec<String>>(),
            true,
        )
        .unwrap();
        let config = config.iter().map(|h| h.to_string()).collect::<Vec<String>>();
        compute_uptime(&[Arc::new(entries)], &hosts, &config, T0, T0 + 3600, opts, false).unwrap()
    }

    fn rows(reports: &[UptimeReport]) -> Vec<(Device, &str, State, i64, i64)> {
        reports
            .iter()
            .map(|r| (r.device, r.host.as_str(), r.state, r.start - T0, r.end - T0))
            .collect()
    }

    // The host rows of each host tile [from, to] exactly.
    fn check_timeline(reports: &[UptimeReport]) {
        let mut by_host: HashMap<Ustr, Vec<&UptimeReport>> = HashMap::new();
        for r in reports.iter().filter(|r| r.device == Device::Host) {
            by_host.entry(r.host).or_default().push(r);
        }
        for rs in by_host.values() {
            assert_eq!(rs[0].start, T0);
            assert_eq!(rs[rs.len() - 1].end, T0 + 3600);
            for w in rs.windows(2) {
                assert_eq!(w[0].end, w[1].start);
            }
        }
    }

    #[test]
    fn test_uptime_gap() {
        use Device::*;
        use State::*;
        let reports = run(
            vec![
                obs("a", 3060, 0),
                obs("a", 60, 0),
                obs("a", 120, 0),
                obs("a", 120, 0),
                obs("a", 3000, 0),
            ],
            &[],
            &[],
            &UptimeOptions::default(),
        );
        assert_eq!(
            rows(&reports),
            vec![
                (Host, "a", Down, 0, 60),
                (Host, "a", Up, 60, 120),
                (Gpu, "a", Up, 60, 120),
                (Host, "a", Down, 120, 3000),
                (Host, "a", Up, 3000, 3060),
                (Gpu, "a", Up, 3000, 3060),
                (Host, "a", Down, 3060, 3600),
            ]
        );
        check_timeline(&reports);
    }

    #[test]
    fn test_uptime_edges_and_gpu() {
        use Device::*;
        use State::*;
        let reports = run(
            vec![obs("a", 900, 0), obs("a", 960, 1), obs("a", 1020, 1)],
            &[],
            &[],
            &UptimeOptions::default(),
        );
        assert_eq!(
            rows(&reports),
            vec![
                (Host, "a", Down, 0, 900),
                (Host, "a", Up, 900, 1020),
                (Gpu, "a", Up, 900, 960),
                (Gpu, "a", Down, 960, 1020),
                (Host, "a", Down, 1020, 3600),
            ]
        );
        check_timeline(&reports);

        let only_up = UptimeOptions {
            only_up: true,
            ..Default::default()
        };
        let reports = run(vec![obs("a", 900, 0), obs("a", 960, 1)], &[], &[], &only_up);
        assert!(reports.iter().all(|r| r.state == Up));
        assert_eq!(reports.len(), 2);
    }

    #[test]
    fn test_uptime_config_hosts() {
        use Device::*;
        use State::*;
        let entries = vec![obs("a", 60, 0), obs("a", 3500, 0), obs("c", 60, 0)];
        let opts = UptimeOptions {
            interval: 30,
            ..Default::default()
        };
        let reports = run(entries.clone(), &[], &["a", "b"], &opts);
        assert_eq!(
            rows(&reports),
            vec![
                (Host, "a", Down, 0, 60),
                (Host, "a", Up, 60, 3500),
                (Gpu, "a", Up, 60, 3500),
                (Host, "a", Down, 3500, 3600),
                (Host, "b", Down, 0, 3600),
                (Host, "c", Down, 0, 60),
                (Host, "c", Up, 60, 60),
                (Host, "c", Down, 60, 3600),
                (Gpu, "c", Up, 60, 60),
            ]
        );
        check_timeline(&reports);

        let reports = run(entries, &["a"], &["a", "b"], &opts);
        assert!(reports.iter().all(|r| r.host.as_str() == "a"));
        assert_eq!(reports.len(), 4);
    }

    #[test]
    fn test_uptime_bad_interval() {
        let opts = UptimeOptions {
            interval: 0,
            ..Default::default()
        };
        let hosts = HostGlobber::new(true);
        assert!(compute_uptime(&[], &hosts, &[], T0, T0 + 3600, &opts, false).is_err());
    }
}
