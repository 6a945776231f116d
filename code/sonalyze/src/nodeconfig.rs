/// Node configuration, as a time series per host.
///
/// The sysinfo data give us, for every host and every time sysinfo ran, the node's CPUs and memory
/// and its GPU cards as separate records.  These are joined on (time, host) into `NodeConfig`
/// records that carry the resource numbers the query operators need and a human-readable
/// description.
///
/// `NodeConfigView` keeps a per-host cache of those records so that repeated lookups for the same
/// hosts (typically, the hosts of the jobs in a query) do not rescan the store.  The static cluster
/// configuration, if there is one, is the fallback for hosts the store knows nothing about.
use anyhow::Result;
use rustutils::{
    far_future, from_unix, log, now, parse_timestamp, to_unix, ClusterConfig, HostGlobber, System,
};
use sonarlog::{DataProvider, SysinfoCardData, SysinfoNodeData};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use ustr::Ustr;

#[derive(Clone, Debug, PartialEq)]
pub struct NodeConfig {
    pub timestamp: i64,
    pub hostname: Ustr,
    pub description: String,
    pub cpu_cores: usize,
    pub mem_gb: usize,
    pub gpu_cards: usize,
    pub gpumem_gb: usize,
    pub distances: String,
    pub topo_svg: String,
    pub topo_text: String,
}

impl NodeConfig {
    /// The resource view of the record.  Whether the node's jobs can be merged across nodes and
    /// whether it reports GPU memory as a percentage are not in sysinfo; they come from the static
    /// configuration when available.
    pub fn to_system(&self, static_sys: Option<&System>) -> System {
        System {
            timestamp: from_unix(self.timestamp).to_rfc3339(),
            hostname: self.hostname.to_string(),
            description: self.description.clone(),
            cross_node_jobs: static_sys.map_or(false, |s| s.cross_node_jobs),
            cpu_cores: self.cpu_cores,
            mem_gb: self.mem_gb,
            gpu_cards: self.gpu_cards,
            gpumem_gb: self.gpumem_gb,
            gpumem_pct: static_sys.map_or(false, |s| s.gpumem_pct),
        }
    }
}

/// Anything that can answer "what did this host look like at time t".  The operators that need
/// node capacities go through this.

pub trait HostConfigSource: Send + Sync {
    fn lookup_host_by_time(&self, host: &str, t: i64) -> Result<Option<Arc<System>>>;
}

impl HostConfigSource for ClusterConfig {
    fn lookup_host_by_time(&self, host: &str, _t: i64) -> Result<Option<Arc<System>>> {
        Ok(self.lookup(host))
    }
}

/// Join node and card records on (time, host) into config records.  Node records whose time does
/// not parse are dropped; cards without a node record are dropped.  The result is sorted by host
/// and then time.

pub fn join_sysinfo(
    nodes: &[Arc<Vec<SysinfoNodeData>>],
    cards: &[Arc<Vec<SysinfoCardData>>],
) -> Vec<NodeConfig> {
    let mut joined: HashMap<(&str, &str), (&SysinfoNodeData, Vec<&SysinfoCardData>)> =
        HashMap::new();
    for n in nodes.iter().flat_map(|b| b.iter()) {
        joined.insert((n.time.as_str(), n.node.as_str()), (n, vec![]));
    }
    for c in cards.iter().flat_map(|b| b.iter()) {
        if let Some((_, cs)) = joined.get_mut(&(c.time.as_str(), c.node.as_str())) {
            cs.push(c);
        }
    }

    let mut records = vec![];
    for (node, mut cards) in joined.into_values() {
        let Ok(t) = parse_timestamp(&node.time) else {
            continue;
        };
        cards.sort_by_key(|c| c.index);
        records.push(make_config(to_unix(t), node, &cards));
    }
    records.sort_by(|a, b| (a.hostname, a.timestamp).cmp(&(b.hostname, b.timestamp)));
    records
}

const KIB_PER_GIB: f64 = 1024.0 * 1024.0;

fn make_config(timestamp: i64, node: &SysinfoNodeData, cards: &[&SysinfoCardData]) -> NodeConfig {
    let ht = if node.threads_per_core > 1 {
        " (hyperthreaded)"
    } else {
        ""
    };
    let mem_gb = (node.memory as f64 / KIB_PER_GIB).round() as usize;
    let mut description = format!(
        "{}x{}{} {}, {} GiB",
        node.sockets, node.cores_per_socket, ht, node.cpu_model, mem_gb
    );
    let card_mem_kib = cards.iter().map(|c| c.memory).sum::<u64>();
    if let Some(c0) = cards.first() {
        description += &format!(
            ", {}x {} @ {}GiB",
            cards.len(),
            c0.model,
            c0.memory / (1024 * 1024)
        );
    }
    NodeConfig {
        timestamp,
        hostname: Ustr::from(node.node.as_str()),
        description,
        cpu_cores: (node.sockets * node.cores_per_socket * node.threads_per_core) as usize,
        mem_gb,
        gpu_cards: cards.len(),
        gpumem_gb: (card_mem_kib as f64 / KIB_PER_GIB).round() as usize,
        distances: format_distances(&node.distances),
        topo_svg: node.topo_svg.clone(),
        topo_text: node.topo_text.clone(),
    }
}

// [[10 20] [20 10]]
fn format_distances(d: &[Vec<u64>]) -> String {
    if d.is_empty() {
        return String::new();
    }
    let rows = d
        .iter()
        .map(|row| {
            format!(
                "[{}]",
                row.iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<String>>()
                    .join(" ")
            )
        })
        .collect::<Vec<String>>();
    format!("[{}]", rows.join(" "))
}

/// Keep only the newest record for each host.  The input order is otherwise preserved.

pub fn newest_only(records: Vec<NodeConfig>) -> Vec<NodeConfig> {
    let mut newest: HashMap<Ustr, i64> = HashMap::new();
    for r in &records {
        let t = newest.entry(r.hostname).or_insert(r.timestamp);
        *t = (*t).max(r.timestamp);
    }
    let mut result = records
        .into_iter()
        .filter(|r| newest.get(&r.hostname) == Some(&r.timestamp))
        .collect::<Vec<NodeConfig>>();
    result.dedup_by(|a, b| a.hostname == b.hostname && a.timestamp == b.timestamp);
    result
}

// How far back a backward scan reaches beyond the requested time: sysinfo normally runs at least
// daily, but hosts can be down for a while.
const LOOKBACK: i64 = 14 * 24 * 60 * 60;

// Minimum time between forward scans for new data.
const RESCAN_INTERVAL: i64 = 60 * 60;

const NEVER: i64 = i64::MAX;

// The records for one host are sorted ascending by timestamp without duplicates.  The store has
// been scanned for the host over [oldest_scanned, last_scan].
struct HostRecords {
    records: Vec<Arc<NodeConfig>>,
    oldest_scanned: i64,
    oldest_record: i64,
    youngest_record: i64,
    last_scan: i64,
}

impl HostRecords {
    fn new() -> HostRecords {
        HostRecords {
            records: vec![],
            oldest_scanned: NEVER,
            oldest_record: NEVER,
            youngest_record: i64::MIN,
            last_scan: i64::MIN,
        }
    }

    fn insert(&mut self, new_records: Vec<NodeConfig>) {
        for r in new_records {
            match self
                .records
                .binary_search_by_key(&r.timestamp, |x| x.timestamp)
            {
                Ok(_) => {}
                Err(ix) => self.records.insert(ix, Arc::new(r)),
            }
        }
        if let (Some(first), Some(last)) = (self.records.first(), self.records.last()) {
            self.oldest_record = first.timestamp;
            self.youngest_record = last.timestamp;
        }
    }

    fn at_or_before(&self, t: i64) -> Option<Arc<NodeConfig>> {
        let ix = self.records.partition_point(|r| r.timestamp <= t);
        if ix == 0 {
            None
        } else {
            Some(self.records[ix - 1].clone())
        }
    }
}

pub struct NodeConfigView {
    provider: Arc<dyn DataProvider>,
    static_config: Option<Arc<ClusterConfig>>,
    hosts: Mutex<HashMap<Ustr, Arc<Mutex<HostRecords>>>>,
    clock: fn() -> i64,
    verbose: bool,
}

fn unix_now() -> i64 {
    to_unix(now())
}

impl NodeConfigView {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        static_config: Option<Arc<ClusterConfig>>,
        verbose: bool,
    ) -> NodeConfigView {
        NodeConfigView::with_clock(provider, static_config, unix_now, verbose)
    }

    fn with_clock(
        provider: Arc<dyn DataProvider>,
        static_config: Option<Arc<ClusterConfig>>,
        clock: fn() -> i64,
        verbose: bool,
    ) -> NodeConfigView {
        NodeConfigView {
            provider,
            static_config,
            hosts: Mutex::new(HashMap::new()),
            clock,
            verbose,
        }
    }

    /// The cached records for `host` with timestamps in [from, to], scanning the store first if
    /// the cache does not cover the window.
    pub fn host_records(&self, host: &str, from: i64, to: i64) -> Result<Vec<Arc<NodeConfig>>> {
        let entry = self.refresh(host, from, to)?;
        let h = entry.lock().unwrap();
        Ok(h.records
            .iter()
            .filter(|r| from <= r.timestamp && r.timestamp <= to)
            .cloned()
            .collect())
    }

    /// The most recent record at or before `t`.  If the store has nothing, a record synthesized
    /// from the static configuration is returned, if there is one.
    pub fn lookup_config(&self, host: &str, t: i64) -> Result<Option<Arc<NodeConfig>>> {
        let entry = self.refresh(host, t, t)?;
        let found = entry.lock().unwrap().at_or_before(t);
        if found.is_some() {
            return Ok(found);
        }
        Ok(self.static_system(host).map(|sys| {
            Arc::new(NodeConfig {
                timestamp: t,
                hostname: Ustr::from(host),
                description: sys.description.clone(),
                cpu_cores: sys.cpu_cores,
                mem_gb: sys.mem_gb,
                gpu_cards: sys.gpu_cards,
                gpumem_gb: sys.gpumem_gb,
                distances: String::new(),
                topo_svg: String::new(),
                topo_text: String::new(),
            })
        }))
    }

    /// All records in the window for the hosts selected by `hosts` (all hosts if it is empty),
    /// read directly from the store.  With `newest`, only the most recent record per host.
    pub fn query(
        &self,
        from: i64,
        to: i64,
        hosts: &HostGlobber,
        newest: bool,
    ) -> Result<Vec<NodeConfig>> {
        let records = self
            .scan(from, to, hosts)?
            .into_iter()
            .filter(|r| from <= r.timestamp && r.timestamp <= to)
            .filter(|r| hosts.is_empty() || hosts.match_hostname(&r.hostname))
            .collect::<Vec<NodeConfig>>();
        Ok(if newest {
            newest_only(records)
        } else {
            records
        })
    }

    /// The timestamps of the oldest and youngest cached records for the host, if any.
    pub fn cached_range(&self, host: &str) -> Option<(i64, i64)> {
        let entry = self.hosts.lock().unwrap().get(&Ustr::from(host)).cloned()?;
        let h = entry.lock().unwrap();
        if h.records.is_empty() {
            None
        } else {
            Some((h.oldest_record, h.youngest_record))
        }
    }

    fn static_system(&self, host: &str) -> Option<Arc<System>> {
        self.static_config.as_ref().and_then(|c| c.lookup(host))
    }

    fn host_entry(&self, host: &str) -> Arc<Mutex<HostRecords>> {
        self.hosts
            .lock()
            .unwrap()
            .entry(Ustr::from(host))
            .or_insert_with(|| Arc::new(Mutex::new(HostRecords::new())))
            .clone()
    }

    // Bring the host's cache up to date for [from, to].  The store is read without holding the
    // host's lock, so two threads can scan the same range; insertion ignores records already
    // present.
    fn refresh(&self, host: &str, from: i64, to: i64) -> Result<Arc<Mutex<HostRecords>>> {
        let entry = self.host_entry(host);
        let now = (self.clock)();
        let (backward, forward) = {
            let h = entry.lock().unwrap();
            let backward = if from < h.oldest_scanned {
                let end = if h.oldest_scanned == NEVER {
                    now
                } else {
                    h.oldest_scanned
                };
                Some((from - LOOKBACK, end))
            } else {
                None
            };
            let forward = if h.oldest_scanned != NEVER
                && to > h.youngest_record
                && now - h.last_scan > RESCAN_INTERVAL
            {
                Some((h.youngest_record.max(h.oldest_scanned), now))
            } else {
                None
            };
            (backward, forward)
        };
        if backward.is_none() && forward.is_none() {
            return Ok(entry);
        }

        let mut globber = HostGlobber::new(false);
        globber.insert(host)?;
        let mut found = vec![];
        for (scan_from, scan_to) in backward.iter().chain(forward.iter()) {
            if self.verbose {
                slog::info!(log(), "Scanning sysinfo for {host} in {scan_from}..{scan_to}");
            }
            found.extend(
                self.scan(*scan_from, *scan_to, &globber)?
                    .into_iter()
                    .filter(|r| r.hostname.as_str() == host),
            );
        }

        let mut h = entry.lock().unwrap();
        h.insert(found);
        if let Some((scan_from, scan_to)) = backward {
            h.oldest_scanned = h.oldest_scanned.min(scan_from);
            if scan_to == now {
                h.last_scan = now;
            }
        }
        if forward.is_some() {
            h.last_scan = now;
        }
        drop(h);
        Ok(entry)
    }

    fn scan(&self, from: i64, to: i64, hosts: &HostGlobber) -> Result<Vec<NodeConfig>> {
        let (from, to) = (
            from_unix(from.max(0)),
            from_unix(to.min(to_unix(far_future()))),
        );
        let (nodes, node_errors) =
            self.provider
                .read_sysinfo_node_data(from, to, hosts, self.verbose)?;
        let (cards, card_errors) =
            self.provider
                .read_sysinfo_card_data(from, to, hosts, self.verbose)?;
        if self.verbose && node_errors + card_errors > 0 {
            slog::info!(log(), "{} soft errors in sysinfo", node_errors + card_errors);
        }
        Ok(join_sysinfo(&nodes, &cards))
    }
}

impl HostConfigSource for NodeConfigView {
    fn lookup_host_by_time(&self, host: &str, t: i64) -> Result<Option<Arc<System>>> {
        let entry = self.refresh(host, t, t)?;
        let found = entry.lock().unwrap().at_or_before(t);
        let static_sys = self.static_system(host);
        Ok(match found {
            Some(cfg) => Some(Arc::new(cfg.to_system(static_sys.as_deref()))),
            None => static_sys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarlog::{DataFamily, FileReader, LogFile, TransientCluster};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    // 2024-03-01T00:00:00Z and 2024-03-05T00:00:00Z
    const T1: i64 = 1709251200;
    const T2: i64 = 1709596800;
    const DAY: i64 = 86400;

    fn sysinfo(time: &str, node: &str, cards: &str) -> String {
        format!(
            r#"{{"meta":{{"producer":"sonar","version":"0.13.0"}},"data":{{"type":"sysinfo","attributes":{{"time":"{time}","cluster":"c","node":"{node}","sockets":2,"cores_per_socket":14,"threads_per_core":2,"cpu_model":"Intel Xeon Gold 5120","memory":134217728,"distances":[[10,20],[20,10]],"cards":[{cards}]}}}}}}"#
        )
    }

    const TWO_CARDS: &str = r#"{"index":1,"model":"NVIDIA RTX 2080 Ti","memory":11534336},{"index":0,"model":"NVIDIA RTX 2080 Ti","memory":11534336}"#;

    fn write_files(dir: &std::path::Path) -> Vec<PathBuf> {
        let a = dir.join("0+sysinfo-a.json");
        std::fs::write(
            &a,
            format!(
                "{}\n{}\n",
                sysinfo("2024-03-01T00:00:00Z", "a", ""),
                sysinfo("2024-03-05T00:00:00Z", "a", TWO_CARDS)
            ),
        )
        .unwrap();
        let b = dir.join("0+sysinfo-b.json");
        std::fs::write(&b, sysinfo("2024-03-02T00:00:00Z", "b", "") + "\n").unwrap();
        vec![a, b]
    }

    struct Counting {
        inner: TransientCluster,
        calls: AtomicUsize,
    }

    impl DataProvider for Counting {
        fn files(
            &self,
            family: DataFamily,
            from: rustutils::Timestamp,
            to: rustutils::Timestamp,
            hosts: &HostGlobber,
            verbose: bool,
        ) -> Result<Vec<Arc<LogFile>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.files(family, from, to, hosts, verbose)
        }

        fn reader(&self, family: DataFamily) -> Arc<dyn FileReader> {
            self.inner.reader(family)
        }
    }

    static CLOCK: AtomicI64 = AtomicI64::new(T2 + DAY);

    fn test_clock() -> i64 {
        CLOCK.load(Ordering::SeqCst)
    }

    #[test]
    fn test_join_and_describe() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path());
        let c = TransientCluster::new(DataFamily::Sysinfo, &files, None).unwrap();
        let view = NodeConfigView::new(Arc::new(c), None, false);
        let all = view.query(0, i64::MAX, &HostGlobber::new(false), false).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].hostname.as_str(), "a");
        assert_eq!(all[0].timestamp, T1);
        assert_eq!(
            all[0].description,
            "2x14 (hyperthreaded) Intel Xeon Gold 5120, 128 GiB"
        );
        assert_eq!(all[1].timestamp, T2);
        assert_eq!(
            all[1].description,
            "2x14 (hyperthreaded) Intel Xeon Gold 5120, 128 GiB, 2x NVIDIA RTX 2080 Ti @ 11GiB"
        );
        assert_eq!(all[1].cpu_cores, 56);
        assert_eq!(all[1].mem_gb, 128);
        assert_eq!(all[1].gpu_cards, 2);
        assert_eq!(all[1].gpumem_gb, 22);
        assert_eq!(all[1].distances, "[[10 20] [20 10]]");
        assert_eq!(all[2].hostname.as_str(), "b");

        let newest = view.query(0, i64::MAX, &HostGlobber::new(false), true).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].timestamp, T2);

        let mut only_b = HostGlobber::new(false);
        only_b.insert("b").unwrap();
        assert_eq!(view.query(0, i64::MAX, &only_b, false).unwrap().len(), 1);
    }

    #[test]
    fn test_host_cache_scans() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path());
        let provider = Arc::new(Counting {
            inner: TransientCluster::new(DataFamily::Sysinfo, &files, None).unwrap(),
            calls: AtomicUsize::new(0),
        });
        let cfg = ClusterConfig::from_json_str(
            r#"{"name":"c","nodes":[{"hostname":"a","cpu_cores":8,"mem_gb":32,"cross_node_jobs":true}]}"#,
        )
        .unwrap();
        let view = NodeConfigView::with_clock(
            provider.clone(),
            Some(Arc::new(cfg)),
            test_clock,
            false,
        );

        // First lookup scans (one read each for nodes and cards).
        let r = view.lookup_config("a", T2 + 3600).unwrap().unwrap();
        assert_eq!(r.timestamp, T2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // Covered by the lookback, no scan.
        let r = view.lookup_config("a", T1 + 60).unwrap().unwrap();
        assert_eq!(r.timestamp, T1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // Before the lookback: a backward scan, and nothing found, so the static config.
        let r = view.lookup_config("a", T1 - 30 * DAY).unwrap().unwrap();
        assert_eq!(r.cpu_cores, 8);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);

        // Past the youngest record but scanned recently: no scan.
        view.lookup_config("a", T2 + 10 * DAY).unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);

        // Some time later there may be new data.
        CLOCK.fetch_add(2 * 3600, Ordering::SeqCst);
        view.lookup_config("a", T2 + 10 * DAY).unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);

        assert_eq!(view.host_records("a", 0, i64::MAX).unwrap().len(), 2);
        assert_eq!(view.cached_range("a"), Some((T1, T2)));

        // The resource view takes cross-node information from the static config.
        let sys = view.lookup_host_by_time("a", T2).unwrap().unwrap();
        assert_eq!(sys.cpu_cores, 56);
        assert!(sys.cross_node_jobs);

        // Unknown everywhere.
        assert!(view.lookup_host_by_time("zz", T2).unwrap().is_none());
    }
}
