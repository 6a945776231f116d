/// Data stores.  A store provides the files for a family of data within a time window and for a
/// set of hosts, and knows how to read them.
///
/// A persistent cluster is a directory tree `<root>/YYYY/MM/DD/<file>` that is maintained by
/// external producers and only ever grows.  Each day directory holds files in the old naming scheme
/// (`<host>.csv`, `sysinfo-<host>.json`, `slurm-sacct.csv`) or the new one
/// (`0+<type>-<originator>.json`), or both.  Directory listings and file handles are retained for
/// the life of the cluster so that cached content is found again by later queries; only the
/// listing for today (and later) is redone every time, as those directories may still be growing.
///
/// A transient cluster is an explicit list of files, read without caching.
use crate::logfile::{
    CluzterReader, FileKind, FileReader, LogFile, SacctReader, SampleReader, SysinfoReader,
};
use crate::repr::{
    CluzterAttributes, CluzterNodes, CluzterPartitions, CpuSamples, GpuSamples, LogEntry,
    SacctInfo, SysinfoCardData, SysinfoNodeData,
};
use crate::workers::read_records_from_files;

use anyhow::Result;
use chrono::Datelike;
use once_cell::sync::Lazy;
use rustutils::{
    day_path, log, next_day, now, roundup_day, this_day, ClusterConfig, HostGlobber, Timestamp,
};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("The cluster has been closed")]
    ClusterClosed,

    #[error("Mixed old and new file representations")]
    MixedFileRepresentations,

    #[error("Failed to process one or more files:\n{0}")]
    FilesFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataFamily {
    Samples,
    Sysinfo,
    Sacct,
    Cluzter,
}

impl DataFamily {
    pub fn of(kind: FileKind) -> DataFamily {
        match kind {
            FileKind::SampleCsv | FileKind::SampleV0Json => DataFamily::Samples,
            FileKind::SysinfoOldJson | FileKind::SysinfoV0Json => DataFamily::Sysinfo,
            FileKind::SlurmCsv | FileKind::SlurmV0Json => DataFamily::Sacct,
            FileKind::CluzterV0Json => DataFamily::Cluzter,
        }
    }

    // (old scheme, new scheme); cluzter data only exist in the new scheme.
    fn kinds(&self) -> (FileKind, FileKind) {
        match self {
            DataFamily::Samples => (FileKind::SampleCsv, FileKind::SampleV0Json),
            DataFamily::Sysinfo => (FileKind::SysinfoOldJson, FileKind::SysinfoV0Json),
            DataFamily::Sacct => (FileKind::SlurmCsv, FileKind::SlurmV0Json),
            DataFamily::Cluzter => (FileKind::CluzterV0Json, FileKind::CluzterV0Json),
        }
    }
}

/// The host name carried in a file name, if any.  "ml1.csv" -> "ml1", "sysinfo-ml1.json" -> "ml1",
/// "0+sample-ml1.json" -> "ml1".  Sacct and cluzter files are per cluster and carry no host.

pub fn host_of_filename(name: &str, kind: FileKind) -> Option<&str> {
    match kind {
        FileKind::SampleCsv => name.strip_suffix(".csv"),
        FileKind::SysinfoOldJson => name.strip_prefix("sysinfo-")?.strip_suffix(".json"),
        FileKind::SampleV0Json => name.strip_prefix("0+sample-")?.strip_suffix(".json"),
        FileKind::SysinfoV0Json => name.strip_prefix("0+sysinfo-")?.strip_suffix(".json"),
        FileKind::SlurmCsv | FileKind::SlurmV0Json | FileKind::CluzterV0Json => None,
    }
}

/// Given a set of file names that should all be of the same family, return the kind to use for
/// them: `old` if they all use the old naming scheme (or the set is empty), `new` if they all use
/// the new one, and an error if they are mixed.

pub fn sniff_type_from_filenames<S: AsRef<str>>(
    names: &[S],
    old: FileKind,
    new: FileKind,
) -> Result<FileKind> {
    let mut saw_old = false;
    let mut saw_new = false;
    for name in names {
        let base = Path::new(name.as_ref())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        if base.starts_with("0+") {
            saw_new = true;
        } else {
            saw_old = true;
        }
    }
    match (saw_old, saw_new) {
        (true, true) => Err(StoreError::MixedFileRepresentations.into()),
        (false, true) => Ok(new),
        _ => Ok(old),
    }
}

/// The interface to a store.  `files` and `reader` are the primitives; the typed readers return
/// one vector per file, in no particular order.  The vectors are shared with the cache and must not
/// be mutated.

pub trait DataProvider: Send + Sync {
    fn files(
        &self,
        family: DataFamily,
        from: Timestamp,
        to: Timestamp,
        hosts: &HostGlobber,
        verbose: bool,
    ) -> Result<Vec<Arc<LogFile>>>;

    fn reader(&self, family: DataFamily) -> Arc<dyn FileReader>;

    fn read_samples(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: &HostGlobber,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<LogEntry>>>, usize)> {
        let files = self.files(DataFamily::Samples, from, to, hosts, verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Samples), verbose)
    }

    fn read_cpu_samples(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: &HostGlobber,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<CpuSamples>>>, usize)> {
        let files = self.files(DataFamily::Samples, from, to, hosts, verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Samples), verbose)
    }

    fn read_gpu_samples(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: &HostGlobber,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<GpuSamples>>>, usize)> {
        let files = self.files(DataFamily::Samples, from, to, hosts, verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Samples), verbose)
    }

    fn read_sysinfo_node_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: &HostGlobber,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<SysinfoNodeData>>>, usize)> {
        let files = self.files(DataFamily::Sysinfo, from, to, hosts, verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Sysinfo), verbose)
    }

    fn read_sysinfo_card_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: &HostGlobber,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<SysinfoCardData>>>, usize)> {
        let files = self.files(DataFamily::Sysinfo, from, to, hosts, verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Sysinfo), verbose)
    }

    fn read_sacct_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<SacctInfo>>>, usize)> {
        let files = self.files(DataFamily::Sacct, from, to, &HostGlobber::new(false), verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Sacct), verbose)
    }

    fn read_cluzter_attributes(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<CluzterAttributes>>>, usize)> {
        let files = self.files(DataFamily::Cluzter, from, to, &HostGlobber::new(false), verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Cluzter), verbose)
    }

    fn read_cluzter_partitions(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<CluzterPartitions>>>, usize)> {
        let files = self.files(DataFamily::Cluzter, from, to, &HostGlobber::new(false), verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Cluzter), verbose)
    }

    fn read_cluzter_nodes(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Arc<Vec<CluzterNodes>>>, usize)> {
        let files = self.files(DataFamily::Cluzter, from, to, &HostGlobber::new(false), verbose)?;
        read_records_from_files(&files, self.reader(DataFamily::Cluzter), verbose)
    }
}

fn make_reader(
    family: DataFamily,
    cacheable: bool,
    config: &Option<Arc<ClusterConfig>>,
) -> Arc<dyn FileReader> {
    match family {
        DataFamily::Samples => Arc::new(SampleReader {
            cacheable,
            config: config.clone(),
        }),
        DataFamily::Sysinfo => Arc::new(SysinfoReader { cacheable }),
        DataFamily::Sacct => Arc::new(SacctReader { cacheable }),
        DataFamily::Cluzter => Arc::new(CluzterReader { cacheable }),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//
// Persistent clusters

pub struct PersistentCluster {
    root: PathBuf,
    config: Option<Arc<ClusterConfig>>,
    closed: AtomicBool,
    state: Mutex<ClusterState>,
}

#[derive(Default)]
struct ClusterState {
    // Every handle ever created, by full path.
    handles: HashMap<PathBuf, Arc<LogFile>>,

    // Retained listings for past days, keyed by the day's unix time.  All families are listed at
    // once since they live in the same directory.
    days: BTreeMap<i64, Vec<Arc<LogFile>>>,
}

impl PersistentCluster {
    fn new(root: PathBuf, config: Option<Arc<ClusterConfig>>) -> PersistentCluster {
        PersistentCluster {
            root,
            config,
            closed: AtomicBool::new(false),
            state: Mutex::new(ClusterState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> Option<Arc<ClusterConfig>> {
        self.config.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the cluster: drop all cached content.  Subsequent operations fail with
    /// `StoreError::ClusterClosed`.
    pub fn close(&self, verbose: bool) {
        self.closed.store(true, Ordering::SeqCst);
        let handles = {
            let mut state = self.state.lock().unwrap();
            state.days.clear();
            std::mem::take(&mut state.handles)
        };
        for (_, h) in handles {
            h.close(verbose);
        }
    }

    // The listing of one day directory, from the retained set or from disk.
    fn list_day(
        &self,
        state: &mut ClusterState,
        day: Timestamp,
        retain: bool,
    ) -> Result<Vec<Arc<LogFile>>> {
        if let Some(files) = state.days.get(&day.timestamp()) {
            return Ok(files.clone());
        }
        let dir = self.root.join(day_path(day.year(), day.month(), day.day()));
        let mut files = vec![];
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                let mut names = vec![];
                for entry in entries {
                    let entry = entry?;
                    if let Some(name) = entry.file_name().to_str() {
                        if let Some(kind) = FileKind::from_filename(name) {
                            names.push((name.to_string(), kind));
                        }
                    }
                }
                names.sort_by(|a, b| a.0.cmp(&b.0));
                for (name, kind) in names {
                    let path = dir.join(&name);
                    let handle = state
                        .handles
                        .entry(path.clone())
                        .or_insert_with(|| Arc::new(LogFile::new(path, kind)))
                        .clone();
                    files.push(handle);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if retain {
            state.days.insert(day.timestamp(), files.clone());
        }
        Ok(files)
    }
}

impl DataProvider for PersistentCluster {
    /// Both ends of the window are widened to day boundaries.  Nothing later than tomorrow is
    /// examined.
    fn files(
        &self,
        family: DataFamily,
        from: Timestamp,
        to: Timestamp,
        hosts: &HostGlobber,
        verbose: bool,
    ) -> Result<Vec<Arc<LogFile>>> {
        if self.is_closed() {
            return Err(StoreError::ClusterClosed.into());
        }
        let today = this_day(now());
        let lim = std::cmp::min(roundup_day(to), next_day(today));
        let (old, new) = family.kinds();
        let mut result = vec![];
        let mut state = self.state.lock().unwrap();
        let mut day = this_day(from);
        while day < lim {
            for f in self.list_day(&mut state, day, day < today)? {
                if f.kind != old && f.kind != new {
                    continue;
                }
                if !hosts.is_empty() {
                    if let Some(host) = host_of_filename(f.basename(), f.kind) {
                        if !hosts.match_hostname(host) {
                            continue;
                        }
                    }
                }
                result.push(f);
            }
            day = next_day(day);
        }
        if verbose {
            slog::info!(log(), "{} files in {} for {:?}", result.len(), self.root.display(), family);
        }
        Ok(result)
    }

    fn reader(&self, family: DataFamily) -> Arc<dyn FileReader> {
        make_reader(family, true, &self.config)
    }
}

/// The process-wide table of open persistent clusters, keyed by canonical root path.  Opening the
/// same directory twice yields the same cluster, and hence the same cached content.

static CLUSTER_STORE: Lazy<Mutex<HashMap<PathBuf, Arc<PersistentCluster>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn open_persistent_cluster(
    root: &Path,
    config: Option<Arc<ClusterConfig>>,
) -> Result<Arc<PersistentCluster>> {
    let root = std::fs::canonicalize(root)?;
    let mut store = CLUSTER_STORE.lock().unwrap();
    Ok(store
        .entry(root.clone())
        .or_insert_with(|| Arc::new(PersistentCluster::new(root, config)))
        .clone())
}

/// Close the cluster rooted at `root` if it is open; it is removed from the table and a later open
/// creates a fresh cluster.

pub fn close_persistent_cluster(root: &Path, verbose: bool) -> Result<()> {
    let root = std::fs::canonicalize(root)?;
    let cluster = CLUSTER_STORE.lock().unwrap().remove(&root);
    if let Some(c) = cluster {
        c.close(verbose);
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//
// Transient clusters

pub struct TransientCluster {
    family: DataFamily,
    files: Vec<Arc<LogFile>>,
    config: Option<Arc<ClusterConfig>>,
}

impl TransientCluster {
    /// All the files must be of the given family and must use the same naming scheme.  The time
    /// window and host filter are not applied to the file set; records are filtered later.
    pub fn new(
        family: DataFamily,
        paths: &[PathBuf],
        config: Option<Arc<ClusterConfig>>,
    ) -> Result<TransientCluster> {
        let names = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<String>>();
        let (old, new) = family.kinds();
        let kind = sniff_type_from_filenames(&names, old, new)?;
        Ok(TransientCluster {
            family,
            files: paths
                .iter()
                .map(|p| Arc::new(LogFile::new(p.clone(), kind)))
                .collect(),
            config,
        })
    }
}

impl DataProvider for TransientCluster {
    fn files(
        &self,
        family: DataFamily,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: &HostGlobber,
        _verbose: bool,
    ) -> Result<Vec<Arc<LogFile>>> {
        if family == self.family {
            Ok(self.files.clone())
        } else {
            Ok(vec![])
        }
    }

    fn reader(&self, family: DataFamily) -> Arc<dyn FileReader> {
        make_reader(family, false, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use rustutils::timestamp_from_ymd;
    use std::io::Write;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn sample(t: &str, host: &str) -> String {
        format!("v=0.11.0,time={t},host={host},user=u,cmd=c,pid=10\n")
    }

    fn make_tree(root: &Path) {
        write(root, "2024/01/01/a1.csv", &sample("2024-01-01T10:00:00Z", "a1"));
        write(root, "2024/01/01/b1.csv", &sample("2024-01-01T10:00:00Z", "b1"));
        write(root, "2024/01/01/cpuhog.csv", "junk\n");
        write(root, "2024/01/01/bughunt.csv", "junk\n");
        write(
            root,
            "2024/01/01/slurm-sacct.csv",
            "v=0.1.0,JobIDRaw=17,End=2024-01-01T10:00:00Z,User=u\n",
        );
        write(root, "2024/01/02/a1.csv", &sample("2024-01-02T10:00:00Z", "a1"));
        write(
            root,
            "2024/01/03/0+sample-a1.json",
            r#"{"meta":{"producer":"sonar","version":"0.13.0"},"data":{"type":"sample","attributes":{"time":"2024-01-03T10:00:00Z","cluster":"x","node":"a1","jobs":[]}}}"#,
        );
        write(root, "2024/01/03/0+sysinfo-a1.json", "");
    }

    #[test]
    fn test_persistent_files() {
        let _guard = cache::test_lock();
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let c = open_persistent_cluster(dir.path(), None).unwrap();
        let all = HostGlobber::new(true);
        let from = timestamp_from_ymd(2024, 1, 1);
        let to = timestamp_from_ymd(2024, 1, 3) + chrono::Duration::hours(1);

        let fs = c.files(DataFamily::Samples, from, to, &all, false).unwrap();
        let names = fs.iter().map(|f| f.basename().to_string()).collect::<Vec<String>>();
        assert_eq!(names, vec!["a1.csv", "b1.csv", "a1.csv", "0+sample-a1.json"]);

        let mut a1 = HostGlobber::new(true);
        a1.insert("a1").unwrap();
        let fs = c.files(DataFamily::Samples, from, to, &a1, false).unwrap();
        assert_eq!(fs.len(), 3);

        // Half-open day range: to at midnight excludes that day.
        let fs = c
            .files(DataFamily::Samples, from, timestamp_from_ymd(2024, 1, 2), &all, false)
            .unwrap();
        assert_eq!(fs.len(), 2);

        let fs = c.files(DataFamily::Sacct, from, to, &a1, false).unwrap();
        assert_eq!(fs.len(), 1);
        let fs = c.files(DataFamily::Sysinfo, from, to, &all, false).unwrap();
        assert_eq!(fs.len(), 1);

        // Handles are shared between listings and between opens.
        let c2 = open_persistent_cluster(dir.path(), None).unwrap();
        assert!(Arc::ptr_eq(&c, &c2));
        let f1 = c.files(DataFamily::Samples, from, to, &a1, false).unwrap();
        let f2 = c2.files(DataFamily::Samples, from, to, &a1, false).unwrap();
        assert!(Arc::ptr_eq(&f1[0], &f2[0]));

        let (samples, soft) = c.read_samples(from, to, &all, false).unwrap();
        assert_eq!(soft, 0);
        // Three CSV files with one record each and one JSON file with a heartbeat.
        assert_eq!(samples.iter().map(|s| s.len()).sum::<usize>(), 4);
        let (sacct, _) = c.read_sacct_data(from, to, false).unwrap();
        assert_eq!(sacct.len(), 1);
        assert_eq!(sacct[0][0].job_id, 17);

        close_persistent_cluster(dir.path(), false).unwrap();
        assert!(c.is_closed());
        let err = c.files(DataFamily::Samples, from, to, &all, false).unwrap_err();
        assert_eq!(err.downcast_ref::<StoreError>(), Some(&StoreError::ClusterClosed));
        assert!(!f1[0].is_cached());
    }

    #[test]
    fn test_sniff() {
        let k = sniff_type_from_filenames(
            &["a/b.csv", "c.csv"],
            FileKind::SampleCsv,
            FileKind::SampleV0Json,
        )
        .unwrap();
        assert_eq!(k, FileKind::SampleCsv);
        let k = sniff_type_from_filenames(
            &["a/0+sample-b.json"],
            FileKind::SampleCsv,
            FileKind::SampleV0Json,
        )
        .unwrap();
        assert_eq!(k, FileKind::SampleV0Json);
        let e = sniff_type_from_filenames(
            &["a/0+sample-b.json", "x.csv"],
            FileKind::SampleCsv,
            FileKind::SampleV0Json,
        )
        .unwrap_err();
        assert_eq!(e.downcast_ref::<StoreError>(), Some(&StoreError::MixedFileRepresentations));
    }

    #[test]
    fn test_host_of_filename() {
        assert_eq!(host_of_filename("ml1.hpc.uio.no.csv", FileKind::SampleCsv), Some("ml1.hpc.uio.no"));
        assert_eq!(host_of_filename("sysinfo-ml1.json", FileKind::SysinfoOldJson), Some("ml1"));
        assert_eq!(host_of_filename("0+sample-c1-5.json", FileKind::SampleV0Json), Some("c1-5"));
        assert_eq!(host_of_filename("0+sysinfo-c1-5.json", FileKind::SysinfoV0Json), Some("c1-5"));
        assert_eq!(host_of_filename("slurm-sacct.csv", FileKind::SlurmCsv), None);
    }

    #[test]
    fn test_transient() {
        let _guard = cache::test_lock();
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let paths = vec![
            dir.path().join("2024/01/01/a1.csv"),
            dir.path().join("2024/01/02/a1.csv"),
        ];
        let c = TransientCluster::new(DataFamily::Samples, &paths, None).unwrap();
        let all = HostGlobber::new(true);
        let (samples, _) = c
            .read_samples(rustutils::epoch(), rustutils::far_future(), &all, false)
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert!(!c.files[0].is_cached());
        let (sacct, _) = c
            .read_sacct_data(rustutils::epoch(), rustutils::far_future(), false)
            .unwrap();
        assert!(sacct.is_empty());

        let mixed = vec![paths[0].clone(), dir.path().join("2024/01/03/0+sample-a1.json")];
        assert!(TransientCluster::new(DataFamily::Samples, &mixed, None).is_err());
    }
}
