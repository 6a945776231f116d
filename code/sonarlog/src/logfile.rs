/// A `LogFile` is the handle for one data file in a store.  There is exactly one handle per file
/// per open cluster; the handle owns the file's parsed content when that content is cached.
///
/// The content of a file is a `Payload`, a tagged union over the file families.  Callers ask for a
/// projection of the payload by element type (`Select`): a sample file holds process samples, CPU
/// samples and GPU samples, and a caller that only wants CPU samples gets just those.  The payload
/// is stored once and the projections share it.
///
/// How to parse a file and whether to cache the result is decided by a `FileReader`, one per file
/// family.  The readers also rectify the data where that requires outside knowledge (the sample
/// reader normalizes GPU memory fields against the node configuration).
use crate::cache;
use crate::repr::{
    CluzterAttributes, CluzterNodes, CluzterPartitions, CpuSamples, GpuSamples, LogEntry,
    SacctInfo, SysinfoCardData, SysinfoNodeData,
};
use crate::sacctcsv::parse_sacct_csv;
use crate::samplecsv::{parse_sample_csv, SampleData};
use crate::sysinfo::parse_sysinfo_oldjson;
use crate::v0json::{
    parse_cluzter_v0json, parse_sample_v0json, parse_slurm_v0json, parse_sysinfo_v0json,
};

use anyhow::{bail, Result};
use rustutils::{log, ClusterConfig, UstrAllocator};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard};

/// The representation of a file, determined by its name.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// `<host>.csv`
    SampleCsv,
    /// `0+sample-<host>.json`
    SampleV0Json,
    /// `sysinfo-<host>.json`
    SysinfoOldJson,
    /// `0+sysinfo-<host>.json`
    SysinfoV0Json,
    /// `slurm-sacct.csv`
    SlurmCsv,
    /// `0+job-slurm.json`
    SlurmV0Json,
    /// `0+cluzter-slurm.json`
    CluzterV0Json,
}

impl FileKind {
    pub fn is_new_format(&self) -> bool {
        matches!(
            self,
            FileKind::SampleV0Json
                | FileKind::SysinfoV0Json
                | FileKind::SlurmV0Json
                | FileKind::CluzterV0Json
        )
    }

    /// Classify a file by its base name, None if it is not a data file.  Reserved names are not
    /// data files.
    pub fn from_filename(name: &str) -> Option<FileKind> {
        if name.starts_with("0+") {
            if !name.ends_with(".json") {
                return None;
            }
            let rest = &name[2..];
            if rest.starts_with("sample-") {
                Some(FileKind::SampleV0Json)
            } else if rest.starts_with("sysinfo-") {
                Some(FileKind::SysinfoV0Json)
            } else if rest.starts_with("job-") {
                Some(FileKind::SlurmV0Json)
            } else if rest.starts_with("cluzter-") {
                Some(FileKind::CluzterV0Json)
            } else {
                None
            }
        } else if name == "slurm-sacct.csv" {
            Some(FileKind::SlurmCsv)
        } else if name == "bughunt.csv" || name == "cpuhog.csv" {
            None
        } else if name.ends_with(".csv") {
            Some(FileKind::SampleCsv)
        } else if name.starts_with("sysinfo-") && name.ends_with(".json") {
            Some(FileKind::SysinfoOldJson)
        } else {
            None
        }
    }
}

/// The parsed content of a file.  The vectors are shared with every reader of the file and must
/// not be mutated.

#[derive(Clone)]
pub enum Payload {
    Samples {
        samples: Arc<Vec<LogEntry>>,
        cpu: Arc<Vec<CpuSamples>>,
        gpu: Arc<Vec<GpuSamples>>,
    },
    Sysinfo {
        nodes: Arc<Vec<SysinfoNodeData>>,
        cards: Arc<Vec<SysinfoCardData>>,
    },
    Sacct(Arc<Vec<SacctInfo>>),
    Cluzter {
        attributes: Arc<Vec<CluzterAttributes>>,
        partitions: Arc<Vec<CluzterPartitions>>,
        nodes: Arc<Vec<CluzterNodes>>,
    },
}

impl Payload {
    /// The number of primary records: process samples, sysinfo nodes, sacct records or cluster
    /// snapshots.
    pub fn len(&self) -> usize {
        match self {
            Payload::Samples { samples, .. } => samples.len(),
            Payload::Sysinfo { nodes, .. } => nodes.len(),
            Payload::Sacct(rs) => rs.len(),
            Payload::Cluzter { attributes, .. } => attributes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated heap footprint in bytes.
    pub fn size(&self) -> usize {
        match self {
            Payload::Samples { samples, cpu, gpu } => {
                samples.len() * std::mem::size_of::<LogEntry>()
                    + cpu.iter().map(|c| c.size()).sum::<usize>()
                    + gpu.iter().map(|g| g.size()).sum::<usize>()
            }
            Payload::Sysinfo { nodes, cards } => {
                nodes.iter().map(|n| n.size()).sum::<usize>()
                    + cards.iter().map(|c| c.size()).sum::<usize>()
            }
            Payload::Sacct(rs) => rs.len() * std::mem::size_of::<SacctInfo>(),
            Payload::Cluzter {
                attributes,
                partitions,
                nodes,
            } => {
                attributes.iter().map(|a| a.size()).sum::<usize>()
                    + partitions.iter().map(|p| p.size()).sum::<usize>()
                    + nodes.iter().map(|n| n.size()).sum::<usize>()
            }
        }
    }
}

/// The result of parsing one file.  A hard error ends the parse early; the payload then holds the
/// records parsed before the error.

pub struct Parsed {
    pub payload: Payload,
    pub soft_errors: usize,
    pub hard_error: Option<anyhow::Error>,
}

/// Projection of a payload onto one element type.

pub trait Select: Sized + Send + Sync + 'static {
    fn select(p: &Payload) -> Option<Arc<Vec<Self>>>;
}

macro_rules! selector {
    ($t:ty, $pat:pat => $e:expr) => {
        impl Select for $t {
            fn select(p: &Payload) -> Option<Arc<Vec<Self>>> {
                match p {
                    $pat => Some($e.clone()),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}

selector!(LogEntry, Payload::Samples { samples, .. } => samples);
selector!(CpuSamples, Payload::Samples { cpu, .. } => cpu);
selector!(GpuSamples, Payload::Samples { gpu, .. } => gpu);
selector!(SysinfoNodeData, Payload::Sysinfo { nodes, .. } => nodes);
selector!(SysinfoCardData, Payload::Sysinfo { cards, .. } => cards);
selector!(SacctInfo, Payload::Sacct(rs) => rs);
selector!(CluzterAttributes, Payload::Cluzter { attributes, .. } => attributes);
selector!(CluzterPartitions, Payload::Cluzter { partitions, .. } => partitions);
selector!(CluzterNodes, Payload::Cluzter { nodes, .. } => nodes);

/// The capabilities of a file family: how to parse and rectify its files, whether to cache them,
/// and what a cached payload costs.

pub trait FileReader: Send + Sync {
    fn is_cacheable(&self) -> bool;

    fn read_and_rectify(
        &self,
        file: &LogFile,
        input: &mut dyn io::Read,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<Parsed>;

    fn cached_size(&self, payload: &Payload) -> usize {
        payload.size()
    }
}

fn wrong_kind(file: &LogFile) -> anyhow::Error {
    anyhow::anyhow!("File {} has the wrong kind for this reader", file.path().display())
}

/// Samples.  With a cluster configuration the GPU memory fields are normalized: for nodes that
/// report GPU memory as a percentage the KiB value is computed from it, otherwise the percentage
/// is computed from the KiB value.

pub struct SampleReader {
    pub cacheable: bool,
    pub config: Option<Arc<ClusterConfig>>,
}

impl FileReader for SampleReader {
    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn read_and_rectify(
        &self,
        file: &LogFile,
        input: &mut dyn io::Read,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<Parsed> {
        let mut data = match file.kind {
            FileKind::SampleCsv => parse_sample_csv(input, ustrs, verbose)?,
            FileKind::SampleV0Json => parse_sample_v0json(input, ustrs, verbose)?,
            _ => return Err(wrong_kind(file)),
        };
        if let Some(ref config) = self.config {
            rectify_gpu_memory(&mut data, config);
        }
        let SampleData {
            samples,
            cpu_samples,
            gpu_samples,
            soft_errors,
            hard_error,
        } = data;
        Ok(Parsed {
            payload: Payload::Samples {
                samples: Arc::new(samples),
                cpu: Arc::new(cpu_samples),
                gpu: Arc::new(gpu_samples),
            },
            soft_errors,
            hard_error,
        })
    }
}

fn rectify_gpu_memory(data: &mut SampleData, config: &ClusterConfig) {
    for s in data.samples.iter_mut() {
        let Some(sys) = config.lookup(s.hostname.as_str()) else {
            continue;
        };
        if sys.gpu_cards == 0 {
            continue;
        }
        let cardsize_kb = (sys.gpumem_gb * 1024 * 1024) as f64 / sys.gpu_cards as f64;
        if cardsize_kb == 0.0 {
            continue;
        }
        if sys.gpumem_pct {
            s.gpu_kb = (s.gpumem_pct as f64 / 100.0 * cardsize_kb) as u64;
        } else {
            s.gpumem_pct = (s.gpu_kb as f64 / cardsize_kb * 100.0) as f32;
        }
    }
}

pub struct SysinfoReader {
    pub cacheable: bool,
}

impl FileReader for SysinfoReader {
    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn read_and_rectify(
        &self,
        file: &LogFile,
        input: &mut dyn io::Read,
        _ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<Parsed> {
        let data = match file.kind {
            FileKind::SysinfoOldJson => parse_sysinfo_oldjson(input)?,
            FileKind::SysinfoV0Json => parse_sysinfo_v0json(input, verbose)?,
            _ => return Err(wrong_kind(file)),
        };
        Ok(Parsed {
            payload: Payload::Sysinfo {
                nodes: Arc::new(data.nodes),
                cards: Arc::new(data.cards),
            },
            soft_errors: data.soft_errors,
            hard_error: data.hard_error,
        })
    }
}

pub struct SacctReader {
    pub cacheable: bool,
}

impl FileReader for SacctReader {
    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn read_and_rectify(
        &self,
        file: &LogFile,
        input: &mut dyn io::Read,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<Parsed> {
        let (records, soft_errors, hard_error) = match file.kind {
            FileKind::SlurmCsv => {
                let (records, soft_errors) = parse_sacct_csv(input, ustrs, verbose)?;
                (records, soft_errors, None)
            }
            FileKind::SlurmV0Json => parse_slurm_v0json(input, ustrs, verbose)?,
            _ => return Err(wrong_kind(file)),
        };
        Ok(Parsed {
            payload: Payload::Sacct(Arc::new(records)),
            soft_errors,
            hard_error,
        })
    }
}

pub struct CluzterReader {
    pub cacheable: bool,
}

impl FileReader for CluzterReader {
    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn read_and_rectify(
        &self,
        file: &LogFile,
        input: &mut dyn io::Read,
        _ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<Parsed> {
        if file.kind != FileKind::CluzterV0Json {
            return Err(wrong_kind(file));
        }
        let data = parse_cluzter_v0json(input, verbose)?;
        Ok(Parsed {
            payload: Payload::Cluzter {
                attributes: Arc::new(data.attributes),
                partitions: Arc::new(data.partitions),
                nodes: Arc::new(data.nodes),
            },
            soft_errors: data.soft_errors,
            hard_error: data.hard_error,
        })
    }
}

/// Slot index meaning "not in the purgeable set".
pub(crate) const NOT_PURGEABLE: usize = usize::MAX;

pub struct LogFile {
    path: PathBuf,
    pub kind: FileKind,

    // The per-file lock.  Held while reading the file and while evicting its payload.
    content: Mutex<Content>,

    // Position in the purgeable set and LRU stamp.  Only written while holding the purge lock.
    pub(crate) purge_ix: AtomicUsize,
    pub(crate) lru: AtomicU64,
}

#[derive(Default)]
pub(crate) struct Content {
    pub(crate) payload: Option<Payload>,
    pub(crate) soft_errors: usize,
    pub(crate) size: usize,
    // Set when the owning cluster is closed; payloads are no longer installed.
    pub(crate) closed: bool,
}

impl fmt::Debug for LogFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogFile")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish()
    }
}

impl LogFile {
    pub fn new(path: PathBuf, kind: FileKind) -> LogFile {
        LogFile {
            path,
            kind,
            content: Mutex::new(Content::default()),
            purge_ix: AtomicUsize::new(NOT_PURGEABLE),
            lru: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn basename(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Content> {
        self.content.lock().unwrap()
    }

    pub fn is_cached(&self) -> bool {
        self.lock().payload.is_some()
    }

    /// Read the file (or take its content from the cache) and return the projection onto `T`
    /// along with the number of soft errors encountered when the file was parsed.

    pub fn read_sync<T: Select>(
        self: &Arc<Self>,
        reader: &dyn FileReader,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<(Arc<Vec<T>>, usize)> {
        let mut content = self.lock();
        if let Some(ref payload) = content.payload {
            let data = self.project::<T>(payload)?;
            let soft_errors = content.soft_errors;
            cache::note_hit(self, verbose);
            return Ok((data, soft_errors));
        }

        let mut input = io::BufReader::new(File::open(&self.path)?);
        let Parsed {
            payload,
            soft_errors,
            hard_error,
        } = reader.read_and_rectify(self, &mut input, ustrs, verbose)?;
        if let Some(e) = hard_error {
            // The partial content is not cached so that a later read sees the whole file.
            slog::warn!(
                log(),
                "{}: parse stopped after {} records: {}",
                self.path.display(),
                payload.len(),
                e
            );
            return Err(e.context(format!(
                "Parse stopped after {} records",
                payload.len()
            )));
        }
        let data = self.project::<T>(&payload)?;
        if soft_errors > 0 && verbose {
            slog::info!(log(), "{} soft errors in {}", soft_errors, self.path.display());
        }
        if reader.is_cacheable() && !content.closed && cache::is_enabled() {
            let size = reader.cached_size(&payload);
            content.payload = Some(payload);
            content.soft_errors = soft_errors;
            content.size = size;
            cache::install(self, size, verbose);
        }
        Ok((data, soft_errors))
    }

    fn project<T: Select>(&self, payload: &Payload) -> Result<Arc<Vec<T>>> {
        match T::select(payload) {
            Some(data) => Ok(data),
            None => bail!(
                "Content of {} does not hold {}",
                self.path.display(),
                std::any::type_name::<T>()
            ),
        }
    }

    /// Drop the cached content, if any, and mark the file closed so that later reads do not
    /// install content.
    pub(crate) fn close(self: &Arc<Self>, verbose: bool) {
        let mut content = self.lock();
        content.closed = true;
        cache::evict_locked(self, &mut content, "close", verbose);
    }
}

#[test]
fn test_file_kind() {
    assert_eq!(FileKind::from_filename("ml1.hpc.uio.no.csv"), Some(FileKind::SampleCsv));
    assert_eq!(FileKind::from_filename("cpuhog.csv"), None);
    assert_eq!(FileKind::from_filename("bughunt.csv"), None);
    assert_eq!(FileKind::from_filename("slurm-sacct.csv"), Some(FileKind::SlurmCsv));
    assert_eq!(
        FileKind::from_filename("sysinfo-ml1.hpc.uio.no.json"),
        Some(FileKind::SysinfoOldJson)
    );
    assert_eq!(FileKind::from_filename("0+sample-c1-5.json"), Some(FileKind::SampleV0Json));
    assert_eq!(FileKind::from_filename("0+sysinfo-c1-5.json"), Some(FileKind::SysinfoV0Json));
    assert_eq!(FileKind::from_filename("0+job-slurm.json"), Some(FileKind::SlurmV0Json));
    assert_eq!(FileKind::from_filename("0+cluzter-slurm.json"), Some(FileKind::CluzterV0Json));
    assert_eq!(FileKind::from_filename("0+sample-c1-5.csv"), None);
    assert_eq!(FileKind::from_filename("README"), None);
    assert!(FileKind::SampleV0Json.is_new_format());
    assert!(!FileKind::SlurmCsv.is_new_format());
}

#[test]
fn test_rectify_gpu_memory() {
    use rustutils::{GlobalUstrs, System};
    let mut data = parse_sample_csv(
        "\
v=0.11.0,time=2024-01-01T00:00:00Z,host=a,user=u,cmd=c,gpukib=2097152
v=0.11.0,time=2024-01-01T00:00:00Z,host=b,user=u,cmd=c,gpumem%=50
v=0.11.0,time=2024-01-01T00:00:00Z,host=z,user=u,cmd=c,gpukib=100,gpumem%=7
v=0.11.0,time=2024-01-01T00:00:00Z,host=c,user=u,cmd=c,gpukib=1048576
"
        .as_bytes(),
        &mut GlobalUstrs,
        false,
    )
    .unwrap();
    let sys = |name: &str, pct: bool| System {
        hostname: name.to_string(),
        gpu_cards: 4,
        gpumem_gb: 32,
        gpumem_pct: pct,
        ..Default::default()
    };
    // 1 GiB split over three cards does not divide evenly in KiB.
    let odd = System {
        hostname: "c".to_string(),
        gpu_cards: 3,
        gpumem_gb: 1,
        ..Default::default()
    };
    let config = ClusterConfig::from_systems("test", vec![sys("a", false), sys("b", true), odd]);
    rectify_gpu_memory(&mut data, &config);
    // 8 GiB cards.
    assert_eq!(data.samples[0].gpumem_pct, 25.0);
    assert_eq!(data.samples[1].gpu_kb, 4 * 1024 * 1024);
    assert_eq!((data.samples[2].gpu_kb, data.samples[2].gpumem_pct), (100, 7.0));
    // All of the node's GPU memory is three cards' worth.
    assert_eq!(data.samples[3].gpumem_pct, 300.0);
}

#[test]
fn test_read_sync_stops_on_syntax_error() {
    use rustutils::UstrCache;
    use std::io::Write;
    let _guard = crate::cache::test_lock();
    crate::cache::cache_init(1 << 30);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("0+sample-c1-5.json");
    let mut f = File::create(&path).unwrap();
    write!(
        f,
        r#"{{"meta":{{"version":"0.13.0"}},"data":{{"type":"sample","attributes":{{"time":"2025-03-01T00:00:10Z","node":"c1-5"}}}}}}
{{"meta": garbage"#
    )
    .unwrap();
    drop(f);
    let file = Arc::new(LogFile::new(path, FileKind::SampleV0Json));
    let reader = SampleReader {
        cacheable: true,
        config: None,
    };

    // The reader hands back the record parsed before the error along with the error.
    let mut input = io::BufReader::new(File::open(file.path()).unwrap());
    let parsed = reader
        .read_and_rectify(&file, &mut input, &mut UstrCache::new(), false)
        .unwrap();
    assert_eq!(parsed.payload.len(), 1);
    assert!(parsed.hard_error.is_some());

    // A read fails and leaves nothing in the cache.
    let err = file
        .read_sync::<LogEntry>(&reader, &mut UstrCache::new(), false)
        .unwrap_err();
    assert!(format!("{err:#}").contains("Parse stopped after 1 records"));
    assert!(!file.is_cached());
}
