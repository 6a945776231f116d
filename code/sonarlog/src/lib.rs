/// Sonar data are structured logs: process samples, node sysinfo, batch-system accounting, and
/// cluster snapshots, written by external producers into a time-partitioned directory tree,
/// `<root>/<cluster>/YYYY/MM/DD/`, one or more files per host and day.  Two naming schemes coexist:
/// the old one (`<host>.csv`, `sysinfo-<host>.json`, `slurm-sacct.csv`) and the new one
/// (`0+sample-<host>.json`, `0+sysinfo-<host>.json`, `0+job-slurm.json`, `0+cluzter-slurm.json`).
///
/// This library has as its fundamental task to make those data available to queries quickly and
/// in a clean form.  That breaks down into a number of subtasks:
///
/// - Find the files within the tree for a date range and a set of host names.
///
/// - Parse the files in parallel into typed records, counting (and skipping) malformed records
///   rather than failing.  Old-style untagged sample records are supported under the feature
///   "untagged_sonar_data".
///
/// - Keep the parsed content in a process-wide cache bounded by a byte budget, shared read-only by
///   all queries.
///
/// - Filter and clean up the samples and reconstruct the *sample streams*: the samples for a single
///   process (or a rolled-up set of processes of the same job and command) on a single host, in
///   time order.
///
/// - Merge and fold sample streams, to create complete views of jobs or systems.
mod cache;
mod filter;
mod logfile;
mod numbers;
mod postprocess;
mod repr;
mod sacctcsv;
mod samplecsv;
mod store;
mod synthesize;
mod sysinfo;
mod v0json;
mod workers;

// Record types.

pub use repr::parse_version;
pub use repr::CluzterAttributes;
pub use repr::CluzterNodeStates;
pub use repr::CluzterNodes;
pub use repr::CluzterPartition;
pub use repr::CluzterPartitions;
pub use repr::CpuSamples;
pub use repr::EncodedCpuSamples;
pub use repr::EncodedGpuSamples;
pub use repr::GpuSamples;
pub use repr::LogEntry;
pub use repr::PerGpuSample;
pub use repr::SacctInfo;
pub use repr::SysinfoCardData;
pub use repr::SysinfoNodeData;
pub use repr::FLAG_HEARTBEAT;

// Decoders for the compact per-CPU and per-GPU encodings in CSV sample files.

pub use repr::decode_cpu_samples;
pub use repr::decode_gpu_samples;

// Parsers, one per file format.  Normally these are reached through the store.

pub use sacctcsv::parse_sacct_csv;
pub use samplecsv::parse_sample_csv;
pub use samplecsv::SampleData;
pub use sysinfo::parse_sysinfo_oldjson;
pub use sysinfo::SysinfoData;
pub use v0json::parse_cluzter_v0json;
pub use v0json::parse_sample_v0json;
pub use v0json::parse_slurm_v0json;
pub use v0json::parse_sysinfo_v0json;
pub use v0json::CluzterData;

// Files, file kinds, and the payloads parsed from them.

pub use logfile::FileKind;
pub use logfile::FileReader;
pub use logfile::LogFile;
pub use logfile::Parsed;
pub use logfile::Payload;
pub use logfile::Select;

// The payload cache.  Caching is off until `cache_init` is called with a nonnegative budget.

pub use cache::cache_budget;
pub use cache::cache_init;
pub use cache::cache_purge_all_sync;
pub use cache::is_enabled as cache_is_enabled;

// Read a set of files on the parse workers.

pub use workers::read_records_from_files;

// The store: data providers over a directory tree (cached) or a list of files (not cached).

pub use store::close_persistent_cluster;
pub use store::host_of_filename;
pub use store::open_persistent_cluster;
pub use store::sniff_type_from_filenames;
pub use store::DataFamily;
pub use store::DataProvider;
pub use store::PersistentCluster;
pub use store::StoreError;
pub use store::TransientCluster;

// Record filters.

pub use filter::RecordFilter;
pub use filter::SampleFilter;

// Clean up sample blobs and reconstruct the sample streams, computing time bounds per host.

pub use postprocess::postprocess;
pub use postprocess::stream_id;
pub use postprocess::InputStreamKey;
pub use postprocess::InputStreamSet;
pub use postprocess::Sample;
pub use postprocess::SampleStream;
pub use postprocess::SampleStreams;
pub use postprocess::Timebound;
pub use postprocess::Timebounds;
pub use postprocess::JOB_ID_TAG;

// Given a set of sample streams, merge by host and job, by job across hosts, or by host.

pub use synthesize::merge_by_host;
pub use synthesize::merge_by_host_and_job;
pub use synthesize::merge_by_job;

// Given a set of already-merged streams, one per host, merge by timeslot to create cross-host
// cross-job data.

pub use synthesize::merge_across_hosts_by_time;

// Bucket samples in a single stream by various time quantities and compute averages.

pub use synthesize::fold_samples_daily;
pub use synthesize::fold_samples_half_daily;
pub use synthesize::fold_samples_half_hourly;
pub use synthesize::fold_samples_hourly;
pub use synthesize::fold_samples_weekly;
