/// The query layer over sonar data.  Every query is given a data provider (a persistent cluster
/// directory tree or a transient list of files), an optional static cluster configuration, and a
/// `QueryFilter` selecting the time window, hosts, users, commands and jobs.  The filter is
/// compiled into a sample filter and host globber, the samples are read and reconstructed into
/// streams by `sonarlog`, and an operator aggregates the streams:
///
/// - jobs: per-job aggregates with computed fields, flags, filters and an optional sacct join
/// - load: per-host or per-group load in time buckets
/// - uptime: up/down timelines for hosts and their GPUs
/// - profile: the per-process matrix for a single job
///
/// Node configuration comes from the static cluster configuration, or dynamically from the sysinfo
/// data in the store through a `NodeConfigView`; both are `HostConfigSource`s.
mod jobs;
mod load;
mod nodeconfig;
mod profile;
mod query;
mod uptime;

pub use query::build_sample_filter;
pub use query::read_sample_streams_and_maybe_bounds;
pub use query::QueryError;
pub use query::QueryFilter;

pub use nodeconfig::join_sysinfo;
pub use nodeconfig::newest_only;
pub use nodeconfig::HostConfigSource;
pub use nodeconfig::NodeConfig;
pub use nodeconfig::NodeConfigView;

pub use jobs::aggregate_and_filter_jobs;
pub use jobs::join_sacct;
pub use jobs::query_jobs;
pub use jobs::Field;
pub use jobs::FieldRange;
pub use jobs::JobAggregate;
pub use jobs::JobSummary;
pub use jobs::JobsOptions;
pub use jobs::MergePolicy;
pub use jobs::SacctFilter;

// Job classification bits and job flags.

pub use jobs::DOES_NOT_USE_GPU;
pub use jobs::GPU_FAIL;
pub use jobs::IS_LIVE_AT_END;
pub use jobs::IS_LIVE_AT_START;
pub use jobs::IS_NOT_LIVE_AT_END;
pub use jobs::IS_NOT_LIVE_AT_START;
pub use jobs::IS_ZOMBIE;
pub use jobs::LIVE_AT_END;
pub use jobs::LIVE_AT_START;
pub use jobs::USES_GPU;

pub use load::aggregate_load;
pub use load::query_load;
pub use load::Bucket;
pub use load::LoadOptions;
pub use load::LoadRecord;
pub use load::LoadReport;

pub use uptime::compute_uptime;
pub use uptime::query_uptime;
pub use uptime::Device;
pub use uptime::State;
pub use uptime::UptimeOptions;
pub use uptime::UptimeReport;

pub use profile::build_profile;
pub use profile::query_profile;
pub use profile::Profile;
pub use profile::ProfileDatum;
pub use profile::ProfileOptions;
pub use profile::ProfileProcess;
pub use profile::ProfileRow;
