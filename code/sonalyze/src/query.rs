/// The front half of every query: turn the user's selection into a host globber and a sample
/// filter, then read and postprocess the samples.
///
/// Defaulting rules for the user selection:
///
/// - a user name of "-" means all users
/// - with no user names and without `all_users`, the user running the query is selected, as found
///   in $LOGNAME or else $USER; if neither is set the query fails
/// - `skip_system_users` excludes root and zabbix
/// - `exclude_system_commands` excludes the shells and daemons that are always running
/// - `exclude_heartbeat` excludes the heartbeat records
/// - the cluster configuration's `exclude-user` names are always excluded
/// - `exclude_system_jobs` drops processes with pids below 1000
/// - `from` defaults to the epoch and `to` to the far future
use anyhow::Result;
use rustutils::{
    epoch, far_future, log, to_unix, ClusterConfig, HostGlobber, Timestamp,
};
use sonarlog::{postprocess, DataProvider, InputStreamSet, SampleFilter, Timebounds};
use std::collections::HashSet;
use thiserror::Error;
use ustr::Ustr;

#[derive(Error, Debug, PartialEq)]
pub enum QueryError {
    #[error("configuration file required: {0}")]
    ConfigRequired(String),

    #[error("No user name: LOGNAME and USER are both unset")]
    NoUser,
}

const SYSTEM_USERS: [&str; 2] = ["root", "zabbix"];
const SYSTEM_COMMANDS: [&str; 5] = ["bash", "zsh", "sshd", "tmux", "systemd"];
const HEARTBEAT_COMMAND: &str = "_heartbeat_";
const MIN_USER_PID: u32 = 1000;

#[derive(Clone, Debug, Default)]
pub struct QueryFilter {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub host: Vec<String>,
    pub user: Vec<String>,
    pub exclude_user: Vec<String>,
    pub command: Vec<String>,
    pub exclude_command: Vec<String>,
    pub job: Vec<u32>,
    pub exclude_job: Vec<u32>,
    pub exclude_system_jobs: bool,
    pub all_users: bool,
    pub skip_system_users: bool,
    pub exclude_system_commands: bool,
    pub exclude_heartbeat: bool,
}

impl QueryFilter {
    pub fn from_time(&self) -> Timestamp {
        self.from.unwrap_or_else(epoch)
    }

    pub fn to_time(&self) -> Timestamp {
        self.to.unwrap_or_else(far_future)
    }
}

pub fn build_sample_filter(
    cfg: Option<&ClusterConfig>,
    filter: &QueryFilter,
    verbose: bool,
) -> Result<(HostGlobber, SampleFilter)> {
    build_filter(cfg, filter, login_name, verbose)
}

fn login_name() -> Option<String> {
    std::env::var("LOGNAME")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("USER").ok().filter(|s| !s.is_empty()))
}

fn build_filter(
    cfg: Option<&ClusterConfig>,
    filter: &QueryFilter,
    login: fn() -> Option<String>,
    verbose: bool,
) -> Result<(HostGlobber, SampleFilter)> {
    let hosts = HostGlobber::from_patterns(&filter.host, true)?;

    let mut include_users = HashSet::new();
    let all_users = filter.all_users || filter.user.iter().any(|u| u == "-");
    if !all_users {
        if filter.user.is_empty() {
            match login() {
                Some(name) => {
                    include_users.insert(Ustr::from(name.as_str()));
                }
                None => return Err(QueryError::NoUser.into()),
            }
        } else {
            for u in &filter.user {
                include_users.insert(Ustr::from(u.as_str()));
            }
        }
    }

    let mut exclude_users = filter
        .exclude_user
        .iter()
        .map(|u| Ustr::from(u.as_str()))
        .collect::<HashSet<Ustr>>();
    if filter.skip_system_users {
        for u in SYSTEM_USERS {
            exclude_users.insert(Ustr::from(u));
        }
    }
    if let Some(cfg) = cfg {
        for u in &cfg.exclude_user {
            exclude_users.insert(Ustr::from(u.as_str()));
        }
    }

    let mut exclude_commands = filter
        .exclude_command
        .iter()
        .map(|c| Ustr::from(c.as_str()))
        .collect::<HashSet<Ustr>>();
    if filter.exclude_system_commands {
        for c in SYSTEM_COMMANDS {
            exclude_commands.insert(Ustr::from(c));
        }
    }
    if filter.exclude_heartbeat {
        exclude_commands.insert(Ustr::from(HEARTBEAT_COMMAND));
    }

    let sample_filter = SampleFilter {
        include_users,
        include_hosts: if hosts.is_empty() {
            None
        } else {
            Some(hosts.clone())
        },
        include_jobs: filter.job.iter().copied().collect(),
        include_commands: filter.command.iter().map(|c| Ustr::from(c.as_str())).collect(),
        exclude_users,
        exclude_jobs: filter.exclude_job.iter().copied().collect(),
        exclude_commands,
        min_pid: if filter.exclude_system_jobs {
            MIN_USER_PID
        } else {
            0
        },
        from: to_unix(filter.from_time()),
        to: to_unix(filter.to_time()),
    };

    if verbose {
        slog::info!(log(), "Hosts: {:?}", hosts.patterns());
        slog::info!(log(), "Sample filter: {:?}", sample_filter);
    }

    Ok((hosts, sample_filter))
}

/// Read the samples for the window and hosts and reconstruct the streams.  Returns the streams,
/// the per-host bounds (empty unless `want_bounds`), and the number of soft errors.

pub fn read_sample_streams_and_maybe_bounds(
    provider: &dyn DataProvider,
    from: Timestamp,
    to: Timestamp,
    hosts: &HostGlobber,
    filter: Option<&SampleFilter>,
    want_bounds: bool,
    verbose: bool,
) -> Result<(InputStreamSet, Timebounds, usize)> {
    let (blobs, soft_errors) = provider.read_samples(from, to, hosts, verbose)?;
    if verbose {
        slog::info!(
            log(),
            "{} sample blobs, {} soft errors",
            blobs.len(),
            soft_errors
        );
    }
    let (streams, bounds) = postprocess(&blobs, filter, want_bounds);
    if verbose {
        slog::info!(log(), "{} streams", streams.len());
    }
    Ok((streams, bounds, soft_errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustutils::timestamp_from_ymd;

    fn alice() -> Option<String> {
        Some("alice".to_string())
    }

    fn nobody() -> Option<String> {
        None
    }

    #[test]
    fn test_login_user_default() {
        let (hosts, f) = build_filter(None, &QueryFilter::default(), alice, false).unwrap();
        assert!(hosts.is_empty());
        assert!(f.include_hosts.is_none());
        assert_eq!(f.include_users.len(), 1);
        assert!(f.include_users.contains(&Ustr::from("alice")));
        assert_eq!(f.from, 0);
        assert_eq!(f.to, to_unix(far_future()));
        assert_eq!(f.min_pid, 0);
    }

    #[test]
    fn test_no_login_user() {
        let err = build_filter(None, &QueryFilter::default(), nobody, false).unwrap_err();
        assert_eq!(err.downcast_ref::<QueryError>(), Some(&QueryError::NoUser));

        // All users does not need a login name.
        let q = QueryFilter {
            all_users: true,
            ..Default::default()
        };
        let (_, f) = build_filter(None, &q, nobody, false).unwrap();
        assert!(f.include_users.is_empty());

        let q = QueryFilter {
            user: vec!["-".to_string()],
            ..Default::default()
        };
        let (_, f) = build_filter(None, &q, nobody, false).unwrap();
        assert!(f.include_users.is_empty());
    }

    #[test]
    fn test_system_exclusions() {
        let cfg = ClusterConfig::from_json_str(
            r#"{"name":"c","exclude-user":["backup"],"nodes":[{"hostname":"a","cpu_cores":4,"mem_gb":16}]}"#,
        )
        .unwrap();
        let q = QueryFilter {
            from: Some(timestamp_from_ymd(2024, 1, 1)),
            host: vec!["c1-[1-4]".to_string()],
            user: vec!["bob".to_string()],
            job: vec![17],
            exclude_system_jobs: true,
            skip_system_users: true,
            exclude_system_commands: true,
            exclude_heartbeat: true,
            ..Default::default()
        };
        let (hosts, f) = build_filter(Some(&cfg), &q, nobody, false).unwrap();
        assert!(hosts.match_hostname("c1-3"));
        assert!(f.include_hosts.is_some());
        for u in ["root", "zabbix", "backup"] {
            assert!(f.exclude_users.contains(&Ustr::from(u)));
        }
        for c in ["bash", "zsh", "sshd", "tmux", "systemd", "_heartbeat_"] {
            assert!(f.exclude_commands.contains(&Ustr::from(c)));
        }
        assert!(f.include_users.contains(&Ustr::from("bob")));
        assert!(f.include_jobs.contains(&17));
        assert_eq!(f.min_pid, 1000);
        assert_eq!(f.from, to_unix(timestamp_from_ymd(2024, 1, 1)));
    }
}
