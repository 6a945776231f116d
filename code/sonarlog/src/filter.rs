/// Record filtering for samples.
///
/// A `SampleFilter` is the declarative form: sets of things to include or exclude, a minimum pid,
/// and an inclusive time window.  Empty sets mean "no constraint".  It is compiled into a
/// `RecordFilter`, a small instruction stream that is run against every record during
/// postprocessing and is safe to share between threads.
///
/// Every instruction is a u64 with the opcode in the low bits and an operand in the high 32 bits.
/// Singleton sets get their own opcodes so that the common cases ("this job", "not heartbeats")
/// need no hashing.  Tests are ordered from the most to the least discriminating.  The time window
/// test almost always passes since the store has already selected files by date, so it is not an
/// instruction but is run last.
use crate::repr::LogEntry;

use rustutils::{ustr_empty, HostGlobber};
use std::collections::HashSet;
use ustr::Ustr;

#[derive(Clone, Debug)]
pub struct SampleFilter {
    pub include_users: HashSet<Ustr>,
    pub include_hosts: Option<HostGlobber>,
    pub include_jobs: HashSet<u32>,
    pub include_commands: HashSet<Ustr>,
    pub exclude_users: HashSet<Ustr>,
    pub exclude_jobs: HashSet<u32>,
    pub exclude_commands: HashSet<Ustr>,
    pub min_pid: u32,
    pub from: i64,
    pub to: i64,
}

impl Default for SampleFilter {
    fn default() -> SampleFilter {
        SampleFilter {
            include_users: HashSet::new(),
            include_hosts: None,
            include_jobs: HashSet::new(),
            include_commands: HashSet::new(),
            exclude_users: HashSet::new(),
            exclude_jobs: HashSet::new(),
            exclude_commands: HashSet::new(),
            min_pid: 0,
            from: 0,
            to: i64::MAX,
        }
    }
}

impl SampleFilter {
    /// The plain conjunction of all the constraints.  `RecordFilter::apply` must always agree with
    /// this.
    pub fn matches(&self, e: &LogEntry) -> bool {
        (self.include_users.is_empty() || self.include_users.contains(&e.user))
            && self
                .include_hosts
                .as_ref()
                .map_or(true, |h| h.is_empty() || h.match_hostname(e.hostname.as_str()))
            && (self.include_jobs.is_empty() || self.include_jobs.contains(&e.job_id))
            && (self.include_commands.is_empty() || self.include_commands.contains(&e.command))
            && !self.exclude_users.contains(&e.user)
            && !self.exclude_jobs.contains(&e.job_id)
            && !self.exclude_commands.contains(&e.command)
            && e.pid >= self.min_pid
            && self.from <= e.timestamp
            && e.timestamp <= self.to
    }
}

const INCLUDE_SINGLE_JOB: u64 = 0;
const INCLUDE_JOBS: u64 = 1;
const INCLUDE_SINGLE_USER: u64 = 2;
const INCLUDE_USERS: u64 = 3;
const INCLUDE_HOSTS: u64 = 4;
const INCLUDE_SINGLE_COMMAND: u64 = 5;
const INCLUDE_COMMANDS: u64 = 6;
const EXCLUDE_SINGLE_USER: u64 = 7;
const EXCLUDE_USERS: u64 = 8;
const EXCLUDE_SINGLE_JOB: u64 = 9;
const EXCLUDE_JOBS: u64 = 10;
const EXCLUDE_SINGLE_COMMAND: u64 = 11;
const EXCLUDE_COMMANDS: u64 = 12;
const EXCLUDE_LOW_PIDS: u64 = 13;

// Opcode in the low 5 bits, operand in the high 32.
const OP_MASK: u64 = 31;
const OP_SHIFT: u32 = 32;

pub struct RecordFilter {
    insns: Vec<u64>,
    // Interned strings can't be packed into an operand, so string operands index this table.
    strings: Vec<Ustr>,
    filter: SampleFilter,
}

impl RecordFilter {
    pub fn compile(filter: &SampleFilter) -> RecordFilter {
        let mut insns = vec![];
        let mut strings = vec![];

        let mut string_operand = |s: Ustr| -> u64 {
            strings.push(s);
            ((strings.len() - 1) as u64) << OP_SHIFT
        };

        match filter.include_jobs.len() {
            0 => {}
            1 => {
                let j = *filter.include_jobs.iter().next().unwrap_or(&0);
                insns.push(INCLUDE_SINGLE_JOB | (j as u64) << OP_SHIFT);
            }
            _ => insns.push(INCLUDE_JOBS),
        }

        match filter.include_users.len() {
            0 => {}
            1 => {
                let u = *filter.include_users.iter().next().unwrap_or(&ustr_empty());
                insns.push(INCLUDE_SINGLE_USER | string_operand(u));
            }
            _ => insns.push(INCLUDE_USERS),
        }

        if filter.include_hosts.as_ref().is_some_and(|h| !h.is_empty()) {
            insns.push(INCLUDE_HOSTS);
        }

        match filter.include_commands.len() {
            0 => {}
            1 => {
                let c = *filter.include_commands.iter().next().unwrap_or(&ustr_empty());
                insns.push(INCLUDE_SINGLE_COMMAND | string_operand(c));
            }
            _ => insns.push(INCLUDE_COMMANDS),
        }

        match filter.exclude_users.len() {
            0 => {}
            1 => {
                let u = *filter.exclude_users.iter().next().unwrap_or(&ustr_empty());
                insns.push(EXCLUDE_SINGLE_USER | string_operand(u));
            }
            _ => insns.push(EXCLUDE_USERS),
        }

        match filter.exclude_jobs.len() {
            0 => {}
            1 => {
                let j = *filter.exclude_jobs.iter().next().unwrap_or(&0);
                insns.push(EXCLUDE_SINGLE_JOB | (j as u64) << OP_SHIFT);
            }
            _ => insns.push(EXCLUDE_JOBS),
        }

        match filter.exclude_commands.len() {
            0 => {}
            1 => {
                let c = *filter.exclude_commands.iter().next().unwrap_or(&ustr_empty());
                insns.push(EXCLUDE_SINGLE_COMMAND | string_operand(c));
            }
            _ => insns.push(EXCLUDE_COMMANDS),
        }

        if filter.min_pid > 0 {
            insns.push(EXCLUDE_LOW_PIDS | (filter.min_pid as u64) << OP_SHIFT);
        }

        RecordFilter {
            insns,
            strings,
            filter: filter.clone(),
        }
    }

    /// A filter that accepts everything.
    pub fn accept_all() -> RecordFilter {
        RecordFilter::compile(&SampleFilter::default())
    }

    pub fn apply(&self, e: &LogEntry) -> bool {
        let f = &self.filter;
        for &op in &self.insns {
            let operand = op >> OP_SHIFT;
            match op & OP_MASK {
                INCLUDE_SINGLE_JOB => {
                    if e.job_id != operand as u32 {
                        return false;
                    }
                }
                INCLUDE_JOBS => {
                    if !f.include_jobs.contains(&e.job_id) {
                        return false;
                    }
                }
                INCLUDE_SINGLE_USER => {
                    if e.user != self.strings[operand as usize] {
                        return false;
                    }
                }
                INCLUDE_USERS => {
                    if !f.include_users.contains(&e.user) {
                        return false;
                    }
                }
                INCLUDE_HOSTS => {
                    if let Some(ref hosts) = f.include_hosts {
                        if !hosts.match_hostname(e.hostname.as_str()) {
                            return false;
                        }
                    }
                }
                INCLUDE_SINGLE_COMMAND => {
                    if e.command != self.strings[operand as usize] {
                        return false;
                    }
                }
                INCLUDE_COMMANDS => {
                    if !f.include_commands.contains(&e.command) {
                        return false;
                    }
                }
                EXCLUDE_SINGLE_USER => {
                    if e.user == self.strings[operand as usize] {
                        return false;
                    }
                }
                EXCLUDE_USERS => {
                    if f.exclude_users.contains(&e.user) {
                        return false;
                    }
                }
                EXCLUDE_SINGLE_JOB => {
                    if e.job_id == operand as u32 {
                        return false;
                    }
                }
                EXCLUDE_JOBS => {
                    if f.exclude_jobs.contains(&e.job_id) {
                        return false;
                    }
                }
                EXCLUDE_SINGLE_COMMAND => {
                    if e.command == self.strings[operand as usize] {
                        return false;
                    }
                }
                EXCLUDE_COMMANDS => {
                    if f.exclude_commands.contains(&e.command) {
                        return false;
                    }
                }
                EXCLUDE_LOW_PIDS => {
                    if e.pid < operand as u32 {
                        return false;
                    }
                }
                _ => panic!("Bad filter instruction {op:#x}"),
            }
        }
        f.from <= e.timestamp && e.timestamp <= f.to
    }

    #[cfg(test)]
    fn opcodes(&self) -> Vec<u64> {
        self.insns.iter().map(|op| op & OP_MASK).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn entry(user: &str, host: &str, cmd: &str, job: u32, pid: u32, t: i64) -> LogEntry {
        LogEntry {
            user: Ustr::from(user),
            command: Ustr::from(cmd),
            job_id: job,
            pid,
            ..LogEntry::empty(t, Ustr::from(host))
        }
    }

    #[test]
    fn test_compile_order_and_singletons() {
        let mut f = SampleFilter::default();
        f.include_jobs.insert(7);
        f.exclude_commands.insert(Ustr::from("_heartbeat_"));
        f.exclude_users.insert(Ustr::from("root"));
        f.exclude_users.insert(Ustr::from("zabbix"));
        f.min_pid = 1000;
        let rf = RecordFilter::compile(&f);
        assert_eq!(
            rf.opcodes(),
            vec![INCLUDE_SINGLE_JOB, EXCLUDE_USERS, EXCLUDE_SINGLE_COMMAND, EXCLUDE_LOW_PIDS]
        );

        assert!(rf.apply(&entry("bob", "h", "python", 7, 1234, 10)));
        assert!(!rf.apply(&entry("bob", "h", "python", 8, 1234, 10)));
        assert!(!rf.apply(&entry("bob", "h", "_heartbeat_", 7, 1234, 10)));
        assert!(!rf.apply(&entry("zabbix", "h", "python", 7, 1234, 10)));
        assert!(!rf.apply(&entry("bob", "h", "python", 7, 999, 10)));
    }

    #[test]
    fn test_time_window_and_hosts() {
        let mut f = SampleFilter {
            from: 100,
            to: 200,
            ..Default::default()
        };
        f.include_hosts = Some(HostGlobber::from_patterns(&["c1-[1-2]".to_string()], true).unwrap());
        let rf = RecordFilter::compile(&f);
        assert!(rf.apply(&entry("u", "c1-1", "x", 1, 1, 100)));
        assert!(rf.apply(&entry("u", "c1-2.fox", "x", 1, 1, 200)));
        assert!(!rf.apply(&entry("u", "c1-3", "x", 1, 1, 150)));
        assert!(!rf.apply(&entry("u", "c1-1", "x", 1, 1, 99)));
        assert!(!rf.apply(&entry("u", "c1-1", "x", 1, 1, 201)));

        // An empty globber is no constraint.
        f.include_hosts = Some(HostGlobber::new(true));
        let rf = RecordFilter::compile(&f);
        assert!(rf.opcodes().is_empty());
        assert!(rf.apply(&entry("u", "anything", "x", 1, 1, 150)));
        assert!(RecordFilter::accept_all().apply(&entry("u", "h", "x", 0, 0, 0)));
    }

    // Random filters against random records: the compiled filter must agree with the plain
    // conjunction everywhere.
    #[test]
    fn test_compiled_agrees_with_matches() {
        let users = ["alice", "bob", "carol", "root"].map(Ustr::from);
        let cmds = ["python", "bash", "_heartbeat_", "a.out"].map(Ustr::from);
        let hosts = ["c1-1", "c1-2", "gpu-1", "login"];
        let mut rng = SmallRng::seed_from_u64(1337);

        let pick_users = |rng: &mut SmallRng| -> HashSet<Ustr> {
            let n = rng.gen_range(0..3);
            (0..n).map(|_| users[rng.gen_range(0..users.len())]).collect()
        };
        let pick_cmds = |rng: &mut SmallRng| -> HashSet<Ustr> {
            let n = rng.gen_range(0..3);
            (0..n).map(|_| cmds[rng.gen_range(0..cmds.len())]).collect()
        };
        let pick_jobs = |rng: &mut SmallRng| -> HashSet<u32> {
            let n = rng.gen_range(0..3);
            (0..n).map(|_| rng.gen_range(0..5)).collect()
        };

        for _ in 0..200 {
            let f = SampleFilter {
                include_users: pick_users(&mut rng),
                include_hosts: if rng.gen_bool(0.3) {
                    Some(HostGlobber::from_patterns(&["c1-*".to_string()], true).unwrap())
                } else {
                    None
                },
                include_jobs: pick_jobs(&mut rng),
                include_commands: pick_cmds(&mut rng),
                exclude_users: pick_users(&mut rng),
                exclude_jobs: pick_jobs(&mut rng),
                exclude_commands: pick_cmds(&mut rng),
                min_pid: if rng.gen_bool(0.3) { 1000 } else { 0 },
                from: rng.gen_range(0..50),
                to: rng.gen_range(50..100),
            };
            let rf = RecordFilter::compile(&f);
            for _ in 0..50 {
                let e = LogEntry {
                    user: users[rng.gen_range(0..users.len())],
                    command: cmds[rng.gen_range(0..cmds.len())],
                    job_id: rng.gen_range(0..5),
                    pid: rng.gen_range(0..2000),
                    ..LogEntry::empty(
                        rng.gen_range(0..100),
                        Ustr::from(hosts[rng.gen_range(0..hosts.len())]),
                    )
                };
                assert_eq!(rf.apply(&e), f.matches(&e), "{f:?} {e:?}");
            }
        }
    }
}
