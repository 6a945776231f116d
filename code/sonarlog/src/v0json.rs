/// Parsers for the version-0 JSON files (`0+<type>-<originator>.json`).
///
/// A file is a sequence of top-level envelope objects without separators, each of the form
///
///   { "meta": {"producer": ..., "version": ...}, "data": {"type": ..., "attributes": {...}},
///     "errors": [...] }
///
/// where exactly one of "data" and "errors" is normally present.  Envelopes are decoded one at a
/// time.  An envelope that is well-formed JSON but does not have the expected shape, or that
/// carries only errors, counts as one soft error.  A JSON syntax error ends the parse: the result
/// then holds the records parsed before the error along with the error itself.
///
/// Fields are optional unless noted; missing fields take default values.
use crate::repr::{
    CluzterAttributes, CluzterNodeStates, CluzterNodes, CluzterPartition, CluzterPartitions,
    CpuSamples, EncodedCpuSamples, EncodedGpuSamples, GpuSamples, LogEntry, PerGpuSample,
    SacctInfo, SysinfoCardData, SysinfoNodeData, FLAG_HEARTBEAT, GPU_HAS_COMPUTE_MODE,
    GPU_HAS_FAILING, GPU_HAS_UTIL, GPU_HAS_UUID,
};
use crate::samplecsv::SampleData;
use crate::sysinfo::SysinfoData;

use anyhow::Result;
use base64::Engine;
use rustutils::{log, parse_timestamp, ustr_empty, GpuSet, UstrAllocator};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io;

#[derive(Deserialize, Default)]
#[serde(default)]
struct Meta {
    #[allow(dead_code)]
    producer: String,
    version: String,
}

#[derive(Deserialize)]
struct Data<T> {
    #[allow(dead_code)]
    #[serde(rename = "type")]
    ty: String,
    attributes: T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    meta: Meta,
    data: Option<Data<T>>,
    errors: Option<Vec<serde_json::Value>>,
}

// Decode envelopes one by one and hand the ones with data to `f`, which returns the number of soft
// errors it found.  Returns the total soft error count and the syntax or I/O error that stopped the
// decoding, if any.
fn consume_envelopes<R, T, F>(input: R, verbose: bool, mut f: F) -> (usize, Option<anyhow::Error>)
where
    R: io::Read,
    T: DeserializeOwned,
    F: FnMut(&Meta, T) -> usize,
{
    let mut soft_errors = 0;
    for v in serde_json::Deserializer::from_reader(input).into_iter::<serde_json::Value>() {
        let v = match v {
            Ok(v) => v,
            Err(e) => return (soft_errors, Some(e.into())),
        };
        match serde_json::from_value::<Envelope<T>>(v) {
            Ok(Envelope {
                meta,
                data: Some(data),
                ..
            }) => soft_errors += f(&meta, data.attributes),
            Ok(Envelope { errors, .. }) => {
                if verbose {
                    slog::info!(log(), "Envelope without data, {} errors",
                                errors.map(|e| e.len()).unwrap_or(0));
                }
                soft_errors += 1;
            }
            Err(e) => {
                if verbose {
                    slog::info!(log(), "Dropping malformed envelope: {}", e);
                }
                soft_errors += 1;
            }
        }
    }
    (soft_errors, None)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//
// Samples

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleAttributes {
    time: String,
    cluster: String,
    node: String,
    system: Option<SampleSystem>,
    jobs: Vec<SampleJob>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleSystem {
    /// Per-core cumulative CPU seconds.
    cpus: Option<Vec<u64>>,
    gpus: Option<Vec<SampleGpu>>,
    /// KiB
    used_memory: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleGpu {
    index: u64,
    uuid: String,
    failing: u64,
    fan: u64,
    compute_mode: String,
    performance_state: i64,
    memory: u64,
    ce_util: u64,
    memory_util: u64,
    temperature: i64,
    power: u64,
    power_limit: u64,
    ce_clock: u64,
    memory_clock: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleJob {
    job: u64,
    user: String,
    epoch: u64,
    processes: Vec<SampleProcess>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleProcess {
    resident_memory: u64,
    virtual_memory: u64,
    cmd: String,
    pid: u64,
    ppid: u64,
    num_threads: u64,
    cpu_avg: f64,
    cpu_util: f64,
    cpu_time: u64,
    rolledup: u64,
    gpu_fail: u64,
    gpus: Vec<SampleProcessGpu>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleProcessGpu {
    index: u64,
    uuid: String,
    gpu_util: f64,
    gpu_memory: u64,
    gpu_memory_util: f64,
}

/// Each envelope yields a heartbeat record for the node, one record per process, and per-node CPU
/// and GPU samples when present.  An envelope with an unparseable time is skipped silently.

pub fn parse_sample_v0json<R: io::Read>(
    input: R,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<SampleData> {
    let mut result = SampleData::default();
    let heartbeat = ustrs.alloc("_heartbeat_");
    let sonar = ustrs.alloc("_sonar_");
    let (soft_errors, hard_error) = consume_envelopes(input, verbose, |meta, a: SampleAttributes| {
        let Ok(t) = parse_timestamp(&a.time) else {
            return 0;
        };
        let timestamp = t.timestamp();
        let version = ustrs.alloc(&meta.version);
        let cluster = ustrs.alloc(&a.cluster);
        let hostname = ustrs.alloc(&a.node);
        let system = a.system.unwrap_or_default();
        let num_cores = system.cpus.as_ref().map(|c| c.len() as u32).unwrap_or(0);

        let mut hb = LogEntry::empty(timestamp, hostname);
        hb.version = version;
        hb.cluster = cluster;
        hb.user = sonar;
        hb.command = heartbeat;
        hb.num_cores = num_cores;
        hb.flags = FLAG_HEARTBEAT;
        result.samples.push(hb);

        if let Some(cpus) = system.cpus {
            result.cpu_samples.push(CpuSamples {
                timestamp,
                hostname,
                encoded: EncodedCpuSamples::Values(cpus),
            });
        }
        if let Some(gpus) = system.gpus {
            let cards = gpus
                .into_iter()
                .map(|g| PerGpuSample {
                    attr: GPU_HAS_UUID | GPU_HAS_COMPUTE_MODE | GPU_HAS_UTIL | GPU_HAS_FAILING,
                    index: g.index,
                    uuid: ustrs.alloc(&g.uuid),
                    failing: g.failing,
                    fan: g.fan,
                    compute_mode: ustrs.alloc(&g.compute_mode),
                    performance_state: g.performance_state,
                    memory: g.memory,
                    ce_util: g.ce_util,
                    memory_util: g.memory_util,
                    temperature: g.temperature,
                    power: g.power,
                    power_limit: g.power_limit,
                    ce_clock: g.ce_clock,
                    memory_clock: g.memory_clock,
                })
                .collect();
            result.gpu_samples.push(GpuSamples {
                timestamp,
                hostname,
                encoded: EncodedGpuSamples::Values(cards),
            });
        }

        for job in a.jobs {
            let user = ustrs.alloc(&job.user);
            for p in job.processes {
                let mut gpus = GpuSet::empty();
                let mut gpu_pct = 0.0;
                let mut gpumem_pct = 0.0;
                let mut gpu_kb = 0;
                for g in &p.gpus {
                    gpus.adjoin(g.index as u32);
                    gpu_pct += g.gpu_util;
                    gpumem_pct += g.gpu_memory_util;
                    gpu_kb += g.gpu_memory;
                }
                result.samples.push(LogEntry {
                    timestamp,
                    memtotal_kb: 0,
                    cpu_kb: p.virtual_memory,
                    rssanon_kb: p.resident_memory,
                    gpu_kb,
                    cputime_sec: p.cpu_time,
                    version,
                    cluster,
                    hostname,
                    user,
                    command: ustrs.alloc(&p.cmd),
                    num_cores,
                    job_id: job.job as u32,
                    pid: p.pid as u32,
                    ppid: p.ppid as u32,
                    cpu_pct: p.cpu_avg as f32,
                    gpu_pct: gpu_pct as f32,
                    gpumem_pct: gpumem_pct as f32,
                    gpus,
                    rolledup: p.rolledup as u32,
                    gpu_fail: p.gpu_fail.min(255) as u8,
                    flags: 0,
                });
            }
        }
        0
    });
    result.soft_errors = soft_errors;
    result.hard_error = hard_error;
    Ok(result)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//
// Sysinfo

#[derive(Deserialize, Default)]
#[serde(default)]
struct SysinfoAttributes {
    time: String,
    cluster: String,
    node: String,
    os_name: String,
    os_release: String,
    architecture: String,
    sockets: u64,
    cores_per_socket: u64,
    threads_per_core: u64,
    cpu_model: String,
    memory: u64,
    topo_svg: String,
    topo_text: String,
    distances: Option<Vec<Vec<u64>>>,
    cards: Vec<SysinfoGpuCard>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SysinfoGpuCard {
    index: u64,
    uuid: String,
    address: String,
    manufacturer: String,
    model: String,
    architecture: String,
    driver: String,
    firmware: String,
    memory: u64,
    power_limit: u64,
    max_power_limit: u64,
    min_power_limit: u64,
    max_ce_clock: u64,
    max_memory_clock: u64,
}

pub fn parse_sysinfo_v0json<R: io::Read>(input: R, verbose: bool) -> Result<SysinfoData> {
    let mut result = SysinfoData::default();
    let (soft_errors, hard_error) = consume_envelopes(input, verbose, |_, d: SysinfoAttributes| {
        let mut soft_errors = 0;
        let mut decode = |s: &str| -> String {
            if s.is_empty() {
                return String::new();
            }
            match base64::engine::general_purpose::STANDARD.decode(s) {
                Ok(bs) => String::from_utf8_lossy(&bs).into_owned(),
                Err(_) => {
                    soft_errors += 1;
                    String::new()
                }
            }
        };
        let topo_svg = decode(&d.topo_svg);
        let topo_text = decode(&d.topo_text);
        for c in d.cards {
            result.cards.push(SysinfoCardData {
                time: d.time.clone(),
                node: d.node.clone(),
                index: c.index,
                uuid: c.uuid,
                address: c.address,
                manufacturer: c.manufacturer,
                model: c.model,
                architecture: c.architecture,
                driver: c.driver,
                firmware: c.firmware,
                memory: c.memory,
                power_limit: c.power_limit,
                max_power_limit: c.max_power_limit,
                min_power_limit: c.min_power_limit,
                max_ce_clock: c.max_ce_clock,
                max_memory_clock: c.max_memory_clock,
            });
        }
        result.nodes.push(SysinfoNodeData {
            time: d.time,
            cluster: d.cluster,
            node: d.node,
            os_name: d.os_name,
            os_release: d.os_release,
            architecture: d.architecture,
            sockets: d.sockets,
            cores_per_socket: d.cores_per_socket,
            threads_per_core: d.threads_per_core,
            cpu_model: d.cpu_model,
            memory: d.memory,
            topo_svg,
            topo_text,
            distances: d.distances.unwrap_or_else(|| vec![vec![10]]),
        });
        soft_errors
    });
    result.soft_errors = soft_errors;
    result.hard_error = hard_error;
    Ok(result)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//
// Slurm jobs

#[derive(Deserialize, Default)]
#[serde(default)]
struct JobsAttributes {
    time: String,
    cluster: String,
    slurm_jobs: Vec<SlurmJob>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SlurmJob {
    job_id: u64,
    job_step: String,
    job_name: String,
    job_state: String,
    array_job_id: u64,
    array_task_id: u64,
    het_job_id: u64,
    het_job_offset: u64,
    user_name: String,
    account: String,
    submit_time: String,
    /// Minutes.
    time_limit: u64,
    partition: String,
    reservation: String,
    nodes: Vec<String>,
    distribution: String,
    requested_cpus: u64,
    requested_memory_per_node: u64,
    requested_node_count: u64,
    start_time: String,
    end_time: String,
    suspend_time: u64,
    exit_code: u64,
    sacct: Option<SacctData>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SacctData {
    #[serde(rename = "MinCPU")]
    min_cpu: u64,
    #[serde(rename = "AllocTRES")]
    alloc_tres: String,
    #[serde(rename = "AveCPU")]
    ave_cpu: u64,
    #[serde(rename = "AveDiskRead")]
    ave_disk_read: u64,
    #[serde(rename = "AveDiskWrite")]
    ave_disk_write: u64,
    #[serde(rename = "AveRSS")]
    ave_rss: u64,
    #[serde(rename = "AveVMSize")]
    ave_vm_size: u64,
    #[serde(rename = "ElapsedRaw")]
    elapsed_raw: u64,
    #[serde(rename = "SystemCPU")]
    system_cpu: u64,
    #[serde(rename = "UserCPU")]
    user_cpu: u64,
    #[serde(rename = "MaxRSS")]
    max_rss: u64,
    #[serde(rename = "MaxVMSize")]
    max_vm_size: u64,
}

fn unix_or_zero(s: &str) -> i64 {
    parse_timestamp(s).map(|t| t.timestamp()).unwrap_or(0)
}

fn narrow(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

pub fn parse_slurm_v0json<R: io::Read>(
    input: R,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<(Vec<SacctInfo>, usize, Option<anyhow::Error>)> {
    let mut records = vec![];
    let (soft_errors, hard_error) = consume_envelopes(input, verbose, |meta, a: JobsAttributes| {
        let time = unix_or_zero(&a.time);
        let version = ustrs.alloc(&meta.version);
        for job in a.slurm_jobs {
            let sacct = job.sacct.unwrap_or_default();
            let step = ustrs.alloc(&job.job_step);
            records.push(SacctInfo {
                time,
                start: unix_or_zero(&job.start_time),
                end: unix_or_zero(&job.end_time),
                submit: unix_or_zero(&job.submit_time),
                system_cpu: sacct.system_cpu,
                user_cpu: sacct.user_cpu,
                ave_cpu: sacct.ave_cpu,
                min_cpu: sacct.min_cpu,
                version,
                user: ustrs.alloc(&job.user_name),
                job_name: ustrs.alloc(&job.job_name),
                state: ustrs.alloc(&job.job_state),
                account: ustrs.alloc(&job.account),
                layout: ustrs.alloc(&job.distribution),
                reservation: ustrs.alloc(&job.reservation),
                job_step: step,
                array_step: if job.array_job_id != 0 { step } else { ustr_empty() },
                het_step: if job.het_job_id != 0 { step } else { ustr_empty() },
                node_list: ustrs.alloc(&job.nodes.join(",")),
                partition: ustrs.alloc(&job.partition),
                req_gpus: crate::sacctcsv::parse_alloc_tres(sacct.alloc_tres.as_bytes(), ustrs),
                job_id: narrow(job.job_id),
                array_job_id: narrow(job.array_job_id),
                array_index: narrow(job.array_task_id),
                het_job_id: narrow(job.het_job_id),
                het_offset: narrow(job.het_job_offset),
                ave_disk_read: narrow(sacct.ave_disk_read),
                ave_disk_write: narrow(sacct.ave_disk_write),
                ave_rss: narrow(sacct.ave_rss),
                ave_vm_size: narrow(sacct.ave_vm_size),
                elapsed_raw: narrow(sacct.elapsed_raw),
                max_rss: narrow(sacct.max_rss),
                max_vm_size: narrow(sacct.max_vm_size),
                req_cpus: narrow(job.requested_cpus),
                req_mem: narrow(job.requested_memory_per_node),
                req_nodes: narrow(job.requested_node_count),
                suspended: narrow(job.suspend_time),
                timelimit_raw: narrow(job.time_limit.saturating_mul(60)),
                exit_code: job.exit_code.min(255) as u8,
                exit_signal: 0,
            });
        }
        0
    });
    Ok((records, soft_errors, hard_error))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//
// Cluzter

#[derive(Deserialize, Default)]
#[serde(default)]
struct CluzterAttributesJson {
    time: String,
    cluster: String,
    slurm: bool,
    partitions: Vec<CluzterPartitionJson>,
    nodes: Vec<CluzterNodesJson>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CluzterPartitionJson {
    name: String,
    nodes: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CluzterNodesJson {
    names: Vec<String>,
    states: Vec<String>,
}

#[derive(Default)]
pub struct CluzterData {
    pub attributes: Vec<CluzterAttributes>,
    pub partitions: Vec<CluzterPartitions>,
    pub nodes: Vec<CluzterNodes>,
    pub soft_errors: usize,
    pub hard_error: Option<anyhow::Error>,
}

pub fn parse_cluzter_v0json<R: io::Read>(input: R, verbose: bool) -> Result<CluzterData> {
    let mut result = CluzterData::default();
    let (soft_errors, hard_error) = consume_envelopes(input, verbose, |_, a: CluzterAttributesJson| {
        result.attributes.push(CluzterAttributes {
            time: a.time.clone(),
            cluster: a.cluster.clone(),
            slurm: a.slurm,
        });
        result.partitions.push(CluzterPartitions {
            time: a.time.clone(),
            cluster: a.cluster.clone(),
            partitions: a
                .partitions
                .into_iter()
                .map(|p| CluzterPartition {
                    name: p.name,
                    nodes: p.nodes,
                })
                .collect(),
        });
        result.nodes.push(CluzterNodes {
            time: a.time,
            cluster: a.cluster,
            nodes: a
                .nodes
                .into_iter()
                .map(|n| CluzterNodeStates {
                    names: n.names,
                    states: n.states,
                })
                .collect(),
        });
        0
    });
    result.soft_errors = soft_errors;
    result.hard_error = hard_error;
    Ok(result)
}

#[cfg(test)]
use rustutils::UstrCache;

#[test]
fn test_sample_v0json() {
    let text = r#"
{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"sample","attributes":{"time":"2025-03-01T00:00:10Z","cluster":"fox","node":"c1-5",
   "system":{"cpus":[10,20,30],
             "gpus":[{"index":0,"uuid":"GPU-1","fan":30,"performance_state":2,"memory":1024}]},
   "jobs":[{"job":17,"user":"bob","processes":[
      {"pid":100,"ppid":1,"cmd":"python","cpu_avg":50.5,"cpu_time":60,"virtual_memory":2048,
       "resident_memory":1024,"gpus":[{"index":0,"gpu_util":40,"gpu_memory":512,"gpu_memory_util":5},
                                      {"index":2,"gpu_util":10,"gpu_memory":256,"gpu_memory_util":1}]},
      {"pid":101,"cmd":"python","rolledup":3}]}]}}}
{"meta":{"producer":"sonar","version":"0.13.0"},"errors":[{"detail":"oops"}]}
{"meta":{"producer":"sonar","version":"0.13.0"},"data":{"type":"sample","attributes":{"time":"garbage"}}}
{"meta":{"producer":"sonar","version":"0.13.0"},"data":{"type":"sample","attributes":{"time":17}}}
"#;
    let d = parse_sample_v0json(text.as_bytes(), &mut UstrCache::new(), false).unwrap();
    assert_eq!(d.soft_errors, 2);
    assert_eq!(d.samples.len(), 3);
    assert!(d.samples[0].is_heartbeat());
    assert_eq!(d.samples[0].num_cores, 3);
    let p = &d.samples[1];
    assert_eq!(p.timestamp, 1740787210);
    assert_eq!(p.cluster.as_str(), "fox");
    assert_eq!(p.hostname.as_str(), "c1-5");
    assert_eq!(p.version.as_str(), "0.13.0");
    assert_eq!((p.job_id, p.pid, p.ppid), (17, 100, 1));
    assert_eq!(p.user.as_str(), "bob");
    assert_eq!(p.cpu_pct, 50.5);
    assert_eq!((p.cpu_kb, p.rssanon_kb, p.gpu_kb), (2048, 1024, 768));
    assert_eq!(p.gpus.to_string(), "0,2");
    assert_eq!((p.gpu_pct, p.gpumem_pct), (50.0, 6.0));
    assert_eq!(d.samples[2].rolledup, 3);

    assert_eq!(d.cpu_samples[0].decode().unwrap(), vec![10, 20, 30]);
    let g = d.gpu_samples[0].decode().unwrap();
    assert_eq!(g.len(), 1);
    assert_eq!(g[0].uuid.as_str(), "GPU-1");
    assert_eq!(g[0].performance_state, 2);
    assert_eq!(g[0].attr & GPU_HAS_UUID, GPU_HAS_UUID);
}

#[test]
fn test_sample_v0json_syntax_error() {
    let text = r#"{"meta":{"version":"0.13.0"},"data":{"type":"sample","attributes":{"time":"2025-03-01T00:00:10Z","node":"c1-5","jobs":[{"job":17,"user":"bob","processes":[{"pid":100,"cmd":"python"}]}]}}}
{"meta": garbage"#;
    let d = parse_sample_v0json(text.as_bytes(), &mut UstrCache::new(), false).unwrap();
    assert!(d.hard_error.is_some());
    assert_eq!(d.soft_errors, 0);
    // The heartbeat and the process record from the first envelope survive.
    assert_eq!(d.samples.len(), 2);
    assert_eq!(d.samples[1].pid, 100);

    let text = r#"{"meta":{"version":"0.13.0"},"data":{"type":"jobs","attributes":{"slurm_jobs":[{"job_id":5}]}}} {"meta":"#;
    let (rs, _, hard) = parse_slurm_v0json(text.as_bytes(), &mut UstrCache::new(), false).unwrap();
    assert_eq!(rs.len(), 1);
    assert!(hard.is_some());
}

#[test]
fn test_sysinfo_v0json() {
    let text = r#"{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"sysinfo","attributes":{"time":"2025-03-01T00:00:00Z","cluster":"fox","node":"c1-5",
   "os_name":"Linux","sockets":2,"cores_per_socket":14,"threads_per_core":2,
   "cpu_model":"Intel Xeon Gold 5120","memory":134217728,"topo_text":"aGVsbG8=","topo_svg":"!!!",
   "cards":[{"index":0,"uuid":"GPU-1","model":"NVIDIA RTX 2080 Ti","memory":11534336},
            {"index":1,"uuid":"GPU-2","model":"NVIDIA RTX 2080 Ti","memory":11534336}]}}}"#;
    let d = parse_sysinfo_v0json(text.as_bytes(), false).unwrap();
    assert_eq!(d.soft_errors, 1);
    assert_eq!(d.nodes.len(), 1);
    let n = &d.nodes[0];
    assert_eq!((n.sockets, n.cores_per_socket, n.threads_per_core), (2, 14, 2));
    assert_eq!(n.topo_text, "hello");
    assert_eq!(n.topo_svg, "");
    assert_eq!(n.distances, vec![vec![10]]);
    assert_eq!(d.cards.len(), 2);
    assert_eq!(d.cards[1].uuid, "GPU-2");
    assert_eq!(d.cards[1].node, "c1-5");
}

#[test]
fn test_slurm_v0json() {
    let text = r#"{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"jobs","attributes":{"time":"2025-03-01T00:00:00Z","cluster":"fox",
   "slurm_jobs":[{"job_id":1234,"job_step":"0","job_name":"train","job_state":"COMPLETED",
                  "array_job_id":1200,"array_task_id":34,"user_name":"bob","account":"ec30",
                  "time_limit":60,"partition":"normal","nodes":["c1-5","c1-6"],
                  "start_time":"2025-02-28T23:00:00Z","end_time":"2025-02-28T23:30:00Z",
                  "requested_cpus":8,"exit_code":1,
                  "sacct":{"AllocTRES":"billing=8,cpu=8,gres/gpu:rtx30=2,mem=32G","ElapsedRaw":1800,
                           "MaxRSS":3}}]}}}
{"meta":{"producer":"sonar","version":"0.13.0"},"errors":[{"detail":"no slurm"}]}"#;
    let (rs, soft, hard) =
        parse_slurm_v0json(text.as_bytes(), &mut UstrCache::new(), false).unwrap();
    assert_eq!(soft, 1);
    assert!(hard.is_none());
    assert_eq!(rs.len(), 1);
    let r = &rs[0];
    assert_eq!(r.job_id, 1234);
    assert_eq!(r.array_job_id, 1200);
    assert_eq!(r.array_index, 34);
    assert_eq!(r.array_step.as_str(), "0");
    assert_eq!(r.het_step.as_str(), "");
    assert_eq!(r.node_list.as_str(), "c1-5,c1-6");
    assert_eq!(r.req_gpus.as_str(), "rtx30=2");
    assert_eq!(r.timelimit_raw, 3600);
    assert_eq!(r.end - r.start, 1800);
    assert_eq!((r.elapsed_raw, r.max_rss, r.exit_code), (1800, 3, 1));
}

#[test]
fn test_cluzter_v0json() {
    let text = r#"{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"cluster","attributes":{"time":"2025-03-01T00:00:00Z","cluster":"fox","slurm":true,
   "partitions":[{"name":"normal","nodes":["c1-[1-8]"]},{"name":"gpu","nodes":["gpu-1","gpu-2"]}],
   "nodes":[{"names":["c1-[1-7]"],"states":["IDLE"]},{"names":["c1-8"],"states":["DOWN","DRAIN"]}]}}}"#;
    let d = parse_cluzter_v0json(text.as_bytes(), false).unwrap();
    assert_eq!(d.soft_errors, 0);
    assert!(d.hard_error.is_none());
    assert!(d.attributes[0].slurm);
    assert_eq!(d.partitions[0].partitions[1].nodes, vec!["gpu-1", "gpu-2"]);
    assert_eq!(d.nodes[0].nodes[1].states, vec!["DOWN", "DRAIN"]);
    assert_eq!(d.nodes[0].cluster, "fox");
}
