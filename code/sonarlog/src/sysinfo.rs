/// Parser for the old-style sysinfo files (`sysinfo-<host>.json`), a sequence of JSON objects
/// without separators, each of the form
///
///   {"timestamp":"...","hostname":"...","description":"...","cpu_cores":n,"mem_gb":n,
///    "gpu_cards":n,"gpumem_gb":n,"gpu_info":[...]}
///
/// The description is mined for the CPU and GPU configuration.  There is no recovery: a decoding
/// error ends the parse.
use crate::repr::{SysinfoCardData, SysinfoNodeData};

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::io;

#[derive(Default)]
pub struct SysinfoData {
    pub nodes: Vec<SysinfoNodeData>,
    pub cards: Vec<SysinfoCardData>,
    pub soft_errors: usize,
    pub hard_error: Option<anyhow::Error>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OldSysinfo {
    timestamp: String,
    hostname: String,
    description: String,
    #[allow(dead_code)]
    cpu_cores: u64,
    mem_gb: u64,
    gpu_cards: u64,
    #[allow(dead_code)]
    gpumem_gb: u64,
    gpu_info: Option<Vec<OldGpuInfo>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OldGpuInfo {
    bus_addr: String,
    uuid: String,
    manufacturer: String,
    model: String,
    arch: String,
    driver: String,
    firmware: String,
    mem_size_kib: u64,
    power_limit_watt: u64,
    max_power_limit_watt: u64,
    min_power_limit_watt: u64,
    max_ce_clock_mhz: u64,
    max_mem_clock_mhz: u64,
}

// "2x48 (hyperthreaded) AMD EPYC 7642 48-Core Processor, 1007 GiB, 4x NVIDIA GeForce RTX 3090 @ 24GiB"
static DESC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)x(\d+)( \(hyperthreaded\))?(.*?), \d+ GiB").expect("Bad regex")
});
static GPU_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r", \d+x (.*) @ (\d+)GiB$").expect("Bad regex"));

pub fn parse_sysinfo_oldjson<R: io::Read>(input: R) -> Result<SysinfoData> {
    let mut result = SysinfoData::default();
    for r in serde_json::Deserializer::from_reader(input).into_iter::<OldSysinfo>() {
        let r = r?;
        let mut sockets = 0;
        let mut cores_per_socket = 0;
        let mut threads_per_core = 0;
        let mut cpu_model = String::new();
        if let Some(m) = DESC_RE.captures(&r.description) {
            sockets = m[1].parse::<u64>().unwrap_or(0);
            cores_per_socket = m[2].parse::<u64>().unwrap_or(0);
            threads_per_core = if m.get(3).is_some() { 2 } else { 1 };
            cpu_model = m[4].trim().to_string();
        }
        let architecture = if r.description.contains("Intel") || r.description.contains("AMD") {
            "x86_64"
        } else {
            "aarch64"
        };
        result.nodes.push(SysinfoNodeData {
            time: r.timestamp.clone(),
            cluster: String::new(),
            node: r.hostname.clone(),
            os_name: "Linux".to_string(),
            os_release: String::new(),
            architecture: architecture.to_string(),
            sockets,
            cores_per_socket,
            threads_per_core,
            cpu_model,
            memory: r.mem_gb * 1024 * 1024,
            topo_svg: String::new(),
            topo_text: String::new(),
            distances: vec![vec![10]],
        });

        let card = |index: u64| SysinfoCardData {
            time: r.timestamp.clone(),
            node: r.hostname.clone(),
            index,
            ..Default::default()
        };
        match r.gpu_info {
            Some(ref info) => {
                for (i, o) in info.iter().enumerate() {
                    result.cards.push(SysinfoCardData {
                        uuid: o.uuid.clone(),
                        address: o.bus_addr.clone(),
                        manufacturer: o.manufacturer.clone(),
                        model: o.model.clone(),
                        architecture: o.arch.clone(),
                        driver: o.driver.clone(),
                        firmware: o.firmware.clone(),
                        memory: o.mem_size_kib,
                        power_limit: o.power_limit_watt,
                        max_power_limit: o.max_power_limit_watt,
                        min_power_limit: o.min_power_limit_watt,
                        max_ce_clock: o.max_ce_clock_mhz,
                        max_memory_clock: o.max_mem_clock_mhz,
                        ..card(i as u64)
                    });
                }
            }
            None if r.gpu_cards > 0 => {
                let mut model = String::new();
                let mut manufacturer = "";
                let mut memory = 0;
                if let Some(m) = GPU_RE.captures(&r.description) {
                    model = m[1].to_string();
                    memory = m[2].parse::<u64>().unwrap_or(0) * 1024 * 1024;
                    for maker in ["NVIDIA", "AMD", "Intel"] {
                        if model.contains(maker) {
                            manufacturer = maker;
                            break;
                        }
                    }
                }
                for i in 0..r.gpu_cards {
                    result.cards.push(SysinfoCardData {
                        model: model.clone(),
                        manufacturer: manufacturer.to_string(),
                        memory,
                        ..card(i)
                    });
                }
            }
            None => {}
        }
    }
    Ok(result)
}

#[test]
fn test_parse_sysinfo_oldjson() {
    let text = r#"
{"timestamp":"2024-10-31T00:00:01+01:00","hostname":"ml1.hpc.uio.no",
 "description":"2x14 (hyperthreaded) Intel(R) Xeon(R) Gold 5120 CPU @ 2.20GHz, 125 GiB, 3x NVIDIA GeForce RTX 2080 Ti @ 11GiB",
 "cpu_cores":56,"mem_gb":125,"gpu_cards":3,"gpumem_gb":33}
{"timestamp":"2024-10-31T00:00:01+01:00","hostname":"ml8.hpc.uio.no",
 "description":"2x64 AMD EPYC 7763 64-Core Processor, 1007 GiB, 4x NVIDIA A100 @ 80GiB",
 "cpu_cores":128,"mem_gb":1007,"gpu_cards":4,"gpumem_gb":320,
 "gpu_info":[{"bus_addr":"00000000:01:00.0","uuid":"GPU-a","model":"NVIDIA A100","mem_size_kib":83886080},
             {"bus_addr":"00000000:41:00.0","uuid":"GPU-b","model":"NVIDIA A100","mem_size_kib":83886080}]}
{"timestamp":"2024-10-31T00:00:01+01:00","hostname":"arm1","description":"1x4 Cortex, 8 GiB"}
"#;
    let d = parse_sysinfo_oldjson(text.as_bytes()).unwrap();
    assert_eq!(d.nodes.len(), 3);
    let n = &d.nodes[0];
    assert_eq!((n.sockets, n.cores_per_socket, n.threads_per_core), (2, 14, 2));
    assert_eq!(n.cpu_model, "Intel(R) Xeon(R) Gold 5120 CPU @ 2.20GHz");
    assert_eq!(n.architecture, "x86_64");
    assert_eq!(n.memory, 125 * 1024 * 1024);
    assert_eq!(d.nodes[1].threads_per_core, 1);
    assert_eq!(d.nodes[2].architecture, "aarch64");

    // Three synthesized cards for ml1, two described cards for ml8.
    assert_eq!(d.cards.len(), 5);
    assert_eq!(d.cards[2].index, 2);
    assert_eq!(d.cards[2].model, "NVIDIA GeForce RTX 2080 Ti");
    assert_eq!(d.cards[2].manufacturer, "NVIDIA");
    assert_eq!(d.cards[2].memory, 11 * 1024 * 1024);
    assert_eq!(d.cards[4].uuid, "GPU-b");
    assert_eq!(d.cards[4].address, "00000000:41:00.0");
    assert_eq!(d.cards[4].node, "ml8.hpc.uio.no");
}

#[test]
fn test_parse_sysinfo_oldjson_error() {
    let text = r#"{"timestamp":"2024-10-31T00:00:01+01:00","hostname":"a"} {"timestamp":"#;
    assert!(parse_sysinfo_oldjson(text.as_bytes()).is_err());
}
