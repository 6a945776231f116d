/// Static cluster configuration, read from a JSON file maintained by the cluster's admins.
///
/// v2 format: an object with these fields:
///
///   name - string, the canonical name of the cluster
///   description - string, optional
///   aliases - array of strings, optional
///   exclude-user - array of strings, optional, users whose records are always filtered out
///   nodes - array of node objects in the v1 format (below)
///
/// v1 format: an array of node objects, each with these fields:
///
///   timestamp - string, optional, RFC3339 time when the data were obtained
///   hostname - string, a host name or a pattern like "c1-[1-32]" that is expanded
///   description - string, optional
///   cross_node_jobs - bool, optional, jobs on this node can be merged with jobs on other nodes that
///                     also set the flag, because job numbers come from a cluster-wide source
///   cpu_cores - integer, the number of hyperthreads
///   mem_gb - integer, main memory in GB
///   gpu_cards - integer, optional, the number of gpu cards
///   gpumem_gb - integer, optional, gpu memory in GB across all cards
///   gpumem_pct - bool, optional, true if the node reports gpu memory as a percentage
///
/// Field names starting with '#' are comments.
///
/// The input is human-generated and has drifted over time, so it is decoded field by field from a
/// generic serde_json::Value rather than with a derived parser.
use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct System {
    pub timestamp: String,
    pub hostname: String,
    pub description: String,
    pub cross_node_jobs: bool,
    pub cpu_cores: usize,
    pub mem_gb: usize,
    pub gpu_cards: usize,
    pub gpumem_gb: usize,
    pub gpumem_pct: bool,
}

#[derive(Debug, Default)]
pub struct ClusterConfig {
    pub name: String,
    pub description: String,
    pub aliases: Vec<String>,
    pub exclude_user: Vec<String>,
    nodes: HashMap<String, Arc<System>>,
}

impl ClusterConfig {
    pub fn from_json_str(text: &str) -> Result<ClusterConfig> {
        config_from_value("(string)", serde_json::from_str(text)?)
    }

    pub fn from_systems(name: &str, systems: Vec<System>) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            nodes: systems
                .into_iter()
                .map(|s| (s.hostname.clone(), Arc::new(s)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn lookup(&self, hostname: &str) -> Option<Arc<System>> {
        self.nodes.get(hostname).cloned()
    }

    /// All configured host names, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hs = self.nodes.keys().cloned().collect::<Vec<String>>();
        hs.sort();
        hs
    }

    pub fn cross_node_jobs(&self) -> bool {
        self.nodes.values().any(|sys| sys.cross_node_jobs)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub fn read_cluster_config(filename: &str) -> Result<ClusterConfig> {
    let file = File::open(filename)?;
    let v = serde_json::from_reader(BufReader::new(file))?;
    config_from_value(filename, v)
}

fn config_from_value(source: &str, v: Value) -> Result<ClusterConfig> {
    let mut cfg = ClusterConfig::default();
    match v {
        Value::Array(objs) => {
            cfg.name = source.to_string();
            cfg.description = source.to_string();
            cfg.nodes = process_cluster_nodes(&objs)?;
        }
        Value::Object(fields) => {
            cfg.name = grab_string(&fields, "name")?;
            cfg.description = grab_string_opt(&fields, "description")?;
            cfg.aliases = grab_strings_opt(&fields, "aliases")?;
            cfg.exclude_user = grab_strings_opt(&fields, "exclude-user")?;
            match fields.get("nodes") {
                Some(Value::Array(objs)) => cfg.nodes = process_cluster_nodes(objs)?,
                _ => bail!("The field 'nodes' is required"),
            }
        }
        _ => bail!("Expected an array or object value"),
    }
    Ok(cfg)
}

fn process_cluster_nodes(objs: &[Value]) -> Result<HashMap<String, Arc<System>>> {
    let mut nodes = HashMap::new();
    for obj in objs {
        let Value::Object(fields) = obj else {
            bail!("Expected an object value")
        };
        let gpu_cards = grab_usize_opt(fields, "gpu_cards")?;
        let gpumem_gb = grab_usize_opt(fields, "gpumem_gb")?;
        let gpumem_pct = grab_bool_opt(fields, "gpumem_pct")?;
        if gpu_cards.is_none() && (gpumem_gb.is_some() || gpumem_pct.is_some()) {
            bail!("Without gpu_cards there should be no gpumem_gb or gpumem_pct")
        }
        let sys = System {
            timestamp: grab_string_opt(fields, "timestamp")?,
            hostname: grab_string(fields, "hostname")?,
            description: grab_string_opt(fields, "description")?,
            cross_node_jobs: grab_bool_opt(fields, "cross_node_jobs")?.unwrap_or(false),
            cpu_cores: grab_usize(fields, "cpu_cores")?,
            mem_gb: grab_usize(fields, "mem_gb")?,
            gpu_cards: gpu_cards.unwrap_or(0),
            gpumem_gb: gpumem_gb.unwrap_or(0),
            gpumem_pct: gpumem_pct.unwrap_or(false),
        };
        for name in crate::expand_pattern(&sys.hostname)? {
            if nodes.contains_key(&name) {
                bail!("System info for host {name} already defined");
            }
            let node = Arc::new(System {
                hostname: name.clone(),
                ..sys.clone()
            });
            nodes.insert(name, node);
        }
    }
    Ok(nodes)
}

fn grab_string(fields: &Map<String, Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => bail!("Field '{name}' must be present and have a string value"),
    }
}

fn grab_string_opt(fields: &Map<String, Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        None => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => bail!("Field '{name}' must have a string value"),
    }
}

fn grab_strings_opt(fields: &Map<String, Value>, name: &str) -> Result<Vec<String>> {
    match fields.get(name) {
        None => Ok(vec![]),
        Some(Value::Array(vals)) => vals
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                _ => bail!("Field '{name}' must have string values"),
            })
            .collect(),
        Some(_) => bail!("Field '{name}' must be an array of strings"),
    }
}

fn grab_usize(fields: &Map<String, Value>, name: &str) -> Result<usize> {
    match grab_usize_opt(fields, name)? {
        Some(n) => Ok(n),
        None => bail!("Field '{name}' must be present and have an integer value"),
    }
}

fn grab_usize_opt(fields: &Map<String, Value>, name: &str) -> Result<Option<usize>> {
    match fields.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => match n.as_u64().and_then(|n| usize::try_from(n).ok()) {
            Some(n) => Ok(Some(n)),
            None => bail!("Field '{name}' must have unsigned integer value"),
        },
        Some(_) => bail!("Field '{name}' must have unsigned integer value"),
    }
}

fn grab_bool_opt(fields: &Map<String, Value>, name: &str) -> Result<Option<bool>> {
    match fields.get(name) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => bail!("Field '{name}' must have a boolean value"),
    }
}

#[cfg(test)]
const V2_CONFIG: &str = r##"{
  "name": "mlx.hpc.uio.no",
  "description": "UiO machine learning nodes",
  "aliases": ["ml", "mlx"],
  "exclude-user": ["root", "toor"],
  "nodes": [
    { "hostname": "ml1.hpc.uio.no", "cpu_cores": 56, "mem_gb": 128, "gpu_cards": 4,
      "gpumem_pct": true, "#note": "comment" },
    { "hostname": "ml8.hpc.uio.no", "cpu_cores": 192, "mem_gb": 1024, "gpu_cards": 3,
      "gpumem_gb": 128, "cross_node_jobs": false },
    { "hostname": "c1-[23-25]", "cpu_cores": 64, "mem_gb": 256, "cross_node_jobs": true }
  ]
}"##;

#[test]
fn test_config_v2() {
    let conf = ClusterConfig::from_json_str(V2_CONFIG).unwrap();
    assert_eq!(conf.name, "mlx.hpc.uio.no");
    assert_eq!(conf.description, "UiO machine learning nodes");
    assert_eq!(conf.aliases, vec!["ml", "mlx"]);
    assert_eq!(conf.exclude_user, vec!["root", "toor"]);

    let c0 = conf.lookup("ml1.hpc.uio.no").unwrap();
    assert_eq!(c0.cpu_cores, 56);
    assert_eq!(c0.gpu_cards, 4);
    assert_eq!(c0.gpumem_gb, 0);
    assert!(c0.gpumem_pct);

    let c1 = conf.lookup("ml8.hpc.uio.no").unwrap();
    assert_eq!(c1.gpu_cards, 3);
    assert_eq!(c1.gpumem_gb, 128);
    assert!(!c1.gpumem_pct);

    let c2 = conf.lookup("c1-24").unwrap();
    assert_eq!(c2.hostname, "c1-24");
    assert_eq!(c2.gpu_cards, 0);
    assert!(c2.cross_node_jobs);
    assert!(conf.cross_node_jobs());

    assert!(conf.lookup("ml2.hpc.uio.no").is_none());
    assert_eq!(conf.hosts().len(), 5);
}

#[test]
fn test_config_v1_and_errors() {
    let conf = ClusterConfig::from_json_str(
        r#"[{"hostname": "a[1-2]", "cpu_cores": 8, "mem_gb": 16}]"#,
    )
    .unwrap();
    assert_eq!(conf.hosts(), vec!["a1", "a2"]);
    assert!(!conf.cross_node_jobs());

    assert!(ClusterConfig::from_json_str(r#"{"name": "x"}"#).is_err());
    assert!(ClusterConfig::from_json_str(
        r#"[{"hostname": "a", "cpu_cores": 8, "mem_gb": 16, "gpumem_gb": 3}]"#
    )
    .is_err());
    assert!(ClusterConfig::from_json_str(
        r#"[{"hostname": "a", "cpu_cores": 8, "mem_gb": 16}, {"hostname": "a", "cpu_cores": 8, "mem_gb": 16}]"#
    )
    .is_err());
    assert!(ClusterConfig::from_json_str(r#"[{"hostname": "a", "cpu_cores": -1, "mem_gb": 1}]"#).is_err());
}
