/// Matching, expansion and compression of host names.
///
/// A host name is a sequence of dot-separated elements.  A pattern is the same, except each element
/// may contain numeric ranges `[1-3,5]` and '*' wildcards (which match within an element, never
/// across a '.').  A prefix matcher also accepts any host name that extends the pattern with more
/// elements, so "ml8" matches "ml8.hpc.uio.no".
use crate::pattern;

use anyhow::{bail, Result};
use regex::Regex;
use std::collections::BTreeMap;
use ustr::Ustr;

#[derive(Clone, Debug)]
pub struct HostGlobber {
    is_prefix_matcher: bool,
    matchers: Vec<Regex>,
    patterns: Vec<String>,
}

impl HostGlobber {
    pub fn new(is_prefix_matcher: bool) -> HostGlobber {
        HostGlobber {
            is_prefix_matcher,
            matchers: vec![],
            patterns: vec![],
        }
    }

    pub fn from_patterns(patterns: &[String], is_prefix_matcher: bool) -> Result<HostGlobber> {
        let mut g = HostGlobber::new(is_prefix_matcher);
        for p in patterns {
            g.insert(p)?;
        }
        Ok(g)
    }

    pub fn insert(&mut self, pattern: &str) -> Result<()> {
        self.matchers
            .push(compile_globber(pattern, self.is_prefix_matcher)?);
        self.patterns.push(pattern.to_string());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True iff `s` matches at least one pattern.  The empty globber matches nothing; callers that
    /// want "no filter means everything" check `is_empty()` first.
    pub fn match_hostname(&self, s: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(s))
    }
}

fn compile_globber(p: &str, prefix: bool) -> Result<Regex> {
    let mut r = String::from("^");
    let mut cs = p.chars().peekable();
    while let Some(c) = cs.next() {
        if r.len() > 50000 {
            bail!("Expression too large, use more '*'")
        }
        match c {
            '*' => r += "[^.]*",
            '[' => {
                let mut body = String::new();
                loop {
                    match cs.next() {
                        Some(']') => break,
                        Some(c) => body.push(c),
                        None => bail!("Missing ']' in host pattern"),
                    }
                }
                let alternatives = pattern::expand_element(&format!("x[{body}]"))?
                    .iter()
                    .map(|s| s[1..].to_string())
                    .collect::<Vec<String>>();
                r += "(?:";
                r += &alternatives.join("|");
                r += ")";
            }
            _ => r += &regex::escape(&c.to_string()),
        }
    }
    if prefix {
        r += "(?:\\..*)?$";
    } else {
        r += "$";
    }
    Ok(Regex::new(&r)?)
}

/// Expand a pattern without wildcards into the host names it denotes.

pub fn expand_pattern(p: &str) -> Result<Vec<String>> {
    let mut names = vec![String::new()];
    for (i, elt) in p.split('.').enumerate() {
        let expanded = pattern::expand_element(elt)?;
        if expanded.iter().any(|e| e.ends_with('*')) {
            bail!("Wildcard not allowed in expandable host name {p}")
        }
        names = names
            .iter()
            .flat_map(|n| {
                expanded.iter().map(move |e| {
                    if i == 0 {
                        e.clone()
                    } else {
                        format!("{n}.{e}")
                    }
                })
            })
            .collect();
    }
    Ok(names)
}

/// Compress a list of host names into patterns whose expansion is the input set.  Names whose
/// first element ends in a number and that share the rest of the name are combined into a range,
/// e.g. a1.fox, a2.fox, a3.fox, a5.fox -> a[1-3,5].fox.  The output is sorted.

pub fn compress_hostnames(hosts: &[Ustr]) -> Vec<String> {
    // (stem of first element, rest of name) -> numeric suffixes
    let mut groups: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
    let mut singles = vec![];
    for h in hosts {
        let (first, rest) = match h.as_str().split_once('.') {
            Some((f, r)) => (f, format!(".{r}")),
            None => (h.as_str(), String::new()),
        };
        let digits = first.len() - first.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let stem = &first[..first.len() - digits];
        // Leading zeroes would not survive the round trip through a number.
        let suffix = &first[stem.len()..];
        if digits == 0 || stem.is_empty() || (suffix.len() > 1 && suffix.starts_with('0')) {
            singles.push(h.to_string());
            continue;
        }
        match suffix.parse::<u64>() {
            Ok(n) => groups
                .entry((stem.to_string(), rest))
                .or_default()
                .push(n),
            Err(_) => singles.push(h.to_string()),
        }
    }

    let mut results = singles;
    for ((stem, rest), mut ns) in groups {
        ns.sort();
        ns.dedup();
        if ns.len() == 1 {
            results.push(format!("{stem}{}{rest}", ns[0]));
        } else {
            results.push(format!("{stem}[{}]{rest}", ranges(&ns)));
        }
    }
    results.sort();
    results.dedup();
    results
}

fn ranges(ns: &[u64]) -> String {
    let mut parts = vec![];
    let mut i = 0;
    while i < ns.len() {
        let mut j = i + 1;
        while j < ns.len() && ns[j] == ns[j - 1] + 1 {
            j += 1;
        }
        if j == i + 1 {
            parts.push(ns[i].to_string());
        } else {
            parts.push(format!("{}-{}", ns[i], ns[j - 1]));
        }
        i = j;
    }
    parts.join(",")
}

#[test]
fn test_prefix_and_exact_matching() {
    let mut hf = HostGlobber::new(true);
    hf.insert("ml8").unwrap();
    hf.insert("ml3.hpc").unwrap();
    assert!(hf.match_hostname("ml8.hpc.uio.no"));
    assert!(hf.match_hostname("ml3.hpc.uio.no"));
    assert!(!hf.match_hostname("ml80.hpc.uio.no"));

    let mut hf = HostGlobber::new(false);
    hf.insert("ml4.hpc.uio.no").unwrap();
    assert!(hf.match_hostname("ml4.hpc.uio.no"));
    assert!(!hf.match_hostname("ml4.hpc.uio.no.yes"));
    assert!(!hf.match_hostname("ml4xhpc.uio.no"));
}

#[test]
fn test_ranges_and_wildcards() {
    let hf = HostGlobber::from_patterns(&["ml[1-3]*".to_string()], true).unwrap();
    assert!(hf.match_hostname("ml1"));
    assert!(hf.match_hostname("ml1x"));
    assert!(hf.match_hostname("ml1.uio"));
    assert!(!hf.match_hostname("ml4"));

    let hf = HostGlobber::from_patterns(&["c[1-3]-[2,4]".to_string()], false).unwrap();
    assert!(hf.match_hostname("c1-2"));
    assert!(hf.match_hostname("c2-4"));
    assert!(!hf.match_hostname("c2-3"));
    assert!(HostGlobber::new(false).is_empty());
    assert!(HostGlobber::from_patterns(&["c[1-".to_string()], false).is_err());
}

#[test]
fn test_expand_pattern() {
    assert_eq!(
        expand_pattern("c[1-2].x[3,5]").unwrap(),
        vec!["c1.x3", "c1.x5", "c2.x3", "c2.x5"]
    );
    assert!(expand_pattern("c*.x").is_err());
}

#[test]
fn test_compress_hostnames() {
    let hs = |xs: &[&str]| xs.iter().map(|x| Ustr::from(*x)).collect::<Vec<Ustr>>();
    assert_eq!(
        compress_hostnames(&hs(&["a1", "a3", "a2", "a5"])).join(","),
        "a[1-3,5]"
    );
    assert_eq!(
        compress_hostnames(&hs(&["a3.fox", "a1.fox", "a3.fum", "a2.fox", "a5.fox"])).join(","),
        "a3.fum,a[1-3,5].fox"
    );
    assert_eq!(compress_hostnames(&hs(&["x", "b01", "b1"])).join(","), "b01,b1,x");
}
