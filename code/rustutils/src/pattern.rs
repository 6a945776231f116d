/// Expansion of host-name elements with numeric ranges.
///
///   element ::= eltpat ("," eltpat)*
///   eltpat  ::= (literal | "[" range ("," range)* "]")+ "*"?
///   range   ::= n | n "-" m
///
/// `expand_element("c[1-2]-[5,7]")` gives c1-5, c1-7, c2-5, c2-7.  A trailing '*' is kept on the
/// expanded strings, the caller decides what it means.
use anyhow::{bail, Result};
use std::iter::Peekable;
use std::str::Chars;

pub fn expand_element(s: &str) -> Result<Vec<String>> {
    let mut input = s.chars().peekable();
    let mut result = vec![];
    loop {
        result.extend(expand_eltpat(&mut input)?);
        match input.next() {
            None => break,
            Some(',') => {}
            Some(c) => bail!("Unexpected '{c}' in host pattern"),
        }
    }
    Ok(result)
}

// Consumes up to but not including a ',' at the outer level, or to the end of input.
fn expand_eltpat(input: &mut Peekable<Chars>) -> Result<Vec<String>> {
    let mut prefixes = vec![String::new()];
    let mut empty = true;
    while let Some(&c) = input.peek() {
        match c {
            ',' => break,
            '*' => {
                input.next();
                prefixes.iter_mut().for_each(|p| p.push('*'));
                empty = false;
                if input.peek().is_some_and(|c| *c != ',') {
                    bail!("'*' must be last in host pattern element")
                }
                break;
            }
            '[' => {
                input.next();
                let numbers = parse_brackets(input)?;
                prefixes = prefixes
                    .iter()
                    .flat_map(|p| numbers.iter().map(move |n| format!("{p}{n}")))
                    .collect();
                empty = false;
            }
            _ => {
                input.next();
                prefixes.iter_mut().for_each(|p| p.push(c));
                empty = false;
            }
        }
    }
    if empty {
        bail!("Empty pattern in input")
    }
    Ok(prefixes)
}

// The '[' has been consumed; this consumes through the ']'.
fn parse_brackets(input: &mut Peekable<Chars>) -> Result<Vec<u32>> {
    let mut numbers = vec![];
    loop {
        let lo = parse_u32(input)?;
        if input.peek() == Some(&'-') {
            input.next();
            let hi = parse_u32(input)?;
            if lo > hi {
                bail!("Invalid range {lo}-{hi}");
            }
            if hi - lo > 10000 {
                bail!("Range too large");
            }
            numbers.extend(lo..=hi);
        } else {
            numbers.push(lo);
        }
        match input.next() {
            Some(']') => return Ok(numbers),
            Some(',') => {}
            Some(c) => bail!("Expected ',' or ']' but saw '{c}'"),
            None => bail!("Unexpected end of input"),
        }
    }
}

fn parse_u32(input: &mut Peekable<Chars>) -> Result<u32> {
    let mut n: u64 = 0;
    let mut any = false;
    while let Some(d) = input.peek().and_then(|c| c.to_digit(10)) {
        input.next();
        n = n * 10 + d as u64;
        if n > u32::MAX as u64 {
            bail!("Number out of range");
        }
        any = true;
    }
    if !any {
        bail!("Expected number");
    }
    Ok(n as u32)
}

#[cfg(test)]
fn strs(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_expand_element() {
    assert_eq!(
        expand_element("c1-[0-1],c2-[2-3]").unwrap(),
        strs(&["c1-0", "c1-1", "c2-2", "c2-3"])
    );
    assert_eq!(expand_element("c1-0,c2-1").unwrap(), strs(&["c1-0", "c2-1"]));
    assert_eq!(
        expand_element("c3-[1-3,5,9-10]").unwrap(),
        strs(&["c3-1", "c3-2", "c3-3", "c3-5", "c3-9", "c3-10"])
    );
    assert_eq!(
        expand_element("c[1-2]-[5,7]").unwrap(),
        strs(&["c1-5", "c1-7", "c2-5", "c2-7"])
    );
    assert_eq!(expand_element("gpu-*").unwrap(), strs(&["gpu-*"]));
}

#[test]
fn test_expand_element_errors() {
    assert!(expand_element("").is_err());
    assert!(expand_element("a,,b").is_err());
    assert!(expand_element("c[1-").is_err());
    assert!(expand_element("c[3-1]").is_err());
    assert!(expand_element("c[x]").is_err());
    assert!(expand_element("a*b").is_err());
}
