/// Fast value parsers for the fields produced by the CSV tokenizer.  They work on byte slices and
/// accept only what the producers actually emit.
use anyhow::{bail, Result};
use rustutils::parse_timestamp;

pub fn parse_u64(bs: &[u8]) -> Result<u64> {
    if bs.is_empty() {
        bail!("Empty")
    }
    let mut n = 0u64;
    for c in bs {
        if !c.is_ascii_digit() {
            bail!("Not a digit")
        }
        n = match n.checked_mul(10).and_then(|n| n.checked_add((c - b'0') as u64)) {
            Some(m) => m,
            None => bail!("Out of range"),
        };
    }
    Ok(n)
}

pub fn parse_u32(bs: &[u8]) -> Result<u32> {
    match u32::try_from(parse_u64(bs)?) {
        Ok(n) => Ok(n),
        Err(_) => bail!("Overflow"),
    }
}

pub fn parse_u8(bs: &[u8]) -> Result<u8> {
    match u8::try_from(parse_u64(bs)?) {
        Ok(n) => Ok(n),
        Err(_) => bail!("Overflow"),
    }
}

/// Unsigned decimal numbers with an optional fraction, no exponent.  "nan", "inf", "+inf",
/// "infinity" and "+infinity" are recognized case-insensitively (the Rust and Go formatters have
/// both been used to produce the data), and rejected when `filter_inf_nan` is set.  Accuracy is
/// adequate for sonar data, not more.

pub fn parse_float(bs: &[u8], filter_inf_nan: bool) -> Result<f64> {
    if bs.is_empty() {
        bail!("Empty")
    }
    match bs[0] {
        b'-' => bail!("Not a digit"),
        b'+' | b'i' | b'I' => {
            let body = if bs[0] == b'+' { &bs[1..] } else { bs };
            if body.eq_ignore_ascii_case(b"inf") || body.eq_ignore_ascii_case(b"infinity") {
                if filter_inf_nan {
                    bail!("Infinity")
                }
                return Ok(f64::INFINITY);
            }
            bail!("Not a digit")
        }
        b'n' | b'N' => {
            if bs.eq_ignore_ascii_case(b"nan") {
                if filter_inf_nan {
                    bail!("NaN")
                }
                return Ok(f64::NAN);
            }
            bail!("Not a digit")
        }
        _ => {}
    }
    let mut n = 0.0f64;
    let mut i = 0;
    while i < bs.len() && bs[i] != b'.' {
        if !bs[i].is_ascii_digit() {
            bail!("Not a digit")
        }
        n = n * 10.0 + (bs[i] - b'0') as f64;
        i += 1;
    }
    if i < bs.len() {
        i += 1;
        if i == bs.len() {
            bail!("Empty fraction")
        }
        let mut f = 0.1;
        while i < bs.len() {
            if !bs[i].is_ascii_digit() {
                bail!("Not a digit")
            }
            n += (bs[i] - b'0') as f64 * f;
            f *= 0.1;
            i += 1;
        }
    }
    Ok(n)
}

/// RFC3339 with or without a fractional part, to Unix seconds.

pub fn parse_time(bs: &[u8]) -> Result<i64> {
    match std::str::from_utf8(bs) {
        Ok(s) => Ok(parse_timestamp(s)?.timestamp()),
        Err(_) => bail!("Bad timestamp"),
    }
}

/// Slurm elapsed time, to seconds.  The documented format is [DD-[HH:]]MM:SS[.micros] but the
/// documentation is inconsistent about which parts are optional and how wide they are, so we parse
/// the simplified grammar
///
///   (DD-)?(HH:)?MM:SS(.micros)?
///
/// by looking for terminators.  The micros are dropped.

pub fn parse_slurm_elapsed(bs: &[u8]) -> Result<u64> {
    let (mut n, mut i) = number_at(bs, 0)?;
    let mut days = None;
    let mut hours = None;
    let mut minutes = None;
    if i < bs.len() && bs[i] == b'-' {
        days = Some(n);
        (n, i) = number_at(bs, i + 1)?;
    }
    while i < bs.len() && bs[i] == b':' {
        if hours.is_some() {
            bail!("Bad elapsed time format")
        }
        if minutes.is_some() {
            hours = minutes;
        }
        minutes = Some(n);
        (n, i) = number_at(bs, i + 1)?;
    }
    let Some(minutes) = minutes else {
        bail!("Bad elapsed time format")
    };
    let seconds = n;
    if i < bs.len() && bs[i] == b'.' {
        (_, i) = number_at(bs, i + 1)?;
    }
    if i < bs.len() {
        bail!("Bad elapsed time format")
    }
    let total = [(days, 86400), (hours, 3600), (Some(minutes), 60)]
        .into_iter()
        .try_fold(seconds, |acc, (v, scale)| {
            v.unwrap_or(0).checked_mul(scale)?.checked_add(acc)
        });
    match total {
        Some(t) => Ok(t),
        None => bail!("Elapsed time out of range"),
    }
}

pub fn parse_slurm_elapsed32(bs: &[u8]) -> Result<u32> {
    match u32::try_from(parse_slurm_elapsed(bs)?) {
        Ok(n) => Ok(n),
        Err(_) => bail!("Bad elapsed time format"),
    }
}

fn number_at(bs: &[u8], start: usize) -> Result<(u64, usize)> {
    let mut i = start;
    while i < bs.len() && bs[i].is_ascii_digit() {
        i += 1;
    }
    if i == start {
        bail!("Bad elapsed time format")
    }
    Ok((parse_u64(&bs[start..i])?, i))
}

/// An integer or decimal number of bytes, possibly followed by K, M or G.  The result is GiB,
/// always rounded up.

pub fn parse_slurm_bytes(bs: &[u8]) -> Result<u32> {
    let Some(last) = bs.last() else {
        bail!("Empty")
    };
    let (mpy, digits) = match last {
        b'G' => (1024.0 * 1024.0 * 1024.0, &bs[..bs.len() - 1]),
        b'M' => (1024.0 * 1024.0, &bs[..bs.len() - 1]),
        b'K' => (1024.0, &bs[..bs.len() - 1]),
        _ => (1.0, bs),
    };
    let n = parse_float(digits, true)?;
    Ok(((n * mpy) / (1024.0 * 1024.0 * 1024.0)).ceil() as u32)
}

#[test]
fn test_parse_ints() {
    assert_eq!(parse_u64(b"12345").unwrap(), 12345);
    assert!(parse_u64(b"").is_err());
    assert!(parse_u64(b"12a").is_err());
    assert!(parse_u64(b"-1").is_err());
    assert!(parse_u64(b"99999999999999999999").is_err());
    assert_eq!(parse_u32(b"4294967295").unwrap(), u32::MAX);
    assert!(parse_u32(b"4294967296").is_err());
    assert_eq!(parse_u8(b"255").unwrap(), 255);
    assert!(parse_u8(b"256").is_err());
}

#[test]
fn test_parse_float() {
    assert_eq!(parse_float(b"12", true).unwrap(), 12.0);
    assert!((parse_float(b"12.25", true).unwrap() - 12.25).abs() < 1e-9);
    assert!(parse_float(b"12.", true).is_err());
    assert!(parse_float(b"-1", true).is_err());
    assert!(parse_float(b"1e5", true).is_err());
    assert!(parse_float(b"", true).is_err());
    for s in [&b"NaN"[..], b"nan", b"inf", b"+Inf", b"Infinity", b"+INFINITY"] {
        assert!(parse_float(s, true).is_err());
    }
    assert!(parse_float(b"NaN", false).unwrap().is_nan());
    assert_eq!(parse_float(b"+Inf", false).unwrap(), f64::INFINITY);
    assert_eq!(parse_float(b"inf", false).unwrap(), f64::INFINITY);
    assert!(parse_float(b"+nan", false).is_err());
}

#[test]
fn test_parse_slurm_elapsed() {
    assert_eq!(parse_slurm_elapsed(b"01:02").unwrap(), 62);
    assert_eq!(parse_slurm_elapsed(b"03:01:02").unwrap(), 3 * 3600 + 62);
    assert_eq!(parse_slurm_elapsed(b"2-03:01:02").unwrap(), 2 * 86400 + 3 * 3600 + 62);
    assert_eq!(parse_slurm_elapsed(b"2-01:02.345").unwrap(), 2 * 86400 + 62);
    assert!(parse_slurm_elapsed(b"12").is_err());
    assert!(parse_slurm_elapsed(b"1:2:3:4").is_err());
    assert!(parse_slurm_elapsed(b"1:2x").is_err());
    assert!(parse_slurm_elapsed(b"").is_err());
    assert!(parse_slurm_elapsed(b"999999999999999999-00:00:00").is_err());
    assert!(parse_slurm_elapsed(b"18446744073709551615:00").is_err());
    assert_eq!(parse_slurm_elapsed(b"0:18446744073709551615").unwrap(), u64::MAX);
}

#[test]
fn test_parse_slurm_bytes() {
    assert_eq!(parse_slurm_bytes(b"1G").unwrap(), 1);
    assert_eq!(parse_slurm_bytes(b"1.5G").unwrap(), 2);
    assert_eq!(parse_slurm_bytes(b"1025M").unwrap(), 2);
    assert_eq!(parse_slurm_bytes(b"100K").unwrap(), 1);
    assert_eq!(parse_slurm_bytes(b"0").unwrap(), 0);
    assert!(parse_slurm_bytes(b"").is_err());
    assert!(parse_slurm_bytes(b"G").is_err());
}

#[test]
fn test_parse_time() {
    assert_eq!(parse_time(b"2024-01-01T00:00:10Z").unwrap(), 1704067210);
    assert_eq!(parse_time(b"2024-01-01T01:00:10.5+01:00").unwrap(), 1704067210);
    assert!(parse_time(b"2024-01-01").is_err());
}
