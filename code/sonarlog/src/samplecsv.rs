/// Parser for CSV files holding Sonar `sample` data, both the tagged ("name=value") form and, under
/// the feature "untagged_sonar_data", the positional form from sonar 0.6.0 and earlier.
///
/// NOTE:
///
/// - Tagged and untagged records can be mixed in a file in any order; this allows files to be
///   catenated and sonar to be updated at any time.
///
/// - A corrupted record is dropped and counted as a soft error, never reported as an error.
///   Appending-to-log is not atomic wrt reading-from-log and it is somewhat likely that the reader
///   will see a partly-written record.
///
/// - A field without a tag in a tagged record is dropped, but the record is kept.  A field with an
///   unknown tag is dropped.  A field with a known tag but an unparseable value drops the record.
///
/// - Only I/O errors are returned as errors.
use crate::numbers::{parse_float, parse_time, parse_u32, parse_u64, parse_u8};
use crate::repr::{
    CpuSamples, EncodedCpuSamples, EncodedGpuSamples, GpuSamples, LogEntry, FLAG_HEARTBEAT,
};

use anyhow::Result;
use rustutils::{log, ustr_empty, CsvToken, CsvTokenizer, GpuSet, UstrAllocator, CSV_EQ_SENTINEL};
use std::io;
use ustr::Ustr;

#[derive(Default)]
pub struct SampleData {
    pub samples: Vec<LogEntry>,
    pub cpu_samples: Vec<CpuSamples>,
    pub gpu_samples: Vec<GpuSamples>,
    pub soft_errors: usize,
    /// Set when the parse ended early; the vectors hold what was parsed before the error.
    pub hard_error: Option<anyhow::Error>,
}

pub fn parse_sample_csv<R: io::Read>(
    input: R,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<SampleData> {
    let mut result = SampleData::default();
    let mut tokenizer = CsvTokenizer::new(input);
    let heartbeat = ustrs.alloc("_heartbeat_");
    #[cfg(feature = "untagged_sonar_data")]
    let v060 = ustrs.alloc("0.6.0");
    let mut end_of_input = false;

    #[derive(PartialEq)]
    enum Format {
        Unknown,
        Untagged,
        Tagged,
    }

    'line_loop: while !end_of_input
    /* every line */
    {
        // Find the fields and then convert them.  Duplicates are not allowed.  Mandatory fields
        // are really required.
        let mut version: Option<Ustr> = None;
        let mut timestamp: Option<i64> = None;
        let mut hostname: Option<Ustr> = None;
        let mut num_cores: Option<u32> = None;
        let mut memtotal_kb: Option<u64> = None;
        let mut user: Option<Ustr> = None;
        let mut pid: Option<u32> = None;
        let mut ppid: Option<u32> = None;
        let mut job_id: Option<u32> = None;
        let mut command: Option<Ustr> = None;
        let mut cpu_pct: Option<f32> = None;
        let mut cpu_kb: Option<u64> = None;
        let mut rssanon_kb: Option<u64> = None;
        let mut gpus: Option<GpuSet> = None;
        let mut gpu_pct: Option<f32> = None;
        let mut gpumem_pct: Option<f32> = None;
        let mut gpu_kb: Option<u64> = None;
        let mut gpu_fail: Option<u8> = None;
        let mut cputime_sec: Option<u64> = None;
        let mut rolledup: Option<u32> = None;
        let mut load: Option<Box<[u8]>> = None;
        let mut gpuinfo: Option<Box<[u8]>> = None;
        let mut format = Format::Unknown;
        #[cfg(feature = "untagged_sonar_data")]
        let mut untagged_position = 0;

        'field_loop: loop
        /* every field on a line */
        {
            let (start, lim, eqloc) = match tokenizer.get() {
                Err(e) => {
                    if e.downcast_ref::<io::Error>().is_some() {
                        return Err(e);
                    }
                    result.soft_errors += 1;
                    // The tokenizer is positioned at the end of the line.
                    if let Ok(CsvToken::EOF) = tokenizer.get() {
                        end_of_input = true;
                    }
                    continue 'line_loop;
                }
                Ok(CsvToken::EOL) => break 'field_loop,
                Ok(CsvToken::EOF) => {
                    end_of_input = true;
                    break 'field_loop;
                }
                Ok(CsvToken::Field { start, lim, eqloc }) => (start, lim, eqloc),
            };

            if format == Format::Unknown {
                format = if eqloc == CSV_EQ_SENTINEL {
                    Format::Untagged
                } else {
                    Format::Tagged
                };
            }

            let mut matched = false;
            let mut failed = false;
            match format {
                Format::Unknown => {
                    panic!("Unexpected");
                }
                Format::Untagged => {
                    #[cfg(not(feature = "untagged_sonar_data"))]
                    {
                        if verbose {
                            slog::info!(log(), "Dropping untagged record");
                        }
                        result.soft_errors += 1;
                        skip_to_eol(&mut tokenizer, &mut end_of_input)?;
                        continue 'line_loop;
                    }

                    // Old old format (Saga and Fram until 2024)
                    // 0  timestamp
                    // 1  hostname
                    // 2  numcores
                    // 3  username
                    // 4  jobid
                    // 5  command
                    // 6  cpu_pct
                    // 7  mem_kib
                    //
                    // Fields beyond these were briefly deployed on some nodes and are ignored.
                    #[cfg(feature = "untagged_sonar_data")]
                    {
                        let val = tokenizer.get_bytes(start, lim);
                        version = Some(v060);
                        matched = true;
                        match untagged_position {
                            0 => match parse_time(val) {
                                Ok(t) => timestamp = Some(t),
                                Err(_) => failed = true,
                            },
                            1 => hostname = Some(ustrs.alloc_bytes(val)),
                            2 => match parse_u32(val) {
                                Ok(n) => num_cores = Some(n),
                                Err(_) => failed = true,
                            },
                            3 => user = Some(ustrs.alloc_bytes(val)),
                            4 => match parse_u32(val) {
                                // Untagged data do not carry a PID, so use the job ID in its
                                // place.  This is mostly OK.  Sometimes the job ID is zero, for
                                // root jobs; clients must handle that.
                                Ok(n) => {
                                    job_id = Some(n);
                                    pid = Some(n);
                                }
                                Err(_) => failed = true,
                            },
                            5 => command = Some(ustrs.alloc_bytes(val)),
                            6 => match parse_float(val, true) {
                                Ok(n) => cpu_pct = Some(n as f32),
                                Err(_) => failed = true,
                            },
                            7 => match parse_u64(val) {
                                Ok(n) => cpu_kb = Some(n),
                                Err(_) => failed = true,
                            },
                            _ => {}
                        }
                        untagged_position += 1;
                    }
                }
                Format::Tagged => {
                    if eqloc == CSV_EQ_SENTINEL {
                        if verbose {
                            slog::info!(log(), "Dropping field with bad form: {}",
                                        tokenizer.get_str(start, lim));
                        }
                        result.soft_errors += 1;
                        continue 'field_loop;
                    }

                    let val = tokenizer.get_bytes(eqloc, lim);

                    // The first two characters will always be present because eqloc >= start+2.
                    match tokenizer.buf_at(start) {
                        b'c' => {
                            if tokenizer.match_tag(b"cmd", start, eqloc) && command.is_none() {
                                command = Some(ustrs.alloc_bytes(val));
                                matched = true;
                            } else if tokenizer.match_tag(b"cores", start, eqloc)
                                && num_cores.is_none()
                            {
                                (num_cores, failed) = get(parse_u32(val));
                                matched = true;
                            } else if tokenizer.match_tag(b"cpu%", start, eqloc)
                                && cpu_pct.is_none()
                            {
                                (cpu_pct, failed) = get_f32(val);
                                matched = true;
                            } else if tokenizer.match_tag(b"cpukib", start, eqloc)
                                && cpu_kb.is_none()
                            {
                                (cpu_kb, failed) = get(parse_u64(val));
                                matched = true;
                            } else if tokenizer.match_tag(b"cputime_sec", start, eqloc)
                                && cputime_sec.is_none()
                            {
                                (cputime_sec, failed) = get(parse_u64(val));
                                matched = true;
                            }
                        }
                        b'e' => {
                            // Obsolete, ignore.
                            matched = tokenizer.match_tag(b"epoch", start, eqloc);
                        }
                        b'g' => {
                            if tokenizer.match_tag(b"gpus", start, eqloc) && gpus.is_none() {
                                match GpuSet::from_list(tokenizer.get_str(eqloc, lim)) {
                                    Ok(g) => gpus = Some(g),
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            } else if tokenizer.match_tag(b"gpu%", start, eqloc)
                                && gpu_pct.is_none()
                            {
                                (gpu_pct, failed) = get_f32(val);
                                matched = true;
                            } else if tokenizer.match_tag(b"gpumem%", start, eqloc)
                                && gpumem_pct.is_none()
                            {
                                (gpumem_pct, failed) = get_f32(val);
                                matched = true;
                            } else if tokenizer.match_tag(b"gpukib", start, eqloc)
                                && gpu_kb.is_none()
                            {
                                (gpu_kb, failed) = get(parse_u64(val));
                                matched = true;
                            } else if tokenizer.match_tag(b"gpufail", start, eqloc)
                                && gpu_fail.is_none()
                            {
                                (gpu_fail, failed) = get(parse_u8(val));
                                matched = true;
                            } else if tokenizer.match_tag(b"gpuinfo", start, eqloc)
                                && gpuinfo.is_none()
                            {
                                gpuinfo = Some(val.into());
                                matched = true;
                            }
                        }
                        b'h' => {
                            if tokenizer.match_tag(b"host", start, eqloc) && hostname.is_none() {
                                hostname = Some(ustrs.alloc_bytes(val));
                                matched = true;
                            }
                        }
                        b'j' => {
                            if tokenizer.match_tag(b"job", start, eqloc) && job_id.is_none() {
                                (job_id, failed) = get(parse_u32(val));
                                matched = true;
                            }
                        }
                        b'l' => {
                            if tokenizer.match_tag(b"load", start, eqloc) && load.is_none() {
                                load = Some(val.into());
                                matched = true;
                            }
                        }
                        b'm' => {
                            if tokenizer.match_tag(b"memtotalkib", start, eqloc)
                                && memtotal_kb.is_none()
                            {
                                (memtotal_kb, failed) = get(parse_u64(val));
                                matched = true;
                            }
                        }
                        b'p' => {
                            if tokenizer.match_tag(b"pid", start, eqloc) && pid.is_none() {
                                (pid, failed) = get(parse_u32(val));
                                matched = true;
                            } else if tokenizer.match_tag(b"ppid", start, eqloc) && ppid.is_none()
                            {
                                (ppid, failed) = get(parse_u32(val));
                                matched = true;
                            }
                        }
                        b'r' => {
                            if tokenizer.match_tag(b"rssanonkib", start, eqloc)
                                && rssanon_kb.is_none()
                            {
                                (rssanon_kb, failed) = get(parse_u64(val));
                                matched = true;
                            } else if tokenizer.match_tag(b"rolledup", start, eqloc)
                                && rolledup.is_none()
                            {
                                (rolledup, failed) = get(parse_u32(val));
                                matched = true;
                            }
                        }
                        b't' => {
                            if tokenizer.match_tag(b"time", start, eqloc) && timestamp.is_none() {
                                (timestamp, failed) = get(parse_time(val));
                                matched = true;
                            }
                        }
                        b'u' => {
                            if tokenizer.match_tag(b"user", start, eqloc) && user.is_none() {
                                user = Some(ustrs.alloc_bytes(val));
                                matched = true;
                            }
                        }
                        b'v' => {
                            if tokenizer.match_tag(b"v", start, eqloc) && version.is_none() {
                                version = Some(ustrs.alloc_bytes(val));
                                matched = true;
                            }
                        }
                        _ => {}
                    }
                    if !matched {
                        if verbose {
                            slog::info!(log(), "Dropping field with unknown name: {}",
                                        tokenizer.get_str(start, eqloc - 1));
                        }
                        result.soft_errors += 1;
                    }
                }
            }

            // Four cases:
            //
            //   matched && !failed - field matched a tag, value is good
            //   matched && failed - field matched a tag, value is bad
            //   !matched && !failed - field did not match any tag
            //   !matched && failed - impossible
            //
            // The second case suggests something bad, so discard the record in this case.
            if failed {
                if verbose {
                    slog::info!(log(), "Dropping record with illegal/unparseable value: {}",
                                tokenizer.get_str(start, lim));
                }
                result.soft_errors += 1;
                skip_to_eol(&mut tokenizer, &mut end_of_input)?;
                continue 'line_loop;
            }
        } // Field loop

        // Skip entirely empty records.
        if format == Format::Unknown {
            continue 'line_loop;
        }

        // Untagged records do not have optional trailing fields.
        #[cfg(feature = "untagged_sonar_data")]
        if format == Format::Untagged && untagged_position < 8 {
            if verbose {
                slog::info!(log(), "Dropping untagged record with missing fields, got only {}",
                            untagged_position);
            }
            result.soft_errors += 1;
            continue 'line_loop;
        }

        // Check that mandatory fields are present.  Heartbeats need not have a user.
        let (Some(version), Some(timestamp), Some(hostname), Some(command)) =
            (version, timestamp, hostname, command)
        else {
            if verbose {
                slog::info!(log(), "Dropping record with missing mandatory field(s)");
            }
            result.soft_errors += 1;
            continue 'line_loop;
        };
        if version == ustr_empty() || hostname == ustr_empty() || command == ustr_empty() {
            result.soft_errors += 1;
            continue 'line_loop;
        }
        let is_heartbeat = command == heartbeat;
        let user = match user {
            Some(u) if u != ustr_empty() => u,
            _ if is_heartbeat => ustr_empty(),
            _ => {
                if verbose {
                    slog::info!(log(), "Dropping record with missing user");
                }
                result.soft_errors += 1;
                continue 'line_loop;
            }
        };

        // Ship it, with default data for optional fields.

        result.samples.push(LogEntry {
            timestamp,
            memtotal_kb: memtotal_kb.unwrap_or(0),
            cpu_kb: cpu_kb.unwrap_or(0),
            rssanon_kb: rssanon_kb.unwrap_or(0),
            gpu_kb: gpu_kb.unwrap_or(0),
            cputime_sec: cputime_sec.unwrap_or(0),
            version,
            cluster: ustr_empty(),
            hostname,
            user,
            command,
            num_cores: num_cores.unwrap_or(0),
            job_id: job_id.unwrap_or(0),
            pid: pid.unwrap_or(0),
            ppid: ppid.unwrap_or(0),
            cpu_pct: cpu_pct.unwrap_or(0.0),
            gpu_pct: gpu_pct.unwrap_or(0.0),
            gpumem_pct: gpumem_pct.unwrap_or(0.0),
            gpus: gpus.unwrap_or_else(GpuSet::empty),
            rolledup: rolledup.unwrap_or(0),
            gpu_fail: gpu_fail.unwrap_or(0),
            flags: if is_heartbeat { FLAG_HEARTBEAT } else { 0 },
        });
        if let Some(encoded) = load {
            result.cpu_samples.push(CpuSamples {
                timestamp,
                hostname,
                encoded: EncodedCpuSamples::Bytes(encoded),
            });
        }
        if let Some(encoded) = gpuinfo {
            result.gpu_samples.push(GpuSamples {
                timestamp,
                hostname,
                encoded: EncodedGpuSamples::Bytes(encoded),
            });
        }
    } // Line loop

    Ok(result)
}

// Discard the rest of the current line.
fn skip_to_eol<R: io::Read>(tokenizer: &mut CsvTokenizer<R>, end_of_input: &mut bool) -> Result<()> {
    loop {
        match tokenizer.get() {
            Ok(CsvToken::EOL) => return Ok(()),
            Ok(CsvToken::EOF) => {
                *end_of_input = true;
                return Ok(());
            }
            Ok(CsvToken::Field { .. }) => {}
            Err(e) => {
                if e.downcast_ref::<io::Error>().is_some() {
                    return Err(e);
                }
            }
        }
    }
}

fn get<T>(r: Result<T>) -> (Option<T>, bool) {
    match r {
        Ok(v) => (Some(v), false),
        Err(_) => (None, true),
    }
}

fn get_f32(bs: &[u8]) -> (Option<f32>, bool) {
    match parse_float(bs, true) {
        Ok(x) => (Some(x as f32), false),
        Err(_) => (None, true),
    }
}

#[cfg(test)]
use rustutils::UstrCache;

#[cfg(test)]
fn parse_str(text: &str) -> SampleData {
    parse_sample_csv(text.as_bytes(), &mut UstrCache::new(), false).unwrap()
}

#[test]
fn test_parse_tagged() {
    let text = "\
v=0.7.0,time=2023-10-01T10:00:00+02:00,host=ml4.hpc.uio.no,cores=64,memtotalkib=131072,user=larstha,pid=1234,ppid=1,job=4567,cmd=python,cpu%=125.5,cpukib=2048,rssanonkib=1024,\"gpus=0,1\",gpu%=50,gpumem%=10.5,gpukib=3072,gpufail=1,cputime_sec=300,rolledup=2
v=0.7.0,time=2023-10-01T10:05:00+02:00,host=ml4.hpc.uio.no,user=_sonar_,cmd=_heartbeat_,load=[k}1,gpuinfo=fan%=27|28
";
    let d = parse_str(text);
    assert_eq!(d.soft_errors, 0);
    assert_eq!(d.samples.len(), 2);
    let s = &d.samples[0];
    assert_eq!(s.version.as_str(), "0.7.0");
    assert_eq!(s.timestamp, 1696147200);
    assert_eq!(s.hostname.as_str(), "ml4.hpc.uio.no");
    assert_eq!(s.num_cores, 64);
    assert_eq!(s.memtotal_kb, 131072);
    assert_eq!(s.user.as_str(), "larstha");
    assert_eq!((s.pid, s.ppid, s.job_id), (1234, 1, 4567));
    assert_eq!(s.command.as_str(), "python");
    assert_eq!(s.cpu_pct, 125.5);
    assert_eq!((s.cpu_kb, s.rssanon_kb, s.gpu_kb), (2048, 1024, 3072));
    assert_eq!(s.gpus.to_string(), "0,1");
    assert_eq!((s.gpu_pct, s.gpumem_pct), (50.0, 10.5));
    assert_eq!((s.gpu_fail, s.cputime_sec, s.rolledup), (1, 300, 2));
    assert!(!s.is_heartbeat());

    assert!(d.samples[1].is_heartbeat());
    assert_eq!(d.cpu_samples.len(), 1);
    assert_eq!(d.cpu_samples[0].decode().unwrap(), vec![24, 52]);
    assert_eq!(d.gpu_samples.len(), 1);
    assert_eq!(d.gpu_samples[0].decode().unwrap()[1].fan, 28);
}

#[test]
fn test_parse_soft_errors() {
    let text = "\
v=0.7.0,time=2023-10-01T10:00:00Z,host=a,user=u,cmd=c,zappa=1,junk
v=0.7.0,time=2023-10-01T10:00:00Z,host=a,user=u,cmd=c,cpu%=abc
v=0.7.0,time=2023-10-01T10:00:00Z,host=a,cmd=c
v=0.7.0,host=a,user=u,cmd=c
time=2023-10-01T10:00:00Z,host=a,user=u,cmd=c

v=0.7.0,time=2023-10-01T10:00:00Z,host=a,cmd=_heartbeat_
v=0.7.0,time=2023-10-01T10:00:00Z,host=a,user=u,cmd=\"bad\"x
v=0.7.0,time=2023-10-01T10:00:00Z,host=b,user=u,cmd=c";
    let d = parse_str(text);
    // Line 1: two dropped fields, record kept.  Lines 2-4: one each, dropped.  Line 5: no version.
    // Line 6 is empty.  Line 7 is a heartbeat without a user, kept.  Line 8 is a syntax error.
    assert_eq!(d.soft_errors, 2 + 1 + 1 + 1 + 1 + 1);
    assert_eq!(d.samples.len(), 3);
    assert_eq!(d.samples[0].hostname.as_str(), "a");
    assert!(d.samples[1].is_heartbeat());
    assert_eq!(d.samples[2].hostname.as_str(), "b");
}

#[cfg(feature = "untagged_sonar_data")]
#[test]
fn test_parse_untagged() {
    let text = "\
2023-06-23T12:25:01.486240376+00:00,ml1,192,larsbent,2381,python,1.5,4096
2023-06-23T12:25:01.486240376+00:00,ml1,192,larsbent,2381,python,1.5
2023-06-23T12:25:01.486240376+00:00,ml1,x,larsbent,2381,python,1.5,4096
";
    let d = parse_str(text);
    assert_eq!(d.samples.len(), 1);
    assert_eq!(d.soft_errors, 2);
    let s = &d.samples[0];
    assert_eq!(s.version.as_str(), "0.6.0");
    assert_eq!(s.timestamp, 1687523101);
    assert_eq!((s.job_id, s.pid), (2381, 2381));
    assert_eq!(s.num_cores, 192);
    assert_eq!(s.cpu_kb, 4096);
}
