/// Parser for the tagged CSV files holding Slurm `sacct` data, one record per job step.
///
/// The structure follows the sample parser: a field with bad form or an unknown tag is dropped and
/// counted as a soft error, a field with a known tag and a bad value drops the record.  Mandatory
/// fields are `v`, `End` and a nonzero job ID (from `JobIDRaw`).
use crate::numbers::{
    parse_slurm_bytes, parse_slurm_elapsed, parse_slurm_elapsed32, parse_time, parse_u32, parse_u8,
};
use crate::repr::SacctInfo;

use anyhow::Result;
use rustutils::{log, ustr_empty, CsvToken, CsvTokenizer, UstrAllocator, CSV_EQ_SENTINEL};
use std::io;
use ustr::Ustr;

pub fn parse_sacct_csv<R: io::Read>(
    input: R,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<(Vec<SacctInfo>, usize)> {
    let mut records = vec![];
    let mut soft_errors = 0;
    let mut tokenizer = CsvTokenizer::new(input);
    let mut end_of_input = false;

    'line_loop: while !end_of_input {
        let mut any_matched = false;
        let mut info = SacctInfo {
            end: i64::MAX,
            ..Default::default()
        };

        'field_loop: loop {
            let (start, lim, eqloc) = match tokenizer.get() {
                Err(e) => {
                    if e.downcast_ref::<io::Error>().is_some() {
                        return Err(e);
                    }
                    soft_errors += 1;
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

            if eqloc == CSV_EQ_SENTINEL {
                if verbose {
                    slog::info!(log(), "Dropping field with bad form: {}",
                                tokenizer.get_str(start, lim));
                }
                soft_errors += 1;
                continue 'field_loop;
            }

            let val = tokenizer.get_bytes(eqloc, lim);
            let is = |tag: &[u8]| tokenizer.match_tag(tag, start, eqloc);
            let mut matched = true;
            let mut failed = false;

            if is(b"Account") {
                info.account = ustrs.alloc_bytes(val);
            } else if is(b"AllocTRES") {
                info.req_gpus = parse_alloc_tres(val, ustrs);
            } else if is(b"AveCPU") {
                failed = bad(parse_slurm_elapsed(val).map(|v| info.ave_cpu = v));
            } else if is(b"AveDiskRead") {
                failed = bad(parse_slurm_bytes(val).map(|v| info.ave_disk_read = v));
            } else if is(b"AveDiskWrite") {
                failed = bad(parse_slurm_bytes(val).map(|v| info.ave_disk_write = v));
            } else if is(b"AveRSS") {
                failed = bad(parse_slurm_bytes(val).map(|v| info.ave_rss = v));
            } else if is(b"AveVMSize") {
                failed = bad(parse_slurm_bytes(val).map(|v| info.ave_vm_size = v));
            } else if is(b"ElapsedRaw") {
                failed = bad(parse_u32(val).map(|v| info.elapsed_raw = v));
            } else if is(b"ExitCode") {
                match val.iter().position(|c| *c == b':') {
                    None => failed = bad(parse_u8(val).map(|v| info.exit_code = v)),
                    Some(sep) => {
                        failed = bad(parse_u8(&val[..sep]).map(|v| info.exit_code = v))
                            | bad(parse_u8(&val[sep + 1..]).map(|v| info.exit_signal = v));
                    }
                }
            } else if is(b"End") {
                failed = bad(parse_time(val).map(|v| info.end = v));
            } else if is(b"JobID") {
                // Array and het jobs set their own fields here; JobID proper and the step come
                // from JobIDRaw.
                let (id, step) = split_step(val, ustrs);
                if let Some(sep) = id.iter().position(|c| *c == b'_' || *c == b'+') {
                    match (parse_u32(&id[..sep]), parse_u32(&id[sep + 1..])) {
                        (Ok(job), Ok(ix)) => {
                            if id[sep] == b'_' {
                                info.array_job_id = job;
                                info.array_index = ix;
                                info.array_step = step;
                            } else {
                                info.het_job_id = job;
                                info.het_offset = ix;
                                info.het_step = step;
                            }
                        }
                        _ => failed = true,
                    }
                }
            } else if is(b"JobIDRaw") {
                let (id, step) = split_step(val, ustrs);
                failed = bad(parse_u32(id).map(|v| info.job_id = v));
                info.job_step = step;
            } else if is(b"JobName") {
                info.job_name = ustrs.alloc_bytes(val);
            } else if is(b"Layout") {
                info.layout = ustrs.alloc_bytes(val);
            } else if is(b"MaxRSS") {
                failed = bad(parse_slurm_bytes(val).map(|v| info.max_rss = v));
            } else if is(b"MaxVMSize") {
                failed = bad(parse_slurm_bytes(val).map(|v| info.max_vm_size = v));
            } else if is(b"MinCPU") {
                failed = bad(parse_slurm_elapsed(val).map(|v| info.min_cpu = v));
            } else if is(b"NodeList") {
                info.node_list = ustrs.alloc_bytes(val);
            } else if is(b"Partition") {
                info.partition = ustrs.alloc_bytes(val);
            } else if is(b"Priority") {
                // Recognized, not recorded.
            } else if is(b"ReqCPUS") {
                failed = bad(parse_u32(val).map(|v| info.req_cpus = v));
            } else if is(b"ReqMem") {
                failed = bad(parse_slurm_bytes(val).map(|v| info.req_mem = v));
            } else if is(b"ReqNodes") {
                failed = bad(parse_u32(val).map(|v| info.req_nodes = v));
            } else if is(b"Reservation") {
                info.reservation = ustrs.alloc_bytes(val);
            } else if is(b"Start") {
                failed = bad(parse_time(val).map(|v| info.start = v));
            } else if is(b"State") {
                // "CANCELLED by 1234" becomes "CANCELLED".
                let word = match val.iter().position(|c| *c == b' ') {
                    Some(loc) => &val[..loc],
                    None => val,
                };
                info.state = ustrs.alloc_bytes(word);
            } else if is(b"Submit") {
                failed = bad(parse_time(val).map(|v| info.submit = v));
            } else if is(b"Suspended") {
                failed = bad(parse_slurm_elapsed32(val).map(|v| info.suspended = v));
            } else if is(b"SystemCPU") {
                failed = bad(parse_slurm_elapsed(val).map(|v| info.system_cpu = v));
            } else if is(b"TimelimitRaw") {
                // Minutes
                failed = bad(parse_u32(val).map(|v| info.timelimit_raw = v.saturating_mul(60)));
            } else if is(b"User") {
                info.user = ustrs.alloc_bytes(val);
            } else if is(b"UserCPU") {
                failed = bad(parse_slurm_elapsed(val).map(|v| info.user_cpu = v));
            } else if is(b"v") {
                info.version = ustrs.alloc_bytes(val);
            } else {
                matched = false;
            }

            if matched {
                any_matched = true;
            } else {
                if verbose {
                    slog::info!(log(), "Dropping field with unknown name: {}",
                                tokenizer.get_str(start, eqloc - 1));
                }
                soft_errors += 1;
            }
            if failed {
                if verbose {
                    slog::info!(log(), "Dropping record with illegal/unparseable value: {}",
                                tokenizer.get_str(start, lim));
                }
                soft_errors += 1;
                skip_to_eol(&mut tokenizer, &mut end_of_input)?;
                continue 'line_loop;
            }
        } // Field loop

        if !any_matched {
            continue 'line_loop;
        }

        if info.version == ustr_empty() || info.end == i64::MAX || info.job_id == 0 {
            if verbose {
                slog::info!(log(), "Dropping record with missing mandatory field(s)");
            }
            soft_errors += 1;
            continue 'line_loop;
        }

        records.push(info);
    } // Line loop

    Ok((records, soft_errors))
}

fn bad(r: Result<()>) -> bool {
    r.is_err()
}

// "1234.batch" -> ("1234", "batch"); without a dot the step is empty.
fn split_step<'a>(val: &'a [u8], ustrs: &mut dyn UstrAllocator) -> (&'a [u8], Ustr) {
    match val.iter().position(|c| *c == b'.') {
        Some(sep) => (&val[..sep], ustrs.alloc_bytes(&val[sep + 1..])),
        None => (val, ustr_empty()),
    }
}

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

/// Extract the GPU requests from an AllocTRES string.  "gres/gpu=n" becomes "*=n" and
/// "gres/gpu:model=n" becomes "model=n"; other resources are ignored.  Multiple GPU entries are
/// joined with ",".
///
///   "billing=20,cpu=20,gres/gpu:rtx30=1,gres/gpu=1,mem=50G,node=1" -> "rtx30=1,*=1"

pub fn parse_alloc_tres(val: &[u8], ustrs: &mut dyn UstrAllocator) -> Ustr {
    let mut t: Vec<u8> = vec![];
    for part in val.split(|c| *c == b',') {
        if part.len() > 8 && part.starts_with(b"gres/gpu") {
            if !t.is_empty() {
                t.push(b',');
            }
            if part[8] == b'=' {
                t.push(b'*');
                t.extend_from_slice(&part[8..]);
            } else {
                t.extend_from_slice(&part[9..]);
            }
        }
    }
    ustrs.alloc_bytes(&t)
}

#[cfg(test)]
use rustutils::UstrCache;

#[test]
fn test_parse_alloc_tres() {
    let mut u = UstrCache::new();
    assert_eq!(
        parse_alloc_tres(b"billing=20,cpu=20,gres/gpu:rtx30=1,gres/gpu=1,mem=50G,node=1", &mut u)
            .as_str(),
        "rtx30=1,*=1"
    );
    assert_eq!(parse_alloc_tres(b"billing=1,cpu=1", &mut u).as_str(), "");
    assert_eq!(parse_alloc_tres(b"", &mut u).as_str(), "");
}

#[test]
fn test_parse_sacct_csv() {
    let text = "\
v=0.1.0,JobID=1200_34.0,JobIDRaw=1234.0,User=bob,Account=ec30,State=CANCELLED by 1234,Start=2024-01-01T00:00:10Z,End=2024-01-01T01:00:10Z,Submit=2024-01-01T00:00:00Z,ElapsedRaw=3600,ExitCode=2:9,TimelimitRaw=90,AveCPU=01:02,MaxRSS=1025M,ReqMem=4G,AllocTRES=gres/gpu=2,Priority=10,NodeList=c1-[5-6]
v=0.1.0,JobID=2000+1,JobIDRaw=2001,End=2024-01-01T01:00:10Z,Mystery=1,junk
v=0.1.0,JobIDRaw=3000,End=yesterday
v=0.1.0,JobIDRaw=3001
";
    let (rs, soft) = parse_sacct_csv(text.as_bytes(), &mut UstrCache::new(), false).unwrap();
    // Mystery, junk, bad End, missing End
    assert_eq!(soft, 4);
    assert_eq!(rs.len(), 2);
    let r = &rs[0];
    assert_eq!((r.job_id, r.job_step.as_str()), (1234, "0"));
    assert_eq!((r.array_job_id, r.array_index, r.array_step.as_str()), (1200, 34, "0"));
    assert_eq!(r.state.as_str(), "CANCELLED");
    assert_eq!(r.end - r.start, 3600);
    assert_eq!(r.start - r.submit, 10);
    assert_eq!((r.exit_code, r.exit_signal), (2, 9));
    assert_eq!(r.timelimit_raw, 90 * 60);
    assert_eq!(r.ave_cpu, 62);
    assert_eq!((r.max_rss, r.req_mem), (2, 4));
    assert_eq!(r.req_gpus.as_str(), "*=2");
    assert_eq!(r.node_list.as_str(), "c1-[5-6]");
    assert!(r.is_main());

    let r = &rs[1];
    assert_eq!((r.het_job_id, r.het_offset), (2000, 1));
    assert_eq!(r.job_id, 2001);
    assert!(!r.is_main());
}
