/// The parse workers: a fixed pool of threads, one per logical CPU, that read files on behalf of
/// queries.  Each worker owns a `UstrCache` so that interning on the hot path rarely touches the
/// global string table.
///
/// Requests are closures queued on a shared channel; replies come back on a per-request channel.
/// The results of a multi-file read arrive in no particular order.
use crate::logfile::{FileReader, LogFile, Select};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use rustutils::{log, UstrCache};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce(&mut UstrCache) + Send + 'static>;

struct Pool {
    sender: Mutex<Sender<Job>>,
}

static POOL: Lazy<Pool> = Lazy::new(|| {
    let size = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let (sender, receiver) = channel::<Job>();
    let receiver = Arc::new(Mutex::new(receiver));
    for i in 0..size {
        let receiver = Arc::clone(&receiver);
        if let Err(e) = thread::Builder::new()
            .name(format!("parse-worker-{i}"))
            .spawn(move || worker(receiver))
        {
            slog::error!(log(), "Could not start parse worker: {}", e);
        }
    }
    Pool {
        sender: Mutex::new(sender),
    }
});

fn worker(receiver: Arc<Mutex<Receiver<Job>>>) {
    let mut ustrs = UstrCache::new();
    loop {
        // The guard is a temporary and is released before the job runs.
        let job = receiver.lock().unwrap().recv();
        match job {
            Ok(job) => job(&mut ustrs),
            Err(_) => break,
        }
    }
}

fn submit(job: Job) -> Result<()> {
    if POOL.sender.lock().unwrap().send(job).is_err() {
        bail!("Parse workers are gone")
    }
    Ok(())
}

/// Read the files in parallel and return one vector per file, in arbitrary order, along with the
/// total soft error count.  All files are attempted; if any fail, the error lists every failure.

pub fn read_records_from_files<T: Select>(
    files: &[Arc<LogFile>],
    reader: Arc<dyn FileReader>,
    verbose: bool,
) -> Result<(Vec<Arc<Vec<T>>>, usize)> {
    type Reply<T> = (Arc<LogFile>, Result<(Arc<Vec<T>>, usize)>);
    let (tx, rx) = channel::<Reply<T>>();
    for file in files {
        let file = file.clone();
        let reader = reader.clone();
        let tx = tx.clone();
        submit(Box::new(move |ustrs: &mut UstrCache| {
            let r = file.read_sync::<T>(reader.as_ref(), ustrs, verbose);
            let _ = tx.send((file, r));
        }))?;
    }
    drop(tx);

    let mut results = Vec::with_capacity(files.len());
    let mut soft_errors = 0;
    let mut failures = vec![];
    for _ in 0..files.len() {
        match rx.recv() {
            Ok((_, Ok((data, soft)))) => {
                results.push(data);
                soft_errors += soft;
            }
            Ok((file, Err(e))) => failures.push(format!("{}: {}", file.path().display(), e)),
            Err(_) => bail!("Lost contact with parse workers"),
        }
    }
    if !failures.is_empty() {
        bail!(crate::StoreError::FilesFailed(failures.join("\n")))
    }
    if verbose {
        slog::info!(log(), "Read {} files, {} soft errors", files.len(), soft_errors);
    }
    Ok((results, soft_errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use crate::logfile::{FileKind, SampleReader};
    use crate::repr::LogEntry;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_read_in_parallel() {
        let _guard = cache::test_lock();
        cache::cache_purge_all_sync();
        let dir = tempfile::tempdir().unwrap();
        let mut files = vec![];
        for i in 0..8 {
            let path = dir.path().join(format!("n{i}.csv"));
            let mut f = std::fs::File::create(&path).unwrap();
            for k in 0..=i {
                writeln!(f, "v=0.11.0,time=2024-01-01T00:00:0{k}Z,host=n{i},user=u,cmd=c").unwrap();
            }
            writeln!(f, "garbage").unwrap();
            files.push(Arc::new(LogFile::new(path, FileKind::SampleCsv)));
        }
        let reader: Arc<dyn FileReader> = Arc::new(SampleReader {
            cacheable: false,
            config: None,
        });
        let (data, soft) = read_records_from_files::<LogEntry>(&files, reader.clone(), false).unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(soft, 8);
        let mut lens = data.iter().map(|d| d.len()).collect::<Vec<usize>>();
        lens.sort();
        assert_eq!(lens, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        files.push(Arc::new(LogFile::new(
            PathBuf::from("/nonexistent/x.csv"),
            FileKind::SampleCsv,
        )));
        let err = read_records_from_files::<LogEntry>(&files, reader, false).unwrap_err();
        assert!(err.to_string().contains("Failed to process one or more files"));
        assert!(err.to_string().contains("/nonexistent/x.csv"));
    }
}
