/// Process-wide bounded cache of parsed file content.
///
/// The cached content lives in the `LogFile` handles; this module keeps the books.  There is a
/// signed byte budget and a set of purgeable files, which are exactly the files that currently hold
/// content.  Installing content lowers the budget; when it drops below zero the purger thread is
/// signalled and evicts content until the budget is nonnegative again.
///
/// Victims are chosen by 2-random LRU: pick two purgeable files at random and evict the one that
/// was least recently used.  Every install and every hit stamps the file with the next value of a
/// global counter.
///
/// Locking: a file's lock is always taken before the purge lock, never the other way around.  The
/// purger selects a victim under the purge lock, releases it, takes the victim's file lock, and
/// then retakes the purge lock to unlink the victim.
///
/// Caching is off until `cache_init` is called with a nonnegative budget.
use crate::logfile::{Content, LogFile, NOT_PURGEABLE};

use once_cell::sync::{Lazy, OnceCell};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustutils::log;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

static ENABLED: AtomicBool = AtomicBool::new(false);
static VERBOSE: AtomicBool = AtomicBool::new(false);
static BUDGET: AtomicI64 = AtomicI64::new(0);
// Bytes of content currently installed.
static CACHED: AtomicI64 = AtomicI64::new(0);

struct Purgeable {
    files: Vec<Arc<LogFile>>,
    lru_counter: u64,
}

impl Purgeable {
    fn next_lru(&mut self) -> u64 {
        if self.lru_counter == u64::MAX {
            // Start over.  Choices are effectively random until the stamps have spread out again.
            for f in &self.files {
                f.lru.store(0, Ordering::Relaxed);
            }
            self.lru_counter = 0;
        }
        self.lru_counter += 1;
        self.lru_counter
    }
}

static PURGEABLE: Lazy<Mutex<Purgeable>> = Lazy::new(|| {
    Mutex::new(Purgeable {
        files: vec![],
        lru_counter: 0,
    })
});

static UNDERFLOW: OnceCell<SyncSender<()>> = OnceCell::new();

/// Set the budget in bytes and enable caching, or disable caching if the budget is negative.
/// Content already cached stays cached and is charged against the new budget; if it exceeds the
/// budget the purger is started on the excess.

pub fn cache_init(budget: i64) {
    if budget < 0 {
        ENABLED.store(false, Ordering::SeqCst);
        return;
    }
    let remaining = budget - CACHED.load(Ordering::SeqCst);
    BUDGET.store(remaining, Ordering::SeqCst);
    ENABLED.store(true, Ordering::SeqCst);
    let tx = UNDERFLOW.get_or_init(|| {
        let (tx, rx) = sync_channel(100);
        // If the thread can't be created we never purge; the cache then only grows.
        if let Err(e) = thread::Builder::new()
            .name("cache-purger".to_string())
            .spawn(move || purger(rx))
        {
            slog::error!(log(), "Could not start cache purger: {}", e);
        }
        tx
    });
    if remaining < 0 {
        let _ = tx.try_send(());
    }
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

/// The remaining budget; negative while the purger is behind.
pub fn cache_budget() -> i64 {
    BUDGET.load(Ordering::SeqCst)
}

/// Evict all cached content now, on the calling thread.

pub fn cache_purge_all_sync() {
    loop {
        let victim = match PURGEABLE.lock().unwrap().files.last() {
            Some(f) => f.clone(),
            None => break,
        };
        let mut content = victim.lock();
        evict_locked(&victim, &mut content, "purge-all", VERBOSE.load(Ordering::Relaxed));
    }
}

// Called with the file lock held, after installing content of the given size.
pub(crate) fn install(file: &Arc<LogFile>, size: usize, verbose: bool) {
    {
        let mut p = PURGEABLE.lock().unwrap();
        let stamp = p.next_lru();
        file.purge_ix.store(p.files.len(), Ordering::Relaxed);
        file.lru.store(stamp, Ordering::Relaxed);
        p.files.push(file.clone());
    }
    if verbose {
        VERBOSE.store(true, Ordering::Relaxed);
        slog::info!(log(), "Caching {} size {}", file.path().display(), size);
    }
    let size = size as i64;
    CACHED.fetch_add(size, Ordering::SeqCst);
    if BUDGET.fetch_sub(size, Ordering::SeqCst) - size < 0 {
        if let Some(tx) = UNDERFLOW.get() {
            // A full channel means the purger already has work queued.
            let _ = tx.try_send(());
        }
    }
}

// Called with the file lock held, when content is served from the cache.
pub(crate) fn note_hit(file: &Arc<LogFile>, verbose: bool) {
    {
        let mut p = PURGEABLE.lock().unwrap();
        let stamp = p.next_lru();
        file.lru.store(stamp, Ordering::Relaxed);
    }
    if verbose {
        slog::info!(log(), "Cache hit {}", file.path().display());
    }
}

// Called with the file lock held.  No-op if the file has no content.
pub(crate) fn evict_locked(file: &Arc<LogFile>, content: &mut Content, reason: &str, verbose: bool) {
    if content.payload.is_none() {
        return;
    }
    {
        let mut p = PURGEABLE.lock().unwrap();
        let ix = file.purge_ix.load(Ordering::Relaxed);
        if ix == NOT_PURGEABLE || ix >= p.files.len() || !Arc::ptr_eq(&p.files[ix], file) {
            panic!("Purgeable set out of sync with cached content: {}", file.path().display());
        }
        p.files.swap_remove(ix);
        if ix < p.files.len() {
            p.files[ix].purge_ix.store(ix, Ordering::Relaxed);
        }
        file.purge_ix.store(NOT_PURGEABLE, Ordering::Relaxed);
    }
    content.payload = None;
    BUDGET.fetch_add(content.size as i64, Ordering::SeqCst);
    CACHED.fetch_sub(content.size as i64, Ordering::SeqCst);
    if verbose {
        slog::info!(log(), "Purging {} b/c {}", file.path().display(), reason);
    }
    content.size = 0;
    content.soft_errors = 0;
}

// Evict one file if there is one, return false if there is nothing to evict.
fn purge_one(rng: &mut SmallRng) -> bool {
    let victim = {
        let p = PURGEABLE.lock().unwrap();
        let n = p.files.len();
        if n == 0 {
            return false;
        }
        let a = &p.files[rng.gen_range(0..n)];
        let b = &p.files[rng.gen_range(0..n)];
        if a.lru.load(Ordering::Relaxed) <= b.lru.load(Ordering::Relaxed) {
            a.clone()
        } else {
            b.clone()
        }
    };
    let mut content = victim.lock();
    evict_locked(&victim, &mut content, "budget", VERBOSE.load(Ordering::Relaxed));
    true
}

fn purger(rx: Receiver<()>) {
    let mut rng = SmallRng::from_entropy();
    while rx.recv().is_ok() {
        // Coalesce signals that arrived while we were busy.
        while rx.try_recv().is_ok() {}
        while BUDGET.load(Ordering::SeqCst) < 0 {
            if !purge_one(&mut rng) {
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) fn purgeable_count() -> usize {
    PURGEABLE.lock().unwrap().files.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::{FileKind, SampleReader};
    use crate::repr::LogEntry;
    use rustutils::UstrCache;
    use std::io::Write;
    use std::time::{Duration, Instant};

    fn make_files(dir: &std::path::Path, n: usize) -> Vec<Arc<LogFile>> {
        (0..n)
            .map(|i| {
                let path = dir.join(format!("h{i}.csv"));
                let mut f = std::fs::File::create(&path).unwrap();
                for k in 0..20 {
                    writeln!(
                        f,
                        "v=0.11.0,time=2024-01-01T00:{:02}:00Z,host=h{i},user=u,cmd=c,pid={k},cputime_sec={k}",
                        k
                    )
                    .unwrap();
                }
                Arc::new(LogFile::new(path, FileKind::SampleCsv))
            })
            .collect()
    }

    #[test]
    fn test_cache_hit_and_purge_all() {
        let _guard = test_lock();
        cache_purge_all_sync();
        cache_init(1 << 30);
        let dir = tempfile::tempdir().unwrap();
        let files = make_files(dir.path(), 3);
        let reader = SampleReader {
            cacheable: true,
            config: None,
        };
        let mut ustrs = UstrCache::new();
        let before = cache_budget();
        let (a, _) = files[0].read_sync::<LogEntry>(&reader, &mut ustrs, false).unwrap();
        assert!(files[0].is_cached());
        assert!(cache_budget() < before);
        // Second read is served from the cache and shares the vector.
        let (b, _) = files[0].read_sync::<LogEntry>(&reader, &mut ustrs, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 20);

        files[1].read_sync::<LogEntry>(&reader, &mut ustrs, false).unwrap();
        assert_eq!(purgeable_count(), 2);
        cache_purge_all_sync();
        assert_eq!(purgeable_count(), 0);
        assert!(!files[0].is_cached());
        assert_eq!(cache_budget(), before);

        // Content read from disk again is equal to the content that was cached.
        let (c, _) = files[0].read_sync::<LogEntry>(&reader, &mut ustrs, false).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(*a, *c);
        cache_purge_all_sync();
    }

    #[test]
    fn test_cache_budget_enforced() {
        let _guard = test_lock();
        cache_purge_all_sync();
        let dir = tempfile::tempdir().unwrap();
        let files = make_files(dir.path(), 10);
        let reader = SampleReader {
            cacheable: true,
            config: None,
        };
        let mut ustrs = UstrCache::new();
        let one_file = 20 * std::mem::size_of::<LogEntry>() as i64;
        cache_init(3 * one_file);
        for f in &files {
            f.read_sync::<LogEntry>(&reader, &mut ustrs, false).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while cache_budget() < 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(cache_budget() >= 0);
        let cached = files.iter().filter(|f| f.is_cached()).count();
        assert!(cached <= 3);
        assert_eq!(cached, purgeable_count());
        cache_purge_all_sync();
        cache_init(1 << 30);
    }

    #[test]
    fn test_cache_reinit_charges_cached_content() {
        let _guard = test_lock();
        cache_purge_all_sync();
        cache_init(1 << 30);
        let dir = tempfile::tempdir().unwrap();
        let files = make_files(dir.path(), 2);
        let reader = SampleReader {
            cacheable: true,
            config: None,
        };
        let mut ustrs = UstrCache::new();
        for f in &files {
            f.read_sync::<LogEntry>(&reader, &mut ustrs, false).unwrap();
        }
        let cached = (1 << 30) - cache_budget();
        assert!(cached > 0);

        // The content stays cached and counts against the new budget.
        cache_init(1 << 20);
        assert!(files.iter().all(|f| f.is_cached()));
        assert_eq!(cache_budget(), (1 << 20) - cached);

        // Once it is gone the whole budget is available again.
        cache_purge_all_sync();
        assert_eq!(cache_budget(), 1 << 20);
        cache_init(1 << 30);
    }

    #[test]
    fn test_cache_disabled() {
        let _guard = test_lock();
        cache_purge_all_sync();
        cache_init(-1);
        let dir = tempfile::tempdir().unwrap();
        let files = make_files(dir.path(), 1);
        let reader = SampleReader {
            cacheable: true,
            config: None,
        };
        files[0].read_sync::<LogEntry>(&reader, &mut UstrCache::new(), false).unwrap();
        assert!(!files[0].is_cached());
        cache_init(1 << 30);
    }
}
