/// Process-wide logger.  Everything verbose goes to stderr through a synchronous terminal drain so
/// that messages from worker threads and the cache purger are not interleaved mid-line.
use once_cell::sync::Lazy;
use slog::Drain;

static LOGGER: Lazy<slog::Logger> = Lazy::new(|| {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    slog::Logger::root(slog_term::FullFormat::new(plain).build().fuse(), slog::o!())
});

pub fn log() -> &'static slog::Logger {
    &LOGGER
}
