// Misc utilities useful to both sonarlog and sonalyze.

mod configs;
mod csv;
mod dates;
mod gpuset;
mod hostglob;
mod intern;
mod logutil;
mod pattern;

// A structure representing the configuration of one host.

pub use configs::ClusterConfig;
pub use configs::System;

// Read a cluster configuration from a file.

pub use configs::read_cluster_config;

// Fast, non-allocating, flexible CSV tokenizer.

pub use csv::CsvToken;
pub use csv::CsvTokenizer;
pub use csv::CSV_EQ_SENTINEL;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// "A long long time ago", the time right now, and a time that should not be in any record.

pub use dates::epoch;
pub use dates::far_future;
pub use dates::now;

// Conversions.

pub use dates::format_ymdhm;
pub use dates::from_unix;
pub use dates::parse_timestamp;
pub use dates::timestamp_from_ymd;
pub use dates::timestamp_from_ymdhms;
pub use dates::to_unix;

// Day boundaries and the store's day-directory names.

pub use dates::day_path;
pub use dates::next_day;
pub use dates::roundup_day;
pub use dates::this_day;

// Return the unix time with various parts cleared out.

pub use dates::truncate_to_day;
pub use dates::truncate_to_half_day;
pub use dates::truncate_to_half_hour;
pub use dates::truncate_to_hour;
pub use dates::truncate_to_week;

// Add various quantities to the unix time.

pub use dates::add_day;
pub use dates::add_half_day;
pub use dates::add_half_hour;
pub use dates::add_hour;
pub use dates::add_week;

// A GpuSet is "none", "unknown", or a set of card indices.

pub use gpuset::GpuSet;

// Structure representing a host name filter: basically a restricted automaton matching host names
// in useful ways.

pub use hostglob::HostGlobber;

// Formatter for sets of host names, and the inverse.

pub use hostglob::compress_hostnames;
pub use hostglob::expand_pattern;

// Interned strings: the allocator interface, the per-worker cache, and the global fallback.

pub use intern::ustr_empty;
pub use intern::GlobalUstrs;
pub use intern::UstrAllocator;
pub use intern::UstrCache;

// Process-wide structured logger; all verbose output goes here.

pub use logutil::log;
