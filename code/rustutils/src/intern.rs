/// Interned strings.
///
/// The process-wide table is the one provided by the `ustr` crate: a `Ustr` is a small `Copy`
/// handle, equal strings have equal handles, and comparison and hashing are O(1).  The table grows
/// monotonically and is never torn down.  The empty string is a reserved value, `ustr_empty()`.
///
/// Parsers allocate a great many strings that are repeated over and over (host names, user names,
/// commands, version strings), and the global table serializes insertions.  Each parse worker
/// therefore fronts the global table with its own unsynchronized `UstrCache`, which maps raw bytes
/// to handles without touching the global lock after the first sighting.
use std::collections::HashMap;
use ustr::Ustr;

/// Something that can turn text into interned strings.
pub trait UstrAllocator {
    fn alloc(&mut self, s: &str) -> Ustr;

    /// Invalid UTF-8 is replaced, as with `String::from_utf8_lossy`.
    fn alloc_bytes(&mut self, bs: &[u8]) -> Ustr;
}

pub fn ustr_empty() -> Ustr {
    Ustr::from("")
}

/// The allocator that goes straight to the global table.
#[derive(Default)]
pub struct GlobalUstrs;

impl UstrAllocator for GlobalUstrs {
    fn alloc(&mut self, s: &str) -> Ustr {
        Ustr::from(s)
    }

    fn alloc_bytes(&mut self, bs: &[u8]) -> Ustr {
        Ustr::from(String::from_utf8_lossy(bs).as_ref())
    }
}

/// A per-thread cache in front of the global table.  It is not shareable across threads.
#[derive(Default)]
pub struct UstrCache {
    known: HashMap<Box<[u8]>, Ustr>,
}

impl UstrCache {
    pub fn new() -> UstrCache {
        UstrCache {
            known: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

impl UstrAllocator for UstrCache {
    fn alloc(&mut self, s: &str) -> Ustr {
        self.alloc_bytes(s.as_bytes())
    }

    fn alloc_bytes(&mut self, bs: &[u8]) -> Ustr {
        if bs.is_empty() {
            return ustr_empty();
        }
        if let Some(u) = self.known.get(bs) {
            return *u;
        }
        let u = Ustr::from(String::from_utf8_lossy(bs).as_ref());
        self.known.insert(bs.into(), u);
        u
    }
}

#[test]
fn test_ustr_cache() {
    let mut c = UstrCache::new();
    let a = c.alloc("hello");
    let b = c.alloc_bytes(b"hello");
    assert_eq!(a, b);
    assert_eq!(c.len(), 1);
    assert_eq!(a, GlobalUstrs.alloc("hello"));
    assert_eq!(c.alloc(""), ustr_empty());
    assert_eq!(c.len(), 1);
    assert_eq!(c.alloc_bytes(b"x\xffy").as_str(), "x\u{fffd}y");
}
