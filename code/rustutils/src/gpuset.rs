/// A GpuSet is a set of GPU card indices with three kinds of states:
///
///  - known to be empty ("none")
///  - known to be nonempty with only known members, eg {0,2,3}
///  - known to be nonempty but with (some) unknown members ("unknown")
///
/// Once a set has become unknown it stays unknown under union and adjoin.  There is no
/// representation for "some known + some unknown" cards, it is not believed to be worthwhile.
///
/// Space is at a premium in sample records, so this is a bitmask: bits 0..30 are cards 0..30 and
/// the top bit means "unknown".  Card indices above 30 are folded into "unknown".
use anyhow::{bail, Result};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct GpuSet(u32);

const UNKNOWN: u32 = 0x8000_0000;
const MAX_CARD: u32 = 30;

impl GpuSet {
    pub fn empty() -> GpuSet {
        GpuSet(0)
    }

    pub fn unknown() -> GpuSet {
        GpuSet(UNKNOWN)
    }

    pub fn singleton(card: u32) -> GpuSet {
        let mut s = GpuSet::empty();
        s.adjoin(card);
        s
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_unknown(&self) -> bool {
        (self.0 & UNKNOWN) != 0
    }

    pub fn adjoin(&mut self, card: u32) {
        if self.is_unknown() {
            return;
        }
        if card > MAX_CARD {
            self.0 = UNKNOWN;
        } else {
            self.0 |= 1 << card;
        }
    }

    pub fn union(&mut self, other: GpuSet) {
        if self.is_unknown() || other.is_unknown() {
            self.0 = UNKNOWN;
        } else {
            self.0 |= other.0;
        }
    }

    /// Number of known cards; zero for "unknown".
    pub fn size(&self) -> usize {
        if self.is_unknown() {
            0
        } else {
            self.0.count_ones() as usize
        }
    }

    /// The known members in ascending order.
    pub fn cards(&self) -> Vec<u32> {
        if self.is_unknown() {
            return vec![];
        }
        (0..=MAX_CARD).filter(|c| (self.0 & (1 << c)) != 0).collect()
    }

    /// Parse "unknown", "none", or a comma-separated list of card numbers.
    pub fn from_list(s: &str) -> Result<GpuSet> {
        match s {
            "unknown" => Ok(GpuSet::unknown()),
            "none" | "" => Ok(GpuSet::empty()),
            _ => {
                let mut set = GpuSet::empty();
                for x in s.split(',') {
                    match x.parse::<u32>() {
                        Ok(n) => set.adjoin(n),
                        Err(_) => bail!("Bad GPU set {s}"),
                    }
                }
                Ok(set)
            }
        }
    }

    /// Parse the bitvector form from old untagged records, eg "101" = {0,2}.
    pub fn from_bitvector(s: &str) -> Result<GpuSet> {
        match u32::from_str_radix(s, 2) {
            Ok(mask) => {
                if mask & UNKNOWN != 0 {
                    Ok(GpuSet::unknown())
                } else {
                    Ok(GpuSet(mask))
                }
            }
            Err(_) => bail!("Bad GPU bitvector {s}"),
        }
    }
}

impl fmt::Display for GpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "unknown")
        } else if self.is_empty() {
            write!(f, "none")
        } else {
            let cs = self
                .cards()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<String>>();
            write!(f, "{}", cs.join(","))
        }
    }
}

#[test]
fn test_gpuset() {
    assert!(GpuSet::empty().is_empty());
    assert!(!GpuSet::unknown().is_empty());
    assert!(!GpuSet::singleton(1).is_empty());
    let mut s = GpuSet::unknown();
    s.adjoin(1);
    assert!(s.is_unknown());
    let mut t = GpuSet::singleton(3);
    t.union(GpuSet::singleton(0));
    assert_eq!(t.cards(), vec![0, 3]);
    assert_eq!(t.size(), 2);
    t.union(GpuSet::unknown());
    assert!(t.is_unknown());
    assert_eq!(t.to_string(), "unknown");
}

#[test]
fn test_gpuset_parsing() {
    assert!(GpuSet::from_list("unknownx").is_err());
    assert!(GpuSet::from_list("unknown").unwrap().is_unknown());
    assert!(GpuSet::from_list("none").unwrap().is_empty());
    assert_eq!(GpuSet::from_list("1,1,1").unwrap(), GpuSet::singleton(1));
    assert_eq!(GpuSet::from_list("5,2,0").unwrap().to_string(), "0,2,5");
    assert_eq!(GpuSet::from_bitvector("101").unwrap().to_string(), "0,2");
    assert!(GpuSet::from_bitvector("12").is_err());
    assert!(GpuSet::from_list("31").unwrap().is_unknown());
}
