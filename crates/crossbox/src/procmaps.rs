//! `/proc/<pid>/maps` parsing and the common-gap search for identity
//! mappings.
//!
//! The fallback path of [`crate::Sandbox::map_identity`] needs an address
//! that is unmapped in *both* processes. Candidate bases sit in the typical
//! 64-bit mmap region, probed at 64 KiB alignment; the search is best-effort
//! and can fail if ASLR placed large mappings inconveniently.

use std::fs::File;
use std::io::{self, BufRead, BufReader};

const CANDIDATE_BASES: [u64; 6] = [
    0x7000_0000_0000,
    0x6000_0000_0000,
    0x5000_0000_0000,
    0x4000_0000_0000,
    0x2000_0000_0000,
    0x1000_0000_0000,
];

/// How far past each candidate base to probe.
const SEARCH_SPAN: u64 = 0x100_0000_0000;

const ALIGN: u64 = 64 * 1024;

/// Find an address where `len` bytes are free in both processes' address
/// spaces, or `None` if the maps can't be read or no gap exists.
pub(crate) fn find_common_free_address(pid_a: i32, pid_b: i32, len: usize) -> Option<u64> {
    let a = read_maps(pid_a).ok()?;
    let b = read_maps(pid_b).ok()?;
    search_gap(&a, &b, len)
}

fn read_maps(pid: i32) -> io::Result<Vec<(u64, u64)>> {
    let file = File::open(format!("/proc/{pid}/maps"))?;
    Ok(parse_maps(BufReader::new(file)))
}

fn parse_maps<R: BufRead>(reader: R) -> Vec<(u64, u64)> {
    reader
        .lines()
        .map_while(io::Result::ok)
        .filter_map(|line| parse_line(&line))
        .collect()
}

/// Parse the `start-end` range that leads a maps line.
fn parse_line(line: &str) -> Option<(u64, u64)> {
    let range = line.split_whitespace().next()?;
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    (start < end).then_some((start, end))
}

fn overlaps(addr: u64, len: u64, regions: &[(u64, u64)]) -> bool {
    let end = addr + len;
    regions.iter().any(|&(start, stop)| addr < stop && end > start)
}

fn search_gap(a: &[(u64, u64)], b: &[(u64, u64)], len: usize) -> Option<u64> {
    let len = ((len + 4095) & !4095) as u64;
    for base in CANDIDATE_BASES {
        let mut addr = base;
        while addr < base + SEARCH_SPAN {
            if !overlaps(addr, len, a) && !overlaps(addr, len, b) {
                return Some(addr);
            }
            addr += ALIGN;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "\
5651a45b0000-5651a45b2000 r--p 00000000 103:02 2097216 /usr/bin/cat
5651a45b2000-5651a45b7000 r-xp 00002000 103:02 2097216 /usr/bin/cat
7ffd15c00000-7ffd15c21000 rw-p 00000000 00:00 0 [stack]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0 [vsyscall]
garbage line
";

    #[test]
    fn parses_ranges_and_skips_garbage() {
        let regions = parse_maps(Cursor::new(SAMPLE));
        assert_eq!(regions.len(), 4);
        assert_eq!(regions[0], (0x5651a45b0000, 0x5651a45b2000));
        assert_eq!(regions[2], (0x7ffd15c00000, 0x7ffd15c21000));
    }

    #[test]
    fn overlap_detection() {
        let regions = [(0x1000, 0x2000), (0x5000, 0x6000)];
        assert!(overlaps(0x1800, 0x1000, &regions));
        assert!(overlaps(0x0800, 0x1000, &regions));
        assert!(!overlaps(0x2000, 0x1000, &regions));
        assert!(!overlaps(0x6000, 0x1000, &regions));
    }

    #[test]
    fn gap_search_prefers_first_candidate() {
        let addr = search_gap(&[], &[], 4096).unwrap();
        assert_eq!(addr, CANDIDATE_BASES[0]);
        assert_eq!(addr % ALIGN, 0);
    }

    #[test]
    fn gap_search_skips_occupied_slots() {
        // First 64 KiB slot of the first base is busy in process A, the
        // second in process B; the search lands on the third.
        let base = CANDIDATE_BASES[0];
        let a = [(base, base + ALIGN)];
        let b = [(base + ALIGN, base + 2 * ALIGN)];
        let addr = search_gap(&a, &b, 4096).unwrap();
        assert_eq!(addr, base + 2 * ALIGN);
    }

    #[test]
    fn own_maps_are_readable() {
        let regions = read_maps(std::process::id() as i32).unwrap();
        assert!(!regions.is_empty());
    }
}
