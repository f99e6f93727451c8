//! A reader for the kernel's per-process memory map.
//!
//! Each line of the map describes one region as `START-END PERMS ...` with
//! lowercase hexadecimal bounds. Only the `rwx` triple of the permission
//! column is interpreted; the regions are listed in ascending address order.

use crate::error::{Error, Result};
use std::fs;

/// One mapped region and its protection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
  pub start: usize,
  pub end: usize,
  /// Protection as a `libc::PROT_*` bitfield, ready for `mprotect`.
  pub protection: i32,
}

/// A snapshot of the process address-space table.
#[derive(Debug, Default)]
pub struct MemoryMap {
  regions: Vec<Region>,
}

impl MemoryMap {
  /// Loads the memory map of the current process.
  pub fn load() -> Result<Self> {
    let contents = fs::read_to_string("/proc/self/maps").map_err(|error| {
      log::error!("failed reading /proc/self/maps: {error}");
      Error::Unexpected
    })?;

    Self::parse(&contents)
  }

  /// Parses a map table from its textual form.
  pub fn parse(contents: &str) -> Result<Self> {
    let mut regions = Vec::new();

    for line in contents.lines() {
      let mut columns = line.split_ascii_whitespace();
      let range = columns.next().unwrap_or_default();
      let permissions = columns.next().unwrap_or_default();

      let parsed = range.split_once('-').and_then(|(start, end)| {
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        Some((start, end))
      });

      let Some((start, end)) = parsed else {
        log::error!("failed to parse address range {range:?}");
        return Err(Error::Unexpected);
      };

      if permissions.len() < 3 {
        log::error!("failed to parse permissions {permissions:?}");
        return Err(Error::Unexpected);
      }

      let bits = permissions.as_bytes();
      let protection = (if bits[0] == b'r' { libc::PROT_READ } else { 0 })
        | (if bits[1] == b'w' { libc::PROT_WRITE } else { 0 })
        | (if bits[2] == b'x' { libc::PROT_EXEC } else { 0 });

      regions.push(Region {
        start,
        end,
        protection,
      });
    }

    Ok(MemoryMap { regions })
  }

  /// Returns the region containing `addr`, if any.
  pub fn find(&self, addr: usize) -> Option<&Region> {
    for region in &self.regions {
      if addr < region.start {
        // Regions are sorted in address order, so the address cannot fall
        // in any later region either.
        break;
      }

      if addr < region.end {
        return Some(region);
      }
    }

    None
  }

  /// Returns every parsed region.
  pub fn regions(&self) -> &[Region] {
    &self.regions
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const FIXTURE: &str = "\
5650a0000000-5650a0001000 r--p 00000000 103:02 1573002 /usr/bin/true\n\
5650a0001000-5650a0005000 r-xp 00001000 103:02 1573002 /usr/bin/true\n\
7f20c1000000-7f20c1021000 rw-p 00000000 00:00 0\n\
7ffd7a000000-7ffd7a022000 rw-p 00000000 00:00 0 [stack]\n\
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0 [vsyscall]\n";

  #[test]
  fn parses_bounds_and_protection_bits() {
    let map = MemoryMap::parse(FIXTURE).unwrap();
    assert_eq!(map.regions().len(), 5);

    let text = &map.regions()[1];
    assert_eq!(text.start, 0x5650_a000_1000);
    assert_eq!(text.end, 0x5650_a000_5000);
    assert_eq!(text.protection, libc::PROT_READ | libc::PROT_EXEC);

    let vsyscall = &map.regions()[4];
    assert_eq!(vsyscall.protection, libc::PROT_EXEC);
  }

  #[test]
  fn find_honors_region_bounds() {
    let map = MemoryMap::parse(FIXTURE).unwrap();

    assert_eq!(map.find(0x5650_a000_1000), Some(&map.regions()[1]));
    assert_eq!(map.find(0x5650_a000_4fff), Some(&map.regions()[1]));
    // End addresses are exclusive and gaps resolve to nothing.
    assert_eq!(map.find(0x5650_a000_5000), None);
    assert_eq!(map.find(0x6000_0000_0000), None);
    assert_eq!(map.find(0), None);
  }

  #[test]
  fn rejects_garbage() {
    assert_eq!(
      MemoryMap::parse("kwyjibo r-xp\n").unwrap_err(),
      Error::Unexpected
    );
  }

  #[test]
  fn locates_our_own_code() {
    let map = MemoryMap::load().unwrap();
    let addr = MemoryMap::load as usize;

    let region = map.find(addr).expect("code address not in the map");
    assert_ne!(region.protection & libc::PROT_EXEC, 0);
  }
}
