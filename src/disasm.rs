//! Prologue analysis: how many leading bytes of a function may be replaced.

use crate::error::{Error, Result};
use capstone::prelude::*;
use capstone::InsnGroupType;
use std::slice;

/// The outcome of analyzing a function prologue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analysis {
  /// The number of leading bytes that must be saved and restored: the
  /// smallest whole-instruction prefix covering the requested minimum, or
  /// the whole window when widened.
  pub copy_len: usize,
  /// Whether a PC-relative branch was decoded. Such a prologue cannot be
  /// relocated without instruction rewriting.
  pub has_relative_branch: bool,
}

/// Analyzes the prologue of the function at `addr`.
///
/// Instructions are decoded one at a time, accumulating their encoded
/// lengths until at least `min_bytes` are covered. Decoding a PC-relative
/// branch widens the result to `max_bytes`, treating the entire function as
/// non-relocatable.
///
/// # Safety
///
/// `addr` must point to at least `max_bytes` of readable mapped memory.
pub unsafe fn analyze_prologue(addr: usize, max_bytes: usize, min_bytes: usize) -> Result<Analysis> {
  let code = slice::from_raw_parts(addr as *const u8, max_bytes);
  analyze(code, addr as u64, min_bytes)
}

fn analyze(code: &[u8], addr: u64, min_bytes: usize) -> Result<Analysis> {
  let capstone = disassembler()?;

  let instructions = capstone.disasm_all(code, addr).map_err(|error| {
    log::error!("disassembly at {addr:#x} failed: {error}");
    Error::Unexpected
  })?;

  let mut copy_len = 0;
  for instruction in instructions.iter() {
    let detail = capstone.insn_detail(instruction).map_err(|error| {
      log::error!("no detail for instruction at {:#x}: {error}", instruction.address());
      Error::Unexpected
    })?;

    if detail
      .groups()
      .iter()
      .any(|group| group.0 as u32 == InsnGroupType::CS_GRP_BRANCH_RELATIVE as u32)
    {
      // A relative branch cannot be overwritten or relocated piecemeal;
      // fall back to treating the whole function as the prologue.
      return Ok(Analysis {
        copy_len: code.len(),
        has_relative_branch: true,
      });
    }

    copy_len += instruction.bytes().len();
    if copy_len >= min_bytes {
      return Ok(Analysis {
        copy_len,
        has_relative_branch: false,
      });
    }
  }

  // The stream ended early (alignment padding or data); there is no
  // instruction boundary to honor beyond the patch itself.
  Ok(Analysis {
    copy_len: min_bytes,
    has_relative_branch: false,
  })
}

/// Creates a disassembler for the host architecture with instruction detail
/// enabled, which is required to see branch-group membership.
fn disassembler() -> Result<Capstone> {
  #[cfg(target_arch = "x86_64")]
  let capstone = Capstone::new()
    .x86()
    .mode(arch::x86::ArchMode::Mode64)
    .detail(true)
    .build();

  #[cfg(target_arch = "aarch64")]
  let capstone = Capstone::new()
    .arm64()
    .mode(arch::arm64::ArchMode::Arm)
    .detail(true)
    .build();

  capstone.map_err(|error| {
    log::error!("failed to construct a disassembler: {error}");
    Error::Unexpected
  })
}
