//! Executable copies of saved function prologues.

use crate::arch;
use crate::error::{Error, Result};
use std::ptr;

/// An executable relocation of a function prologue.
///
/// The mapping holds the saved prologue bytes followed by a jump back to the
/// first original instruction after them, so a hook can invoke the original
/// function while its entry is patched. The mapping is released on drop.
pub struct Trampoline {
  memory: region::Allocation,
  prologue_len: usize,
}

impl Trampoline {
  /// Allocates a trampoline from a prologue snapshot.
  ///
  /// `resume` is the address of the first instruction following the
  /// snapshot in the original function.
  ///
  /// # Safety
  ///
  /// The snapshot must consist of whole instructions that are valid at any
  /// load address; the caller is responsible for rejecting prologues with
  /// PC-relative instructions.
  pub unsafe fn new(snapshot: &[u8], resume: usize) -> Result<Trampoline> {
    let size = snapshot.len() + arch::TAIL_JUMP_SIZE;

    let mut memory = region::alloc(size, region::Protection::READ_WRITE).map_err(|error| {
      log::error!("failed to allocate {size} trampoline bytes: {error}");
      Error::TrampolineCreationFailure
    })?;

    let base = memory.as_mut_ptr::<u8>();
    ptr::copy_nonoverlapping(snapshot.as_ptr(), base, snapshot.len());

    let tail = arch::tail_jump_to(resume);
    ptr::copy_nonoverlapping(tail.as_ptr(), base.add(snapshot.len()), tail.len());

    region::protect(base, size, region::Protection::READ_EXECUTE).map_err(|error| {
      log::error!("failed to make the trampoline executable: {error}");
      Error::TrampolineCreationFailure
    })?;
    arch::flush_instruction_cache(base, size);

    Ok(Trampoline {
      memory,
      prologue_len: snapshot.len(),
    })
  }

  /// Returns the entry point of the trampoline.
  pub fn address(&self) -> *const () {
    self.memory.as_ptr()
  }

  /// Returns the number of prologue bytes held by the trampoline.
  pub fn prologue_len(&self) -> usize {
    self.prologue_len
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{mem, slice};

  #[test]
  fn lays_out_prologue_then_tail_jump() {
    #[cfg(target_arch = "x86_64")]
    let snapshot = [0x90u8; 13];
    #[cfg(target_arch = "aarch64")]
    let snapshot = [0x1F, 0x20, 0x03, 0xD5, 0x1F, 0x20, 0x03, 0xD5];

    let resume = 0x7000_0000_1000;
    let trampoline = unsafe { Trampoline::new(&snapshot, resume).unwrap() };
    assert_eq!(trampoline.prologue_len(), snapshot.len());

    let bytes = unsafe {
      slice::from_raw_parts(
        trampoline.address() as *const u8,
        snapshot.len() + arch::TAIL_JUMP_SIZE,
      )
    };
    assert_eq!(&bytes[..snapshot.len()], &snapshot);
    assert_eq!(&bytes[snapshot.len()..], &arch::tail_jump_to(resume));
  }

  #[test]
  fn executes_the_copied_code() {
    // A self-contained snapshot that returns 42 without ever reaching the
    // tail jump.
    #[cfg(target_arch = "x86_64")]
    let snapshot = [0xB8, 42, 0, 0, 0, 0xC3];
    #[cfg(target_arch = "aarch64")]
    let snapshot = {
      let mut code = [0u8; 8];
      code[..4].copy_from_slice(&0x5280_0540u32.to_le_bytes()); // mov w0, #42
      code[4..].copy_from_slice(&0xD65F_03C0u32.to_le_bytes()); // ret
      code
    };

    let trampoline = unsafe { Trampoline::new(&snapshot, 0).unwrap() };
    let function: extern "C" fn() -> i32 = unsafe { mem::transmute(trampoline.address()) };
    assert_eq!(function(), 42);
  }
}
