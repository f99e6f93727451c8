//! Architecture specific code.
//!
//! Each architecture module exposes:
//!
//! - `JUMP_PATCH_SIZE`, the fixed length of the jump patch.
//! - `jump_to`, producing the byte sequence that transfers control to an
//!   absolute address. The sequence is position independent (no PC-relative
//!   fields) and only clobbers a scratch register, so it behaves the same
//!   from any patch site.
//! - `tail_jump_to` and `TAIL_JUMP_SIZE`, the branch appended to a
//!   relocated prologue, which must also preserve mid-function state.
//! - `flush_icache`, instruction-cache maintenance for a patched range.

use cfg_if::cfg_if;

cfg_if! {
  if #[cfg(target_arch = "x86_64")] {
    mod x86;
    pub use self::x86::{jump_to, tail_jump_to, JUMP_PATCH_SIZE, TAIL_JUMP_SIZE};
    use self::x86::flush_icache;
  } else if #[cfg(target_arch = "aarch64")] {
    mod aarch64;
    pub use self::aarch64::{jump_to, tail_jump_to, JUMP_PATCH_SIZE, TAIL_JUMP_SIZE};
    use self::aarch64::flush_icache;
  } else {
    compile_error!("only x86_64 and aarch64 are supported");
  }
}

/// Flushes the instruction cache for exactly the patched byte range.
///
/// # Safety
///
/// The range must be mapped.
pub unsafe fn flush_instruction_cache(addr: *const u8, len: usize) {
  flush_icache(addr, len);
}
