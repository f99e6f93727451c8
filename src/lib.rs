//! A transactional function hot-patching library for Linux.
//!
//! ## Intro
//!
//! This library atomically redirects functions in the running process.
//! Given a set of symbol-name to replacement-function bindings, it
//! overwrites the prologue of each target with an absolute jump, so that
//! subsequent calls divert to the replacement. The whole set installs
//! together or not at all, and a rollback restores the original prologues
//! byte for byte.
//!
//! The hard part of patching a live process is that any other thread may be
//! executing the very bytes being rewritten. Before anything is written,
//! every peer thread is halted in a signal handler and its captured
//! backtrace is checked against every patch range; a thread caught inside
//! one is released and recaptured until it is provably elsewhere. Only then
//! are the patches written, the instruction caches flushed, and the halted
//! threads released.
//!
//! ## Procedure
//!
//! 1. `prepare` resolves each name against the loaded ELF images, verifies
//!    the target is large enough, disassembles its prologue to find the
//!    smallest whole-instruction prefix covering the patch, snapshots those
//!    bytes, and records the protection bits of every page the target
//!    spans. No process memory is modified.
//! 2. `commit` makes the recorded pages writable, halts every peer thread
//!    outside the patch ranges, writes the jump patches, and restores page
//!    protections and signal state on the way out.
//! 3. `rollback` runs the same protocol in reverse, copying the snapshots
//!    back over the patched prologues.
//!
//! ## Platforms
//!
//! 64-bit x86 and 64-bit ARM Linux. Anything else fails to compile.
//!
//! ## Example
//!
//! ```rust,no_run
//! use graft::Transaction;
//!
//! extern "C" fn quieter_write(fd: i32, buf: *const u8, len: usize) -> isize {
//!   let _ = (fd, buf);
//!   len as isize
//! }
//!
//! # fn main() -> graft::Result<()> {
//! let mut txn = Transaction::builder()
//!   .add("write", quieter_write as *const ())
//!   .build();
//!
//! txn.prepare()?;
//! txn.commit()?;
//! // ... every call to `write` now lands in `quieter_write` ...
//! txn.rollback()?;
//! # Ok(())
//! # }
//! ```

// Re-exports
pub use crate::arch::JUMP_PATCH_SIZE;
pub use crate::error::{Error, Result};
pub use crate::transaction::{Builder, Transaction};

// Modules
mod arch;
mod disasm;
mod error;
mod event;
mod memory_map;
mod modules;
mod signal;
mod symbols;
mod threads;
mod trampoline;
mod transaction;
mod unwind;
