//! The transactional patching engine.
//!
//! A transaction moves through a small state machine:
//!
//! ```text
//! Initialized --prepare--> Prepared --commit--> Committed
//!                              \                    |
//!                               +----- rollback ----+--> RolledBack
//! ```
//!
//! `prepare` resolves and inspects every target without touching process
//! memory; `commit` and `rollback` share one patching path that first halts
//! every peer thread and proves, from its captured backtrace, that it cannot
//! resume inside a byte range about to be overwritten.

use crate::arch;
use crate::disasm;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::memory_map::MemoryMap;
use crate::signal::SignalAction;
use crate::symbols::{self, Descriptor};
use crate::threads;
use crate::trampoline::Trampoline;
use crate::unwind;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;
use std::{ptr, slice, thread};

lazy_static! {
  static ref PAGE_SIZE: usize = region::page::size();
}

/// How long a single halted peer is awaited.
const HALT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cap of the exponential retry backoff, in microseconds.
const MAX_BACKOFF_US: u64 = 1_000_000;

/// Upper bound of captured stack frames per halted thread.
const MAX_FRAME_COUNT: usize = 64;

/// Accumulates bindings and produces a [`Transaction`].
///
/// Bindings are stored as three parallel vectors: symbol names, hook
/// addresses, and optional trampoline out-pointers. Building moves the
/// vectors into the transaction, spending the builder.
#[derive(Debug, Default)]
pub struct Builder {
  names: Vec<String>,
  hooks: Vec<usize>,
  trampoline_outs: Vec<Option<*mut *const ()>>,
}

impl Builder {
  /// Creates an empty builder.
  pub fn new() -> Self {
    Builder::default()
  }

  /// Binds `name` to the replacement function at `hook`.
  pub fn add<N: Into<String>>(mut self, name: N, hook: *const ()) -> Self {
    self.names.push(name.into());
    self.hooks.push(hook as usize);
    self.trampoline_outs.push(None);
    self
  }

  /// Binds `name` to `hook` and requests a trampoline to the original.
  ///
  /// # Safety
  ///
  /// `trampoline` must stay writable until `prepare` returns; the trampoline
  /// entry point is stored through it during that call.
  pub unsafe fn add_with_trampoline<N: Into<String>>(
    mut self,
    name: N,
    hook: *const (),
    trampoline: *mut *const (),
  ) -> Self {
    self.names.push(name.into());
    self.hooks.push(hook as usize);
    self.trampoline_outs.push(Some(trampoline));
    self
  }

  /// Produces the transaction, spending the builder.
  pub fn build(self) -> Transaction {
    Transaction {
      state: State::Initialized,
      names: self.names,
      hooks: self.hooks,
      trampoline_outs: self.trampoline_outs,
      descriptors: Vec::new(),
      snapshots: Vec::new(),
      trampolines: Vec::new(),
      page_permissions: HashMap::new(),
      halt_controls: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Initialized,
  Prepared,
  Committed,
  RolledBack,
}

#[derive(Clone, Copy)]
enum PatchCommand {
  Apply,
  Restore,
}

/// An atomic set of function patches.
pub struct Transaction {
  state: State,
  names: Vec<String>,
  hooks: Vec<usize>,
  trampoline_outs: Vec<Option<*mut *const ()>>,
  descriptors: Vec<Descriptor>,
  snapshots: Vec<Vec<u8>>,
  trampolines: Vec<Option<Trampoline>>,
  page_permissions: HashMap<usize, i32>,
  halt_controls: Vec<ThreadControl>,
}

impl Transaction {
  /// Starts accumulating bindings for a new transaction.
  pub fn builder() -> Builder {
    Builder::new()
  }

  /// Resolves and inspects every binding without mutating process memory.
  ///
  /// On success the transaction holds, per binding: the resolved descriptor
  /// (pinning its providing module), a snapshot of the prologue bytes that
  /// will be overwritten, any requested trampoline, and the original
  /// protection bits of every page the target spans.
  pub fn prepare(&mut self) -> Result<()> {
    if self.state != State::Initialized {
      return Err(Error::InvalidState);
    }

    let resolved = symbols::lookup(&self.names);
    let map = MemoryMap::load()?;

    let mut descriptors = Vec::with_capacity(self.names.len());
    for (idx, descriptor) in resolved.into_iter().enumerate() {
      match descriptor {
        Some(descriptor) => descriptors.push(descriptor),
        None => {
          log::error!("symbol {} did not resolve", self.names[idx]);
          return Err(Error::SymbolNotFound);
        },
      }
    }

    let mut snapshots = Vec::with_capacity(descriptors.len());
    let mut trampolines = Vec::with_capacity(descriptors.len());
    let mut page_permissions = HashMap::new();

    for (idx, descriptor) in descriptors.iter().enumerate() {
      if arch::JUMP_PATCH_SIZE > descriptor.size {
        log::error!("function {} is too small to patch", self.names[idx]);
        return Err(Error::FunctionBodyTooSmall);
      }

      let analysis = unsafe {
        disasm::analyze_prologue(descriptor.addr, descriptor.size, arch::JUMP_PATCH_SIZE)?
      };
      let snapshot =
        unsafe { slice::from_raw_parts(descriptor.addr as *const u8, analysis.copy_len) }.to_vec();

      let trampoline = match self.trampoline_outs[idx] {
        Some(out) => {
          if analysis.has_relative_branch {
            // The copied prologue would still branch relative to its old
            // location; refuse instead of handing out broken code.
            log::error!(
              "prologue of {} contains a relative branch, cannot build a trampoline",
              self.names[idx]
            );
            return Err(Error::TrampolineCreationFailure);
          }

          let trampoline =
            unsafe { Trampoline::new(&snapshot, descriptor.addr + analysis.copy_len)? };
          unsafe { *out = trampoline.address() };
          Some(trampoline)
        },
        None => None,
      };

      let mut page = descriptor.addr & !(*PAGE_SIZE - 1);
      while page < descriptor.addr + descriptor.size {
        if !page_permissions.contains_key(&page) {
          let region = map.find(page).ok_or(Error::SymbolNotFound)?;
          page_permissions.insert(page, region.protection);
        }
        page += *PAGE_SIZE;
      }

      snapshots.push(snapshot);
      trampolines.push(trampoline);
    }

    self.descriptors = descriptors;
    self.snapshots = snapshots;
    self.trampolines = trampolines;
    self.page_permissions = page_permissions;
    self.state = State::Prepared;
    Ok(())
  }

  /// Installs every hook, or none on failure.
  pub fn commit(&mut self) -> Result<()> {
    if self.state != State::Prepared {
      return Err(Error::InvalidState);
    }

    self.patch(PatchCommand::Apply)?;

    // The patched entry points now live in their providing modules for the
    // rest of the process lifetime; hot unload is not supported.
    for descriptor in &mut self.descriptors {
      descriptor.leak_module();
    }

    self.state = State::Committed;
    Ok(())
  }

  /// Restores the original prologues of a committed transaction.
  ///
  /// Rolling back a transaction that was only prepared succeeds without
  /// touching memory, since nothing has been written yet.
  pub fn rollback(&mut self) -> Result<()> {
    match self.state {
      State::Prepared => {
        self.state = State::RolledBack;
        Ok(())
      },
      State::Committed => {
        self.patch(PatchCommand::Restore)?;
        self.state = State::RolledBack;
        Ok(())
      },
      _ => Err(Error::InvalidState),
    }
  }

  /// Returns the trampoline entry for the binding at `index`, if one was
  /// requested and the transaction has been prepared.
  pub fn trampoline(&self, index: usize) -> Option<*const ()> {
    self
      .trampolines
      .get(index)
      .and_then(|trampoline| trampoline.as_ref())
      .map(Trampoline::address)
  }

  /// Writes or restores every patch under the quiescence protocol.
  fn patch(&mut self, command: PatchCommand) -> Result<()> {
    // Phase A: make every recorded page writable. The guard restores the
    // original protection bits on every exit path.
    let _permissions = PagePermissionGuard {
      pages: &self.page_permissions,
    };
    self.make_pages_writable()?;

    // Phase B: halt every peer thread outside the patch ranges.
    //
    // Any other thread may be concurrently executing the bytes we are about
    // to overwrite, and altering them mid-execution is undefined behavior.
    // Each peer is signalled and held in the handler until its captured
    // instruction pointers prove it cannot resume inside a patch range; a
    // peer caught inside one is released and signalled again after a
    // backoff. Threads created while this runs are not observed; the
    // snapshot is taken once.
    let tids = threads::all().map_err(|error| {
      log::error!("failed enumerating threads: {error}");
      Error::Unexpected
    })?;

    // Everything the halted phase touches is allocated up front: once a
    // peer is halted, it may hold the allocator lock. The control blocks
    // are kept in the transaction rather than on this frame, so a handler
    // with a slow wakeup never observes freed memory.
    self.halt_controls = (0..tids.len()).map(|_| ThreadControl::new()).collect();
    unwind::prime();

    let _action = SignalAction::install(libc::SIGUSR1, backtrace_handler, libc::SA_SIGINFO)?;
    let _release = HandlerReleaseGuard {
      controls: &self.halt_controls,
    };

    let current = threads::current();
    for (tid, control) in tids.iter().zip(&self.halt_controls) {
      if *tid == current {
        // The calling thread cannot race itself.
        continue;
      }
      self.quiesce(*tid, control)?;
    }

    // Phase C: write the patches while every peer is pinned.
    for (idx, descriptor) in self.descriptors.iter().enumerate() {
      let target = descriptor.addr as *mut u8;

      unsafe {
        match command {
          PatchCommand::Apply => {
            let patch = arch::jump_to(self.hooks[idx]);
            ptr::copy_nonoverlapping(patch.as_ptr(), target, patch.len());
            arch::flush_instruction_cache(target, patch.len());
          },
          PatchCommand::Restore => {
            let snapshot = &self.snapshots[idx];
            ptr::copy_nonoverlapping(snapshot.as_ptr(), target, snapshot.len());
            arch::flush_instruction_cache(target, snapshot.len());
          },
        }
      }
    }

    Ok(())
  }

  /// Halts `tid` in the backtrace handler, retrying until its captured
  /// frames all fall outside the patch ranges.
  fn quiesce(&self, tid: libc::pid_t, control: &ThreadControl) -> Result<()> {
    let mut backoff_us: u64 = 1;

    loop {
      control.tid.store(tid, Ordering::Release);
      control.work.reset();

      let value = libc::sigval {
        sival_ptr: control as *const ThreadControl as *mut libc::c_void,
      };
      if unsafe { libc::sigqueue(tid, libc::SIGUSR1, value) } == -1 {
        log::error!("failed to signal tid {tid}");
        return Err(Error::SignalActionFailure);
      }

      if !control.work.wait(Some(HALT_TIMEOUT)) {
        log::error!("timed out waiting for tid {tid} to be signalled");
        return Err(Error::TimedOut);
      }

      // The handler echoes the thread it actually ran on. A mismatch means
      // the signal was serviced elsewhere (possibly on this very thread)
      // and nothing was captured.
      let actual = control.tid.load(Ordering::Acquire);
      let mut resume = actual != tid;

      if !resume {
        let count = control.frame_count.load(Ordering::Acquire).min(MAX_FRAME_COUNT);
        resume = control.frames[..count]
          .iter()
          .any(|frame| self.is_patch_target(frame.load(Ordering::Acquire)));
      }

      if !resume {
        return Ok(());
      }

      // Release the handler so the thread can run past the patch ranges,
      // then try to capture it again.
      control.exit.set();

      if backoff_us > MAX_BACKOFF_US {
        log::error!("could not halt tid {tid} outside the patch ranges");
        return Err(Error::TimedOut);
      }
      thread::sleep(Duration::from_micros(backoff_us));
      backoff_us <<= 1;
    }
  }

  /// Returns true if `addr` lies inside any range about to be overwritten.
  fn is_patch_target(&self, addr: usize) -> bool {
    self
      .descriptors
      .iter()
      .any(|descriptor| {
        addr >= descriptor.addr && addr < descriptor.addr + arch::JUMP_PATCH_SIZE
      })
  }

  fn make_pages_writable(&self) -> Result<()> {
    for (&page, &protection) in &self.page_permissions {
      let prot = protection | libc::PROT_WRITE;
      if unsafe { libc::mprotect(page as *mut libc::c_void, *PAGE_SIZE, prot) } != 0 {
        log::error!("failed making page {page:#x} writable");
        return Err(Error::MemoryProtectionFailure);
      }
    }
    Ok(())
  }
}

/// Restores recorded page protections when dropped.
struct PagePermissionGuard<'a> {
  pages: &'a HashMap<usize, i32>,
}

impl Drop for PagePermissionGuard<'_> {
  fn drop(&mut self) {
    for (&page, &protection) in self.pages {
      if unsafe { libc::mprotect(page as *mut libc::c_void, *PAGE_SIZE, protection) } != 0 {
        // The primary result is already determined; log and move on.
        log::error!("failed to restore permissions on page {page:#x}");
      }
    }
  }
}

/// Releases every halted handler when dropped, so no peer is left blocked.
struct HandlerReleaseGuard<'a> {
  controls: &'a [ThreadControl],
}

impl Drop for HandlerReleaseGuard<'_> {
  fn drop(&mut self) {
    for control in self.controls {
      control.exit.set();
    }
  }
}

/// The rendezvous block shared between the signaller and one peer's handler.
struct ThreadControl {
  /// Written by the signaller with the intended recipient, overwritten by
  /// the handler with the thread it actually ran on.
  tid: AtomicI32,
  /// Set by the handler once the backtrace is captured.
  work: Event,
  /// Set by the signaller to let the handler return.
  exit: Event,
  frame_count: AtomicUsize,
  frames: [AtomicUsize; MAX_FRAME_COUNT],
}

impl ThreadControl {
  fn new() -> Self {
    ThreadControl {
      tid: AtomicI32::new(0),
      work: Event::new(),
      exit: Event::new(),
      frame_count: AtomicUsize::new(0),
      frames: std::array::from_fn(|_| AtomicUsize::new(0)),
    }
  }
}

/// Captures the backtrace of the signalled thread and holds it until
/// released.
///
/// Runs in asynchronous signal context: only atomics, events and the
/// signal-safe unwinder are used.
unsafe extern "C" fn backtrace_handler(
  signal: libc::c_int,
  info: *mut libc::siginfo_t,
  _context: *mut libc::c_void,
) {
  if signal != libc::SIGUSR1 || info.is_null() {
    return;
  }

  let control = (*info).si_value().sival_ptr as *const ThreadControl;
  if control.is_null() {
    return;
  }
  let control = &*control;

  let tid = threads::current();
  let target = control.tid.load(Ordering::Acquire);
  control.tid.store(tid, Ordering::Release);
  if target != tid {
    // The signal was serviced on a different thread than the signaller
    // expected, possibly the signalling thread itself. Announce completion
    // without capturing and without blocking; the signaller compares the
    // echoed tid and retries.
    control.work.set();
    return;
  }

  let mut frames = [0usize; MAX_FRAME_COUNT];
  let count = unwind::backtrace(&mut frames).min(MAX_FRAME_COUNT);
  for (slot, frame) in control.frames.iter().zip(&frames[..count]) {
    slot.store(*frame, Ordering::Release);
  }
  control.frame_count.store(count, Ordering::Release);

  control.exit.reset();
  // Let the signaller know the capture is published.
  control.work.set();
  // Hold this thread in place until every patch is written.
  control.exit.wait(None);
}
