//! Scoped installation of a process-wide signal action.

use crate::error::{Error, Result};
use std::mem;

/// The shape of a `SA_SIGINFO` handler.
pub type Handler = unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// A temporarily installed signal action.
///
/// The previously registered action is captured on installation and restored
/// when the guard is dropped.
pub struct SignalAction {
  signal: libc::c_int,
  original: libc::sigaction,
}

impl SignalAction {
  /// Installs `handler` for `signal` with the given `sigaction` flags.
  pub fn install(signal: libc::c_int, handler: Handler, flags: libc::c_int) -> Result<Self> {
    unsafe {
      let mut action: libc::sigaction = mem::zeroed();
      action.sa_sigaction = handler as usize;
      action.sa_flags = flags;
      libc::sigemptyset(&mut action.sa_mask);

      let mut original: libc::sigaction = mem::zeroed();
      if libc::sigaction(signal, &action, &mut original) == -1 {
        log::error!("failed to install an action for signal {signal}");
        return Err(Error::SignalActionFailure);
      }

      Ok(SignalAction { signal, original })
    }
  }
}

impl Drop for SignalAction {
  fn drop(&mut self) {
    if unsafe { libc::sigaction(self.signal, &self.original, std::ptr::null_mut()) } == -1 {
      // The primary result has been determined by now; nothing to recover.
      log::error!("failed to restore the action for signal {}", self.signal);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  static HITS: AtomicUsize = AtomicUsize::new(0);

  unsafe extern "C" fn count_hits(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
  ) {
    HITS.fetch_add(1, Ordering::SeqCst);
  }

  #[test]
  fn installs_and_restores_the_action() {
    let mut before: libc::sigaction = unsafe { mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGUSR2, std::ptr::null(), &mut before) };

    {
      let _action = SignalAction::install(libc::SIGUSR2, count_hits, libc::SA_SIGINFO).unwrap();
      unsafe { libc::raise(libc::SIGUSR2) };
      assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    let mut after: libc::sigaction = unsafe { mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGUSR2, std::ptr::null(), &mut after) };
    assert_eq!(before.sa_sigaction, after.sa_sigaction);
  }
}
