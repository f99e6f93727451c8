//! A futex-based synchronization primitive similar to a Win32 manual-reset
//! event.
//!
//! The commit protocol uses these for the rendezvous between the signalling
//! thread and a peer's signal handler, so every method must be callable from
//! asynchronous signal context: only atomic operations and the futex syscall,
//! no allocation and no locks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const UNSET: u32 = 0;
const SET: u32 = 1;

/// A manual-reset event on a 32-bit futex word.
pub struct Event {
  value: AtomicU32,
}

impl Event {
  /// Creates a new event in the unset state.
  pub const fn new() -> Self {
    Event {
      value: AtomicU32::new(UNSET),
    }
  }

  /// Resets the event from set to unset. Noop if the event is already unset.
  pub fn reset(&self) {
    self.value.store(UNSET, Ordering::Release);
  }

  /// Sets the event and unblocks all waiters. Noop if the event is already set.
  pub fn set(&self) {
    if self.value.swap(SET, Ordering::Release) == UNSET {
      self.wake_all();
    }
  }

  /// Waits for the event to become set, returning `false` on timeout.
  ///
  /// Returns immediately if the event is already set; once set, every wait
  /// returns `true` until the event is reset.
  pub fn wait(&self, timeout: Option<Duration>) -> bool {
    let timespec = timeout.map(|duration| libc::timespec {
      tv_sec: duration.as_secs() as libc::time_t,
      tv_nsec: libc::c_long::from(duration.subsec_nanos()),
    });

    loop {
      if self.value.load(Ordering::Acquire) == SET {
        return true;
      }

      let result = unsafe {
        libc::syscall(
          libc::SYS_futex,
          self.value.as_ptr(),
          libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
          UNSET,
          timespec
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec),
          0usize,
          0u32,
        )
      };

      if result == -1 {
        match unsafe { *libc::__errno_location() } {
          // The word changed under us, or a signal interrupted the wait;
          // both count as spurious wakeups.
          libc::EAGAIN | libc::EINTR => continue,
          libc::ETIMEDOUT => return false,
          // Any other errno is a programming error.
          _ => std::process::abort(),
        }
      }
    }
  }

  fn wake_all(&self) {
    let result = unsafe {
      libc::syscall(
        libc::SYS_futex,
        self.value.as_ptr(),
        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
        i32::MAX,
        0usize,
        0usize,
        0u32,
      )
    };

    if result == -1 {
      std::process::abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn set_before_wait_returns_immediately() {
    let event = Event::new();
    event.set();
    assert!(event.wait(Some(Duration::from_millis(1))));
    // A set event stays set until reset.
    assert!(event.wait(None));
  }

  #[test]
  fn wait_times_out_when_unset() {
    let event = Event::new();
    assert!(!event.wait(Some(Duration::from_millis(10))));
  }

  #[test]
  fn reset_clears_a_set_event() {
    let event = Event::new();
    event.set();
    event.reset();
    assert!(!event.wait(Some(Duration::from_millis(10))));
  }

  #[test]
  fn set_wakes_a_blocked_waiter() {
    let event = Arc::new(Event::new());
    let waiter = {
      let event = event.clone();
      thread::spawn(move || event.wait(Some(Duration::from_secs(5))))
    };

    thread::sleep(Duration::from_millis(20));
    event.set();
    assert!(waiter.join().unwrap());
  }
}
