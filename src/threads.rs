//! Enumeration of the kernel tasks of the current process.

use std::io;
use std::fs;

/// Returns the thread id of the calling thread.
pub fn current() -> libc::pid_t {
  // Direct syscall; the glibc wrapper is not available everywhere.
  unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Returns a snapshot of every task id of the current process.
///
/// The snapshot is taken once; threads created afterwards are not observed
/// unless the caller asks again.
pub fn all() -> io::Result<Vec<libc::pid_t>> {
  let mut tids = Vec::new();

  for entry in fs::read_dir("/proc/self/task")? {
    let entry = entry?;
    if let Ok(tid) = entry.file_name().to_string_lossy().parse() {
      tids.push(tid);
    }
  }

  Ok(tids)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  #[test]
  fn snapshot_contains_the_calling_thread() {
    let tids = all().unwrap();
    assert!(tids.contains(&current()));
  }

  #[test]
  fn snapshot_observes_live_threads() {
    let (started_tx, started) = mpsc::channel();
    let (release, released) = mpsc::channel::<()>();

    let worker = std::thread::spawn(move || {
      started_tx.send(current()).unwrap();
      released.recv().unwrap();
    });

    let worker_tid = started.recv().unwrap();
    let tids = all().unwrap();
    assert!(tids.contains(&worker_tid));
    assert!(tids.contains(&current()));

    release.send(()).unwrap();
    worker.join().unwrap();
  }
}
