//! Capture of the current thread's instruction-pointer chain.

/// Fills `frames` with the return addresses of the current call chain and
/// returns the number of entries written.
///
/// Callable from asynchronous signal context provided [`prime`] has run
/// beforehand; no allocation happens on the capture path itself.
pub fn backtrace(frames: &mut [usize]) -> usize {
  extern "C" {
    // glibc execinfo.
    #[link_name = "backtrace"]
    fn glibc_backtrace(buffer: *mut *mut libc::c_void, size: libc::c_int) -> libc::c_int;
  }

  if frames.is_empty() {
    return 0;
  }

  let count = unsafe {
    glibc_backtrace(
      frames.as_mut_ptr() as *mut *mut libc::c_void,
      frames.len() as libc::c_int,
    )
  };

  count.max(0) as usize
}

/// Forces the lazy pieces of the unwinder to load.
///
/// glibc resolves its unwind tables through the dynamic loader on the first
/// `backtrace` call, which may allocate; taking one throwaway capture ahead
/// of time keeps the signal-handler path allocation free.
pub fn prime() {
  let mut scratch = [0usize; 8];
  backtrace(&mut scratch);
}
