//! Enumeration of the objects loaded into the current process.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::{fs, ptr};

/// Invokes `visitor` with the file path and load base of every loaded object
/// that carries ELF program headers.
///
/// The dynamic loader reports the main executable with an empty name; the
/// resolved path of the current executable is substituted so callers can open
/// the backing file.
pub fn for_each<F>(visitor: F)
where
  F: FnMut(&Path, usize),
{
  struct Context<F> {
    visitor: F,
    executable: Option<PathBuf>,
  }

  unsafe extern "C" fn callback<F>(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
  ) -> libc::c_int
  where
    F: FnMut(&Path, usize),
  {
    let info = &*info;
    if info.dlpi_phnum == 0 || info.dlpi_phdr.is_null() {
      // Entry has no program headers, skip it.
      return 0;
    }

    let context = &mut *(data as *mut Context<F>);
    let base = info.dlpi_addr as usize;

    if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
      // The unnamed entry is the main executable.
      let path = context
        .executable
        .get_or_insert_with(executable_path)
        .clone();
      (context.visitor)(&path, base);
    } else {
      let name = CStr::from_ptr(info.dlpi_name);
      let path = Path::new(std::ffi::OsStr::from_bytes(name.to_bytes()));
      (context.visitor)(path, base);
    }

    0
  }

  let mut context = Context {
    visitor,
    executable: None,
  };

  unsafe {
    libc::dl_iterate_phdr(
      Some(callback::<F>),
      &mut context as *mut Context<F> as *mut libc::c_void,
    );
  }
}

/// Returns the executable file path for the current process.
pub fn executable_path() -> PathBuf {
  fs::read_link("/proc/self/exe").unwrap_or_default()
}

/// A reference to a loaded module.
///
/// Holding the handle pins the module in memory; the reference is released
/// when the handle is dropped.
#[derive(Debug)]
pub struct ModuleHandle(*mut libc::c_void);

impl ModuleHandle {
  /// Acquires a reference to the module backed by `path`.
  ///
  /// The module is expected to already be loaded, so this only bumps the
  /// loader's reference count.
  pub fn open(path: &Path) -> Option<ModuleHandle> {
    let path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) };

    if handle.is_null() {
      None
    } else {
      Some(ModuleHandle(handle))
    }
  }

  /// Resolves `name` through the dynamic loader within this module.
  pub fn symbol(&self, name: &str) -> *mut libc::c_void {
    let Ok(name) = CString::new(name) else {
      return ptr::null_mut();
    };
    unsafe { libc::dlsym(self.0, name.as_ptr()) }
  }
}

impl Drop for ModuleHandle {
  fn drop(&mut self) {
    unsafe { libc::dlclose(self.0) };
  }
}

// The loader's reference count is thread safe.
unsafe impl Send for ModuleHandle {}
unsafe impl Sync for ModuleHandle {}
