//! Symbol resolution against the loaded ELF images.

use crate::modules::{self, ModuleHandle};
use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::{Elf, Sym};
use goblin::strtab::Strtab;
use std::fs;
use std::path::Path;

/// The resolution of one symbol name.
///
/// The descriptor owns a reference to the providing module, so the patched
/// code cannot be unloaded while the descriptor is alive.
#[derive(Debug)]
pub struct Descriptor {
  /// Runtime address of the symbol.
  pub addr: usize,
  /// Size of the symbol in bytes, as recorded in the symbol table.
  pub size: usize,
  module: Option<ModuleHandle>,
}

impl Descriptor {
  /// Returns the handle of the providing module, when one could be pinned.
  pub fn module(&self) -> Option<&ModuleHandle> {
    self.module.as_ref()
  }

  /// Keeps the providing module loaded for the remaining process lifetime.
  pub fn leak_module(&mut self) {
    if let Some(handle) = self.module.take() {
      std::mem::forget(handle);
    }
  }
}

/// Resolves `names` against every loaded module, returning a vector parallel
/// to the input.
///
/// Modules are visited in link-map order (the main executable first, then
/// shared objects in load order) and both `.symtab` and `.dynsym` are
/// scanned; symbols with an undefined section, a zero value or a zero size
/// are ignored. When a name is present in more than one module, the first
/// match wins.
pub fn lookup<S: AsRef<str>>(names: &[S]) -> Vec<Option<Descriptor>> {
  let mut descriptors: Vec<Option<Descriptor>> = names.iter().map(|_| None).collect();

  modules::for_each(|path, base| {
    if descriptors.iter().all(Option::is_some) {
      return;
    }

    if path.to_string_lossy().contains("vdso") {
      // The vdso is not backed by a file we can load and parse.
      return;
    }

    let data = match fs::read(path) {
      Ok(data) => data,
      Err(error) => {
        log::debug!("failed reading {}: {error}", path.display());
        return;
      },
    };

    let elf = match Elf::parse(&data) {
      Ok(elf) => elf,
      Err(error) => {
        log::debug!("failed to load {} as an ELF file: {error}", path.display());
        return;
      },
    };

    scan_symbols(names, &mut descriptors, path, base, elf.syms.iter(), &elf.strtab);
    scan_symbols(
      names,
      &mut descriptors,
      path,
      base,
      elf.dynsyms.iter(),
      &elf.dynstrtab,
    );
  });

  descriptors
}

fn scan_symbols<S: AsRef<str>>(
  names: &[S],
  descriptors: &mut [Option<Descriptor>],
  path: &Path,
  base: usize,
  symbols: impl Iterator<Item = Sym>,
  strings: &Strtab,
) {
  for sym in symbols {
    if sym.st_shndx == SHN_UNDEF as usize || sym.st_value == 0 || sym.st_size == 0 {
      // Skip undefined and empty symbols.
      continue;
    }

    let Some(name) = strings.get_at(sym.st_name) else {
      continue;
    };

    for (idx, requested) in names.iter().enumerate() {
      if descriptors[idx].is_some() || requested.as_ref() != name {
        continue;
      }

      let module = ModuleHandle::open(path);
      if module.is_none() {
        // The main executable cannot always be reopened through the loader,
        // but it can never be unloaded either.
        log::debug!("could not pin {}", path.display());
      }

      descriptors[idx] = Some(Descriptor {
        addr: base + sym.st_value as usize,
        size: sym.st_size as usize,
        module,
      });
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[no_mangle]
  extern "C" fn graft_symbols_test_fn() -> usize {
    7
  }

  #[no_mangle]
  static GRAFT_SYMBOLS_TEST_ARRAY: [u8; 24] = [0; 24];

  #[test]
  fn resolves_exported_libc_symbols() {
    let descriptors = lookup(&["malloc", "snprintf"]);

    for descriptor in &descriptors {
      let descriptor = descriptor.as_ref().expect("libc symbol did not resolve");
      assert_ne!(descriptor.addr, 0);
      assert!(descriptor.size > 0);

      let module = descriptor.module().expect("module was not pinned");
      assert!(!module.symbol("malloc").is_null());
    }

    let malloc = descriptors[0].as_ref().unwrap();
    assert_eq!(
      malloc.module().unwrap().symbol("malloc") as usize,
      malloc.addr
    );
  }

  #[test]
  fn resolves_private_symbols_in_the_executable() {
    let descriptors = lookup(&["graft_symbols_test_fn", "GRAFT_SYMBOLS_TEST_ARRAY"]);

    let function = descriptors[0].as_ref().expect("function did not resolve");
    assert_eq!(function.addr, graft_symbols_test_fn as usize);

    let array = descriptors[1].as_ref().expect("array did not resolve");
    assert_eq!(array.addr, GRAFT_SYMBOLS_TEST_ARRAY.as_ptr() as usize);
    assert_eq!(array.size, 24);
  }

  #[test]
  fn unknown_symbols_stay_unresolved() {
    let descriptors = lookup(&["kwyjibo"]);
    assert!(descriptors[0].is_none());
  }
}
