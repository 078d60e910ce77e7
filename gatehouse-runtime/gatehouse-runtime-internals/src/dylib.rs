use crate::error::Error;
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};

/// A shared library held open for the lifetime of a loaded module.
///
/// Dropping a `SharedLibrary` unloads it, so any early return from a load
/// sequence releases the OS handle without an explicit unwind step.
pub struct SharedLibrary {
    lib: Library,
    path: PathBuf,
}

impl SharedLibrary {
    /// Open a shared library by path or soname.
    ///
    /// On Windows the loader's search rules differ enough from Unix that a
    /// bare relative path often misses; a failed load is retried against the
    /// current working directory and then against the running executable's
    /// directory before the original error is returned.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        match unsafe { Library::new(path) } {
            Ok(lib) => Ok(SharedLibrary {
                lib,
                path: path.to_owned(),
            }),
            Err(e) => Self::load_fallback(path, e),
        }
    }

    #[cfg(windows)]
    fn load_fallback(path: &Path, first_err: libloading::Error) -> Result<Self, Error> {
        for candidate in Self::alternate_paths(path) {
            if let Ok(lib) = unsafe { Library::new(&candidate) } {
                return Ok(SharedLibrary {
                    lib,
                    path: candidate,
                });
            }
        }
        Err(Error::DlError(first_err))
    }

    #[cfg(windows)]
    fn alternate_paths(path: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(path));
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(path));
            }
        }
        candidates
    }

    #[cfg(not(windows))]
    fn load_fallback(_path: &Path, first_err: libloading::Error) -> Result<Self, Error> {
        Err(Error::DlError(first_err))
    }

    /// Look up a symbol by name. No retries; a missing symbol is a missing
    /// symbol.
    ///
    /// # Safety
    ///
    /// The caller must provide the correct type for the symbol. See
    /// [`libloading::Library::get`].
    pub unsafe fn symbol<T>(&self, name: &[u8]) -> Result<Symbol<'_, T>, Error> {
        self.lib.get(name).map_err(Error::DlError)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_fails() {
        let err = SharedLibrary::load("/nonexistent/libgatehouse_no_such_module.so");
        assert!(matches!(err, Err(Error::DlError(_))));
    }

    #[test]
    fn not_a_library_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("libnot_a_module.so");
        std::fs::write(&path, b"this is not an object file").expect("write");
        assert!(SharedLibrary::load(&path).is_err());
    }
}
