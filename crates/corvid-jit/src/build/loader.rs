//! Shared-object loading
//!
//! Loads a compiled unit with `dlopen(RTLD_NOW | RTLD_LOCAL)` and resolves
//! its entry symbol. The handle lives on the unit and is closed when the
//! unit is unloaded, so the code stays mapped for as long as the engine
//! considers it resident.

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::vm::JitFuncPtr;

/// Errors from loading a compiled unit
#[derive(Debug, Error)]
pub enum LoadError {
    /// The shared object could not be opened
    #[error("cannot load {path}: {reason}")]
    Open {
        /// Path that was attempted
        path: String,
        /// dlerror text
        reason: String,
    },
    /// The entry symbol is missing from the object
    #[error("symbol {symbol} not found in {path}")]
    Symbol {
        /// The entry symbol
        symbol: String,
        /// Object path
        path: String,
    },
    /// The path or symbol contained an interior NUL
    #[error("invalid name: {0}")]
    InvalidName(String),
}

fn dlerror_string() -> String {
    // Safety: dlerror returns a thread-local string or null
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// An open shared object holding one compiled unit
#[derive(Debug)]
pub struct SharedObject {
    handle: *mut std::ffi::c_void,
    path: PathBuf,
}

impl SharedObject {
    /// Open a compiled unit with immediate binding
    pub fn open(path: &Path) -> Result<SharedObject, LoadError> {
        let c_path = CString::new(path.display().to_string())
            .map_err(|_| LoadError::InvalidName(path.display().to_string()))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LoadError::Open {
                path: path.display().to_string(),
                reason: dlerror_string(),
            });
        }

        Ok(SharedObject { handle, path: path.to_path_buf() })
    }

    /// Resolve the unit's entry function.
    ///
    /// The returned pointer is only valid while this object stays open; the
    /// unit retains the object for exactly that reason.
    pub fn entry(&self, symbol: &str) -> Result<JitFuncPtr, LoadError> {
        let c_symbol =
            CString::new(symbol).map_err(|_| LoadError::InvalidName(symbol.to_string()))?;

        // Safety: dlsym with a handle this struct owns
        let func = unsafe {
            libc::dlerror(); // clear any stale error
            libc::dlsym(self.handle, c_symbol.as_ptr())
        };
        if func.is_null() {
            return Err(LoadError::Symbol {
                symbol: symbol.to_string(),
                path: self.path.display().to_string(),
            });
        }

        // Safety: the symbol was emitted by the translator with exactly this
        // signature.
        Ok(unsafe { std::mem::transmute::<*mut std::ffi::c_void, JitFuncPtr>(func) })
    }

    /// Path the object was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SharedObject {
    fn drop(&mut self) {
        // Safety: handle came from dlopen and is closed exactly once
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

// Safety: dlopen handles are process-global; the worker opens objects and
// the engine drops them from whichever thread runs finish().
unsafe impl Send for SharedObject {}
unsafe impl Sync for SharedObject {}
