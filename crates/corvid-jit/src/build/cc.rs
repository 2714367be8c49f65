//! External C compiler invocation
//!
//! Assembles argument vectors from a fixed template and runs the compiler as
//! a child process. Per-unit builds and the one-time PCH build share the
//! same spawn path; the only variation is the PCH-emit versus PCH-use flags
//! and the debug/optimization level.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::options::{CompilerKind, JitOptions};

/// Error from a compiler step. No retries at this layer; the worker marks
/// the unit not compilable and moves on.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The child could not be spawned, or was terminated by a signal
    #[error("failed to run {compiler}: {reason}")]
    Spawn {
        /// Compiler executable
        compiler: String,
        /// What went wrong
        reason: String,
    },
    /// The compiler ran and reported failure
    #[error("{compiler} exited with status {status}")]
    ExitStatus {
        /// Compiler executable
        compiler: String,
        /// Non-zero exit code
        status: i32,
    },
}

/// Resolve the compiler executable: explicit host override first, then the
/// selector's PATH lookup name.
pub fn resolve_compiler(opts: &JitOptions) -> PathBuf {
    match &opts.compiler_path {
        Some(path) => path.clone(),
        None => PathBuf::from(opts.compiler.command()),
    }
}

fn common_flags(opts: &JitOptions, args: &mut Vec<String>) {
    if opts.debug {
        args.push("-O0".to_string());
        args.push("-g".to_string());
    } else {
        args.push("-O2".to_string());
    }
    if opts.warnings {
        args.push("-Wall".to_string());
    } else {
        args.push("-w".to_string());
    }
    args.push("-pipe".to_string());
}

/// Arguments for the one-time PCH build: compile the minimized header as a
/// C header, writing the precompiled artifact to `pch`.
pub fn pch_args(opts: &JitOptions, header: &Path, pch: &Path) -> Vec<String> {
    let mut args = Vec::new();
    common_flags(opts, &mut args);
    args.push("-fPIC".to_string());
    args.push("-x".to_string());
    args.push("c-header".to_string());
    args.push(header.display().to_string());
    args.push("-o".to_string());
    args.push(pch.display().to_string());
    args
}

/// Arguments for a per-unit build: compile one generated `.c` against the
/// PCH into a shared object. The object references only symbols already
/// present in the host process, so no libraries are linked in.
pub fn so_args(opts: &JitOptions, pch: &Path, c_file: &Path, so_file: &Path) -> Vec<String> {
    let mut args = Vec::new();
    common_flags(opts, &mut args);
    args.push("-fPIC".to_string());
    if cfg!(target_os = "macos") {
        args.push("-dynamiclib".to_string());
    } else {
        args.push("-shared".to_string());
        args.push("-nostartfiles".to_string());
        args.push("-nodefaultlibs".to_string());
        args.push("-nostdlib".to_string());
    }
    if opts.compiler == CompilerKind::Clang {
        args.push("-include-pch".to_string());
        args.push(pch.display().to_string());
    }
    args.push(c_file.display().to_string());
    args.push("-o".to_string());
    args.push(so_file.display().to_string());
    args
}

/// Run the compiler and wait for it. Child output goes to the null sink
/// unless the verbose level asks to see it. Termination by signal is
/// reported as a spawn failure, like a compiler that never ran.
pub fn run_compiler(compiler: &Path, args: &[String], verbose: u32) -> Result<(), CompileError> {
    let name = compiler.display().to_string();
    let mut cmd = Command::new(compiler);
    cmd.args(args).stdin(Stdio::null());
    if verbose == 0 {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let status = cmd.status().map_err(|e| CompileError::Spawn {
        compiler: name.clone(),
        reason: e.to_string(),
    })?;

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(CompileError::ExitStatus { compiler: name, status: code }),
        None => Err(CompileError::Spawn {
            compiler: name,
            reason: "terminated by signal".to_string(),
        }),
    }
}
