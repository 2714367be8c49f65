//! Engine configuration
//!
//! The host's option parser validates the `--jit-*` command-line surface and
//! hands the engine a `JitOptions` snapshot at startup; nothing here is
//! consulted again after `JitEngine::init`. `JitOptions::parse` implements
//! the token grammar so the host can delegate the `--jit=<token>,<token>`
//! form wholesale.

use std::path::PathBuf;

use thiserror::Error;

/// Which external C compiler drives the shared-object builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    /// The platform default driver, `cc`
    Cc,
    /// Clang, selected by the `llvm` token
    Clang,
}

impl CompilerKind {
    /// Executable name looked up on PATH when no explicit path is configured
    pub fn command(self) -> &'static str {
        match self {
            CompilerKind::Cc => "cc",
            CompilerKind::Clang => "clang",
        }
    }
}

/// Error from `JitOptions::parse`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    /// Token is not part of the surface
    #[error("unknown JIT option: {0}")]
    UnknownOption(String),
    /// Token has a malformed value
    #[error("invalid value for JIT option {option}: {value}")]
    InvalidValue {
        /// The option name
        option: String,
        /// The rejected value
        value: String,
    },
}

/// Engine configuration, fixed at startup
#[derive(Debug, Clone, PartialEq)]
pub struct JitOptions {
    /// Master switch; a disabled engine ignores every request
    pub enabled: bool,
    /// Compiler selector
    pub compiler: CompilerKind,
    /// Keep intermediate `.c`, `.so` and the PCH after exit
    pub save_temps: bool,
    /// Emit compiler-warning diagnostics to the diagnostic sink
    pub warnings: bool,
    /// Compile generated code with `-O0 -g` instead of `-O2`
    pub debug: bool,
    /// Internal tracing level, 0..3
    pub verbose: u32,
    /// Upper bound on resident compiled units
    pub max_cache_size: usize,
    /// Calls before a body is considered hot
    pub min_calls: usize,

    /// Host-supplied path to the minimized runtime header (install-layout
    /// override; falls back to the search described in `JitEngine::init`)
    pub header_path: Option<PathBuf>,
    /// Host-supplied compiler executable, overriding the selector
    pub compiler_path: Option<PathBuf>,
    /// Scratch directory override; defaults to the platform temp dir
    pub scratch_dir: Option<PathBuf>,
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions {
            enabled: false,
            compiler: CompilerKind::Cc,
            save_temps: false,
            warnings: false,
            debug: false,
            verbose: 0,
            max_cache_size: 1000,
            min_calls: 5,
            header_path: None,
            compiler_path: None,
            scratch_dir: None,
        }
    }
}

impl JitOptions {
    /// Parse the command-line token surface: `on`, `llvm`, `save-temps`,
    /// `warnings`, `debug`, `verbose=<int>`, `max-cache-size=<int>`,
    /// `min-calls=<int>`.
    pub fn parse<'a, I>(tokens: I) -> Result<JitOptions, OptionError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut opts = JitOptions::default();
        for token in tokens {
            match token {
                "on" => opts.enabled = true,
                "llvm" => opts.compiler = CompilerKind::Clang,
                "save-temps" => opts.save_temps = true,
                "warnings" => opts.warnings = true,
                "debug" => opts.debug = true,
                _ => {
                    let (name, value) = token
                        .split_once('=')
                        .ok_or_else(|| OptionError::UnknownOption(token.to_string()))?;
                    let parsed: usize = value.parse().map_err(|_| OptionError::InvalidValue {
                        option: name.to_string(),
                        value: value.to_string(),
                    })?;
                    match name {
                        "verbose" => opts.verbose = parsed as u32,
                        "max-cache-size" => opts.max_cache_size = parsed,
                        "min-calls" => opts.min_calls = parsed,
                        _ => return Err(OptionError::UnknownOption(token.to_string())),
                    }
                }
            }
        }
        Ok(opts)
    }

    /// Emit an internal tracing line when the verbose level allows it
    pub(crate) fn diag(&self, level: u32, msg: &str) {
        if self.verbose >= level {
            eprintln!("jit: {}", msg);
        }
    }

    /// Emit a per-unit failure diagnostic (warnings flag or verbose >= 3)
    pub(crate) fn warn(&self, msg: &str) {
        if self.warnings || self.verbose >= 3 {
            eprintln!("jit warning: {}", msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = JitOptions::default();
        assert!(!opts.enabled);
        assert_eq!(opts.compiler, CompilerKind::Cc);
        assert_eq!(opts.verbose, 0);
        assert_eq!(opts.max_cache_size, 1000);
        assert_eq!(opts.min_calls, 5);
    }

    #[test]
    fn test_parse_flags() {
        let opts = JitOptions::parse(["on", "llvm", "save-temps", "warnings", "debug"]).unwrap();
        assert!(opts.enabled);
        assert_eq!(opts.compiler, CompilerKind::Clang);
        assert!(opts.save_temps);
        assert!(opts.warnings);
        assert!(opts.debug);
    }

    #[test]
    fn test_parse_values() {
        let opts =
            JitOptions::parse(["on", "verbose=2", "max-cache-size=16", "min-calls=100"]).unwrap();
        assert_eq!(opts.verbose, 2);
        assert_eq!(opts.max_cache_size, 16);
        assert_eq!(opts.min_calls, 100);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(
            JitOptions::parse(["bogus"]),
            Err(OptionError::UnknownOption("bogus".to_string()))
        );
        assert_eq!(
            JitOptions::parse(["frobnicate=3"]),
            Err(OptionError::UnknownOption("frobnicate=3".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_value() {
        assert_eq!(
            JitOptions::parse(["verbose=lots"]),
            Err(OptionError::InvalidValue {
                option: "verbose".to_string(),
                value: "lots".to_string(),
            })
        );
    }
}
