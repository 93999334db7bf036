use std::cell::RefCell;

use rustc_hash::FxHashSet;

use crate::env::env_flag;

/// Name of the environment variable which enables verbose output.
pub const VERBOSE_ENV_VAR: &str = "GCAP_VERBOSE";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    Off,
    /// Report only behavior the caller should be aware of, such as control
    /// flow that is not captured.
    Warn,
    /// Report every step of the export.
    Info,
}

/// Diagnostic reporter for graph capture and export.
///
/// Messages are written to stderr, one per line, prefixed with the level and
/// the context (usually a node or value) they relate to.
pub struct Diagnostics {
    /// Contexts against which diagnostics have been reported at the `Warn`
    /// level.
    warned: RefCell<FxHashSet<String>>,
    level: DiagnosticLevel,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DiagnosticLevel::Off)
    }
}

impl Diagnostics {
    pub fn new(level: DiagnosticLevel) -> Self {
        Self {
            warned: RefCell::new(FxHashSet::default()),
            level,
        }
    }

    /// Create a reporter whose level is set by the `GCAP_VERBOSE` environment
    /// variable. Warnings are shown by default.
    pub fn from_env() -> Self {
        let level = if env_flag(VERBOSE_ENV_VAR, false) {
            DiagnosticLevel::Info
        } else {
            DiagnosticLevel::Warn
        };
        Self::new(level)
    }

    pub fn level(&self) -> DiagnosticLevel {
        self.level
    }

    /// Return true if diagnostic messages are enabled at a given level.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        self.level >= level
    }

    /// Log a message at the [`Info`](DiagnosticLevel::Info) level.
    pub fn info(&self, context: &str, message: std::fmt::Arguments<'_>) {
        if !self.enabled(DiagnosticLevel::Info) {
            return;
        }
        self.log(DiagnosticLevel::Info, context, message);
    }

    /// Log a message at the [`Warn`](DiagnosticLevel::Warn) level.
    ///
    /// Only the first warning for each context is shown.
    pub fn warn(&self, context: &str, message: std::fmt::Arguments<'_>) {
        if !self.enabled(DiagnosticLevel::Warn) || !self.warned.borrow_mut().insert(context.into())
        {
            return;
        }
        self.log(DiagnosticLevel::Warn, context, message);
    }

    /// Return the number of distinct contexts that have been warned about.
    pub fn warning_count(&self) -> usize {
        self.warned.borrow().len()
    }

    fn log(&self, level: DiagnosticLevel, context: &str, message: std::fmt::Arguments<'_>) {
        let level_char = match level {
            DiagnosticLevel::Warn => 'W',
            DiagnosticLevel::Info => 'I',
            DiagnosticLevel::Off => unreachable!(),
        };
        eprintln!("{}| {}: {}", level_char, context, message);
    }
}
