//! Error types for GateGuard

use thiserror::Error;

/// Main error type for GateGuard
#[derive(Error, Debug)]
pub enum GateGuardError {
    /// Image loading errors
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Symbol lookup errors
    #[error("Symbol error: {0}")]
    Symbol(#[from] SymbolError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Errors raised while loading a PE image into memory.
///
/// Every failure during `load` tears down any partially acquired state
/// (committed pages, dependency handles, blocker reservations) before the
/// error is returned.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("bad image: {reason}")]
    BadImage { reason: String },

    #[error("virtual memory allocation failed: {reason}")]
    AllocFailed { reason: String },

    #[error("image must be relocated but carries no relocation directory")]
    RelocationRequiredButAbsent,

    #[error("failed to load dependency {library}: {reason}")]
    DependencyLoadFailed { library: String, reason: String },

    #[error("failed to resolve {symbol} in {library}: {reason}")]
    SymbolResolutionFailed {
        library: String,
        symbol: String,
        reason: String,
    },

    #[error("DLL entry point reported initialization failure")]
    DllInitFailed,
}

impl LoadError {
    /// Shorthand for the header-validation failure case.
    pub(crate) fn bad_image(reason: impl Into<String>) -> Self {
        LoadError::BadImage {
            reason: reason.into(),
        }
    }
}

/// Errors raised by export lookup on a loaded image.
///
/// Lookup never mutates the image; these errors carry no teardown
/// obligations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SymbolError {
    #[error("image has no export directory")]
    NoExports,

    #[error("no export named {name}")]
    NotFound { name: String },

    #[error("ordinal index {ordinal} exceeds the export address table")]
    OrdinalOutOfRange { ordinal: u16 },

    #[error("ordinal {ordinal} is below the export base {base}")]
    OrdinalTooLow { ordinal: u16, base: u32 },
}

/// Result type alias for GateGuard operations
pub type Result<T> = std::result::Result<T, GateGuardError>;
