//! GateGuard - hardened cores for a WireGuard-style Windows endpoint
//!
//! Two independent, standalone components:
//!
//! # Features
//!
//! - Sliding-window anti-replay filtering of 64-bit message counters
//!   (bounded memory, tolerant of out-of-order delivery)
//! - In-memory PE image loading: map a DLL straight from a byte buffer,
//!   relocate it, link it against OS-loaded dependencies, run its
//!   initializers, and resolve its exports (Windows)
//! - Pure, cross-platform PE header validation and file inspection
//!
//! # Usage (replay filtering)
//!
//! ```
//! use gateguard::replay::{ReplayFilter, REJECT_AFTER_MESSAGES};
//!
//! let mut filter = ReplayFilter::new();
//! assert!(filter.validate(0, REJECT_AFTER_MESSAGES));
//! assert!(!filter.validate(0, REJECT_AFTER_MESSAGES)); // replayed
//! ```
//!
//! # Usage (image loading)
//!
//! ```no_run
//! # #[cfg(windows)] fn main() -> Result<(), gateguard::GateGuardError> {
//! use gateguard::loader::LoadedImage;
//!
//! let bytes = std::fs::read("driver.dll")?;
//! let image = LoadedImage::load(&bytes)?;
//! let entry = image.proc_by_name(b"WintunCreateAdapter")?;
//! // ... call through `entry`, then drop or `image.free()`
//! # Ok(()) }
//! # #[cfg(not(windows))] fn main() {}
//! ```

pub mod error;
pub mod loader;
pub mod replay;

pub use error::{GateGuardError, LoadError, SymbolError};
#[cfg(windows)]
pub use loader::LoadedImage;
pub use replay::ReplayFilter;
