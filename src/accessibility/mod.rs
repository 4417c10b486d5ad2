//! Platform accessibility trees for the text context probe.

#[cfg(target_os = "windows")]
mod uia;

#[cfg(target_os = "macos")]
mod ax;

#[cfg(target_os = "windows")]
pub use uia::UiaTree as PlatformTree;

#[cfg(target_os = "macos")]
pub use ax::AxTree as PlatformTree;

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub use crate::text_context::UnsupportedTree as PlatformTree;
