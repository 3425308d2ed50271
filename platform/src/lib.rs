#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(not(target_os = "windows"))]
pub mod unsupported;

#[cfg(target_os = "windows")]
pub use windows::LogicalDriveTable as PlatformVolumeTable;

#[cfg(not(target_os = "windows"))]
pub use unsupported::UnsupportedVolumeTable as PlatformVolumeTable;

#[cfg(target_os = "windows")]
pub use windows::is_elevated;

/// Only Windows elevation is checked; elsewhere nothing can run anyway.
#[cfg(not(target_os = "windows"))]
pub fn is_elevated() -> bool {
    true
}
