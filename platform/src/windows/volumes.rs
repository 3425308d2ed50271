use std::collections::BTreeSet;
use vhdcompact_core::drive::letters_from_mask;
use vhdcompact_core::{CompactError, DriveLetter, VolumeTable};
use windows::Win32::Storage::FileSystem::GetLogicalDrives;

/// Mounted volumes as reported by `GetLogicalDrives`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogicalDriveTable;

#[async_trait::async_trait]
impl VolumeTable for LogicalDriveTable {
    async fn mounted_letters(&self) -> Result<BTreeSet<DriveLetter>, CompactError> {
        let mask = unsafe { GetLogicalDrives() };
        if mask == 0 {
            let err = std::io::Error::last_os_error();
            return Err(CompactError::VolumeEnumeration(format!("GetLogicalDrives failed: {}", err)));
        }

        let letters = letters_from_mask(mask);
        tracing::trace!("Logical drives: {:?}", letters);
        Ok(letters)
    }
}
