use std::collections::BTreeSet;
use vhdcompact_core::{CompactError, DriveLetter, VolumeTable};

/// Hosts without drive letters have nothing to allocate from.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedVolumeTable;

#[async_trait::async_trait]
impl VolumeTable for UnsupportedVolumeTable {
    async fn mounted_letters(&self) -> Result<BTreeSet<DriveLetter>, CompactError> {
        Err(CompactError::PlatformNotSupported(format!(
            "drive letters are not available on {}",
            std::env::consts::OS
        )))
    }
}
