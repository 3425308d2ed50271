use std::path::PathBuf;
use thiserror::Error;

use crate::drive::DriveLetter;

/// Process exit codes reported by the `vhdcompact` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    WrongArguments = 1,
    DiskpartFailed = 2,
    AttachFailed = 3,
    DefragFailed = 4,
    VhdFileNotFound = 5,
    /// The tool itself is broken or the host cannot run it.
    Fatal = 6,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum CompactError {
    #[error("Wrong arguments: {0}")]
    WrongArguments(String),

    #[error("VHD file {} doesn't exist", .0.display())]
    VhdFileNotFound(PathBuf),

    #[error("No free drive letter found")]
    NoFreeDriveLetter,

    #[error("Invalid drive letter: {0:?}")]
    InvalidDriveLetter(char),

    #[error("ERROR: Expected return code 0, got {code}. Output: {output}")]
    DiskpartFailed { code: i32, output: String },

    #[error("Attaching the drive failed ({0}: never appeared). Maybe the drive is a GPT drive? Currently only MBR drives are supported.")]
    AttachFailed(DriveLetter),

    #[error("ERROR: Expected return code 0, got {0}.")]
    DefragFailed(i32),

    #[error("Failed to launch {tool}: {source}")]
    LaunchFailed {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is already attached", .0.display())]
    AlreadyAttached(PathBuf),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("{0} terminated without an exit code")]
    ToolTerminated(String),

    #[error("Volume enumeration failed: {0}")]
    VolumeEnumeration(String),

    #[error("Platform not supported: {0}")]
    PlatformNotSupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CompactError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CompactError::WrongArguments(_) => ExitCode::WrongArguments,
            CompactError::VhdFileNotFound(_) => ExitCode::VhdFileNotFound,
            CompactError::DiskpartFailed { .. } => ExitCode::DiskpartFailed,
            CompactError::AttachFailed(_) => ExitCode::AttachFailed,
            CompactError::DefragFailed(_) => ExitCode::DefragFailed,
            CompactError::NoFreeDriveLetter
            | CompactError::InvalidDriveLetter(_)
            | CompactError::AlreadyAttached(_)
            | CompactError::LaunchFailed { .. }
            | CompactError::ToolNotFound(_)
            | CompactError::ToolTerminated(_)
            | CompactError::VolumeEnumeration(_)
            | CompactError::PlatformNotSupported(_)
            | CompactError::Configuration(_)
            | CompactError::IoError(_)
            | CompactError::SerializationError(_) => ExitCode::Fatal,
        }
    }

    /// Faults of the invoker itself, as opposed to a tool reporting failure.
    pub fn is_invoker_fault(&self) -> bool {
        matches!(
            self,
            CompactError::LaunchFailed { .. }
                | CompactError::ToolNotFound(_)
                | CompactError::ToolTerminated(_)
        )
    }
}
