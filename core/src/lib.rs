pub mod console;
pub mod diskpart;
pub mod drive;
pub mod error;
pub mod invoker;
pub mod options;
pub mod workflow;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use console::{Console, StdConsole};
pub use diskpart::DiskpartScript;
pub use drive::{DriveLetter, DriveLetterAllocator, VolumeTable};
pub use error::{CompactError, ExitCode};
pub use invoker::{CommandResult, ProcessRunner, ToolRunner};
pub use options::CompactOptions;
pub use workflow::{CompactReport, CompactWorkflow, ExecutionContext, PlannedStep, VdiskState};
