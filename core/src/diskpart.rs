use crate::DriveLetter;
use std::fmt;
use std::path::Path;

/// A diskpart script bound to one virtual disk file.
///
/// Every script starts by selecting the image; diskpart keeps that selection
/// for the following commands, so order matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskpartScript {
    commands: Vec<String>,
}

impl DiskpartScript {
    pub fn for_vdisk(image: &Path) -> Self {
        Self {
            commands: vec![format!("select vdisk file=\"{}\"", image.display())],
        }
    }

    pub fn attach(self) -> Self {
        self.push("attach vdisk")
    }

    pub fn attach_readonly(self) -> Self {
        self.push("attach vdisk readonly")
    }

    pub fn select_partition(self, index: u32) -> Self {
        self.push(format!("select part {}", index))
    }

    pub fn assign_letter(self, letter: DriveLetter) -> Self {
        self.push(format!("assign letter={}", letter))
    }

    pub fn detach(self) -> Self {
        self.push("detach vdisk")
    }

    pub fn compact(self) -> Self {
        self.push("compact vdisk")
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    fn push(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }
}

impl fmt::Display for DiskpartScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.commands.join("; "))
    }
}
