/// Test doubles for the workflow seams - NEVER touch real disks or processes
use crate::console::Console;
use crate::drive::{parse_letters, DriveLetter, VolumeTable};
use crate::invoker::{CommandResult, ToolRunner};
use crate::CompactError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory mounted-volume table
#[derive(Debug, Default)]
pub struct MockVolumeTable {
    letters: Mutex<BTreeSet<DriveLetter>>,
    queries: AtomicUsize,
    fail: bool,
}

impl MockVolumeTable {
    pub fn with_letters(letters: &str) -> Self {
        Self {
            letters: Mutex::new(parse_letters(letters).unwrap().into_iter().collect()),
            ..Default::default()
        }
    }

    /// A table whose enumeration always errors.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn mount(&self, letter: DriveLetter) {
        self.letters.lock().unwrap().insert(letter);
    }

    pub fn unmount(&self, letter: DriveLetter) {
        self.letters.lock().unwrap().remove(&letter);
    }

    pub fn is_mounted(&self, letter: DriveLetter) -> bool {
        self.letters.lock().unwrap().contains(&letter)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VolumeTable for MockVolumeTable {
    async fn mounted_letters(&self) -> Result<BTreeSet<DriveLetter>, CompactError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CompactError::VolumeEnumeration("mock failure".to_string()));
        }
        Ok(self.letters.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Script { program: PathBuf, commands: Vec<String> },
    Args { program: PathBuf, args: String },
}

impl Invocation {
    pub fn is_script_containing(&self, needle: &str) -> bool {
        matches!(self, Invocation::Script { commands, .. } if commands.iter().any(|c| c.contains(needle)))
    }

    pub fn is_args(&self) -> bool {
        matches!(self, Invocation::Args { .. })
    }
}

#[derive(Debug)]
struct ScriptRule {
    needle: String,
    exit_code: i32,
    skip: usize,
    remaining: Option<usize>,
}

/// Scripted tool double.
///
/// Scripts succeed unless a rule matches one of their commands. A successful
/// `assign letter=X` mounts X in the shared volume table and a successful
/// `detach vdisk` unmounts it again, the way diskpart and the OS would.
#[derive(Debug)]
pub struct MockToolRunner {
    volumes: Arc<MockVolumeTable>,
    invocations: Mutex<Vec<Invocation>>,
    rules: Mutex<Vec<ScriptRule>>,
    assigned: Mutex<Option<DriveLetter>>,
    defrag_exit: i32,
    mount_on_assign: bool,
    launch_fault: bool,
}

impl MockToolRunner {
    pub fn new(volumes: Arc<MockVolumeTable>) -> Self {
        Self {
            volumes,
            invocations: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            assigned: Mutex::new(None),
            defrag_exit: 0,
            mount_on_assign: true,
            launch_fault: false,
        }
    }

    /// Any script containing `needle` exits with `exit_code`.
    pub fn fail_script(self, needle: &str, exit_code: i32) -> Self {
        self.push_rule(needle, exit_code, 0, None)
    }

    /// Scripts containing `needle` succeed `skip` times, then exit with
    /// `exit_code` from then on.
    pub fn fail_script_after(self, needle: &str, exit_code: i32, skip: usize) -> Self {
        self.push_rule(needle, exit_code, skip, None)
    }

    /// The first `times` scripts containing `needle` exit with `exit_code`.
    pub fn fail_script_times(self, needle: &str, exit_code: i32, times: usize) -> Self {
        self.push_rule(needle, exit_code, 0, Some(times))
    }

    pub fn with_defrag_exit(mut self, exit_code: i32) -> Self {
        self.defrag_exit = exit_code;
        self
    }

    /// Assign reports success but no volume ever shows up (GPT image).
    pub fn without_mounting(mut self) -> Self {
        self.mount_on_assign = false;
        self
    }

    /// Every launch fails as if the process could not be started.
    pub fn with_launch_fault(mut self) -> Self {
        self.launch_fault = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn script_count(&self) -> usize {
        self.invocations().iter().filter(|i| !i.is_args()).count()
    }

    pub fn defrag_count(&self) -> usize {
        self.invocations().iter().filter(|i| i.is_args()).count()
    }

    fn push_rule(self, needle: &str, exit_code: i32, skip: usize, remaining: Option<usize>) -> Self {
        self.rules.lock().unwrap().push(ScriptRule {
            needle: needle.to_string(),
            exit_code,
            skip,
            remaining,
        });
        self
    }

    fn scripted_exit(&self, commands: &[String]) -> i32 {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if rule.remaining == Some(0) || !commands.iter().any(|c| c.contains(&rule.needle)) {
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return rule.exit_code;
        }
        0
    }

    fn apply_effects(&self, commands: &[String]) {
        for command in commands {
            if let Some(letter) = command.strip_prefix("assign letter=") {
                let letter = letter.chars().next().and_then(|c| DriveLetter::new(c).ok());
                *self.assigned.lock().unwrap() = letter;
                if let Some(letter) = letter.filter(|_| self.mount_on_assign) {
                    self.volumes.mount(letter);
                }
            } else if command == "detach vdisk" {
                if let Some(letter) = self.assigned.lock().unwrap().take() {
                    self.volumes.unmount(letter);
                }
            }
        }
    }

    fn launch_error(program: &Path) -> CompactError {
        CompactError::LaunchFailed {
            tool: program.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "process handle was reused"),
        }
    }
}

#[async_trait::async_trait]
impl ToolRunner for MockToolRunner {
    async fn run_script(&self, program: &Path, commands: &[String]) -> Result<CommandResult, CompactError> {
        self.invocations.lock().unwrap().push(Invocation::Script {
            program: program.to_path_buf(),
            commands: commands.to_vec(),
        });
        if self.launch_fault {
            return Err(Self::launch_error(program));
        }

        let exit_code = self.scripted_exit(commands);
        if exit_code == 0 {
            self.apply_effects(commands);
        }
        Ok(CommandResult {
            exit_code,
            output: format!("mock diskpart: {} command(s), exit {}", commands.len(), exit_code),
        })
    }

    async fn run_args(&self, program: &Path, args: &str) -> Result<i32, CompactError> {
        self.invocations.lock().unwrap().push(Invocation::Args {
            program: program.to_path_buf(),
            args: args.to_string(),
        });
        if self.launch_fault {
            return Err(Self::launch_error(program));
        }
        Ok(self.defrag_exit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Info(String),
    Error(String),
}

#[derive(Debug, Default)]
pub struct RecordingConsole {
    pub lines: Vec<ConsoleLine>,
    pub key_waits: usize,
}

impl RecordingConsole {
    pub fn errors(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                ConsoleLine::Error(message) => Some(message.as_str()),
                ConsoleLine::Info(_) => None,
            })
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| match line {
            ConsoleLine::Info(message) | ConsoleLine::Error(message) => message.contains(needle),
        })
    }
}

impl Console for RecordingConsole {
    fn info(&mut self, message: &str) {
        self.lines.push(ConsoleLine::Info(message.to_string()));
    }

    fn error(&mut self, message: &str) {
        self.lines.push(ConsoleLine::Error(message.to_string()));
    }

    fn wait_for_key(&mut self) {
        self.key_waits += 1;
    }
}
