//! The compaction sequence.
//!
//! attach -> assign letter -> verify -> defrag -> detach ->
//! attach read-only + compact -> detach
//!
//! Every step is checked before the next one starts. There are no retries
//! except the bounded settle poll after the first attach, and no rollback
//! unless `cleanup_on_failure` is set.

use crate::console::Console;
use crate::diskpart::DiskpartScript;
use crate::drive::{deadline_after, DriveLetter, DriveLetterAllocator, VolumeTable};
use crate::error::ExitCode;
use crate::invoker::{CommandResult, ToolRunner};
use crate::options::CompactOptions;
use crate::CompactError;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

/// Capabilities the workflow runs against. Tests hand in doubles.
pub struct ExecutionContext<'a> {
    pub runner: &'a dyn ToolRunner,
    pub volumes: &'a dyn VolumeTable,
    pub console: &'a mut dyn Console,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdiskState {
    Detached,
    Attached,
    AttachedReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactReport {
    pub image: PathBuf,
    pub letter: DriveLetter,
    pub size_before: u64,
    pub size_after: u64,
}

impl CompactReport {
    pub fn reclaimed(&self) -> u64 {
        self.size_before.saturating_sub(self.size_after)
    }
}

/// One external invocation of the sequence, for `--dry-run` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub description: &'static str,
    pub program: PathBuf,
    pub lines: Vec<String>,
}

fn attach_script(image: &Path) -> DiskpartScript {
    DiskpartScript::for_vdisk(image).attach()
}

fn assign_script(image: &Path, partition: u32, letter: DriveLetter) -> DiskpartScript {
    DiskpartScript::for_vdisk(image)
        .select_partition(partition)
        .assign_letter(letter)
}

fn detach_script(image: &Path) -> DiskpartScript {
    DiskpartScript::for_vdisk(image).detach()
}

fn compact_script(image: &Path) -> DiskpartScript {
    DiskpartScript::for_vdisk(image).attach_readonly().compact()
}

pub fn plan(image: &Path, letter: DriveLetter, options: &CompactOptions) -> Vec<PlannedStep> {
    let diskpart = |description: &'static str, script: DiskpartScript| PlannedStep {
        description,
        program: options.diskpart_path.clone(),
        lines: script.commands().to_vec(),
    };

    vec![
        diskpart("Attach image", attach_script(image)),
        diskpart(
            "Assign drive letter",
            assign_script(image, options.partition_index, letter),
        ),
        PlannedStep {
            description: "Defragment volume",
            program: options.defrag_path.clone(),
            lines: vec![options.defrag_args(letter)],
        },
        diskpart("Detach image", detach_script(image)),
        diskpart("Attach read-only and compact", compact_script(image)),
        diskpart("Detach image", detach_script(image)),
    ]
}

pub struct CompactWorkflow<'a> {
    ctx: ExecutionContext<'a>,
    options: CompactOptions,
    state: VdiskState,
    image: Option<PathBuf>,
}

impl<'a> CompactWorkflow<'a> {
    pub fn new(ctx: ExecutionContext<'a>, options: CompactOptions) -> Self {
        Self {
            ctx,
            options,
            state: VdiskState::Detached,
            image: None,
        }
    }

    pub fn state(&self) -> VdiskState {
        self.state
    }

    /// Run the sequence, report the outcome on the console and map it to
    /// the process exit code.
    pub async fn execute(&mut self, image: &Path) -> ExitCode {
        let code = match self.run(image).await {
            Ok(report) => {
                self.ctx.console.info(&format!(
                    "Compacting done. Reclaimed {} bytes ({} -> {}).",
                    report.reclaimed(),
                    report.size_before,
                    report.size_after
                ));
                ExitCode::Success
            }
            Err(e) => {
                tracing::error!("Compaction failed: {}", e);
                self.ctx.console.error(&e.to_string());
                e.exit_code()
            }
        };

        if self.options.pause_on_exit {
            self.ctx.console.info("Press any key to exit...");
            self.ctx.console.wait_for_key();
        }
        code
    }

    pub async fn run(&mut self, image: &Path) -> Result<CompactReport, CompactError> {
        let result = self.run_steps(image).await;
        if result.is_err() && self.options.cleanup_on_failure && self.state != VdiskState::Detached {
            self.cleanup().await;
        }
        result
    }

    async fn run_steps(&mut self, image: &Path) -> Result<CompactReport, CompactError> {
        if image.as_os_str().is_empty() {
            return Err(CompactError::VhdFileNotFound(image.to_path_buf()));
        }
        let image = std::path::absolute(image)?;
        if !image.is_file() {
            return Err(CompactError::VhdFileNotFound(image));
        }
        self.ctx.console.info(&format!("VHD file: {}", image.display()));
        self.image = Some(image.clone());
        let size_before = std::fs::metadata(&image)?.len();

        let pool = self.options.candidate_pool()?;
        let letter = DriveLetterAllocator::new(self.ctx.volumes, pool)
            .allocate_free_letter()
            .await?;
        self.ctx.console.info(&format!("Temporary drive letter {}", letter));

        tracing::info!("Attaching {}", image.display());
        self.attach(&attach_script(&image), VdiskState::Attached).await?;

        tracing::info!("Assigning {}: to partition {}", letter, self.options.partition_index);
        self.assign_and_settle(&image, letter).await?;

        tracing::info!("Defragmenting {}", letter.root());
        let code = self
            .ctx
            .runner
            .run_args(&self.options.defrag_path, &self.options.defrag_args(letter))
            .await?;
        if code != 0 {
            return Err(CompactError::DefragFailed(code));
        }

        tracing::info!("Detaching {}", image.display());
        self.detach(&image).await?;

        tracing::info!("Compacting {}", image.display());
        self.attach_and_compact(&image).await?;

        tracing::info!("Detaching {}", image.display());
        self.detach(&image).await?;

        let size_after = std::fs::metadata(&image)?.len();
        Ok(CompactReport {
            image,
            letter,
            size_before,
            size_after,
        })
    }

    async fn diskpart(&self, script: &DiskpartScript) -> Result<CommandResult, CompactError> {
        tracing::debug!("diskpart: {}", script);
        self.ctx
            .runner
            .run_script(&self.options.diskpart_path, script.commands())
            .await
    }

    fn check(result: CommandResult) -> Result<(), CompactError> {
        if result.success() {
            Ok(())
        } else {
            Err(CompactError::DiskpartFailed {
                code: result.exit_code,
                output: result.output,
            })
        }
    }

    async fn attach(&mut self, script: &DiskpartScript, next: VdiskState) -> Result<(), CompactError> {
        if self.state != VdiskState::Detached {
            let image = self.image.clone().unwrap_or_default();
            return Err(CompactError::AlreadyAttached(image));
        }
        Self::check(self.diskpart(script).await?)?;
        self.state = next;
        Ok(())
    }

    /// Read-only attach and compact run in one diskpart session; when compact
    /// fails the attach may already have happened, so the image counts as
    /// attached from the moment the script starts.
    async fn attach_and_compact(&mut self, image: &Path) -> Result<(), CompactError> {
        if self.state != VdiskState::Detached {
            return Err(CompactError::AlreadyAttached(image.to_path_buf()));
        }
        self.state = VdiskState::AttachedReadOnly;
        Self::check(self.diskpart(&compact_script(image)).await?)
    }

    async fn detach(&mut self, image: &Path) -> Result<(), CompactError> {
        Self::check(self.diskpart(&detach_script(image)).await?)?;
        self.state = VdiskState::Detached;
        Ok(())
    }

    /// The new volume may not be registered yet right after attach, so the
    /// assign script is retried and the letter polled until the settle
    /// deadline.
    async fn assign_and_settle(&mut self, image: &Path, letter: DriveLetter) -> Result<(), CompactError> {
        let deadline = deadline_after(self.options.settle_timeout());
        let interval = self.options.poll_interval();
        let script = assign_script(image, self.options.partition_index, letter);

        loop {
            let result = self.diskpart(&script).await?;
            if result.success() {
                break;
            }
            if Instant::now() >= deadline {
                return Self::check(result);
            }
            tracing::debug!("assign exited with {}, retrying in {:?}", result.exit_code, interval);
            tokio::time::sleep(interval).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let allocator = DriveLetterAllocator::new(self.ctx.volumes, vec![letter]);
        if allocator.wait_for_letter(letter, remaining, interval).await? {
            Ok(())
        } else {
            Err(CompactError::AttachFailed(letter))
        }
    }

    async fn cleanup(&mut self) {
        let Some(image) = self.image.clone() else {
            return;
        };
        tracing::warn!("Detaching {} after failure", image.display());
        match self.diskpart(&detach_script(&image)).await {
            Ok(result) if result.success() => self.state = VdiskState::Detached,
            Ok(result) => tracing::warn!(
                "Cleanup detach exited with {}: {}",
                result.exit_code,
                result.output.trim()
            ),
            Err(e) => tracing::warn!("Cleanup detach failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Invocation, MockToolRunner, MockVolumeTable, RecordingConsole};
    use std::sync::Arc;

    fn quick_options() -> CompactOptions {
        CompactOptions {
            diskpart_path: PathBuf::from("diskpart.exe"),
            defrag_path: PathBuf::from("Defrag.exe"),
            settle_timeout_secs: 0,
            poll_interval_ms: 1,
            pause_on_exit: false,
            ..Default::default()
        }
    }

    #[test]
    fn plan_lists_every_invocation_in_order() {
        let letter = DriveLetter::new('K').unwrap();
        let steps = plan(Path::new("disk.vhd"), letter, &quick_options());

        let descriptions: Vec<_> = steps.iter().map(|s| s.description).collect();
        assert_eq!(
            descriptions,
            vec![
                "Attach image",
                "Assign drive letter",
                "Defragment volume",
                "Detach image",
                "Attach read-only and compact",
                "Detach image",
            ]
        );
        assert_eq!(steps[2].lines, vec!["K: /U /V /X".to_string()]);
        assert_eq!(steps[1].lines[2], "assign letter=K");
    }

    #[test]
    fn reclaimed_never_underflows() {
        let report = CompactReport {
            image: PathBuf::from("disk.vhd"),
            letter: DriveLetter::new('D').unwrap(),
            size_before: 10,
            size_after: 12,
        };
        assert_eq!(report.reclaimed(), 0);
    }

    #[tokio::test]
    async fn second_attach_without_detach_is_refused() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let volumes = Arc::new(MockVolumeTable::with_letters("C"));
        let runner = MockToolRunner::new(volumes.clone());
        let mut console = RecordingConsole::default();
        let ctx = ExecutionContext {
            runner: &runner,
            volumes: volumes.as_ref(),
            console: &mut console,
        };
        let mut workflow = CompactWorkflow::new(ctx, quick_options());

        let script = attach_script(image.path());
        workflow.attach(&script, VdiskState::Attached).await.unwrap();
        let err = workflow.attach(&script, VdiskState::Attached).await.unwrap_err();

        assert!(matches!(err, CompactError::AlreadyAttached(_)));
        assert_eq!(runner.invocations().len(), 1);
        assert!(matches!(&runner.invocations()[0], Invocation::Script { .. }));
    }
}
