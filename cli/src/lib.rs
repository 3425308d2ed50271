use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use vhdcompact_core::workflow::plan;
use vhdcompact_core::{
    CompactError, CompactOptions, CompactWorkflow, Console, DriveLetterAllocator, ExecutionContext,
    ExitCode,
};

pub const USAGE: &str = "Usage: vhdcompact [OPTIONS] <VHD>";

#[derive(Parser, Debug)]
#[command(name = "vhdcompact", version)]
#[command(about = "Defragment and compact a virtual hard disk image", long_about = None)]
pub struct Cli {
    /// Path to VHD file
    pub vhd: PathBuf,

    /// JSON options file (default: <config dir>/vhdcompact/config.json)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Maximum seconds to wait for the attached volume to appear
    #[arg(long, value_name = "SECS")]
    pub settle_timeout: Option<u64>,

    /// Detach the image again if a later step fails
    #[arg(long)]
    pub cleanup_on_failure: bool,

    /// Exit without waiting for a key press
    #[arg(long)]
    pub no_pause: bool,

    /// Print the diskpart and defrag invocations without running them
    #[arg(long)]
    pub dry_run: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Options file merged with the flags given on the command line.
    pub fn options(&self) -> anyhow::Result<CompactOptions> {
        let mut options = CompactOptions::load(self.config.as_deref()).with_context(|| match &self.config {
            Some(path) => format!("Failed to load options from {}", path.display()),
            None => "Failed to load default options".to_string(),
        })?;

        if let Some(secs) = self.settle_timeout {
            options.settle_timeout_secs = secs;
        }
        if self.cleanup_on_failure {
            options.cleanup_on_failure = true;
        }
        if self.no_pause || self.dry_run {
            options.pause_on_exit = false;
        }

        options.validate().context("Invalid options")?;
        Ok(options)
    }
}

/// `None` when clap only wants to show help or version output.
pub fn usage_error(err: &clap::Error) -> Option<CompactError> {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => None,
        kind => Some(CompactError::WrongArguments(
            kind.as_str().unwrap_or("invalid arguments").to_string(),
        )),
    }
}

/// Print a clap error the way the tool reports bad invocations and pick the
/// exit code for it.
pub fn report_parse_error(err: &clap::Error) -> ExitCode {
    let usage = usage_error(err);
    if usage.is_some() {
        eprintln!("{}", USAGE);
    }
    let _ = err.print();
    usage.map_or(ExitCode::Success, |e| e.exit_code())
}

/// Options could not be loaded; report like any other failure, pausing
/// unless the command line asked not to.
pub fn report_options_error(cli: &Cli, err: &anyhow::Error, console: &mut dyn Console) -> ExitCode {
    tracing::error!("{:#}", err);
    console.error(&format!("Error: {:#}", err));
    if !(cli.no_pause || cli.dry_run) {
        console.info("Press any key to exit...");
        console.wait_for_key();
    }
    ExitCode::Fatal
}

pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub async fn run(cli: &Cli, options: CompactOptions, ctx: ExecutionContext<'_>) -> ExitCode {
    if cli.dry_run {
        return dry_run(cli, &options, ctx).await;
    }
    CompactWorkflow::new(ctx, options).execute(&cli.vhd).await
}

async fn dry_run(cli: &Cli, options: &CompactOptions, mut ctx: ExecutionContext<'_>) -> ExitCode {
    let image = match std::path::absolute(&cli.vhd) {
        Ok(image) if image.is_file() => image,
        _ => {
            let err = CompactError::VhdFileNotFound(cli.vhd.clone());
            ctx.console.error(&err.to_string());
            return err.exit_code();
        }
    };

    let pool = match options.candidate_pool() {
        Ok(pool) => pool,
        Err(e) => {
            ctx.console.error(&e.to_string());
            return e.exit_code();
        }
    };
    let first = pool[0];
    let letter = match DriveLetterAllocator::new(ctx.volumes, pool).allocate_free_letter().await {
        Ok(letter) => letter,
        Err(e) => {
            tracing::warn!("Cannot inspect mounted volumes ({}), showing {}: instead", e, first);
            first
        }
    };

    ctx.console.info(&format!("Dry run for {}", image.display()));
    for (n, step) in plan(&image, letter, options).iter().enumerate() {
        ctx.console.info(&format!("{}. {} ({})", n + 1, step.description, step.program.display()));
        for line in &step.lines {
            ctx.console.info(&format!("     {}", line));
        }
    }
    ExitCode::Success
}
