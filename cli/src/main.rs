use clap::Parser;
use vhdcompact_cli::{init_logging, report_options_error, report_parse_error, run, Cli};
use vhdcompact_core::{ExecutionContext, ExitCode, ProcessRunner, StdConsole};
use vhdcompact_platform::PlatformVolumeTable;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let code = match Cli::try_parse() {
        Ok(cli) => compact(cli).await,
        Err(e) => report_parse_error(&e),
    };
    std::process::ExitCode::from(code.code())
}

async fn compact(cli: Cli) -> ExitCode {
    init_logging(cli.verbose);

    let mut console = StdConsole;
    let options = match cli.options() {
        Ok(options) => options,
        Err(e) => return report_options_error(&cli, &e, &mut console),
    };

    if !cli.dry_run && !vhdcompact_platform::is_elevated() {
        tracing::warn!("Not running as administrator; diskpart will likely refuse to attach the image");
    }

    let runner = ProcessRunner;
    let volumes = PlatformVolumeTable;
    let ctx = ExecutionContext {
        runner: &runner,
        volumes: &volumes,
        console: &mut console,
    };

    run(&cli, options, ctx).await
}
