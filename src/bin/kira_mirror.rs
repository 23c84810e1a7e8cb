use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kira_mirror::app::{App, RunReport};
use kira_mirror::config::ConfigLoader;
use kira_mirror::context::RunContext;
use kira_mirror::domain::{RunMode, RunStatus};
use kira_mirror::error::MirrorError;
use kira_mirror::output::{JsonOutput, OutputMode, print_summary};
use kira_mirror::progress::LogSink;

#[derive(Parser)]
#[command(name = "kira-mirror")]
#[command(about = "Mirror bioinformatics databanks into a versioned production tree")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, process and install the banks of a batch")]
    Run(RunArgs),
    #[command(about = "List the files each bank would retrieve, without downloading")]
    List(ListArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    /// Overrides the batch's descriptor list.
    #[arg(long = "descriptor")]
    descriptors: Vec<String>,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long = "descriptor")]
    descriptors: Vec<String>,

    /// Listing side file; defaults to `<data dir>/<bank>/<bank>.listing`.
    #[arg(long)]
    output: Option<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(status) => ExitCode::from(status_code(status)),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(mirror) = report.downcast_ref::<MirrorError>() {
                return ExitCode::from(map_exit_code(mirror));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::MissingConfig
        | MirrorError::ConfigRead(_)
        | MirrorError::ConfigParse(_)
        | MirrorError::DescriptorRead(_)
        | MirrorError::InvalidDescriptor { .. }
        | MirrorError::InvalidBankType(_)
        | MirrorError::InvalidPattern { .. }
        | MirrorError::InvalidTaskSpec(_)
        | MirrorError::DependencyCycle(_)
        | MirrorError::UnknownDependency(_) => 2,
        MirrorError::Connection { .. }
        | MirrorError::Listing { .. }
        | MirrorError::Transfer { .. }
        | MirrorError::Http(_)
        | MirrorError::HttpStatus { .. }
        | MirrorError::MissingTool(_) => 3,
        MirrorError::Interrupted => 4,
        _ => 1,
    }
}

fn status_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Ok => 0,
        RunStatus::Error => 1,
        RunStatus::Aborted => 4,
    }
}

fn run() -> miette::Result<RunStatus> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let (config, descriptors, mode, output) = match cli.command {
        Commands::Run(args) => (args.config, args.descriptors, None, None),
        Commands::List(args) => (args.config, args.descriptors, Some(RunMode::Info), args.output),
    };

    let mut config = ConfigLoader::load(config.as_deref())?;
    if !descriptors.is_empty() {
        config.descriptors = descriptors;
    }
    if let Some(mode) = mode {
        config.mode = Some(mode);
    }
    if output.is_some() {
        config.info_output = output;
    }
    let resolved = ConfigLoader::resolve_config(config)?;

    let ctx = RunContext::new();
    let handler_ctx = ctx.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current transfers");
        handler_ctx.abort();
    })
    .map_err(|err| miette::Report::msg(format!("failed to set signal handler: {err}")))?;

    let app = App::new(resolved, ctx);
    let report = match output_mode {
        OutputMode::NonInteractive => app.run(&JsonOutput)?,
        OutputMode::Interactive => app.run(&LogSink)?,
    };
    print_report(&report, output_mode)?;
    Ok(report.status)
}

fn print_report(report: &RunReport, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_report(report).into_diagnostic(),
        OutputMode::Interactive => {
            print_summary(report);
            Ok(())
        }
    }
}
