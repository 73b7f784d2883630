use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use jotter_kernel::{
    ConnectionInfo, InterruptPolicy, Kernel, KernelConfig, KernelError, KernelOptions,
    ProcessEvaluator,
};
use jotter_libraries::ResolutionInfo;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Notebook kernel speaking the Jupyter messaging protocol.
#[derive(Parser, Debug)]
#[command(name = "jotter", version, about)]
struct Cli {
    /// Connection file written by the frontend.
    connection_file: PathBuf,

    /// Kernel home; library descriptors are looked up in `<home>/libraries`.
    #[arg(long)]
    home: Option<PathBuf>,

    /// Classpath entries handed to the evaluator.
    #[arg(long = "classpath", value_name = "PATH")]
    classpath: Vec<PathBuf>,

    #[arg(long, value_name = "DIR")]
    libraries_dir: Option<PathBuf>,

    /// Where bare `%use` names are looked up: `dir:PATH`, `git:REF`, `url:BASE`
    /// or `file:PATH`. Defaults to the descriptors repository at `master`.
    #[arg(long, value_name = "SOURCE")]
    resolution: Option<ResolutionInfo>,

    /// `cooperative` waits for the evaluator to stop, `abandon` stops waiting.
    #[arg(long, default_value = "cooperative")]
    interrupt_policy: InterruptPolicy,

    /// Accept an empty key, i.e. unsigned messages.
    #[arg(long)]
    allow_unsigned: bool,

    /// Evaluator program and its arguments.
    #[arg(last = true, required = true, num_args = 1..)]
    evaluator: Vec<String>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> Result<(), KernelError> {
    let info = ConnectionInfo::from_file(&cli.connection_file)?;
    let config = KernelConfig::new(
        info,
        KernelOptions {
            home_dir: cli.home,
            classpath: cli.classpath,
            libraries_dir: cli.libraries_dir,
            resolution: cli.resolution,
            interrupt_policy: cli.interrupt_policy,
            allow_unsigned: cli.allow_unsigned,
            ..KernelOptions::default()
        },
    )?;

    let (program, args) = cli
        .evaluator
        .split_first()
        .map(|(program, args)| (program.clone(), args.to_vec()))
        .unwrap_or_default();
    let evaluator = ProcessEvaluator::spawn(&program, &args).await?;

    let kernel = Kernel::start(config, Box::new(evaluator)).await?;

    tokio::select! {
        _ = kernel.handle().stopped() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            kernel.handle().shutdown();
        }
    }

    kernel.wait().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "kernel failed");
            ExitCode::FAILURE
        }
    }
}
