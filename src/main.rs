//! Run control command line.
//!
//! Drives a deployment whose components are simulated in-process, which is how the
//! FSM rules and sequences of a new deployment are tried out before going live.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use daq_runcontrol::config::Settings;
use daq_runcontrol::context::OrchestratorContext;
use daq_runcontrol::messages::CommandRequest;
use daq_runcontrol::process::mock::SimulatedBinder;
use daq_runcontrol::sequencer::{ResumePoint, SequencePlan, Sequencer, SequencerControl, ShellHooks};
use daq_runcontrol::RunControl;

#[derive(Parser)]
#[command(name = "daq_runcontrol")]
#[command(about = "Detector run control", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = "config/runcontrol.toml")]
    settings: PathBuf,

    /// Transition delay of the simulated components, in milliseconds
    #[arg(long, default_value_t = 200)]
    delay_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available configurations
    Configs,

    /// Load a configuration and print the system state
    Status {
        /// Configuration name
        config: String,
    },

    /// Take one run: initialise, start, wait, stop, shutdown
    Run {
        /// Configuration name
        config: String,

        /// Run type
        #[arg(long, default_value = "Test")]
        run_type: String,

        /// Start comment
        #[arg(long, default_value = "")]
        comment: String,

        /// Run length in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,

        /// Identity presented to the interlock
        #[arg(long, default_value = "shifter")]
        identity: String,
    },

    /// Run a sequence file
    Sequence {
        /// Sequence file
        file: PathBuf,

        /// Sequence number to resume
        #[arg(short = 'S', long, default_value_t = 0)]
        sequence: u64,

        /// Step to start from (1-based)
        #[arg(short = 's', long, default_value_t = 1)]
        step: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.settings)
        .with_context(|| format!("loading settings from {}", cli.settings.display()))?;
    settings.validate().context("validating settings")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    let ctx = OrchestratorContext::new(settings.clone());
    let binder = Arc::new(SimulatedBinder::new().with_default_delay(Duration::from_millis(cli.delay_ms)));
    let control = Arc::new(RunControl::new(Arc::clone(&ctx), binder));

    let result = match cli.command {
        Commands::Configs => {
            for name in control.list_configurations().context("listing configurations")? {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Status { config } => status(&control, &config).await,
        Commands::Run {
            config,
            run_type,
            comment,
            seconds,
            identity,
        } => {
            control.start_monitor();
            take_run(&control, &config, &run_type, &comment, seconds, &identity).await
        }
        Commands::Sequence { file, sequence, step } => {
            control.start_monitor();
            let plan = SequencePlan::load(&file).with_context(|| format!("loading {}", file.display()))?;
            let sequencer = Sequencer::new(
                Arc::clone(&control) as Arc<dyn SequencerControl>,
                Arc::new(ShellHooks),
                Arc::clone(ctx.sink()),
                &settings,
            );
            let summary = sequencer
                .run(&plan, ResumePoint::new(sequence, step))
                .await
                .context("sequence failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    };

    control.close().await;
    result
}

async fn status(control: &RunControl, config: &str) -> Result<()> {
    control
        .load_configuration(config)
        .await
        .with_context(|| format!("loading configuration '{config}'"))?;
    if let Some(deployment) = control.deployment() {
        deployment.tree.refresh().await;
    }
    println!("{}", serde_json::to_string_pretty(&control.snapshot())?);
    Ok(())
}

async fn take_run(
    control: &RunControl,
    config: &str,
    run_type: &str,
    comment: &str,
    seconds: u64,
    identity: &str,
) -> Result<()> {
    let request = CommandRequest::new(identity);
    let report = control
        .initialise(Some(config), &request)
        .await
        .context("INITIALISE failed")?;
    for location in &report.log_locations {
        info!(%location, "Component log");
    }

    let report = control
        .start(&request.clone().with_run_type(run_type).with_comment(comment))
        .await
        .context("START failed")?;
    info!(run_number = ?report.run_number, "Run started");

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    control
        .stop(&request.clone().with_run_type(run_type).with_comment("Run ended from the command line"))
        .await
        .context("STOP failed")?;
    let report = control.shutdown(&request).await.context("SHUTDOWN failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
