use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use sparkfleet_core::config::DEFAULT_SETTINGS_PATH;
use sparkfleet_core::{ExistingClusterPolicy, Lifecycle, Settings};

mod logging;
mod ls;
mod providers;
mod spinner;

#[derive(Parser, Debug)]
#[command(name = "sparkfleet")]
#[command(about = "sparkfleet - provision, configure and run Spark clusters on cloud instances")]
struct Args {
    /// Path to the settings file
    #[arg(short, long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct Selection {
    /// Comma-separated cluster names (default: every configured cluster)
    #[arg(long, value_delimiter = ',')]
    clusters: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the instances of each cluster and record them in its registry
    Build {
        #[command(flatten)]
        selection: Selection,
        /// What to do with clusters that were already built: skip, keep or replace
        #[arg(long, default_value = "skip")]
        on_existing: ExistingClusterPolicy,
    },
    /// Run the setup commands on every instance
    Configure {
        #[command(flatten)]
        selection: Selection,
    },
    /// Start the master and worker daemons
    Start {
        #[command(flatten)]
        selection: Selection,
    },
    /// Submit the job on the first running master
    Submit {
        #[command(flatten)]
        selection: Selection,
    },
    /// Push the job artifacts to every instance, then submit
    Execute {
        #[command(flatten)]
        selection: Selection,
    },
    /// Stop the daemons, keeping the instances
    Stop {
        #[command(flatten)]
        selection: Selection,
    },
    /// Terminate the instances and delete the registry
    Terminate {
        #[command(flatten)]
        selection: Selection,
        /// Keep the registry file after termination
        #[arg(long)]
        keep_registry: bool,
    },
    /// List the recorded instances of each cluster with their live state
    Ls {
        #[command(flatten)]
        selection: Selection,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(&args.config)?;
    let logs_on_terminal = logging::init(&settings.logging, args.verbose)?;
    let cloud = providers::cloud_adapter(&settings)?;
    let lifecycle = Lifecycle::new(settings, cloud);

    if let Commands::Ls { selection } = &args.command {
        ls::handle_ls_command(&lifecycle, &selection.clusters).await?;
        return Ok(());
    }

    let spinner = spinner::create_spinner(!logs_on_terminal);
    let (phase, result) = match args.command {
        Commands::Build { selection, on_existing } => {
            spinner.set_message("Building clusters...");
            ("Build", lifecycle.build(&selection.clusters, on_existing).await)
        }
        Commands::Configure { selection } => {
            spinner.set_message("Configuring clusters...");
            ("Configure", lifecycle.configure(&selection.clusters).await)
        }
        Commands::Start { selection } => {
            spinner.set_message("Starting daemons...");
            ("Start", lifecycle.start(&selection.clusters).await)
        }
        Commands::Submit { selection } => {
            spinner.set_message("Submitting job...");
            ("Submit", lifecycle.submit(&selection.clusters).await)
        }
        Commands::Execute { selection } => {
            spinner.set_message("Pushing artifacts and submitting job...");
            ("Execute", lifecycle.execute(&selection.clusters).await)
        }
        Commands::Stop { selection } => {
            spinner.set_message("Stopping daemons...");
            ("Stop", lifecycle.stop(&selection.clusters).await)
        }
        Commands::Terminate { selection, keep_registry } => {
            spinner.set_message("Terminating clusters...");
            ("Terminate", lifecycle.terminate(&selection.clusters, !keep_registry).await)
        }
        Commands::Ls { .. } => return Ok(()),
    };

    match result {
        Ok(()) => {
            spinner.finish_with_message(format!("{} finished successfully!", phase));
            Ok(())
        }
        Err(e) => {
            spinner.finish_and_clear();
            Err(e.into())
        }
    }
}
