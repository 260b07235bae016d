//! Command-line front-end for the PakBus collection client.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use paklink::{install_signal_handlers, CollectionConfig, CollectionSession, Result};

/// Data collection software for PakBus dataloggers.
#[derive(Parser, Debug)]
#[command(name = "paklink", version, disable_version_flag = true, about)]
struct Cli {
    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Complete path of the collection configuration file
    #[arg(short = 'c', value_name = "CONFIG.XML")]
    config: PathBuf,

    /// Serial connection override: /dev/tty*[,baud]
    #[arg(short = 'p', value_name = "CONNECTION")]
    connection: Option<String>,

    /// Override the working path mentioned in the config file
    #[arg(short = 'w', value_name = "PATH")]
    working_path: Option<PathBuf>,

    /// Turn on debugging to print packet level errors
    #[arg(short = 'd')]
    debug: bool,

    /// Redirect log messages to a timestamped file in the working path
    #[arg(short = 'r')]
    redirect_log: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("paklink: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = CollectionConfig::load(&cli.config)?;
    if let Some(conn) = &cli.connection {
        config.apply_connection_string(conn)?;
    }
    if let Some(path) = &cli.working_path {
        config.set_working_path(path);
    }

    init_logging(&config, cli.debug, cli.redirect_log)?;
    println!("============================================================");
    println!(" paklink Version : {}", env!("CARGO_PKG_VERSION"));
    println!("============================================================");

    install_signal_handlers();
    CollectionSession::new(config).run()
}

fn init_logging(config: &CollectionConfig, debug: bool, redirect: bool) -> Result<()> {
    let default_level = if debug || config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("paklink={default_level}")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if redirect {
        std::fs::create_dir_all(&config.working_path)
            .map_err(|e| paklink::PakBusError::io(&config.working_path, e))?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let log_path = config.working_path.join(format!("{stamp}.log"));
        let file = File::create(&log_path)
            .map_err(|e| paklink::PakBusError::io(&log_path, e))?;
        println!("Redirecting logging from stdout to : {}", log_path.display());
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    } else {
        builder.init();
    }
    Ok(())
}
