//! Iden-Hide CLI - batch face/plate redaction from the command line.
//!
//! Provides the `idenhide` command: run a folder, a file selection or an S3
//! prefix through the detection service, and inspect remote storage.

mod commands;

use clap::{Parser, Subcommand};
use idenhide_core::IdenhideConfig;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{batch, storage};

/// Iden-Hide CLI - batch redaction of faces and license plates
#[derive(Parser, Debug)]
#[command(
    name = "idenhide",
    author,
    version,
    about = "Iden-Hide - batch face and license plate redaction",
    long_about = "Iden-Hide (idenhide) detects faces and license plates in batches of images and \
                  writes blurred copies.\nImages can come from a local folder, explicit files or an S3 prefix."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Extra configuration file, applied over ~/.idenhide/config.toml and ./.idenhiderc
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a batch of images
    ///
    /// Enumerates the source, runs every image through the detection service,
    /// and writes blurred copies locally or to S3.
    Batch(batch::BatchArgs),

    /// List images under an S3 prefix
    List {
        /// S3 URI (s3://bucket/prefix)
        uri: String,

        /// AWS region
        #[arg(long)]
        region: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a presigned view URL for an S3 object
    Presign {
        /// S3 URI of the object (s3://bucket/key)
        uri: String,

        /// Link lifetime in seconds
        #[arg(long, value_name = "SECS")]
        expires: Option<u64>,

        /// AWS region
        #[arg(long)]
        region: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify the AWS credentials from the environment
    CheckCredentials {
        /// AWS region
        #[arg(long)]
        region: Option<String>,
    },
}

fn load_config(extra: Option<&PathBuf>) -> anyhow::Result<IdenhideConfig> {
    let mut config = IdenhideConfig::discover_and_load();
    if let Some(path) = extra {
        config.merge(&IdenhideConfig::load_from_file(path)?);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    // RUST_LOG wins over the flag and the config file
    let level = args.log_level.as_deref().or(config.log_level.as_deref()).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Batch(batch_args) => batch::execute(batch_args, &config).await?,
        Command::List { uri, region, json } => {
            let region = region.unwrap_or_else(|| config.region().to_string());
            storage::list(&uri, &region, json, &config).await?;
        }
        Command::Presign { uri, expires, region, json } => {
            let region = region.unwrap_or_else(|| config.region().to_string());
            storage::presign(&uri, expires, &region, json, &config).await?;
        }
        Command::CheckCredentials { region } => {
            let region = region.unwrap_or_else(|| config.region().to_string());
            storage::check_credentials(&region, &config).await?;
        }
    }

    Ok(())
}
