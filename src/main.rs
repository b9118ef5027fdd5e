use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use thumbvault::config::{self, config};
use thumbvault::{AssetKey, ImageResizer, SharedDeriver};
use tokio::fs::File;
use tracing::Level;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Args {
    #[clap(long, env = "THUMBVAULT_CONFIG", default_value = "config.yaml")]
    /// The file path to a given config file.
    ///
    /// This can be either a JSON formatted config or YAML.
    pub config_file: PathBuf,

    #[clap(long, env = "THUMBVAULT_LOG_LEVEL", default_value = "info")]
    /// The log level filter, any logs that are above this level wont
    /// be displayed.
    pub log_level: Level,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stores a file and every configured size of it.
    Put {
        /// The key to store the file under, e.g. `ab/cd/abcdef.jpg`.
        key: String,

        /// The file to read the original from.
        file: PathBuf,
    },

    /// Prints the URLs of a stored key and its configured sizes.
    Urls {
        key: String,
    },

    /// Removes a key and every configured size of it.
    Delete {
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    config::init(&args.config_file).await?;
    let storage = config().backend.connect().await?;
    let labels = config().labels();

    match args.command {
        Command::Put { key, file } => {
            let key = AssetKey::new(key)?;
            let mut source = File::open(&file).await?;
            let deriver: SharedDeriver = Arc::new(ImageResizer);

            let report = storage
                .write(&key, &mut source, config().sizes(), deriver)
                .await?;
            let urls = storage.resolve(&key, &labels);

            let out = serde_json::json!({
                "report": report,
                "urls": urls,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        },
        Command::Urls { key } => {
            let key = AssetKey::new(key)?;
            let urls = storage.resolve(&key, &labels);
            println!("{}", serde_json::to_string_pretty(&urls)?);
        },
        Command::Delete { key } => {
            let key = AssetKey::new(key)?;
            storage.delete(&key, &labels).await?;
            tracing::info!("Deleted {} and {} sizes", key, labels.len());
        },
    }

    Ok(())
}
