//! Synheart CLI — drives the on-device runtime from the command line for
//! local testing and demoing: initialize, grant/deny consent, run data
//! collection against in-memory adapters, and print the resulting Human
//! State Vectors.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use synheart_runtime::adapters::{InMemoryBehaviorAdapter, InMemoryPhoneAdapter, InMemoryWearAdapter};
use synheart_runtime::config::{DeviceIdentity, RuntimeConfig};
use synheart_runtime::error::Channel;
use synheart_runtime::storage::{EncryptedFileStore, InMemoryStore, SecureStore};
use synheart_runtime::{SynheartEngine, RUNTIME_VERSION};

/// Synheart — on-device Human State Inference runtime
#[derive(Parser)]
#[command(name = "synheart")]
#[command(author = "Synheart AI Inc")]
#[command(version = RUNTIME_VERSION)]
#[command(about = "Run and inspect the Synheart on-device runtime", long_about = None)]
struct Cli {
    /// Persist consent/device state with an encrypted on-disk store
    /// instead of the in-memory store (lost on exit).
    #[arg(long)]
    persist: bool,

    /// Passphrase for the encrypted store (required with --persist).
    #[arg(long)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grant consent, run data collection for a duration, and print the
    /// resulting Human State Vectors.
    Run {
        /// How long to run data collection, in seconds.
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Grant biosignals consent before running.
        #[arg(long, default_value = "true")]
        biosignals: bool,

        /// Grant behavior consent before running.
        #[arg(long, default_value = "true")]
        behavior: bool,

        /// Grant motion consent before running.
        #[arg(long, default_value = "true")]
        motion: bool,
    },

    /// Revoke consent for one channel.
    Revoke {
        #[arg(value_enum)]
        channel: ChannelArg,
    },

    /// Print runtime and build diagnostics.
    Doctor,
}

#[derive(Clone, ValueEnum)]
enum ChannelArg {
    Biosignals,
    Motion,
    Behavior,
}

impl From<ChannelArg> for Channel {
    fn from(c: ChannelArg) -> Self {
        match c {
            ChannelArg::Biosignals => Channel::Biosignals,
            ChannelArg::Motion => Channel::Motion,
            ChannelArg::Behavior => Channel::Behavior,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn build_engine(cli: &Cli) -> Result<Arc<SynheartEngine>, synheart_runtime::HsiError> {
    let storage: Arc<dyn SecureStore> = if cli.persist {
        let passphrase = cli
            .passphrase
            .clone()
            .ok_or_else(|| synheart_runtime::HsiError::InvalidConfig("--persist requires --passphrase".into()))?;
        Arc::new(EncryptedFileStore::new(
            synheart_runtime::storage::encrypted_file::default_base_dir(),
            passphrase,
        ))
    } else {
        Arc::new(InMemoryStore::new())
    };

    Ok(Arc::new(SynheartEngine::new(
        storage,
        InMemoryWearAdapter::new(),
        InMemoryPhoneAdapter::new(),
        InMemoryBehaviorAdapter::new(),
    )))
}

async fn run(cli: Cli) -> Result<(), synheart_runtime::HsiError> {
    match &cli.command {
        Commands::Doctor => {
            println!("Synheart Runtime Doctor");
            println!("========================");
            println!("producer: {}", synheart_runtime::PRODUCER_NAME);
            println!("version:  {RUNTIME_VERSION}");
            println!("storage:  {}", if cli.persist { "encrypted file" } else { "in-memory" });
            Ok(())
        }

        Commands::Run {
            seconds,
            biosignals,
            behavior,
            motion,
        } => {
            let engine = build_engine(&cli).await?;
            let device = DeviceIdentity {
                device_id: uuid::Uuid::new_v4().to_string(),
                platform: "cli".into(),
            };
            engine.initialize(RuntimeConfig::new(device)).await?;
            engine
                .grant_consent(*biosignals, *behavior, *motion, false)
                .await?;

            let mut hsv_rx = engine.subscribe_hsv().await?;
            engine.start_data_collection().await?;

            let deadline = tokio::time::sleep(Duration::from_secs(*seconds));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    changed = hsv_rx.changed() => {
                        if changed.is_err() { break; }
                        let hsv = hsv_rx.borrow_and_update().clone();
                        println!("{}", serde_json::to_string(&hsv).unwrap_or_else(|_| "<unserializable hsv>".into()));
                    }
                    _ = &mut deadline => break,
                }
            }

            engine.stop_data_collection().await?;
            engine.dispose().await?;
            Ok(())
        }

        Commands::Revoke { channel } => {
            let engine = build_engine(&cli).await?;
            let device = DeviceIdentity {
                device_id: uuid::Uuid::new_v4().to_string(),
                platform: "cli".into(),
            };
            engine.initialize(RuntimeConfig::new(device)).await?;
            let transition = engine.revoke_consent(channel.clone().into()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&transition.after).unwrap_or_else(|_| "<unserializable>".into())
            );
            engine.dispose().await?;
            Ok(())
        }
    }
}
