mod config;
mod run_cmd;
mod tag_cmds;
#[cfg(test)]
mod test_util;

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};

use config::RfidiskConfig;

#[derive(Parser)]
#[command(
    name = "rfidisk",
    version,
    about = "Launch and stop applications by inserting RFID tags into a serial reader"
)]
struct Cli {
    /// Config file (defaults to ~/.config/rfidisk/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an rfidisk config file
    Init {
        /// Serial device of the reader
        #[arg(long, default_value = "/dev/rfidisk")]
        device: PathBuf,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the daemon
    Run {
        /// Serial device (overrides RFIDISK_DEVICE and the config file)
        #[arg(long)]
        device: Option<PathBuf>,
        /// Seconds to wait after a tag is removed before terminating
        #[arg(long)]
        removal_delay: Option<f64>,
    },
    /// Tag store management
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum TagCommands {
    /// List all tags
    List,
    /// Show one tag's entry
    Show {
        /// Tag id (hex)
        tag: String,
    },
    /// Create or edit a tag entry
    Set {
        /// Tag id (hex)
        tag: String,
        /// Command run when the tag is inserted (empty for display only)
        #[arg(long)]
        command: Option<String>,
        /// Command run on removal instead of signalling the application
        #[arg(long)]
        terminate: Option<String>,
        /// Display line 1 (20 characters)
        #[arg(long)]
        line1: Option<String>,
        /// Display line 2 (20 characters)
        #[arg(long)]
        line2: Option<String>,
        /// Display line 3 (14 characters)
        #[arg(long)]
        line3: Option<String>,
        /// Display line 4 (14 characters)
        #[arg(long)]
        line4: Option<String>,
    },
    /// Delete a tag entry
    Remove {
        /// Tag id (hex)
        tag: String,
    },
    /// Launch a tag's command, wait, then terminate it
    Test {
        /// Tag id (hex)
        tag: String,
        /// How long to let the application run
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

/// Execute the `rfidisk init` command: write config file.
fn cmd_init(config_override: Option<&Path>, device: &Path, force: bool) -> anyhow::Result<()> {
    let path = config_override
        .map(Path::to_path_buf)
        .unwrap_or_else(config::config_path);

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let tags_path = path
        .parent()
        .map(|dir| dir.join("tags.json"))
        .unwrap_or_else(|| PathBuf::from("tags.json"));

    let cfg = config::ConfigFile {
        device: config::DeviceSection {
            path: device.to_path_buf(),
            ..config::DeviceSection::default()
        },
        tags: config::TagsSection {
            path: Some(tags_path.clone()),
        },
        ..config::ConfigFile::default()
    };

    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  device.path = {}", device.display());
    println!("  tags.path = {}", tags_path.display());
    println!();
    println!("Next: run `rfidisk run` and insert a tag.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { device, force } => {
            cmd_init(cli.config.as_deref(), &device, force)?;
        }
        Commands::Run {
            device,
            removal_delay,
        } => {
            let resolved =
                RfidiskConfig::resolve(cli.config.as_deref(), device.as_deref(), removal_delay)?;
            run_cmd::run_daemon(resolved).await?;
        }
        Commands::Tag { command } => {
            let resolved = RfidiskConfig::resolve(cli.config.as_deref(), None, None)?;
            tag_cmds::run_tag_command(command, &resolved).await?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "rfidisk", &mut std::io::stdout());
        }
    }

    Ok(())
}
