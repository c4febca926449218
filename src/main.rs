use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::Parser;
use nix::unistd::Uid;
use tracing_subscriber::EnvFilter;

use rustainer::{ContainerConfig, image, runtime};

#[derive(Parser)]
#[command(name = "rustainer")]
#[command(about = "A minimal single-host container runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Pull an image and unpack its root filesystem under ./images
    Pull { image: String },
    /// Run an interactive shell inside a container for a pulled image
    Run {
        /// Image reference previously pulled; ignored when --rootfs is given
        image: Option<String>,
        /// Use an existing root filesystem directory instead of a pulled image
        #[arg(long)]
        rootfs: Option<PathBuf>,
    },
}

/// Where `pull` leaves a rootfs and where `run` expects to find one.
fn rootfs_path(name: &str, tag: &str) -> PathBuf {
    PathBuf::from("images").join(name).join(tag)
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Pull { image } => {
            let (name, tag) = image::parse_reference(&image);
            image::pull(name, tag, &rootfs_path(name, tag))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { image, rootfs } => {
            if !Uid::effective().is_root() {
                bail!("the run command must be run as root");
            }
            let rootfs = match (rootfs, image) {
                (Some(path), _) => path,
                (None, Some(image)) => {
                    let (name, tag) = image::parse_reference(&image);
                    rootfs_path(name, tag)
                }
                (None, None) => bail!("run needs an image reference or --rootfs"),
            };
            let config = ContainerConfig::default();
            let code = runtime::run_container(&config, &rootfs)?;
            Ok(ExitCode::from(code.clamp(0, 255) as u8))
        }
    }
}
