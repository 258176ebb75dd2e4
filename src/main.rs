use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fwpipe::config::{Config, TftpConfig};
use fwpipe::progress;
use fwpipe::{SysupgradeOrchestrator, TftpClient, UpgradeStatus, UploadIngest};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fwpipe")]
#[command(about = "Fetch, stage and flash appliance firmware", long_about = None)]
struct Cli {
    /// JSON file with "upload" and "upgrade" sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TftpServer {
    /// TFTP server address
    server: String,

    #[arg(short, long, default_value_t = 69)]
    port: u16,

    /// Receive timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    retries: Option<u32>,
}

impl TftpServer {
    fn client(&self, mut config: TftpConfig) -> Result<TftpClient> {
        config.port = self.port;
        if let Some(secs) = self.timeout {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        Ok(TftpClient::new(&self.server, config)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a TFTP server answers
    TftpTest {
        #[command(flatten)]
        server: TftpServer,
    },
    /// Download a file over TFTP
    TftpGet {
        #[command(flatten)]
        server: TftpServer,

        /// File name on the server
        filename: String,

        /// Where to store the download
        output: PathBuf,

        #[arg(long, default_value_t = 512)]
        block_size: usize,
    },
    /// Ingest a local image as a manual upload
    Upload {
        file: PathBuf,

        #[arg(long, default_value = "sysupgrade")]
        file_type: String,

        #[arg(long)]
        verify_signature: bool,
    },
    /// List stored uploads
    Uploads,
    /// Delete a stored upload
    DeleteUpload { upload_id: String },
    /// Flash a firmware image and wait for the result
    Upgrade {
        firmware: PathBuf,

        /// Discard the current configuration
        #[arg(short = 'n', long)]
        no_preserve_config: bool,
    },
    /// Show the last recorded upgrade progress
    Status,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            Config::from_json(&text).with_context(|| format!("parsing {}", p.display()))
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::TftpTest { server } => {
            let client = server.client(TftpConfig::for_connection_test())?;
            client.test_connection().await?;
            println!("TFTP server {} is reachable", client.server_addr());
        }
        Commands::TftpGet { server, filename, output, block_size } => {
            let mut client = server.client(TftpConfig {
                block_size,
                ..TftpConfig::for_download()
            })?;
            client.set_progress_callback(Box::new(|p| {
                log::info!("{:.1}% ({} bytes, {:?})", p.percentage, p.bytes_transferred, p.elapsed)
            }));
            let written = client.download_file_to_path(&filename, &output).await?;
            println!("Saved {written} bytes to {}", output.display());
        }
        Commands::Upload { file, file_type, verify_signature } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ingest = UploadIngest::new(config.upload);
            match ingest.upload_firmware_file(&bytes, &name, &file_type, verify_signature) {
                Some(id) => println!("{id}"),
                None => bail!("upload of {} was rejected", file.display()),
            }
        }
        Commands::Uploads => {
            let ingest = UploadIngest::new(config.upload);
            println!("{}", serde_json::to_string_pretty(&ingest.list_uploads())?);
        }
        Commands::DeleteUpload { upload_id } => {
            let ingest = UploadIngest::new(config.upload);
            if !ingest.delete_upload(&upload_id) {
                bail!("no upload named {upload_id}");
            }
        }
        Commands::Upgrade { firmware, no_preserve_config } => {
            let orchestrator = SysupgradeOrchestrator::new(config.upgrade);
            orchestrator.set_progress_callback(|p| {
                println!("[{:>3}%] {}", p.progress_percentage, p.stage_description)
            });
            let id = orchestrator.start_upgrade(&firmware, !no_preserve_config)?;
            log::info!("Upgrade {id} started");

            let last = tokio::task::spawn_blocking(move || {
                orchestrator.wait();
                orchestrator.get_progress()
            })
            .await?;
            if last.status == UpgradeStatus::Failed {
                bail!("upgrade {id} failed: {}", last.error_message);
            }
        }
        Commands::Status => {
            let last = progress::load(&config.upgrade.recovery_file)
                .with_context(|| format!("reading {}", config.upgrade.recovery_file.display()))?;
            println!("{}", progress::to_json(&last)?);
        }
    }

    Ok(())
}
