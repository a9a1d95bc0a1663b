use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pathstream::service::localfs::LocalFsPathService;
use pathstream::{
    ClientConfig, ConsistencyMode, PathClient, ReadOptions, RequestMetrics, WriteMode,
    WriteOptions,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

const COPY_BUF: usize = 256 * 1024;

#[derive(Parser)]
#[command(name = "pathstream")]
#[command(about = "Stream files into and out of a directory-backed path store", long_about = None)]
struct Cli {
    /// Root directory of the path store
    #[arg(long, env = "PATHSTREAM_ROOT", default_value = ".")]
    root: PathBuf,

    /// YAML client config
    #[arg(long, env = "PATHSTREAM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Upload a local file (or stdin) to a path")]
    Put {
        #[arg(value_name = "REMOTE")]
        remote: String,
        /// Local file to read; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        block_size: Option<u64>,
        #[arg(long)]
        parallelism: Option<usize>,
        /// Fail if the path already exists
        #[arg(long)]
        no_overwrite: bool,
        /// Add to the end of the existing content
        #[arg(long)]
        append: bool,
        /// Close the path for further appends
        #[arg(long)]
        close: bool,
    },
    #[command(about = "Download a path to a local file (or stdout)")]
    Get {
        #[arg(value_name = "REMOTE")]
        remote: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        chunk_size: Option<u64>,
        #[arg(long)]
        consistency: Option<ConsistencyMode>,
        /// Expected consistency token of the path
        #[arg(long)]
        token: Option<String>,
    },
    #[command(about = "Show the properties of a path")]
    Stat {
        #[arg(value_name = "REMOTE")]
        remote: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ClientConfig::from_path(path)?,
        None => ClientConfig::default(),
    };
    let metrics = RequestMetrics::new();
    let service = Arc::new(LocalFsPathService::new(&cli.root));
    let client = PathClient::new(service, config)?.with_metrics(metrics.clone());

    match cli.command {
        Commands::Put {
            remote,
            file,
            block_size,
            parallelism,
            no_overwrite,
            append,
            close,
        } => {
            let mut options = WriteOptions::new()
                .prevent_overwrite(no_overwrite)
                .close(close)
                .mode(if append {
                    WriteMode::Append
                } else {
                    WriteMode::Overwrite
                });
            options.block_size = block_size;
            options.parallelism = parallelism;

            let mut input: Box<dyn AsyncRead + Unpin> = match &file {
                Some(path) => Box::new(
                    tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("open {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdin()),
            };
            let mut stream = client.open_write(remote.as_str(), &options).await?;
            let mut buf = vec![0u8; COPY_BUF];
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await?;
            }
            let receipt = stream.close().await?;
            info!(path = %receipt.path, blocks = receipt.blocks, "put done");
            println!(
                "{}\t{} bytes\t{}",
                receipt.path, receipt.length, receipt.token
            );
        }
        Commands::Get {
            remote,
            out,
            offset,
            count,
            chunk_size,
            consistency,
            token,
        } => {
            let mut options = ReadOptions::new().range(offset, count);
            options.chunk_size = chunk_size;
            options.consistency = consistency;
            if let Some(token) = token {
                options = options.token(token);
            }

            let mut output: Box<dyn AsyncWrite + Unpin> = match &out {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("create {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };
            let mut stream = client.open_read(remote.as_str(), &options).await?;
            while let Some(chunk) = stream.next_chunk().await? {
                output.write_all(&chunk).await?;
            }
            output.flush().await?;
            stream.close();
        }
        Commands::Stat { remote } => {
            let props = client.properties(remote.as_str()).await?;
            println!("kind:   {:?}", props.kind);
            println!("length: {}", props.length);
            if let Some(token) = &props.token {
                println!("token:  {token}");
            }
            println!("closed: {}", props.closed);
        }
    }

    info!(requests = ?metrics.snapshot(), "done");
    Ok(())
}
