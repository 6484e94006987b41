//! rangegate: serve IP range membership lookups.

use clap::{Parser, Subcommand};
use rangegate::{Config, RangeIndex, Shutdown, SourceFetcher, SourceFormat};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rangegate")]
#[command(author = "Kaitu.io")]
#[command(version = "0.1.0")]
#[command(about = "Low-latency IP range membership service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured endpoint until Ctrl-C
    Serve {
        /// YAML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print a documented default configuration
    DefaultConfig,

    /// Load a source once and check addresses against it
    Lookup {
        /// Local path or http(s):// URL of the range source
        #[arg(short, long)]
        source: String,

        /// Source format (text or csv)
        #[arg(short, long, default_value = "text")]
        format: SourceFormat,

        /// Addresses to check
        #[arg(required = true)]
        ips: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config } => serve(&config),
        Commands::DefaultConfig => {
            print!("{}", Config::default_yaml());
            Ok(())
        }
        Commands::Lookup {
            source,
            format,
            ips,
        } => {
            init_logging("warn");
            lookup(&source, format, &ips)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn serve(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_file(path)?;
    init_logging(&config.log_level);

    if config.endpoints.is_empty() {
        return Err("no endpoints configured".into());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let outcomes = runtime.block_on(async move {
        let (handle, shutdown) = Shutdown::new();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("Received Ctrl-C, shutting down"),
                Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
            }
            handle.shutdown();
        });

        rangegate::serve_all(config.endpoints, shutdown).await
    });

    let failed = outcomes.iter().filter(|(_, result)| result.is_err()).count();
    if failed > 0 {
        return Err(format!("{} of {} endpoints failed", failed, outcomes.len()).into());
    }
    Ok(())
}

fn lookup(
    source: &str,
    format: SourceFormat,
    ips: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let prefixes = SourceFetcher::new(source, format).load()?;
    let index = RangeIndex::build(&prefixes);

    for ip in ips {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => println!("{}\t{}", ip, u8::from(index.contains(addr))),
            Err(_) => println!("{}\terror: invalid IP format", ip),
        }
    }
    Ok(())
}
