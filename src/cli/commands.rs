use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use crate::core::{
    card,
    config::Config,
    family::CardFamily,
    reader::{PcscReader, ReaderMonitor},
    record::InsurantRecord,
    session::{Notification, SessionManager},
    utils::{format_hex_spaced, parse_hex},
};

#[derive(Parser)]
#[command(name = "health-card-reader")]
#[command(about = "Reads insurant data from German eGK and Austrian e-card health cards")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// JSON configuration file (ATR tables, status policies, poll interval)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Read the insurant record from the card in a reader
    Read {
        /// Reader name or index (use 'list' to see available readers)
        reader: String,

        /// Card type to assume when the ATR is not recognized (DE or AT)
        #[arg(long)]
        fallback: Option<CardFamily>,

        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,

        /// Print the APDU exchange history to stderr
        #[arg(long)]
        trace: bool,
    },

    /// Wait for cards and read each one as it is inserted
    Watch {
        /// Card type to assume when the ATR is not recognized (DE or AT)
        #[arg(long)]
        fallback: Option<CardFamily>,

        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,

        /// Stop after the first card has been read
        #[arg(long)]
        once: bool,
    },

    /// Determine the card type from an ATR without a reader
    Classify {
        /// ATR in hex format (e.g., "3B D3 96 FF 81 B1 FE 45 1F 07 80 81 05 2D")
        atr: String,

        /// Card type to assume when the ATR is not recognized (DE or AT)
        #[arg(long)]
        fallback: Option<CardFamily>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::List { detailed } => cmd_list(detailed, &config),
        Commands::Read {
            reader,
            fallback,
            format,
            trace,
        } => cmd_read(&reader, with_fallback(config, fallback), format, trace),
        Commands::Watch {
            fallback,
            format,
            once,
        } => cmd_watch(with_fallback(config, fallback), format, once),
        Commands::Classify { atr, fallback } => cmd_classify(&atr, &with_fallback(config, fallback)),
    }
}

/// The command line flag wins over the configuration file
fn with_fallback(mut config: Config, fallback: Option<CardFamily>) -> Config {
    if fallback.is_some() {
        config.fallback = fallback;
    }
    config
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to start async runtime")
}

fn cmd_list(detailed: bool, config: &Config) -> Result<()> {
    let reader = PcscReader::new().context("Failed to initialize PCSC")?;
    let readers = reader.list_readers().context("Failed to list readers")?;
    let table = config.atr_table()?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, reader_info) in readers.iter().enumerate() {
        let family = reader_info
            .atr
            .as_deref()
            .and_then(|atr| table.family_of(atr))
            .map_or_else(|| "unknown".to_string(), |f| f.to_string());

        if detailed {
            println!("  [{}] {}", i, reader_info.name);
            println!(
                "      Status: {}",
                if reader_info.is_connected {
                    "Card present"
                } else {
                    "No card"
                }
            );
            if let Some(ref atr) = reader_info.atr {
                println!("      ATR: {}", format_hex_spaced(atr));
                println!("      Card type: {family}");
            }
        } else if reader_info.is_connected {
            println!("  [{}] {} [CARD {family}]", i, reader_info.name);
        } else {
            println!("  [{}] {}", i, reader_info.name);
        }
    }

    Ok(())
}

fn cmd_read(reader_name: &str, config: Config, format: OutputFormat, trace: bool) -> Result<()> {
    let reader = PcscReader::new().context("Failed to initialize PCSC")?;
    let reader_name = resolve_reader_name(&reader, reader_name)?;

    let mut session = reader
        .open_session(&reader_name)
        .with_context(|| format!("Failed to connect to reader: {reader_name}"))?;

    let result = runtime()?.block_on(card::read_insurant(&mut session, &config));

    if trace {
        eprintln!("{}", session.export_history()?);
    }
    if let Err(e) = session.close() {
        log::warn!("Failed to disconnect cleanly from card: {e}");
    }

    let record = result.with_context(|| format!("Failed to read card in {reader_name}"))?;
    print_record(&record, format)
}

fn cmd_watch(config: Config, format: OutputFormat, once: bool) -> Result<()> {
    runtime()?.block_on(async {
        let (mut monitor, mut events) =
            ReaderMonitor::spawn(config.poll_interval()).context("Failed to start reader monitor")?;
        let connector = PcscReader::new().context("Failed to initialize PCSC")?;
        let (mut manager, mut notifications) = SessionManager::new(connector);

        if format == OutputFormat::Text {
            println!("Waiting for cards...");
        }

        'events: while let Some(event) = events.recv().await {
            manager.handle(event);

            while let Ok(notification) = notifications.try_recv() {
                print_notification(&notification, format)?;

                match notification {
                    Notification::CardConnected { reader, .. } => {
                        match manager.read_insurant(&reader, &config).await {
                            Ok(record) => print_record(&record, format)?,
                            Err(e) => eprintln!("Failed to read card in {reader}: {e}"),
                        }
                        if once {
                            break 'events;
                        }
                    }
                    Notification::ReaderDisconnected { .. } => break 'events,
                    _ => {}
                }
            }
        }

        manager.shutdown();
        monitor.stop();
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_classify(atr_hex: &str, config: &Config) -> Result<()> {
    let atr = parse_hex(atr_hex).context("Failed to parse ATR")?;
    if atr.is_empty() {
        bail!("ATR must not be empty");
    }

    let family = config.atr_table()?.classify(&atr, config.fallback)?;
    println!("ATR: {}", format_hex_spaced(&atr));
    println!("Card type: {family}");
    Ok(())
}

fn resolve_reader_name(reader: &PcscReader, name_or_index: &str) -> Result<String> {
    // Try to parse as index first
    if let Ok(index) = name_or_index.parse::<usize>() {
        let readers = reader.list_readers()?;
        return match readers.get(index) {
            Some(info) => Ok(info.name.clone()),
            None if readers.is_empty() => bail!("No PCSC readers found"),
            None => bail!(
                "Reader index {} out of range (0-{})",
                index,
                readers.len() - 1
            ),
        };
    }

    // Use as reader name directly
    Ok(name_or_index.to_string())
}

fn print_record(record: &InsurantRecord, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{record}"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(record).context("Failed to serialize record")?
        ),
    }
    Ok(())
}

fn print_notification(notification: &Notification, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(notification).context("Failed to serialize notification")?
        ),
        OutputFormat::Text => match notification {
            Notification::ReaderConnected { reader } => println!("Reader connected: {reader}"),
            Notification::ReaderDisconnected { reader } => {
                println!("Reader disconnected: {reader}")
            }
            Notification::CardConnected { reader, atr } => {
                println!("Card inserted in {reader} (ATR: {atr})")
            }
            Notification::CardDisconnected { reader } => println!("Card removed from {reader}"),
            Notification::Error { reader, cause } => match reader {
                Some(reader) => eprintln!("Error on {reader}: {cause}"),
                None => eprintln!("Error: {cause}"),
            },
        },
    }
    Ok(())
}
