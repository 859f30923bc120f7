//! serial-stream diagnostic CLI.
//!
//! ```text
//! serial-stream probe /dev/ttyUSB0 --payload "AT\r"
//! serial-stream watch COM3 --seconds 30
//! serial-stream status /dev/ttyACM0
//! ```

use clap::{Parser, Subcommand};
use serial_stream::config::{Config, ConfigLoader, LogFormat, LoggingConfig};
use serial_stream::{AsyncSerialStream, SerialStream, StreamOptions, Timeout};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Serial port stream diagnostics
#[derive(Parser, Debug)]
#[command(name = "serial-stream")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (overrides the standard search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a port, write a payload and print whatever comes back
    Probe {
        /// Port name or alias
        port: String,

        #[arg(short, long)]
        baud: Option<u32>,

        /// Text to send; `\r` and `\n` escapes are honoured
        #[arg(short, long, default_value = "ping")]
        payload: String,

        /// How long to wait for the reply
        #[arg(short, long, default_value_t = 500)]
        timeout_ms: u32,
    },

    /// Print notifications until Ctrl-C
    Watch {
        /// Port name or alias
        port: String,

        #[arg(short, long)]
        baud: Option<u32>,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Print configuration, line state and queue counts
    Status {
        /// Port name or alias
        port: String,
    },
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> CliResult<Config> {
    let loader = match path {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    Ok(loader.into_config())
}

fn unescape(payload: &str) -> Vec<u8> {
    payload
        .replace("\\r", "\r")
        .replace("\\n", "\n")
        .into_bytes()
}

fn printable(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                (b as char).to_string()
            } else {
                format!("\\x{b:02x}")
            }
        })
        .collect()
}

fn options_for(config: &Config, baud: Option<u32>) -> CliResult<StreamOptions> {
    let mut options = config.stream.to_options()?;
    if let Some(baud) = baud {
        options.baud_rate = baud;
    }
    Ok(options)
}

async fn probe(
    config: &Config,
    port: &str,
    baud: Option<u32>,
    payload: &str,
    timeout_ms: u32,
) -> CliResult<()> {
    let mut options = options_for(config, baud)?;
    options.read_timeout = Timeout::Millis(timeout_ms);

    let stream = AsyncSerialStream::open_with_runtime(port, options, config.runtime.to_options())
        .await?;
    let payload = unescape(payload);
    println!("-> {}", printable(&payload));
    stream.write(payload.clone()).await?;

    match stream.read(payload.len().max(64)).await {
        Ok(reply) => println!("<- {}", printable(&reply)),
        Err(serial_stream::StreamError::Timeout { .. }) => {
            println!("<- (no reply within {timeout_ms} ms)");
        }
        Err(err) => return Err(err.into()),
    }

    stream.close().await?;
    Ok(())
}

async fn watch(
    config: &Config,
    port: &str,
    baud: Option<u32>,
    seconds: Option<u64>,
) -> CliResult<()> {
    let options = options_for(config, baud)?;
    let stream = AsyncSerialStream::open_with_runtime(port, options, config.runtime.to_options())
        .await?;
    let mut events = stream.events();
    info!(%port, "watching for notifications; press Ctrl-C to stop");

    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{event:?}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
        }
    }

    drop(events);
    stream.close().await?;
    Ok(())
}

fn status(config: &Config, port: &str) -> CliResult<()> {
    let options = options_for(config, None)?;
    let stream = SerialStream::open_with_runtime(port, &options, &config.runtime.to_options())?;

    println!("port:           {}", stream.port_name());
    println!("baud rate:      {}", stream.baud_rate());
    println!(
        "framing:        {} data bits, {:?} parity, {:?} stop bits",
        stream.data_bits().bits(),
        stream.parity(),
        stream.stop_bits()
    );
    println!("handshake:      {:?}", stream.handshake());
    println!("read timeout:   {:?}", stream.read_timeout());
    println!("write timeout:  {:?}", stream.write_timeout());
    println!("dtr:            {}", stream.dtr_enable());
    match stream.rts_enable() {
        Ok(rts) => println!("rts:            {rts}"),
        Err(_) => println!("rts:            (handshake)"),
    }
    println!(
        "cd / cts / dsr: {} / {} / {}",
        stream.cd_holding()?,
        stream.cts_holding()?,
        stream.dsr_holding()?
    );
    println!("bytes to read:  {}", stream.bytes_to_read()?);
    println!("bytes to write: {}", stream.bytes_to_write()?);

    stream.close()?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging, cli.verbose);

    let result = match &cli.command {
        Commands::Probe {
            port,
            baud,
            payload,
            timeout_ms,
        } => {
            let port = config.stream.resolve_port(port);
            probe(&config, &port, *baud, payload, *timeout_ms).await
        }
        Commands::Watch {
            port,
            baud,
            seconds,
        } => {
            let port = config.stream.resolve_port(port);
            watch(&config, &port, *baud, *seconds).await
        }
        Commands::Status { port } => {
            let port = config.stream.resolve_port(port);
            let config = config.clone();
            match tokio::task::spawn_blocking(move || status(&config, &port)).await {
                Ok(result) => result,
                Err(err) => Err(err.into()),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
