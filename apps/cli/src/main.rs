use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use stm32prog_core::{
    BoardConfig, ImageHeader, LoopExit, MemoryBoard, ProgramSession, SerialEngine, StreamPort,
    TracingObserver, parse_flash_layout,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "STM32MP programming tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a flash layout and show the partitions and alternate settings
    Check {
        /// Flash layout (.tsv), with or without image header
        layout: PathBuf,
        /// Board description (TOML); the default evaluation board otherwise
        #[arg(long)]
        board: Option<PathBuf>,
    },
    /// Serve the serial protocol on a TCP socket against a simulated board
    Serve {
        #[arg(long)]
        board: Option<PathBuf>,
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:5555")]
        listen: String,
    },
    /// Decode and check an image header
    Header {
        file: PathBuf,
    },
    /// Prepend an image header to a payload
    Wrap {
        input: PathBuf,
        output: PathBuf,
    },
}

fn load_board(path: Option<&Path>) -> Result<BoardConfig> {
    match path {
        Some(path) => BoardConfig::load_from_file(path)
            .with_context(|| format!("loading board {}", path.display())),
        None => Ok(BoardConfig::default()),
    }
}

fn check(layout: &Path, board: Option<&Path>) -> Result<()> {
    let data = std::fs::read(layout).with_context(|| format!("reading {}", layout.display()))?;
    let parts = parse_flash_layout(&data)?;
    info!(partitions = parts.len(), "Layout parsed");

    let config = load_board(board)?;
    let mut board = MemoryBoard::from_config(&config);
    let session = ProgramSession::with_layout(config.session.clone(), &mut board, &data)?;
    if let Some(err) = session.error() {
        bail!("layout does not fit the board: {}", err);
    }

    println!(
        "{:<4} {:<16} {:<12} {:<8} {:>12} {:>12}",
        "Id", "Name", "Type", "Target", "Offset", "Size"
    );
    for part in session.parts() {
        println!(
            "0x{:02x} {:<16} {:<12} {:<8} {:>#12x} {:>#12x}",
            part.id,
            part.name,
            part.part_type.to_string(),
            part.target.to_string(),
            part.addr(),
            part.size
        );
    }
    println!();
    for alt in session.alts() {
        println!("alt {:>2}: {} {}", alt.alt_id, alt.descriptor, alt.devstr);
    }
    Ok(())
}

fn serve(board: Option<&Path>, listen: &str) -> Result<()> {
    let config = load_board(board)?;
    let mut board = MemoryBoard::from_config(&config);
    let mut session = ProgramSession::new(config.session.clone(), &mut board);

    let listener = TcpListener::bind(listen).with_context(|| format!("binding {}", listen))?;
    info!(address = %listen, "Waiting for host");
    let (stream, peer) = listener.accept()?;
    info!(peer = %peer, "Host connected");

    let mut engine = SerialEngine::new(StreamPort::new(stream), board, Arc::new(TracingObserver));
    match engine.run(&mut session)? {
        LoopExit::Reset => info!("Programming finished, board reset"),
        LoopExit::Cancelled => warn!("Cancelled"),
        LoopExit::Disconnected => warn!(phase = %session.phase(), "Host disconnected"),
    }
    if let Some(err) = session.error() {
        bail!("session failed: {}", err);
    }
    Ok(())
}

fn header(file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let header = ImageHeader::parse(&data)?;
    println!("magic:        0x{:08x}", header.magic);
    println!("version:      0x{:08x}", header.header_version);
    println!("length:       0x{:x}", header.image_length);
    println!("checksum:     0x{:08x}", header.image_checksum);
    println!("entry point:  0x{:08x}", header.image_entry_point);
    println!("load address: 0x{:08x}", header.load_address);
    println!("binary type:  0x{:02x}", header.binary_type);

    let payload = &data[ImageHeader::SIZE..];
    match header.verify_payload(payload) {
        Ok(()) => println!("payload:      OK"),
        Err(e) => bail!("payload: {}", e),
    }
    Ok(())
}

fn wrap(input: &Path, output: &Path) -> Result<()> {
    let payload = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let image = ImageHeader::wrap(&payload);
    std::fs::write(output, &image).with_context(|| format!("writing {}", output.display()))?;
    info!(payload = payload.len(), image = image.len(), "Image written");
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match &args.command {
        Command::Check { layout, board } => check(layout, board.as_deref()),
        Command::Serve { board, listen } => serve(board.as_deref(), listen),
        Command::Header { file } => header(file),
        Command::Wrap { input, output } => wrap(input, output),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
