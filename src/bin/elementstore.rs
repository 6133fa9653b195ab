//! ElementStore CLI driver.
//!
//! Opens the engine from environment configuration and runs one of the
//! operator commands. Exit codes: 0 ok, 1 configuration error, 2 storage
//! initialization error, 3 genesis error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use elementstore::hub::{serve, Hub};
use elementstore::{Config, ElementStore, StoreError};

const EXIT_CONFIG: u8 = 1;
const EXIT_STORAGE: u8 = 2;
const EXIT_GENESIS: u8 = 3;

#[derive(Parser)]
#[command(name = "elementstore")]
#[command(about = "Self-describing object store engine", long_about = None)]
struct Args {
    /// Data root directory (overrides ELEMENTSTORE_DATA_ROOT)
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Directory of additional genesis seed files
    #[arg(long)]
    genesis_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the genesis loader and print its report
    Genesis,
    /// Serve the WebSocket fan-out hub
    Hub {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9310")]
        addr: SocketAddr,
    },
    /// Write a snapshot bundle and print its metadata
    Export,
    /// Run the built-in schema+data self test
    Selftest,
    /// Drop all non-meta classes and re-seed (development)
    Reset,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(root) = args.data_root {
        config.data_root = root;
    }
    if let Some(dir) = args.genesis_dir {
        config.genesis_dir = Some(dir);
    }
    if let Err(e) = config.validate() {
        eprintln!("configuration error: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    // The hub is a standalone process; it needs no engine.
    if let Command::Hub { addr } = &args.command {
        return run_hub(*addr);
    }

    let store = match ElementStore::open(config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("storage initialization failed: {}", e);
            return ExitCode::from(match e {
                StoreError::Config { .. } => EXIT_CONFIG,
                _ => EXIT_STORAGE,
            });
        }
    };

    match args.command {
        Command::Genesis => match store.run_genesis() {
            Ok(report) => {
                print_json(&report);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("genesis failed: {}", e);
                ExitCode::from(EXIT_GENESIS)
            }
        },
        Command::Export => match store.export_snapshot() {
            Ok(meta) => {
                print_json(&meta);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("export failed: {}", e);
                ExitCode::from(EXIT_STORAGE)
            }
        },
        Command::Selftest => {
            let report = store.run_tests();
            print_json(&report);
            if report.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_STORAGE)
            }
        }
        Command::Reset => match store.reset() {
            Ok(cleared) => {
                print_json(&cleared);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("reset failed: {}", e);
                ExitCode::from(EXIT_STORAGE)
            }
        },
        Command::Hub { .. } => unreachable!("handled before engine open"),
    }
}

fn run_hub(addr: SocketAddr) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("hub runtime failed: {}", e);
            return ExitCode::from(EXIT_STORAGE);
        }
    };
    match runtime.block_on(serve(addr, Hub::new())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hub failed: {}", e);
            ExitCode::from(EXIT_STORAGE)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("render failed: {}", e),
    }
}
