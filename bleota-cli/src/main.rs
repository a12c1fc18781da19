//! bleota CLI - Host tooling for the bleota OTA engine.
//!
//! ## Features
//!
//! - Inspect the FW_HEADER an image would be announced with
//! - Simulate a complete over-the-air transfer against an in-memory device
//! - Decode activation descriptors from flash dumps
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use bleota::{DataType, FirmwareHeader, StorageType};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;

use commands::{
    completions::cmd_completions, descriptor::cmd_descriptor, info::cmd_info,
    simulate::cmd_simulate,
};
use config::Config;

/// bleota - Host tooling for BLE firmware-over-the-air updates.
///
/// Environment variables:
///   BLEOTA_MTU      - Fragment size used by `simulate` (default: 244)
///   BLEOTA_CHUNK    - FW_DATA payload size used by `simulate` (default: 512)
#[derive(Parser)]
#[command(name = "bleota")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Flash device an image targets.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Storage {
    /// On-chip flash (default).
    Internal,
    /// External SPI flash.
    External,
}

impl From<Storage> for StorageType {
    fn from(storage: Storage) -> Self {
        match storage {
            Storage::Internal => StorageType::Internal,
            Storage::External => StorageType::External,
        }
    }
}

/// Fields of the FW_HEADER announced for an image.
#[derive(Args, Debug, Clone)]
struct HeaderArgs {
    /// Image version (defaults to `transfer.version` from config, else 0).
    #[arg(long = "image-version", value_name = "N")]
    image_version: Option<u32>,

    /// Address the bootloader installs the image at.
    #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
    start_address: u32,

    /// Flash device the image is staged in.
    #[arg(long, value_enum, default_value = "internal")]
    storage: Storage,

    /// Mark the image as a data blob instead of a binary.
    #[arg(long)]
    data: bool,

    /// Mark the image as encrypted.
    #[arg(long)]
    encrypted: bool,

    /// Bytes of security metadata prefixed to the image.
    #[arg(long, default_value = "0")]
    security_info_length: u32,
}

impl HeaderArgs {
    /// Build the header describing `image`.
    fn to_header(&self, image: &[u8], config: &Config) -> Result<FirmwareHeader> {
        let data_type = if self.data {
            DataType::Data
        } else {
            DataType::Binary
        };
        let header = FirmwareHeader::for_image(image)
            .with_version(
                self.image_version
                    .or(config.transfer.version)
                    .unwrap_or(0),
            )
            .with_start_address(self.start_address)
            .with_storage(self.storage.into())
            .with_data_type(data_type)
            .with_encrypted(self.encrypted)
            .with_security_info_length(self.security_info_length);
        header.validate()?;
        Ok(header)
    }
}

/// Options of the `simulate` command.
#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Image file to transfer.
    image: PathBuf,

    #[command(flatten)]
    header: HeaderArgs,

    /// Fragment size (bytes per BLE write).
    #[arg(long, env = "BLEOTA_MTU")]
    mtu: Option<usize>,

    /// FW_DATA payload size.
    #[arg(long, env = "BLEOTA_CHUNK")]
    chunk: Option<usize>,

    /// Drop the link halfway through this data packet (0-based) and resume.
    #[arg(long, value_name = "PACKET")]
    drop_at: Option<usize>,

    /// Corrupt this data packet (0-based) once and retransmit it.
    #[arg(long, value_name = "PACKET")]
    corrupt_at: Option<usize>,

    /// Write the staged image read back from simulated flash to this file.
    #[arg(long, value_name = "PATH")]
    dump: Option<PathBuf>,

    /// Output the transfer report as JSON to stdout.
    #[arg(long)]
    json: bool,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show the FW_HEADER an image would be announced with.
    Info {
        /// Image file.
        image: PathBuf,

        #[command(flatten)]
        header: HeaderArgs,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run a complete transfer against a simulated device.
    Simulate(SimulateArgs),

    /// Decode an activation descriptor from a flash dump.
    Descriptor {
        /// Flash dump file.
        dump: PathBuf,

        /// Descriptor address (defaults to `device.descriptor_address`).
        #[arg(long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Flash address of the first byte of the dump.
        #[arg(long, value_parser = parse_hex_u32, default_value = "0")]
        base: u32,

        /// Output the descriptor as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "bleota v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Info {
            image,
            header,
            json,
        } => {
            cmd_info(&cli, &config, image, header, *json)?;
        },
        Commands::Simulate(args) => {
            cmd_simulate(&cli, &config, args)?;
        },
        Commands::Descriptor {
            dump,
            address,
            base,
            json,
        } => {
            let address = address.unwrap_or_else(|| config.device.descriptor_address());
            cmd_descriptor(dump, address, *base, *json)?;
        },
        Commands::Completions { shell } => {
            cmd_completions(*shell)?;
        },
    }

    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    // ---- subcommand parsing ----

    #[test]
    fn test_cli_parse_info() {
        let cli = Cli::try_parse_from(["bleota", "info", "app.bin"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: false, .. }));
    }

    #[test]
    fn test_cli_parse_info_header_flags() {
        let cli = Cli::try_parse_from([
            "bleota",
            "info",
            "app.bin",
            "--image-version",
            "7",
            "--start-address",
            "0x0800_0000",
            "--storage",
            "external",
            "--data",
            "--encrypted",
            "--json",
        ])
        .unwrap();
        if let Commands::Info { header, json, .. } = cli.command {
            assert_eq!(header.image_version, Some(7));
            assert_eq!(header.start_address, 0x0800_0000);
            assert!(matches!(header.storage, Storage::External));
            assert!(header.data);
            assert!(header.encrypted);
            assert!(json);
        } else {
            panic!("Expected Info command");
        }
    }

    #[test]
    fn test_cli_parse_simulate() {
        let cli = Cli::try_parse_from([
            "bleota",
            "simulate",
            "app.bin",
            "--mtu",
            "20",
            "--chunk",
            "128",
            "--drop-at",
            "3",
            "--corrupt-at",
            "1",
        ])
        .unwrap();
        if let Commands::Simulate(args) = cli.command {
            assert_eq!(args.mtu, Some(20));
            assert_eq!(args.chunk, Some(128));
            assert_eq!(args.drop_at, Some(3));
            assert_eq!(args.corrupt_at, Some(1));
            assert!(args.dump.is_none());
        } else {
            panic!("Expected Simulate command");
        }
    }

    #[test]
    fn test_cli_parse_descriptor() {
        let cli =
            Cli::try_parse_from(["bleota", "descriptor", "flash.bin", "--address", "7F000"])
                .unwrap();
        if let Commands::Descriptor { address, base, .. } = cli.command {
            assert_eq!(address, Some(0x7F000));
            assert_eq!(base, 0);
        } else {
            panic!("Expected Descriptor command");
        }
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["bleota", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions {
                shell: Some(Shell::Zsh)
            }
        ));
    }

    // ---- global flags ----

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from([
            "bleota",
            "-vv",
            "--quiet",
            "--config",
            "/tmp/bleota.toml",
            "info",
            "app.bin",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert_eq!(
            cli.config_path.as_deref(),
            Some(std::path::Path::new("/tmp/bleota.toml"))
        );
    }

    #[test]
    fn test_cli_rejects_missing_subcommand() {
        assert!(Cli::try_parse_from(["bleota"]).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_storage() {
        assert!(Cli::try_parse_from(["bleota", "info", "a.bin", "--storage", "sd"]).is_err());
    }

    // ---- parse_hex_u32 ----

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x7F000"), Ok(0x7F000));
        assert_eq!(parse_hex_u32("0X10"), Ok(0x10));
        assert_eq!(parse_hex_u32("00_04_00_00"), Ok(0x40000));
        assert_eq!(parse_hex_u32(" ff "), Ok(0xFF));
        assert!(parse_hex_u32("xyz").is_err());
        assert!(parse_hex_u32("1_0000_0000").is_err());
    }

    // ---- header construction ----

    #[test]
    fn test_header_args_version_falls_back_to_config() {
        let cli = Cli::try_parse_from(["bleota", "info", "app.bin"]).unwrap();
        let Commands::Info { header, .. } = cli.command else {
            panic!("Expected Info command");
        };
        let mut config = Config::default();
        config.transfer.version = Some(12);

        let built = header.to_header(&[1, 2, 3], &config).unwrap();
        assert_eq!(built.version, 12);
        assert_eq!(built.length, 3);
        assert_eq!(built.storage_type, StorageType::Internal);
        assert_eq!(built.data_type, DataType::Binary);
    }
}
