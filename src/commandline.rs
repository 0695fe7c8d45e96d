use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Continuously poll the BMS and print every reading
    Monitor {
        /// Output format for readings
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Take a single reading: battery info and cell voltages
    Once {
        /// Output format for the reading
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

const fn about_text() -> &'static str {
    "jbd bms bluetooth command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Only connect to the device advertising this name
    #[arg(short, long)]
    pub name: Option<String>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config_file: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// How long to scan for the device (e.g., "10s", "1m")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub scan_timeout: Option<Duration>,

    /// Delay between connecting and the first request (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub settle_delay: Option<Duration>,

    /// Delay between two readings (e.g., "1s", "5s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub poll_interval: Option<Duration>,

    /// Request again when a response stalls for this long (e.g., "10s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub stall_timeout: Option<Duration>,
}
