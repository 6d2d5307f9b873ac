pub use clap::StructOpt;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// Serial device of the instrument
    #[clap(long, short, default_value = "/dev/ttyUSB0")]
    pub port: String,

    /// UART baud rate
    #[clap(long, short, default_value_t = 19200)]
    pub baudrate: u32,

    /// Read timeout in seconds
    #[clap(long, short, default_value_t = 3)]
    pub timeout: u64,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query the instrument firmware version
    Version,

    /// Dump the instrument settings
    Settings,

    /// Trigger single-shot measurements
    #[clap(visible_alias = "m")]
    Measure {
        /// Number of measurements to take
        #[clap(long, short, default_value_t = 1)]
        count: u32,

        /// Delay between measurements in milliseconds
        #[clap(long, short, default_value_t = 2000)]
        interval: u64,
    },

    /// Send a raw command body and print the reply payload
    Raw { command: String },
}
