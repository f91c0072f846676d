//! Controller / CLI glue.
//!
//! Command-line surface: `hm05 <verb> <file> [-h|--help]`. A `structopt`
//! struct holds the global flags plus a subcommand enum for the verb,
//! with hex-parsed numeric flags via `parse(try_from_str = ...)`.

use structopt::StructOpt;

use simplelog::LevelFilter;

use crate::mpsse::{PRODUCT_ID, VENDOR_ID};

/// `hm05` command-line options.
#[derive(Debug, StructOpt)]
#[structopt(name = "hm05", about = "Programmer for the hm05 flash cartridge")]
pub struct Options {
    #[structopt(subcommand)]
    pub operation: Operation,

    /// USB vendor ID of the MPSSE bridge, in hex
    #[structopt(long, default_value = "0403", parse(try_from_str = parse_hex_u16))]
    pub vendor: u16,

    /// USB product ID of the MPSSE bridge, in hex
    #[structopt(long, default_value = "6010", parse(try_from_str = parse_hex_u16))]
    pub product: u16,

    /// Configure log level
    #[structopt(long, default_value = "info")]
    pub log_level: LevelFilter,
}

/// The two verbs the programmer supports.
#[derive(Debug, StructOpt)]
pub enum Operation {
    /// Dump the full chip image to a file
    Read {
        /// Output file (binary, length = ROM_BUFFER_SIZE)
        file: String,
    },
    /// Program a file's contents onto the chip
    Write {
        /// Input file (length determined by file size)
        file: String,
    },
}

fn parse_hex_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s, 16)
}
