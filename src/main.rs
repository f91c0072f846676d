//! `hm05`: command-line programmer for the hm05 parallel NOR flash
//! cartridge.
//!
//! `main` maps a `Result` to a process exit code; `run` holds the
//! actual orchestration (open → identify → CFI → operate → power-off).

use std::fs;
use std::process;

use log::error;
use simplelog::{Config, TermLogger, TerminalMode};
use structopt::StructOpt;

use hm05::cli::{Operation, Options};
use hm05::error::{Error, Result};
use hm05::rom::CartridgeSession;
use hm05::transport::FtdiBridge;

fn main() {
    let opts = Options::from_args();

    if TermLogger::init(opts.log_level, Config::default(), TerminalMode::Mixed).is_err() {
        eprintln!("warning: failed to initialize terminal logger");
    }

    match run(opts) {
        Ok(()) => process::exit(0),
        Err(e @ Error::UsageError(_)) => {
            error!("{}", e);
            process::exit(1);
        }
        Err(e) => {
            error!("{}", e);
            process::exit(255);
        }
    }
}

fn run(opts: Options) -> Result<()> {
    let bridge = FtdiBridge::open(opts.vendor, opts.product)?;
    let mut session = CartridgeSession::open(bridge)?;

    session.power_on()?;
    session.identify()?;
    session.query_cfi()?;

    match opts.operation {
        Operation::Read { file } => {
            let rom = session.read_rom()?;
            fs::write(&file, &rom)?;
        }
        Operation::Write { file } => {
            let image = fs::read(&file)?;
            session.write_rom(&image)?;
        }
    }

    session.close()?;
    Ok(())
}
