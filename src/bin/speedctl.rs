use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bully_consensus::config::{Config, Speed};

/// Rescales the timing configuration file for a coordination core node.
#[derive(Debug, Parser)]
#[command(name = "speedctl", version)]
struct Args {
    /// Speed profile to apply: demo, slow, normal, or fast.
    #[arg(long, value_enum)]
    speed: Option<Speed>,

    /// Print every profile's parameters without writing anything.
    #[arg(long)]
    show: bool,

    /// Path to the configuration file to rewrite in place.
    #[arg(long, default_value = "config/node.conf")]
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.show {
        let base = Config::default();
        for speed in Speed::all() {
            println!("# {}", speed.name());
            println!("{}", speed.apply(&base));
        }
        return ExitCode::SUCCESS;
    }

    let Some(speed) = args.speed else {
        eprintln!("speedctl: either --speed <demo|slow|normal|fast> or --show is required");
        return ExitCode::FAILURE;
    };

    if !args.config.exists() {
        eprintln!(
            "speedctl: configuration file {} does not exist",
            args.config.display()
        );
        return ExitCode::FAILURE;
    }

    let base = Config::default();
    let scaled = speed.apply(&base);
    if let Err(e) = scaled.validate() {
        eprintln!("speedctl: refusing to write, {} profile violates a constraint: {e}", speed.name());
        return ExitCode::FAILURE;
    }

    match scaled.write_in_place(&args.config) {
        Ok(()) => {
            println!("speedctl: wrote {} profile to {}", speed.name(), args.config.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("speedctl: {e}");
            ExitCode::FAILURE
        }
    }
}
