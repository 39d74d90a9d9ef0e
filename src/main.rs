use clap::Parser;
use tidemark::cli::{run, Cli};
use tidemark::logging::{init_logging, LogConfig};

fn main() -> std::process::ExitCode {
    if let Err(e) = init_logging(LogConfig::from_env()) {
        eprintln!("warning: logging disabled: {e}");
    }
    run(Cli::parse())
}
