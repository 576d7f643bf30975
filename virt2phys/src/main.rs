extern crate simplelog;
extern crate virt2phys;

#[macro_use]
extern crate log;

use std::env;
use std::io;
use std::process;

use chrono::Utc;
use simplelog::{ColorChoice, CombinedLogger, SharedLogger, TermLogger, TerminalMode};
use virt2phys::{Config, Error, ScanMode};

fn init_logging() -> virt2phys::Result<()> {
    let level = virt2phys::config::log_level()?;
    // stdout carries the page records, so everything else goes to stderr
    let term: Box<dyn SharedLogger> = TermLogger::new(
        level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
    if CombinedLogger::init(vec![term]).is_err() {
        eprintln!("Logger already initialised");
    }
    Ok(())
}

fn usage(program: &str) -> Error {
    Error::InvalidArgument(format!("Usage: {} <pid|kernel|pagecache>", program))
}

fn try_main() -> virt2phys::Result<()> {
    init_logging()?;

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("virt2phys");
    if args.len() != 2 {
        return Err(usage(program));
    }
    let mode: ScanMode = args[1].parse()?;
    let config = Config::detect()?;
    info!("Scanning {}", mode);

    let start_time = Utc::now();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let stats = virt2phys::run(&mode, &config, &mut out)?;
    stats.log_summary();
    info!(
        "---------- Completed {} in {} ms ----------",
        mode,
        (Utc::now() - start_time).num_milliseconds()
    );
    Ok(())
}

fn main() {
    if let Err(e) = try_main() {
        if e.is_process_not_found() {
            eprintln!("No such process or listing: {}", e);
        } else if e.is_permission_denied() {
            eprintln!("Permission denied (pagemap and kpageflags need root): {}", e);
        } else {
            eprintln!("{}", e);
        }
        process::exit(e.exit_code());
    }
}
