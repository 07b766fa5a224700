use cerberus_core::addr::Address;
use cerberus_core::proxy::{Config, Proxy};
use cerberus_support::logging;
use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transparent, single-threaded proxy in front of a sharded key-value
/// cluster.
#[derive(Parser)]
#[command(name = "cerberus-proxy", version)]
struct Args {
    /// Address this proxy listens on for client connections.
    #[arg(long)]
    listen: String,

    /// One backend address used to bootstrap the first topology fetch.
    #[arg(long)]
    seed: String,

    /// Per-connection read buffer size, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    read_buffer_bytes: usize,

    /// Per-connection write buffer size, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    write_buffer_bytes: usize,

    /// Per-backend staged-command high-water mark, for backpressure.
    #[arg(long, default_value_t = 4096)]
    staged_high_water: usize,

    /// `trace` | `debug` | `info` | `warn` | `error`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let log = logging::init(&args.log_level);

    let listen: Address = match args.listen.parse() {
        Ok(addr) => addr,
        Err(_) => {
            logging::error!(log, "invalid --listen address"; "value" => args.listen);
            return ExitCode::FAILURE;
        }
    };
    let seed: Address = match args.seed.parse() {
        Ok(addr) => addr,
        Err(_) => {
            logging::error!(log, "invalid --seed address"; "value" => args.seed);
            return ExitCode::FAILURE;
        }
    };

    let config = Config {
        listen,
        seed,
        read_buffer_bytes: args.read_buffer_bytes,
        write_buffer_bytes: args.write_buffer_bytes,
        staged_high_water: args.staged_high_water,
    };

    let mut proxy = match Proxy::new(config, log.clone()) {
        Ok(proxy) => proxy,
        Err(err) => {
            logging::error!(log, "failed to start"; "error" => err.to_string());
            return ExitCode::FAILURE;
        }
    };

    let term = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term)) {
        logging::error!(log, "failed to install SIGTERM handler"; "error" => err.to_string());
        return ExitCode::FAILURE;
    }

    while !term.load(Ordering::Relaxed) {
        if let Err(err) = proxy.tick(Some(Duration::from_millis(200))) {
            logging::error!(log, "reactor exited"; "error" => err.to_string());
            return ExitCode::FAILURE;
        }
    }

    logging::info!(log, "received SIGTERM, shutting down");
    ExitCode::SUCCESS
}
