use flowscope_core::config::{default_config, load_config};
use flowscope_core::runtime::Engine;
use flowscope_core::server;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "flowscoped", about = "Live network-traffic analysis service")]
struct Args {
    /// Runtime configuration file; defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Override the subscriber listener address.
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,
    /// Replay a capture file on startup instead of waiting for commands.
    #[arg(short, long, value_name = "FILE")]
    replay: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path),
        None => default_config(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let engine = Engine::new(config);

    {
        let engine = engine.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            engine.stop_capture();
            std::process::exit(0);
        })?;
    }

    if let Some(path) = &args.replay {
        engine.load_file(&path.to_string_lossy())?;
    }

    let bind = engine.config().server.bind.clone();
    server::run(engine, &bind)?;
    Ok(())
}
