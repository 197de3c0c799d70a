use std::net::IpAddr;

use ps4adapter::{discovery, DebugError, DebuggerConfig, Ps4Debugger};

async fn run() -> ps4adapter::Result<()> {
    let mut args = std::env::args().skip(1);

    let addr: IpAddr = match args.next() {
        Some(ip) => match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                log::error!("Not an IP address: {ip}");
                std::process::exit(2);
            }
        },
        None => {
            log::info!("No console address given, searching the local network...");
            discovery::find_playstation(discovery::DISCOVERY_TIMEOUT).await?
        }
    };

    let config = match args.next() {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(text) => DebuggerConfig::from_json(&text)?,
            Err(e) => {
                log::error!("Cannot read config {path}: {e}");
                std::process::exit(2);
            }
        },
        None => DebuggerConfig::default(),
    };

    let mut ps4 = Ps4Debugger::with_config(addr, config);
    ps4.connect().await?;

    log::info!("Library version: {}", ps4.get_library_debug_version());
    log::info!("Console version: {}", ps4.get_console_debug_version().await?);

    let processes = ps4.get_process_list().await?;
    match serde_json::to_string_pretty(&processes) {
        Ok(json) => println!("{json}"),
        Err(e) => log::error!("Could not serialize the process list: {e}"),
    }

    ps4.close().await
}

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("ps4adapter", log::LevelFilter::Debug)
        .init()
        .unwrap();

    log::info!("ps4dbg starting...");

    if let Err(e) = run().await {
        log::error!("{e}");
        let code = match e {
            DebugError::Usage(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
