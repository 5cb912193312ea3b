use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    process, time,
};

use bridge_ledger::{config::Config, BridgeLedger, VERSION};

enum Command {
    Init,
    Status,
    Reset,
}

fn usage() -> ! {
    eprintln!("Usage: ledgerctl [--conf <configuration file path>] <init|status|reset>");
    process::exit(1);
}

fn parse_args(args: Vec<String>) -> (Option<PathBuf>, Command) {
    let (conf_file, command) = match args.as_slice() {
        [_, command] => (None, command),
        [_, flag, path, command] if flag == "--conf" => (Some(PathBuf::from(path)), command),
        _ => {
            eprintln!("Unknown arguments '{:?}'.", args);
            usage();
        }
    };

    let command = match command.as_str() {
        "init" => Command::Init,
        "status" => Command::Status,
        "reset" => Command::Reset,
        _ => {
            eprintln!("Unknown command '{}'.", command);
            usage();
        }
    };

    (conf_file, command)
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or_else(|e| {
                        println!("Can't get time since epoch: '{}'. Using a dummy value.", e);
                        time::Duration::from_secs(0)
                    })
                    .as_secs(),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level);

    dispatcher.chain(std::io::stdout()).apply()?;

    Ok(())
}

fn main() {
    let args = env::args().collect();
    let (conf_file, command) = parse_args(args);

    let config = Config::from_file(conf_file).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        process::exit(1);
    });
    setup_logger(config.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });
    let ledger = BridgeLedger::from_config(config).unwrap_or_else(|e| {
        log::error!("Error creating global state: {}", e);
        process::exit(1);
    });
    log::debug!("ledgerctl {} using data directory {:?}", VERSION, ledger.data_dir);

    match command {
        Command::Init => {
            ledger.open().unwrap_or_else(|e| {
                log::error!("Error creating the stores: {}", e);
                process::exit(1);
            });
            log::info!("Stores ready in {:?}", ledger.data_dir);
        }
        Command::Status => {
            let handles = ledger.open_read_only().unwrap_or_else(|e| {
                log::error!("Error opening the stores: {}", e);
                process::exit(1);
            });
            let status = handles.status(&ledger.currency).unwrap_or_else(|e| {
                log::error!("Error reading the stores: {}", e);
                process::exit(1);
            });
            let json = serde_json::to_string_pretty(&status).unwrap_or_else(|e| {
                log::error!("Error serializing status: {}", e);
                process::exit(1);
            });
            println!("{}", json);
        }
        Command::Reset => {
            let mut handles = ledger.open().unwrap_or_else(|e| {
                log::error!("Error opening the stores: {}", e);
                process::exit(1);
            });
            let dropped = handles.reset_all().unwrap_or_else(|e| {
                log::error!("Error resetting the stores: {}", e);
                process::exit(1);
            });
            println!("{}", serde_json::json!({ "dropped": dropped }));
        }
    }

    io::stdout().flush().unwrap_or_else(|e| {
        eprintln!("Error flushing stdout: {}", e);
        process::exit(1);
    });
}
