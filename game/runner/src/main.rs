use clap::{App, Arg};
use ember::logging;
use parlorcore::config::ServerConfig;
use std::process;

fn main() {
    let matches = App::new("parlorrunner")
        .version("0.1.0")
        .about("Multiplayer game-room server")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML configuration")
                .takes_value(true),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Configuration error: {}", err);
                process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let log = match logging::init(
        &config.log.level,
        config.log.file.as_deref(),
        config.log.rotate_size,
    ) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("Logging setup failed: {}", err);
            process::exit(1);
        }
    };

    let mut server = match parlorcore::init_server(&config, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::crit!(log, "Startup failed"; "error" => %err);
            process::exit(1);
        }
    };

    if let Err(err) = server.run() {
        logging::crit!(log, "Event loop failed"; "error" => %err);
        process::exit(1);
    }

    logging::info!(log, "Graceful shutdown complete");
}
