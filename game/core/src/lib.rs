pub mod config;

use crate::config::ServerConfig;
use ember::logging::{self, Logger};
use lattice::server::Server;
use std::io;

/// Builds the room server from a loaded configuration.
pub fn init_server(config: &ServerConfig, log: &Logger) -> io::Result<Server> {
    logging::info!(log, "creating *** Parlor server *** ";
                   "ident" => &config.server.ident);

    Server::new(config.to_opts(), log.clone())
}
