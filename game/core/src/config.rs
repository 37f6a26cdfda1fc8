use lattice::server::ServerOpts;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 4321;

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub address: String,
    pub port: u16,
    pub ident: String,
    pub max_clients: usize,
    pub max_sessions: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Admission {
    pub per_ip_cap: u32,
    pub per_ip_session_cap: usize,
    pub per_uid_ip_cap: usize,
    pub strict_login: bool,
    pub ban_capacity: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Cache {
    pub dir: PathBuf,
    pub max_games: usize,
    pub ttl_days: u32,
    pub saves_per_second: u32,
    pub write_pool: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Timeouts {
    pub preauth_secs: u64,
    pub player_secs: u64,
    pub spectator_secs: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Log {
    pub level: String,
    pub file: Option<PathBuf>,
    pub rotate_size: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: Server,
    pub admission: Admission,
    pub cache: Cache,
    pub timeouts: Timeouts,
    pub log: Log,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server: Server {
                address: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
                ident: "parlor-1".to_string(),
                max_clients: 512,
                max_sessions: 128,
            },
            admission: Admission {
                per_ip_cap: 16,
                per_ip_session_cap: 8,
                per_uid_ip_cap: 2,
                strict_login: false,
                ban_capacity: 256,
            },
            cache: Cache {
                dir: PathBuf::from("games"),
                max_games: 1024,
                ttl_days: 14,
                saves_per_second: 20,
                write_pool: 32,
            },
            timeouts: Timeouts {
                preauth_secs: 30,
                player_secs: 3600,
                spectator_secs: 900,
            },
            log: Log {
                level: "info".to_string(),
                file: None,
                rotate_size: 10 * 1024 * 1024,
            },
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    /// Flattens the file layout into the engine's option struct.
    pub fn to_opts(&self) -> ServerOpts {
        ServerOpts {
            address: self.server.address.clone(),
            port: self.server.port,
            server_ident: self.server.ident.clone(),
            max_clients: self.server.max_clients,
            max_sessions: self.server.max_sessions,
            per_ip_cap: self.admission.per_ip_cap,
            per_ip_session_cap: self.admission.per_ip_session_cap,
            per_uid_ip_cap: self.admission.per_uid_ip_cap,
            strict_login: self.admission.strict_login,
            ban_capacity: self.admission.ban_capacity,
            cache_dir: self.cache.dir.clone(),
            max_games: self.cache.max_games,
            ttl_days: self.cache.ttl_days,
            saves_per_second: self.cache.saves_per_second,
            write_pool: self.cache.write_pool,
            preauth_timeout_secs: self.timeouts.preauth_secs,
            player_timeout_secs: self.timeouts.player_secs,
            spectator_timeout_secs: self.timeouts.spectator_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_toml_roundtrip() {
        let toml = serdeconv::to_toml_string(&ServerConfig::default()).unwrap();
        let parsed: ServerConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(parsed.server.port, DEFAULT_PORT);
        assert_eq!(parsed.server.max_clients, 512);
        assert_eq!(parsed.cache.max_games, 1024);
        assert_eq!(parsed.timeouts.preauth_secs, 30);
        assert_eq!(parsed.log.level, "info");
    }

    #[test]
    fn test_opts_flattening() {
        let mut config = ServerConfig::default();
        config.server.port = 9999;
        config.admission.strict_login = true;
        config.cache.write_pool = 4;

        let opts = config.to_opts();

        assert_eq!(opts.port, 9999);
        assert!(opts.strict_login);
        assert_eq!(opts.write_pool, 4);
    }
}
