use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variables with this prefix override file values;
/// `SSHSYRUP_SERVER_PORT=2223` maps to `server.port`.
const ENV_PREFIX: &str = "SSHSYRUP_";

fn default_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    2222
}
fn default_ident() -> String {
    "SSH-2.0-OpenSSH_6.8p1".to_string()
}
fn default_hostname() -> String {
    "spr1139".to_string()
}
fn default_max_tries() -> u32 {
    3
}
fn default_max_connections() -> usize {
    10
}
fn default_max_conn_per_host() -> usize {
    2
}
fn default_timeout() -> u64 {
    600 // 10 min
}
fn default_true() -> bool {
    true
}
fn default_command_list() -> String {
    "commands.txt".to_string()
}
fn default_command_output_dir() -> String {
    "cmdOutput".to_string()
}
fn default_banner() -> String {
    "banner.txt".to_string()
}
fn default_private_key() -> String {
    "id_rsa".to_string()
}
fn default_session_log_fmt() -> String {
    "asciinema".to_string()
}
fn default_port_redirection() -> String {
    "disable".to_string()
}
fn default_image_file() -> String {
    "filesystem.zip".to_string()
}
fn default_uid_mapping_file() -> String {
    "passwd".to_string()
}
fn default_gid_mapping_file() -> String {
    "group".to_string()
}
fn default_saved_file_dir() -> String {
    "tempdir".to_string()
}
fn default_api_endpoint() -> String {
    "https://asciinema.org".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub addr: String,
    pub port: u16,
    pub ident: String,
    pub hostname: String,
    pub max_tries: u32,
    pub max_connections: usize,
    pub max_conn_per_host: usize,
    /// Idle read deadline, seconds.
    pub timeout: u64,
    /// Token-bucket throughput cap, bytes/sec. 0 disables throttling.
    pub speed: u64,
    /// Simulated command latency, milliseconds. 0 disables the delay.
    pub process_delay: u64,
    pub allow_random_user: bool,
    pub command_list: String,
    pub command_output_dir: String,
    pub banner: String,
    pub private_key: String,
    pub session_log_fmt: String,
    pub port_redirection: String,
    /// SCP upload size cap, bytes. 0 disables the cap.
    pub receive_file_size_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: default_addr(),
            port: default_port(),
            ident: default_ident(),
            hostname: default_hostname(),
            max_tries: default_max_tries(),
            max_connections: default_max_connections(),
            max_conn_per_host: default_max_conn_per_host(),
            timeout: default_timeout(),
            speed: 0,
            process_delay: 0,
            allow_random_user: default_true(),
            command_list: default_command_list(),
            command_output_dir: default_command_output_dir(),
            banner: default_banner(),
            private_key: default_private_key(),
            session_log_fmt: default_session_log_fmt(),
            port_redirection: default_port_redirection(),
            receive_file_size_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualFsConfig {
    pub image_file: String,
    pub uid_mapping_file: String,
    pub gid_mapping_file: String,
    pub saved_file_dir: String,
}

impl Default for VirtualFsConfig {
    fn default() -> Self {
        VirtualFsConfig {
            image_file: default_image_file(),
            uid_mapping_file: default_uid_mapping_file(),
            gid_mapping_file: default_gid_mapping_file(),
            saved_file_dir: default_saved_file_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AsciinemaConfig {
    pub api_endpoint: String,
    pub api_key: String,
}

impl Default for AsciinemaConfig {
    fn default() -> Self {
        AsciinemaConfig {
            api_endpoint: default_api_endpoint(),
            api_key: String::new(),
        }
    }
}

/// Parsed but unused: the Elasticsearch hook is an external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElasticConfig {
    pub end_point: String,
    pub index: String,
    pub pipeline: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub virtualfs: VirtualFsConfig,
    pub asciinema: AsciinemaConfig,
    pub elastic: ElasticConfig,
    /// Directory the config was loaded from; relative file options resolve
    /// against it.
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Config {
    /// Merge precedence: defaults < `config.json` < environment.
    /// A missing file is only a warning; an unparseable one is fatal.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("config.json");
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<Config>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };
        config.config_dir = config_dir.to_path_buf();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Resolve a file option against the config directory.
    pub fn resolve(&self, file: &str) -> PathBuf {
        let p = Path::new(file);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.config_dir.join(p)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }

    pub fn process_delay(&self) -> Duration {
        Duration::from_millis(self.server.process_delay)
    }

    fn apply_env_overrides<F: Fn(&str) -> Option<String>>(&mut self, get: F) {
        fn set_str(get: &impl Fn(&str) -> Option<String>, key: &str, field: &mut String) {
            if let Some(v) = get(&format!("{ENV_PREFIX}{key}")) {
                *field = v;
            }
        }
        fn set_parse<T: std::str::FromStr>(
            get: &impl Fn(&str) -> Option<String>,
            key: &str,
            field: &mut T,
        ) {
            if let Some(v) = get(&format!("{ENV_PREFIX}{key}")) {
                match v.parse() {
                    Ok(parsed) => *field = parsed,
                    Err(_) => warn!(key, value = %v, "ignoring unparseable environment override"),
                }
            }
        }

        set_str(&get, "SERVER_ADDR", &mut self.server.addr);
        set_parse(&get, "SERVER_PORT", &mut self.server.port);
        set_str(&get, "SERVER_IDENT", &mut self.server.ident);
        set_str(&get, "SERVER_HOSTNAME", &mut self.server.hostname);
        set_parse(&get, "SERVER_MAXTRIES", &mut self.server.max_tries);
        set_parse(&get, "SERVER_MAXCONNECTIONS", &mut self.server.max_connections);
        set_parse(&get, "SERVER_MAXCONNPERHOST", &mut self.server.max_conn_per_host);
        set_parse(&get, "SERVER_TIMEOUT", &mut self.server.timeout);
        set_parse(&get, "SERVER_SPEED", &mut self.server.speed);
        set_parse(&get, "SERVER_PROCESSDELAY", &mut self.server.process_delay);
        set_parse(&get, "SERVER_ALLOWRANDOMUSER", &mut self.server.allow_random_user);
        set_str(&get, "SERVER_COMMANDLIST", &mut self.server.command_list);
        set_str(&get, "SERVER_COMMANDOUTPUTDIR", &mut self.server.command_output_dir);
        set_str(&get, "SERVER_BANNER", &mut self.server.banner);
        set_str(&get, "SERVER_PRIVATEKEY", &mut self.server.private_key);
        set_str(&get, "SERVER_SESSIONLOGFMT", &mut self.server.session_log_fmt);
        set_str(&get, "SERVER_PORTREDIRECTION", &mut self.server.port_redirection);
        set_parse(
            &get,
            "SERVER_RECEIVEFILESIZELIMIT",
            &mut self.server.receive_file_size_limit,
        );
        set_str(&get, "VIRTUALFS_IMAGEFILE", &mut self.virtualfs.image_file);
        set_str(&get, "VIRTUALFS_UIDMAPPINGFILE", &mut self.virtualfs.uid_mapping_file);
        set_str(&get, "VIRTUALFS_GIDMAPPINGFILE", &mut self.virtualfs.gid_mapping_file);
        set_str(&get, "VIRTUALFS_SAVEDFILEDIR", &mut self.virtualfs.saved_file_dir);
        set_str(&get, "ASCIINEMA_APIENDPOINT", &mut self.asciinema.api_endpoint);
        set_str(&get, "ASCIINEMA_APIKEY", &mut self.asciinema.api_key);
        set_str(&get, "ELASTIC_ENDPOINT", &mut self.elastic.end_point);
        set_str(&get, "ELASTIC_INDEX", &mut self.elastic.index);
        set_str(&get, "ELASTIC_PIPELINE", &mut self.elastic.pipeline);
    }
}
