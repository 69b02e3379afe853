//! Interactive SSH/SFTP honeypot: accepts any (or credential-list) login,
//! serves a believable shell and SFTP endpoint over a zip-backed virtual
//! filesystem, and records everything for forensic review.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub mod config;
pub mod os;
pub mod record;
pub mod server;

use config::Config;
use nectar_vfs::{OverlayFs, ZipFs};
use os::{AccountStore, CommandRegistry};
use server::{HoneypotServer, ServerState};

/// Bring the whole daemon up from a config directory and serve forever.
/// Only init-time problems (bad config, missing image, unbindable port,
/// unparseable host key) can make this return.
pub async fn run(config_dir: &Path) -> Result<()> {
    let config = Arc::new(Config::load(config_dir)?);

    let image = config.resolve(&config.virtualfs.image_file);
    let lower = Arc::new(
        ZipFs::open_image(&image)
            .with_context(|| format!("failed to load filesystem image {}", image.display()))?,
    );
    let scratch = config.resolve(&config.virtualfs.saved_file_dir);
    let fs = Arc::new(OverlayFs::new(lower, &scratch).context("failed to set up scratch layer")?);

    let passwd = config.resolve(&config.virtualfs.uid_mapping_file);
    let group = config.resolve(&config.virtualfs.gid_mapping_file);
    let accounts = match AccountStore::load(&passwd, &group) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "could not load account mapping files, continuing without");
            Arc::new(AccountStore::default())
        }
    };

    let mut registry = CommandRegistry::with_builtins();
    registry.load_fake_commands(&config.resolve(&config.server.command_list));
    registry.load_canned_outputs(&config.resolve(&config.server.command_output_dir));
    let registry = Arc::new(registry);

    let banner = std::fs::read_to_string(config.resolve(&config.server.banner)).ok();
    if !config.elastic.end_point.is_empty() {
        warn!("elastic log hook configured but not compiled in, ignoring");
    }

    let state = Arc::new(ServerState {
        config: Arc::clone(&config),
        fs,
        accounts,
        registry,
        banner,
    });
    let honeypot = HoneypotServer::new(state)?;

    tokio::select! {
        result = honeypot.listen() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
