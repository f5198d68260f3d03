//! Command-line argument parsing for the server binary.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Meridian replication server.
///
/// CLI values override settings loaded from `server.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "meridian-server", about = "Meridian replication server")]
pub struct CliArgs {
    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Name of the save to load and write.
    #[arg(long)]
    pub save: Option<String>,

    /// Prefab used for player representations.
    #[arg(long)]
    pub player_prefab: Option<String>,

    /// Prefab table file.
    #[arg(long)]
    pub prefab_data: Option<PathBuf>,

    /// Directory holding save files.
    #[arg(long)]
    pub saves_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Never time clients out (the host may be paused in a debugger).
    #[arg(long)]
    pub dev_host: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(ref save) = args.save {
            self.world.save_name = save.clone();
        }
        if let Some(ref prefab) = args.player_prefab {
            self.world.player_prefab = prefab.clone();
        }
        if let Some(ref path) = args.prefab_data {
            self.world.prefab_data = Some(path.clone());
        }
        if let Some(ref dir) = args.saves_dir {
            self.world.saves_dir = dir.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if args.dev_host {
            self.session.dev_host = true;
        }
    }
}
