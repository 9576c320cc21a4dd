use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::bridge::client::parse_layers;
use crate::bridge::converter::{layer_to_node, LayerDescriptor};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

#[derive(Parser, Debug)]
#[command(name = "conectify-bridge")]
#[command(version)]
#[command(about = "Relay and supervisor bridging After Effects and DaVinci Resolve")]
pub struct Args {
    /// Path to the TOML configuration file (defaults are used if it does not exist)
    #[arg(long, short, global = true, default_value = "conectify.toml")]
    pub config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the relay, connect both applications and keep them healthy until Ctrl+C
    Run,
    /// Start only the relay hub
    Relay,
    /// Connect both applications once and print the status as JSON
    Status,
    /// Connect both applications and push one layer from After Effects to Resolve
    Sync {
        /// Layer name on the producer side
        name: String,
    },
    /// Translate layer JSON from a file into node JSON without connecting anywhere
    Translate {
        /// A layer object, an array of layers, or a `{"layers": [...]}` reply
        file: PathBuf,
    },
    /// Check the configured host application paths
    CheckPaths,
}

/// Load the config file, apply command-line overrides and validate.
pub fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load_from_file(&args.config)?;
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Translate the layer JSON in `path`. A single layer yields a single node,
/// anything list-shaped yields an array.
pub fn translate_file(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Io(format!("{}: {e}", path.display())))?;
    let value: Value = serde_json::from_str(&text)?;

    let single = value.is_object() && value.get("layers").is_none();
    if single {
        let layer: LayerDescriptor = serde_json::from_value(value)?;
        return Ok(serde_json::to_value(layer_to_node(&layer))?);
    }
    let nodes: Vec<_> = parse_layers(value)?.iter().map(layer_to_node).collect();
    Ok(serde_json::to_value(nodes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_parse_subcommands() {
        let args = Args::parse_from(["conectify-bridge", "sync", "Title"]);
        assert_eq!(args.command, Command::Sync { name: "Title".into() });
        assert_eq!(args.config, PathBuf::from("conectify.toml"));
        assert!(args.log_level.is_none());

        let args = Args::parse_from(["conectify-bridge", "check-paths"]);
        assert_eq!(args.command, Command::CheckPaths);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from([
            "conectify-bridge",
            "run",
            "--config",
            "/etc/conectify.toml",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.command, Command::Run);
        assert_eq!(args.config, PathBuf::from("/etc/conectify.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Args::try_parse_from(["conectify-bridge"]).is_err());
    }

    #[test]
    fn test_load_config_applies_log_level_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "log_level = \"warn\"\n").unwrap();
        let args = Args::parse_from([
            "conectify-bridge",
            "status",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "trace",
        ]);
        assert_eq!(load_config(&args).unwrap().log_level, "trace");
    }

    #[test]
    fn test_load_config_rejects_invalid_override() {
        let args = Args::parse_from(["conectify-bridge", "status", "--log-level", "loud"]);
        assert_eq!(load_config(&args).unwrap_err().kind(), "config");
    }

    #[test]
    fn test_translate_file_single_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let single = dir.path().join("one.json");
        std::fs::write(&single, json!({"name": "BG", "type": "solid"}).to_string()).unwrap();
        let out = translate_file(&single).unwrap();
        assert_eq!(out["nodeType"], "Background");

        let list = dir.path().join("many.json");
        std::fs::write(
            &list,
            json!({"layers": [{"name": "T", "type": "text"}, {"name": "V", "type": "video"}]}).to_string(),
        )
        .unwrap();
        let out = translate_file(&list).unwrap();
        assert_eq!(out[0]["nodeType"], "Text+");
        assert_eq!(out[1]["nodeType"], "MediaIn");
    }
}
