use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use vanillavae::config::Config;
use vanillavae::error::{Result, VaeError};

/// Initialise `env_logger`, defaulting to the `info` level when `RUST_LOG`
/// is unset.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Command line of the binaries: an optional `--config FILE` followed by
/// `--key value` pairs.
#[derive(Debug, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub options: Vec<(String, String)>,
}

pub fn parse_cli<I>(mut args: I) -> Result<CliArgs>
where
    I: Iterator<Item = String>,
{
    let mut cli = CliArgs::default();
    while let Some(arg) = args.next() {
        let Some(key) = arg.strip_prefix("--") else {
            return Err(VaeError::Config(format!("unexpected argument `{arg}`")));
        };
        let value = args
            .next()
            .ok_or_else(|| VaeError::Config(format!("missing value for `--{key}`")))?;
        if key == "config" {
            cli.config = Some(PathBuf::from(value));
        } else {
            cli.options.push((key.to_string(), value));
        }
    }
    Ok(cli)
}

/// Build the run configuration from the process arguments.
///
/// Options named in `local` are returned to the caller instead of being
/// applied to the [`Config`].
pub fn load_config(local: &[&str]) -> Result<(Config, HashMap<String, String>)> {
    let cli = parse_cli(env::args().skip(1))?;
    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let mut rest = HashMap::new();
    for (key, value) in cli.options {
        if local.contains(&key.as_str()) {
            rest.insert(key, value);
        } else {
            config.apply_override(&key, &value)?;
        }
    }
    config.validate()?;
    Ok((config, rest))
}
