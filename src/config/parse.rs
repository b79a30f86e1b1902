use super::types::*;
use crate::config::{expand_env_vars, expand_tilde};
use regex::Regex;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Smallest datagram budget that still leaves room for the envelope fields
pub const MIN_DATAGRAM_BYTES: usize = 128;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config = parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;

    Ok(config)
}

/// Parse and validate a config from a YAML string
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=/path/to/directory\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables (e.g., export LOG_DIR=/var/log)\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Expands tilde (~) in every path-like field
fn expand_paths(config: &mut Config) {
    for pattern in config
        .inputs
        .paths
        .iter_mut()
        .chain(config.inputs.exclude.iter_mut())
    {
        *pattern = expand_tilde(Path::new(pattern.as_str()))
            .to_string_lossy()
            .into_owned();
    }

    config.registry.path = expand_tilde(&config.registry.path);

    if let Some(marker) = config.shutdown.running_marker.as_mut() {
        *marker = expand_tilde(marker);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_inputs(&config.inputs, &mut errors);

    if config.registry.path.as_os_str().is_empty() {
        errors.push("registry.path cannot be empty".to_string());
    }
    if config.registry.flush_interval.is_zero() {
        errors.push("registry.flush_interval must be greater than 0".to_string());
    }

    if config.spooler.capacity == 0 {
        errors.push("spooler.capacity must be greater than 0".to_string());
    }
    if config.spooler.batch_size == 0 {
        errors.push("spooler.batch_size must be greater than 0".to_string());
    }

    validate_output(&config.output, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_inputs(inputs: &InputConfig, errors: &mut Vec<String>) {
    if inputs.paths.is_empty() {
        errors.push("inputs.paths must contain at least one glob pattern".to_string());
    }

    for (i, pattern) in inputs.paths.iter().enumerate() {
        validate_glob(&format!("inputs.paths[{}]", i), pattern, errors);
    }
    for (i, pattern) in inputs.exclude.iter().enumerate() {
        validate_glob(&format!("inputs.exclude[{}]", i), pattern, errors);
    }

    if inputs.max_line_bytes == 0 {
        errors.push("inputs.max_line_bytes must be greater than 0".to_string());
    }
    if inputs.scan_interval.is_zero() {
        errors.push("inputs.scan_interval must be greater than 0".to_string());
    }
    if inputs.eof_poll_interval.is_zero() {
        errors.push("inputs.eof_poll_interval must be greater than 0".to_string());
    }
}

fn validate_glob(context: &str, pattern: &str, errors: &mut Vec<String>) {
    if pattern.trim().is_empty() {
        errors.push(format!("{}: glob pattern cannot be empty", context));
        return;
    }
    if let Err(e) = glob::Pattern::new(pattern) {
        errors.push(format!("{}: invalid glob '{}': {}", context, pattern, e));
    }
}

fn validate_output(output: &OutputConfig, errors: &mut Vec<String>) {
    if output.host.trim().is_empty() {
        errors.push("output.host cannot be empty".to_string());
    }
    if output.port == 0 {
        errors.push("output.port must be non-zero".to_string());
    }
    if output.log_type.contains(':') {
        errors.push(format!(
            "output.log_type '{}' cannot contain ':'",
            output.log_type
        ));
    }
    if output.max_datagram_bytes < MIN_DATAGRAM_BYTES
        || output.max_datagram_bytes > MAX_UDP_PAYLOAD
    {
        errors.push(format!(
            "output.max_datagram_bytes must be between {} and {}, got {}",
            MIN_DATAGRAM_BYTES, MAX_UDP_PAYLOAD, output.max_datagram_bytes
        ));
    }
    if output.retry.initial_backoff > output.retry.max_backoff {
        errors.push(
            "output.retry.initial_backoff cannot exceed output.retry.max_backoff".to_string(),
        );
    }
}
