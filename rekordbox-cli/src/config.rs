//! CLI configuration

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rekordbox_core::ParseOptions;

#[derive(Debug, Clone)]
pub struct Config {
    /// Reader thresholds, from `--options` or defaults
    pub options: ParseOptions,
    /// Where to write the full results as JSON
    pub json_out: Option<PathBuf>,
    /// Where to write the corruption log as JSON
    pub log_out: Option<PathBuf>,
}

impl Config {
    pub fn new(options_file: Option<&Path>, json_out: Option<PathBuf>, log_out: Option<PathBuf>) -> Result<Self> {
        let options = match options_file {
            Some(path) => load_options(path)?,
            None => ParseOptions::default(),
        };
        Ok(Self {
            options,
            json_out,
            log_out,
        })
    }
}

/// Read reader options from a JSON file. Missing keys keep their defaults.
pub fn load_options(path: &Path) -> Result<ParseOptions> {
    let text = fs::read_to_string(path).with_context(|| format!("reading options file {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parsing options file {:?}", path))
}
