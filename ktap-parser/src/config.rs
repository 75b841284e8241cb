// Copyright (c) The ktap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loading `ktap-report.toml`.

use crate::{
    errors::ConfigError,
    line_buffer::DEFAULT_MAX_LINE_LEN,
    parser::{ParseMode, ParserOptions},
    stream::{DEFAULT_READ_BUFFER_SIZE, StreamSource},
};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::{collections::BTreeSet, io};
use tracing::{debug, warn};

/// The name of the configuration file looked up in the current directory.
pub const CONFIG_FILE_NAME: &str = "ktap-report.toml";

/// Special value for `--config` and `KTAP_REPORT_CONFIG` that skips loading the configuration
/// file.
pub const CONFIG_NONE: &str = "none";

/// The report name used when none is configured.
pub const DEFAULT_REPORT_NAME: &str = "ktap";

/// Specifies where to load configuration from.
#[derive(Clone, Copy, Debug)]
pub enum ConfigLocation<'a> {
    /// Load `ktap-report.toml` from the current directory, if it exists.
    Default,

    /// Skip configuration loading entirely, using only built-in defaults.
    Isolated,

    /// Load configuration from an explicit path.
    ///
    /// Returns an error if the file does not exist.
    Explicit(&'a Utf8Path),
}

impl<'a> ConfigLocation<'a> {
    /// Creates a config location from a CLI or environment variable value.
    ///
    /// Returns `Default` if `None`, `Isolated` if `"none"`, otherwise `Explicit` with the path.
    pub fn from_cli_or_env(s: Option<&'a str>) -> Self {
        match s {
            None => Self::Default,
            Some(s) if s == CONFIG_NONE => Self::Isolated,
            Some(s) => Self::Explicit(Utf8Path::new(s)),
        }
    }
}

/// Resolved configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KtapConfig {
    /// Options for the parser.
    pub parser: ParserOptions,

    /// Options for reading streams.
    pub stream: StreamConfig,

    /// Options for JUnit reports.
    pub junit: JunitConfig,
}

/// Stream reading configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamConfig {
    /// The framing of the source.
    pub source: StreamSource,

    /// The size of a single read from the source.
    pub read_buffer_size: usize,
}

/// JUnit report configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JunitConfig {
    /// Where to write the report, if anywhere.
    pub path: Option<Utf8PathBuf>,

    /// The name of the report.
    pub report_name: String,
}

impl Default for KtapConfig {
    fn default() -> Self {
        DeserializedConfig::default().resolve()
    }
}

impl KtapConfig {
    /// Loads configuration from `location`.
    pub fn from_location(location: ConfigLocation<'_>) -> Result<Self, ConfigError> {
        Self::from_location_with_warnings(location, &mut DefaultConfigWarnings)
    }

    fn from_location_with_warnings(
        location: ConfigLocation<'_>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigError> {
        let config = match location {
            ConfigLocation::Isolated => {
                debug!("config: skipping (isolated)");
                None
            }
            ConfigLocation::Explicit(path) => {
                debug!("config: loading from explicit path {path}");
                match DeserializedConfig::from_path_with_warnings(path, warnings)? {
                    Some(config) => Some(config),
                    None => {
                        return Err(ConfigError::Read {
                            path: path.to_owned(),
                            error: io::Error::from(io::ErrorKind::NotFound),
                        });
                    }
                }
            }
            ConfigLocation::Default => DeserializedConfig::from_path_with_warnings(
                Utf8Path::new(CONFIG_FILE_NAME),
                warnings,
            )?,
        };

        Ok(config.unwrap_or_default().resolve())
    }
}

trait ConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>);
}

struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>) {
        let mut unknown_str = String::new();
        if unknown.len() == 1 {
            unknown_str.push_str("key: ");
            unknown_str.extend(unknown.iter().map(String::as_str));
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push_str("\n  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!("in config file {config_file}, ignoring unknown configuration {unknown_str}");
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedConfig {
    #[serde(default)]
    parser: DeserializedParserConfig,

    #[serde(default)]
    stream: DeserializedStreamConfig,

    #[serde(default)]
    junit: DeserializedJunitConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedParserConfig {
    #[serde(default)]
    mode: Option<ParseMode>,

    /// 0 disables the limit.
    #[serde(default)]
    max_line_length: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedStreamConfig {
    #[serde(default)]
    source: Option<StreamSource>,

    #[serde(default)]
    read_buffer_size: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedJunitConfig {
    #[serde(default)]
    path: Option<Utf8PathBuf>,

    #[serde(default)]
    report_name: Option<String>,
}

impl DeserializedConfig {
    fn from_path_with_warnings(
        path: &Utf8Path,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Option<Self>, ConfigError> {
        debug!("config: attempting to load from {path}");
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("config: file does not exist at {path}");
                return Ok(None);
            }
            Err(error) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };

        let (config, unknown) =
            Self::deserialize_toml(&contents).map_err(|error| ConfigError::Parse {
                path: path.to_owned(),
                error,
            })?;
        if !unknown.is_empty() {
            warnings.unknown_config_keys(path, &unknown);
        }

        debug!("config: loaded successfully from {path}");
        Ok(Some(config))
    }

    fn deserialize_toml(contents: &str) -> Result<(Self, BTreeSet<String>), toml::de::Error> {
        let deserializer = toml::Deserializer::parse(contents)?;
        let mut unknown = BTreeSet::new();
        let config: Self = serde_ignored::deserialize(deserializer, |path| {
            unknown.insert(path.to_string());
        })?;
        Ok((config, unknown))
    }

    fn resolve(self) -> KtapConfig {
        let max_line_len = match self.parser.max_line_length {
            Some(0) => None,
            Some(len) => Some(len),
            None => Some(DEFAULT_MAX_LINE_LEN),
        };

        KtapConfig {
            parser: ParserOptions {
                mode: self.parser.mode.unwrap_or_default(),
                max_line_len,
            },
            stream: StreamConfig {
                source: self.stream.source.unwrap_or_default(),
                read_buffer_size: self
                    .stream
                    .read_buffer_size
                    .filter(|&size| size > 0)
                    .unwrap_or(DEFAULT_READ_BUFFER_SIZE),
            },
            junit: JunitConfig {
                path: self.junit.path,
                report_name: self
                    .junit
                    .report_name
                    .unwrap_or_else(|| DEFAULT_REPORT_NAME.to_owned()),
            },
        }
    }
}
