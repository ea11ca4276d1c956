//! Environment configuration.
//!
//! The client needs an endpoint and a theme. A missing or unusable endpoint is
//! not fatal: the app falls back to the configuration prompt.

use std::env;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const ENDPOINT_ENV: &str = "OPENCODE_VIEW_ENDPOINT";
pub const THEME_ENV: &str = "OPENCODE_VIEW_THEME";

/// Address suggested by the configuration prompt when none is set.
pub const DEFAULT_ENDPOINT_HINT: &str = "http://localhost:9999";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown theme '{0}'; expected one of light, dark, cupcake, dracula, nord, sunset")]
    UnknownTheme(String),

    #[error("invalid endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Theme {
    Light,
    #[default]
    Dark,
    Cupcake,
    Dracula,
    Nord,
    Sunset,
}

pub const AVAILABLE_THEMES: [Theme; 6] = [
    Theme::Light,
    Theme::Dark,
    Theme::Cupcake,
    Theme::Dracula,
    Theme::Nord,
    Theme::Sunset,
];

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
            Self::Cupcake => "cupcake",
            Self::Dracula => "dracula",
            Self::Nord => "nord",
            Self::Sunset => "sunset",
        }
    }

    /// Display label with the first letter capitalized.
    pub fn label(&self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    pub fn is_dark(&self) -> bool {
        matches!(self, Self::Dark | Self::Dracula | Self::Sunset)
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        AVAILABLE_THEMES
            .into_iter()
            .find(|theme| theme.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownTheme(wanted.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub endpoint: Option<String>,
    pub theme: Theme,
}

impl ClientConfig {
    pub fn new(endpoint: Option<String>, theme: Theme) -> Self {
        Self { endpoint, theme }
    }

    pub fn from_env() -> Self {
        let endpoint = env_string_opt(ENDPOINT_ENV).and_then(|raw| match validate_endpoint(&raw) {
            Ok(endpoint) => Some(endpoint),
            Err(error) => {
                tracing::warn!(%error, "ignoring configured endpoint");
                None
            }
        });
        let theme = env_string_opt(THEME_ENV)
            .map(|raw| {
                raw.parse::<Theme>().unwrap_or_else(|error| {
                    tracing::warn!(%error, "falling back to default theme");
                    Theme::default()
                })
            })
            .unwrap_or_default();

        Self { endpoint, theme }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }
}

/// Trim and check an endpoint; the returned value has no trailing slash.
pub fn validate_endpoint(raw: &str) -> Result<String, ConfigError> {
    opencode_api::normalize_base_url(raw).map_err(|error| ConfigError::InvalidEndpoint {
        value: raw.trim().to_string(),
        reason: error.to_string(),
    })
}

pub(crate) fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}
