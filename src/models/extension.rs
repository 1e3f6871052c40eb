//! Protocol extensions the server advertises and enforces.

use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    Creation,
    CreationWithUpload,
    CreationDeferLength,
    Termination,
    Checksum,
    Expiration,
}

impl Extension {
    pub const ALL: [Extension; 6] = [
        Extension::Creation,
        Extension::CreationWithUpload,
        Extension::CreationDeferLength,
        Extension::Termination,
        Extension::Checksum,
        Extension::Expiration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::Creation => "creation",
            Extension::CreationWithUpload => "creation-with-upload",
            Extension::CreationDeferLength => "creation-defer-length",
            Extension::Termination => "termination",
            Extension::Checksum => "checksum",
            Extension::Expiration => "expiration",
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Extension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Extension::ALL
            .into_iter()
            .find(|ext| ext.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tus extension `{}`", s))
    }
}

/// Fixed set of enabled extensions, fixed for the lifetime of the server.
///
/// Order is preserved so `Tus-Extension` is rendered the same way every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSet {
    enabled: Vec<Extension>,
}

impl ExtensionSet {
    pub fn empty() -> Self {
        Self {
            enabled: Vec::new(),
        }
    }

    pub fn with(mut self, extension: Extension) -> Self {
        if !self.enabled.contains(&extension) {
            self.enabled.push(extension);
        }
        self
    }

    pub fn without(mut self, extension: Extension) -> Self {
        self.enabled.retain(|ext| *ext != extension);
        self
    }

    pub fn supports(&self, extension: Extension) -> bool {
        self.enabled.contains(&extension)
    }

    pub fn iter(&self) -> impl Iterator<Item = Extension> + '_ {
        self.enabled.iter().copied()
    }

    /// Value for the `Tus-Extension` header.
    pub fn header_value(&self) -> String {
        self.enabled
            .iter()
            .map(Extension::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for ExtensionSet {
    /// Everything except expiration, which needs a retention period.
    fn default() -> Self {
        Self::empty()
            .with(Extension::Creation)
            .with(Extension::CreationWithUpload)
            .with(Extension::CreationDeferLength)
            .with(Extension::Termination)
            .with(Extension::Checksum)
    }
}
