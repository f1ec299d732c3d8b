//! Memory layout tags for tensors.
//!
//! A [`Format`] records the logical axis order of an image-like tensor and
//! decides how its raw storage is laid out. `Default` and `Nchw` keep the
//! storage in logical order, `Nhwc` keeps it channel-last.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid format '{0}', expected one of: default, nchw, nhwc")]
    InvalidFormat(String),
}

/// Layout tag of a tensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Format {
    /// No explicit layout; storage follows the logical axis order.
    #[default]
    Default,
    /// Batch, channel, height, width.
    Nchw,
    /// Batch, height, width, channel.
    Nhwc,
}

impl Format {
    /// All supported formats.
    pub const ALL: [Format; 3] = [Format::Default, Format::Nchw, Format::Nhwc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Default => "default",
            Format::Nchw => "nchw",
            Format::Nhwc => "nhwc",
        }
    }

    /// Whether the raw storage is channel-last.
    pub fn is_channel_last(&self) -> bool {
        matches!(self, Format::Nhwc)
    }

    /// Permutation from logical axes to storage axes for a tensor of rank `ndim`.
    ///
    /// Returns `None` when storage and logical order coincide, which is the case
    /// for every non channel-last format and for ranks other than 4 and 5.
    /// Rank 5 covers grouped convolution weights `[G, O, I, H, W]`.
    pub fn storage_permutation(&self, ndim: usize) -> Option<Vec<usize>> {
        if !self.is_channel_last() {
            return None;
        }
        match ndim {
            4 => Some(vec![0, 2, 3, 1]),
            5 => Some(vec![0, 1, 3, 4, 2]),
            _ => None,
        }
    }

    /// Inverse of [`Format::storage_permutation`]: storage axes back to logical axes.
    pub fn logical_permutation(&self, ndim: usize) -> Option<Vec<usize>> {
        self.storage_permutation(ndim).map(|perm| invert(&perm))
    }
}

fn invert(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Format::Default),
            "nchw" => Ok(Format::Nchw),
            "nhwc" => Ok(Format::Nhwc),
            _ => Err(FormatError::InvalidFormat(s.to_string())),
        }
    }
}

/// Anything that names a format: a [`Format`] itself or its identifier.
pub trait IntoFormat {
    fn into_format(self) -> Result<Format, FormatError>;
}

impl IntoFormat for Format {
    fn into_format(self) -> Result<Format, FormatError> {
        Ok(self)
    }
}

impl IntoFormat for &str {
    fn into_format(self) -> Result<Format, FormatError> {
        self.parse()
    }
}

impl IntoFormat for String {
    fn into_format(self) -> Result<Format, FormatError> {
        self.parse()
    }
}

impl TryFrom<String> for Format {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Format> for String {
    fn from(format: Format) -> Self {
        format.as_str().to_string()
    }
}
