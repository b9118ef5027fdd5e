use std::fmt;

use hashbrown::HashMap;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// The label reserved for the original object.
pub const ORIGINAL_LABEL: &str = "o";

/// A set of named size specs for a single write.
pub type SizeSpecs = HashMap<SizeLabel, SizeParams>;

/// An opaque identifier of one logical asset, e.g. `ab/cd/abcdef.jpg`.
///
/// Keys are handed to us by whoever computed them, we only make sure they
/// cannot escape the backend's root.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AssetKey(String);

impl AssetKey {
    pub fn new(raw: impl AsRef<str>) -> StorageResult<Self> {
        let trimmed = raw.as_ref().trim_start_matches(|c| c == '/' || c == '\\');

        if trimmed.is_empty() {
            return Err(StorageError::invalid("asset key is empty"));
        }

        if trimmed.contains('\\') || trimmed.contains('\0') {
            return Err(StorageError::invalid(format!(
                "asset key {:?} contains a forbidden character",
                trimmed
            )));
        }

        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StorageError::invalid(format!(
                    "asset key {:?} contains an invalid path segment {:?}",
                    trimmed, segment,
                )));
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The name of a derived size, e.g. `small` or `thumb`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SizeLabel(String);

impl SizeLabel {
    pub fn new(raw: impl Into<String>) -> StorageResult<Self> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(StorageError::invalid("size label is empty"));
        }

        if raw == ORIGINAL_LABEL {
            return Err(StorageError::invalid(format!(
                "size label {:?} is reserved for the original",
                ORIGINAL_LABEL
            )));
        }

        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::invalid(format!(
                "size label {:?} may only contain ascii letters, digits, '-' and '_'",
                raw
            )));
        }

        Ok(Self(raw))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SizeLabel {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SizeLabel> for String {
    fn from(label: SizeLabel) -> Self {
        label.0
    }
}

impl fmt::Display for SizeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored object of an asset.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Variant<'a> {
    Original,
    Size(&'a SizeLabel),
}

impl<'a> Variant<'a> {
    pub fn label(&self) -> &'a str {
        match *self {
            Self::Original => ORIGINAL_LABEL,
            Self::Size(label) => label.as_str(),
        }
    }
}

impl<'a> From<&'a SizeLabel> for Variant<'a> {
    fn from(label: &'a SizeLabel) -> Self {
        Self::Size(label)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Scale down to fit within the bounds, keeping the aspect ratio.
    Fit,

    /// Scale and crop so the result fills the bounds exactly.
    Fill,

    /// Scale to the exact bounds ignoring the aspect ratio.
    Exact,
}

impl Default for ResizeMode {
    fn default() -> Self {
        Self::Fill
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizingFilter {
    /// Nearest Neighbor
    Nearest,

    /// Linear Filter
    Triangle,

    /// Cubic Filter
    CatmullRom,

    /// Gaussian Filter
    Gaussian,

    /// Lanczos with window 3
    Lanczos3,
}

impl Default for ResizingFilter {
    fn default() -> Self {
        Self::Nearest
    }
}

impl From<ResizingFilter> for FilterType {
    fn from(filter: ResizingFilter) -> FilterType {
        match filter {
            ResizingFilter::Nearest => FilterType::Nearest,
            ResizingFilter::Triangle => FilterType::Triangle,
            ResizingFilter::CatmullRom => FilterType::CatmullRom,
            ResizingFilter::Gaussian => FilterType::Gaussian,
            ResizingFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// The parameters of a size spec.
///
/// Only the deriver interprets these, backends pass them through untouched.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SizeParams {
    /// The width to resize the image to.
    pub width: u32,

    /// The height to resize the image to.
    pub height: u32,

    #[serde(default)]
    pub mode: ResizeMode,

    #[serde(default)]
    pub filter: ResizingFilter,
}

impl SizeParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            mode: ResizeMode::default(),
            filter: ResizingFilter::default(),
        }
    }

    pub fn validate(&self, label: &SizeLabel) -> StorageResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(StorageError::invalid(format!(
                "size {} has empty dimensions {}x{}",
                label, self.width, self.height,
            )));
        }

        Ok(())
    }
}

/// Checks every spec of a write before anything touches the backend.
pub fn validate_sizes(sizes: &SizeSpecs) -> StorageResult<()> {
    for (label, params) in sizes {
        params.validate(label)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_trims_leading_separators() {
        let key = AssetKey::new("//ab/cd.jpg").unwrap();
        assert_eq!(key.as_str(), "ab/cd.jpg");

        let key = AssetKey::new("\\ab/cd.jpg").unwrap();
        assert_eq!(key.as_str(), "ab/cd.jpg");
    }

    #[test]
    fn test_key_rejects_bad_input() {
        for raw in ["", "/", "ab//cd.jpg", "ab/cd/", "../etc/passwd", "ab/./cd", "ab\\cd", "a\0b"] {
            let err = AssetKey::new(raw).unwrap_err();
            assert!(err.is_invalid_input(), "{:?} should be rejected", raw);
        }
    }

    #[test]
    fn test_label_validation() {
        assert!(SizeLabel::new("thumb").is_ok());
        assert!(SizeLabel::new("x-large_2").is_ok());

        assert!(SizeLabel::new("").unwrap_err().is_invalid_input());
        assert!(SizeLabel::new("o").unwrap_err().is_invalid_input());
        assert!(SizeLabel::new("a/b").unwrap_err().is_invalid_input());
        assert!(SizeLabel::new("a.b").unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_label_deserialize_validates() {
        let ok: Result<SizeLabel, _> = serde_json::from_str("\"small\"");
        assert!(ok.is_ok());

        let reserved: Result<SizeLabel, _> = serde_json::from_str("\"o\"");
        assert!(reserved.is_err());
    }

    #[test]
    fn test_params_reject_empty_dimensions() {
        let label = SizeLabel::new("thumb").unwrap();
        assert!(SizeParams::new(100, 100).validate(&label).is_ok());
        assert!(SizeParams::new(0, 100).validate(&label).unwrap_err().is_invalid_input());
        assert!(SizeParams::new(100, 0).validate(&label).unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_variant_labels() {
        let label = SizeLabel::new("small").unwrap();
        assert_eq!(Variant::Original.label(), "o");
        assert_eq!(Variant::from(&label).label(), "small");
    }
}
