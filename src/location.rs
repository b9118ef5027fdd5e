//! Where each variant of an asset lives relative to a backend's root.
//!
//! The naming scheme here is the on-disk (and in-bucket) layout, changing it
//! orphans every variant stored so far.

use crate::asset::{AssetKey, Variant};

/// Computes the storage relative location of a variant.
///
/// The original lives at the key itself, a sized variant gets `_<label>`
/// inserted before the extension of the final path segment:
///
/// ```
/// use thumbvault::{locate, AssetKey, SizeLabel, Variant};
///
/// let key = AssetKey::new("ab/cd.jpg").unwrap();
/// let thumb = SizeLabel::new("thumb").unwrap();
///
/// assert_eq!(locate(&key, Variant::Original), "ab/cd.jpg");
/// assert_eq!(locate(&key, Variant::Size(&thumb)), "ab/cd_thumb.jpg");
/// ```
pub fn locate(key: &AssetKey, variant: Variant<'_>) -> String {
    let label = match variant {
        Variant::Original => return key.as_str().to_string(),
        Variant::Size(label) => label.as_str(),
    };

    let key = key.as_str();
    let name_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);

    // A leading dot marks a hidden file, not an extension.
    let extension_start = key[name_start..]
        .rfind('.')
        .filter(|&i| i > 0)
        .map(|i| name_start + i);

    match extension_start {
        Some(dot) => format!("{}_{}{}", &key[..dot], label, &key[dot..]),
        None => format!("{}_{}", key, label),
    }
}

/// The container (directory or prefix) part of a location.
///
/// Empty when the location sits at the backend's root.
pub fn container_of(location: &str) -> &str {
    location.rfind('/').map(|i| &location[..i]).unwrap_or("")
}
