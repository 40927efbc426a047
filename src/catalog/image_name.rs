//! Microscope image filename parsing.
//!
//! Filenames encode acquisition metadata:
//! `<well>_s<site>_x<x>_y<y>[_z<z>]_<channel>.tif`, e.g.
//! `B03_s1_x0_y0_Fluorescence_405_nm_Ex.tif`. Channel names may themselves
//! contain underscores (formatting stand-ins for spaces), so the name is
//! taken apart with a regex rather than a plain split.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{PlateflowError, Result};

/// Metadata recovered from one image filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImageName {
    pub well: String,
    /// 1-indexed linear site index.
    pub site: i64,
    pub site_x: i64,
    pub site_y: i64,
    /// Defaults to 1 when the filename has no z segment.
    pub site_z: i64,
    /// Channel name with formatting underscores restored to spaces.
    pub channel: String,
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+?)_s(\d+)_x(\d+)_y(\d+)(?:_z(\d+))?_(.+)$")
            .expect("image name pattern is valid")
    })
}

/// Parse an image filename (any path prefix and the extension are
/// ignored). Fails with a validation error when the name does not follow
/// the acquisition naming scheme.
pub fn parse(filename: &str) -> Result<ParsedImageName> {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            PlateflowError::Validation(format!("image filename is not valid UTF-8: {filename:?}"))
        })?;

    let captures = pattern().captures(stem).ok_or_else(|| {
        PlateflowError::Validation(format!(
            "image filename {stem:?} does not match <well>_s<n>_x<n>_y<n>[_z<n>]_<channel>"
        ))
    })?;

    let int = |idx: usize| -> Result<i64> {
        captures[idx].parse().map_err(|_| {
            PlateflowError::Validation(format!("image filename {stem:?} has a non-numeric index"))
        })
    };

    Ok(ParsedImageName {
        well: captures[1].to_string(),
        site: int(2)?,
        site_x: int(3)?,
        site_y: int(4)?,
        site_z: match captures.get(5) {
            Some(_) => int(5)?,
            None => 1,
        },
        channel: captures[6].replace('_', " "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fluorescence_name_with_underscored_channel() {
        let parsed = parse("B03_s1_x0_y0_Fluorescence_405_nm_Ex.tif").unwrap();
        assert_eq!(parsed.well, "B03");
        assert_eq!(parsed.site, 1);
        assert_eq!(parsed.site_x, 0);
        assert_eq!(parsed.site_y, 0);
        assert_eq!(parsed.site_z, 1);
        assert_eq!(parsed.channel, "Fluorescence 405 nm Ex");
    }

    #[test]
    fn parses_optional_z_segment() {
        let parsed = parse("A01_s3_x1_y2_z4_BF_full.tif").unwrap();
        assert_eq!(parsed.site_z, 4);
        assert_eq!(parsed.channel, "BF full");
    }

    #[test]
    fn ignores_nested_path_prefix() {
        let parsed = parse("/mnt/squid/project/plate/C07_s2_x1_y0_BF_full.tif").unwrap();
        assert_eq!(parsed.well, "C07");
        assert_eq!(parsed.site, 2);
    }

    #[test]
    fn rejects_names_without_site_segments() {
        assert!(parse("whatever.tif").is_err());
        assert!(parse("B03_Fluorescence_405.tif").is_err());
    }

    #[test]
    fn rejects_indices_too_large_to_represent() {
        assert!(parse("B03_s99999999999999999999_x0_y0_BF_full.tif").is_err());
        // The optional z index gets the same treatment as the others
        // instead of silently defaulting.
        assert!(parse("B03_s1_x0_y0_z99999999999999999999_BF_full.tif").is_err());
    }
}
