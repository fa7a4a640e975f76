//! Parsing of distribution archive filenames.
//!
//! Distribution archives follow the `f.<format>.<start>-<end>.zip` naming
//! convention, where `<start>` and `<end>` are zero-padded identifiers of
//! 6 to 10 digits describing the inclusive identifier range of the archive.

use std::collections::HashSet;
use std::fmt;

use lazy_regex::regex_captures;
use serde::{Deserialize, Serialize};

/// Canonical format token used when none is configured.
pub const DEFAULT_CANONICAL_FORMAT: &str = "fb2";

/// Archives published upstream with broken contents.
pub const DEFAULT_EXCLUDED_ARCHIVES: &[&str] = &["d.fb2-009999.zip"];

/// Structured view of a distribution archive filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    /// Content encoding of the archive.
    pub format: String,
    /// First identifier contained in the archive.
    pub start_id: i64,
    /// Last identifier contained in the archive.
    pub end_id: i64,
    /// Whether the archive belongs to the non-canonical format bucket.
    pub is_user_format: bool,
}

/// Reason a filename was not turned into a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The name does not follow the archive naming convention.
    Malformed,
    /// The name is on the deny-list.
    Excluded,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Malformed => write!(f, "malformed name"),
            Rejection::Excluded => write!(f, "excluded by policy"),
        }
    }
}

/// Converts archive filenames into [`ArchiveDescriptor`]s.
#[derive(Debug, Clone)]
pub struct ArchiveFilenameParser {
    canonical_format: String,
    excluded: HashSet<String>,
}

impl ArchiveFilenameParser {
    /// Create a parser for the given canonical format and deny-list.
    pub fn new<I, S>(canonical_format: &str, excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            canonical_format: canonical_format.to_string(),
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    /// The canonical format token.
    pub fn canonical_format(&self) -> &str {
        &self.canonical_format
    }

    /// Whether a filename is on the deny-list.
    pub fn is_excluded(&self, filename: &str) -> bool {
        self.excluded.contains(filename)
    }

    /// Parse a filename.
    ///
    /// Inverted ranges (`start > end`) are accepted here and reported by the
    /// health checker instead.
    pub fn parse(&self, filename: &str) -> Result<ArchiveDescriptor, Rejection> {
        if self.is_excluded(filename) {
            return Err(Rejection::Excluded);
        }

        let (_, format, start, end) =
            regex_captures!(r"^f\.([^.]+)\.([0-9]{6,10})-([0-9]{6,10})\.zip$", filename)
                .ok_or(Rejection::Malformed)?;

        // 10 digits always fit in an i64.
        let start_id = start.parse::<i64>().map_err(|_| Rejection::Malformed)?;
        let end_id = end.parse::<i64>().map_err(|_| Rejection::Malformed)?;

        Ok(ArchiveDescriptor {
            format: format.to_string(),
            start_id,
            end_id,
            is_user_format: format != self.canonical_format,
        })
    }
}

impl Default for ArchiveFilenameParser {
    fn default() -> Self {
        Self::new(
            DEFAULT_CANONICAL_FORMAT,
            DEFAULT_EXCLUDED_ARCHIVES.iter().copied(),
        )
    }
}
