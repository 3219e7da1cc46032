//! Stored file names.
//!
//! A stored name is `{uuid}_{expiry_unix}{ext}`. The expiry is embedded in
//! the name so the purge task and downloads can decide expiry without any
//! index.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Extension used when the original name has none or an unsafe one.
pub const DEFAULT_EXTENSION: &str = ".bin";

const MAX_EXTENSION_LEN: usize = 10;

/// A parsed stored file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredName {
    pub id: Uuid,
    pub expires_at: DateTime<Utc>,
    /// Includes the leading dot.
    pub extension: String,
}

impl StoredName {
    /// Allocate a fresh name for an upload of `original_name`.
    pub fn generate(original_name: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            // Sub-second precision is dropped by the name format.
            expires_at: DateTime::from_timestamp(expires_at.timestamp(), 0).unwrap_or(expires_at),
            extension: extension_of(original_name),
        }
    }

    /// Parse a stored name, rejecting anything that is not exactly the
    /// generated shape (path separators included).
    pub fn parse(name: &str) -> Option<Self> {
        if name.contains(['/', '\\']) {
            return None;
        }

        let (id, rest) = name.rsplit_once('_')?;
        let (expiry, extension) = match rest.split_once('.') {
            Some((expiry, ext)) => (expiry, ext),
            None => (rest, ""),
        };

        if !is_safe_extension(extension) {
            return None;
        }

        let id = parse_hyphenated(id)?;
        if !is_canonical_timestamp(expiry) {
            return None;
        }
        let expires_at = DateTime::from_timestamp(expiry.parse::<i64>().ok()?, 0)?;

        Some(Self {
            id,
            expires_at,
            extension: format!(".{extension}"),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Only the lowercase hyphenated form that [`StoredName`] renders.
fn parse_hyphenated(id: &str) -> Option<Uuid> {
    let uuid = Uuid::try_parse(id).ok()?;
    (uuid.as_hyphenated().to_string() == id).then_some(uuid)
}

fn is_canonical_timestamp(expiry: &str) -> bool {
    !expiry.is_empty()
        && expiry.bytes().all(|b| b.is_ascii_digit())
        && (expiry == "0" || !expiry.starts_with('0'))
}

impl std::fmt::Display for StoredName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}{}",
            self.id.as_hyphenated(),
            self.expires_at.timestamp(),
            self.extension
        )
    }
}

/// Lowercased extension of `original_name` with its leading dot, or
/// [`DEFAULT_EXTENSION`].
pub fn extension_of(original_name: &str) -> String {
    // Browsers may send a full client path.
    let base = original_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original_name);

    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && is_safe_extension(ext) => {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

fn is_safe_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= MAX_EXTENSION_LEN && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("report.PDF"), ".pdf");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("C:\\Users\\me\\notes.txt"), ".txt");
        assert_eq!(extension_of("README"), ".bin");
        assert_eq!(extension_of(".bashrc"), ".bin");
        assert_eq!(extension_of("evil.ph p"), ".bin");
        assert_eq!(extension_of("x.averyveryverylongext"), ".bin");
    }

    #[test]
    fn test_generated_name_parses_back() {
        let name = StoredName::generate("photo.JPG", at(1_700_000_000));
        let rendered = name.to_string();

        assert!(rendered.ends_with("_1700000000.jpg"));
        assert_eq!(StoredName::parse(&rendered), Some(name));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        let id = Uuid::new_v4();
        assert!(StoredName::parse(&format!("{id}_1700000000.txt")).is_some());

        assert!(StoredName::parse("index.html").is_none());
        assert!(StoredName::parse(&format!("../{id}_1700000000.txt")).is_none());
        assert!(StoredName::parse(&format!("{id}_soon.txt")).is_none());
        assert!(StoredName::parse("nope_1700000000.txt").is_none());
        assert!(StoredName::parse(&format!("{id}_1700000000.txt.part")).is_none());
    }

    #[test]
    fn test_parse_accepts_only_rendered_form() {
        let id = Uuid::new_v4();
        let canonical = format!("{}_1700000000.txt", id.as_hyphenated());
        let parsed = StoredName::parse(&canonical).unwrap();
        assert_eq!(parsed.to_string(), canonical);

        for alias in [
            format!("{}_1700000000.txt", id.simple()),
            format!("{}_1700000000.txt", id.braced()),
            format!("{}_1700000000.txt", id.urn()),
            format!("{}_1700000000.txt", id.as_hyphenated().to_string().to_uppercase()),
            format!("{}_+1700000000.txt", id.as_hyphenated()),
            format!("{}_01700000000.txt", id.as_hyphenated()),
            format!("{}_-5.txt", id.as_hyphenated()),
            format!("{}_.txt", id.as_hyphenated()),
        ] {
            assert!(StoredName::parse(&alias).is_none(), "{alias}");
        }
    }

    #[test]
    fn test_expiry() {
        let name = StoredName::generate("a.txt", at(100));
        assert!(!name.is_expired(at(99)));
        assert!(name.is_expired(at(100)));
    }
}
