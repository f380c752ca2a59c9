//! BIP32 derivation path validation and composition.
//!
//! Paths are written as a literal root marker `m/` followed by zero or more
//! unsigned indices separated by `/`. A trailing apostrophe marks a hardened
//! index. The accepted text grammar is:
//!
//! ```text
//! ^m/(\d+'?/)*(\d+'?/?)?$
//! ```
//!
//! # Example
//!
//! ```
//! use hw_signer_core::path::{compose, validate};
//!
//! assert!(validate("m/84'/0'/0'").is_ok());
//! assert!(validate("84/0/0").is_err());
//!
//! let full = compose("m/48'/0'/0'/2'/", "/0/1").unwrap();
//! assert_eq!(full, "m/48'/0'/0'/2'/0/1");
//! ```

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{Error, Result};

/// The bit set on hardened indices.
pub const HARDENED: u32 = 0x8000_0000;

/// Root marker that starts every path.
const ROOT: &str = "m/";

/// Separator between path segments.
const SEPARATOR: char = '/';

/// Marker for a hardened segment.
const HARDENED_MARKER: char = '\'';

/// Checks that `path` matches the BIP32 path grammar.
///
/// Index magnitude is not checked here; use [`DerivationPath::from_str`] for
/// a path that can be sent to a device.
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] if `path` does not match the grammar.
///
/// # Example
///
/// ```
/// use hw_signer_core::path::validate;
///
/// assert!(validate("m/").is_ok());
/// assert!(validate("m/84'/0'/0'/").is_ok());
/// assert!(validate("m//0").is_err());
/// ```
pub fn validate(path: &str) -> Result<()> {
    if segments(path).is_some() {
        Ok(())
    } else {
        Err(invalid(path))
    }
}

/// Joins a base path and a relative sub-path with exactly one separator.
///
/// Either operand may carry the separator at the seam. The result is
/// validated before it is returned.
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] if the joined path does not match the grammar.
///
/// # Example
///
/// ```
/// use hw_signer_core::path::compose;
///
/// let a = compose("m/48'/0'/0'/2'", "/0/0").unwrap();
/// let b = compose("m/48'/0'/0'/2'/", "0/0").unwrap();
/// assert_eq!(a, b);
/// ```
pub fn compose(base: &str, sub: &str) -> Result<String> {
    let head = base.trim_end_matches(SEPARATOR);
    let tail = sub.trim_start_matches(SEPARATOR);

    let joined = if tail.is_empty() {
        format!("{head}{SEPARATOR}")
    } else {
        format!("{head}{SEPARATOR}{tail}")
    };

    validate(&joined)?;
    Ok(joined)
}

/// Splits a grammatical path into `(digits, hardened)` segments.
fn segments(path: &str) -> Option<Vec<(&str, bool)>> {
    let body = path.strip_prefix(ROOT)?;
    let body = body.strip_suffix(SEPARATOR).unwrap_or(body);

    if body.is_empty() {
        return Some(Vec::new());
    }

    body.split(SEPARATOR)
        .map(|segment| {
            let (digits, hardened) = match segment.strip_suffix(HARDENED_MARKER) {
                Some(digits) => (digits, true),
                None => (segment, false),
            };
            let valid = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
            valid.then_some((digits, hardened))
        })
        .collect()
}

fn invalid(path: &str) -> Error {
    Error::InvalidPath(format!(
        "\"{path}\" must match m/<digits>[']/<digits>[']/..."
    ))
}

/// A parsed BIP32 derivation path.
///
/// Immutable once constructed. Each element is the raw child index with the
/// [`HARDENED`] bit set for hardened steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    /// Child indices from the root.
    indices: Vec<u32>,
}

impl DerivationPath {
    /// The master (root) path `m/`.
    #[must_use]
    pub const fn master() -> Self {
        Self {
            indices: Vec::new(),
        }
    }

    /// Creates a path from raw indices (hardened bit already applied).
    #[must_use]
    pub const fn from_indices(indices: Vec<u32>) -> Self {
        Self { indices }
    }

    /// Returns the raw child indices.
    #[must_use]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Returns the number of derivation steps.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.indices.len()
    }

    /// Returns `true` for the master path.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.indices.is_empty()
    }

    /// Returns the path one step closer to the root, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.indices.split_last()?;
        Some(Self::from_indices(parent.to_vec()))
    }

    /// Returns the last child index, or `None` at the root.
    #[must_use]
    pub fn last(&self) -> Option<u32> {
        self.indices.last().copied()
    }

    /// Returns a new path extended by `index`.
    #[must_use]
    pub fn child(&self, index: u32) -> Self {
        let mut indices = self.indices.clone();
        indices.push(index);
        Self::from_indices(indices)
    }

    /// Encodes the path as 4-byte big-endian indices, the card wire format.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.indices.iter().flat_map(|i| i.to_be_bytes()).collect()
    }
}

impl FromStr for DerivationPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let segments = segments(s).ok_or_else(|| invalid(s))?;

        let indices = segments
            .into_iter()
            .map(|(digits, hardened)| {
                let index: u32 = digits
                    .parse()
                    .ok()
                    .filter(|i| i & HARDENED == 0)
                    .ok_or_else(|| {
                        Error::InvalidPath(format!("index {digits} out of range in \"{s}\""))
                    })?;
                Ok(if hardened { index | HARDENED } else { index })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { indices })
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        if self.indices.is_empty() {
            return f.write_str("/");
        }
        for index in &self.indices {
            if index & HARDENED == 0 {
                write!(f, "/{index}")?;
            } else {
                write!(f, "/{}'", index & !HARDENED)?;
            }
        }
        Ok(())
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_grammar() {
        assert!(validate("m/84'/0'/0'").is_ok());
        assert!(validate("m/84'/0'/0'/").is_ok());
        assert!(validate("m/").is_ok());
        assert!(validate("m/0/1/2").is_ok());
        assert!(validate("m/48'/1'/0'/2'/0/15").is_ok());
    }

    #[test]
    fn validate_rejects_bad_paths() {
        assert!(matches!(validate("84/0/0"), Err(Error::InvalidPath(_))));
        assert!(validate("m").is_err());
        assert!(validate("m//0").is_err());
        assert!(validate("m/0//").is_err());
        assert!(validate("m/84h/0").is_err());
        assert!(validate("m/'0").is_err());
        assert!(validate("m/0''").is_err());
        assert!(validate("M/0").is_err());
        assert!(validate("m/-1").is_err());
        assert!(validate(" m/0").is_err());
    }

    #[test]
    fn compose_inserts_one_separator() {
        let expected = "m/48'/0'/0'/2'/0/0";
        assert_eq!(compose("m/48'/0'/0'/2'", "/0/0").unwrap(), expected);
        assert_eq!(compose("m/48'/0'/0'/2'/", "0/0").unwrap(), expected);
        assert_eq!(compose("m/48'/0'/0'/2'", "0/0").unwrap(), expected);
        assert_eq!(compose("m/48'/0'/0'/2'/", "/0/0").unwrap(), expected);
    }

    #[test]
    fn compose_from_root() {
        assert_eq!(compose("m/", "0/1").unwrap(), "m/0/1");
        assert_eq!(compose("m", "/0/1").unwrap(), "m/0/1");
        assert_eq!(compose("m/84'/0'/0'", "").unwrap(), "m/84'/0'/0'/");
    }

    #[test]
    fn compose_rejects_bad_result() {
        assert!(compose("84'/0'", "0/0").is_err());
        assert!(compose("m/84'", "0/x").is_err());
    }

    #[test]
    fn parse_and_display() {
        let path: DerivationPath = "m/84'/1'/0'/".parse().unwrap();
        assert_eq!(path.indices(), &[84 | HARDENED, 1 | HARDENED, HARDENED]);
        assert_eq!(path.to_string(), "m/84'/1'/0'");
        assert_eq!(DerivationPath::master().to_string(), "m/");
    }

    #[test]
    fn parse_rejects_out_of_range_index() {
        assert!("m/2147483648".parse::<DerivationPath>().is_err());
        assert!("m/99999999999'".parse::<DerivationPath>().is_err());
        assert!("m/2147483647'".parse::<DerivationPath>().is_ok());
    }

    #[test]
    fn card_encoding() {
        let path: DerivationPath = "m/44'/0".parse().unwrap();
        assert_eq!(path.to_bytes(), vec![0x80, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn parent_and_child() {
        let path: DerivationPath = "m/48'/0'/0'/2'".parse().unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.to_string(), "m/48'/0'/0'");
        assert_eq!(parent.child(2 | HARDENED), path);
        assert_eq!(path.last(), Some(2 | HARDENED));
        assert!(DerivationPath::master().parent().is_none());
    }

    #[test]
    fn serde_as_string() {
        let path: DerivationPath = "m/86'/0'/3'".parse().unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"m/86'/0'/3'\"");
        let back: DerivationPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
