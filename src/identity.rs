use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    path::Path,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {
    parts: Vec<u32>,
}

impl Version {
    pub fn new(major: u32, minor: u32, revision: u32) -> Self {
        Self {
            parts: vec![major, minor, revision],
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw
            .strip_prefix('v')
            .or_else(|| raw.strip_prefix('V'))
            .unwrap_or(raw);
        if raw.is_empty() {
            return None;
        }
        let mut parts = Vec::new();
        for seg in raw.split('.') {
            if seg.is_empty() || !seg.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            parts.push(seg.parse::<u32>().ok()?);
        }
        if parts.len() > 4 {
            return None;
        }
        Some(Self { parts })
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn part(&self, index: usize) -> u32 {
        self.parts.get(index).copied().unwrap_or(0)
    }

    fn significant(&self) -> &[u32] {
        let len = self
            .parts
            .iter()
            .rposition(|part| *part != 0)
            .map_or(0, |last| last + 1);
        &self.parts[..len]
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

// Trailing zeros do not take part, matching `eq`.
impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for index in 0..len {
            match self.part(index).cmp(&other.part(index)) {
                Ordering::Equal => continue,
                order => return order,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .parts
            .iter()
            .map(|part| part.to_string())
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&joined)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedIdentity {
    pub display_name: String,
    pub core_name: String,
    pub version: Option<Version>,
}

pub const KNOWN_EXTENSIONS: [&str; 3] = ["zip", "bak", "xml"];

/// Identity of a source or backup path: the file name without a known
/// container extension. Directories keep their full name.
pub fn identity_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    let name = match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && KNOWN_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext)) =>
        {
            stem
        }
        _ => name.as_ref(),
    };
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Splits `Texture_Pack_v2.3` into core name `Texture Pack` and version `2.3`.
pub fn parse_identity(identity: &str) -> ParsedIdentity {
    let trimmed = identity.trim();
    let split = trimmed.rfind(['_', '-', ' ']);
    let (name, version) = match split {
        Some(pos) => {
            let tail = &trimmed[pos + 1..];
            match Version::parse(tail) {
                Some(version) => (&trimmed[..pos], Some(version)),
                None => (trimmed, None),
            }
        }
        None => (trimmed, None),
    };
    let name = name.replace('_', " ");
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let name = if name.is_empty() {
        trimmed.to_string()
    } else {
        name
    };
    ParsedIdentity {
        display_name: name.clone(),
        core_name: name,
        version,
    }
}

pub fn identity_hash(identity: &str) -> u64 {
    let digest = blake3::hash(identity.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

pub fn core_names_match(a: &str, b: &str) -> bool {
    fold_name(a) == fold_name(b)
}

fn fold_name(name: &str) -> String {
    name.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl Comparator {
    pub fn accepts(self, candidate: &Version, wanted: &Version) -> bool {
        let order = candidate.cmp(wanted);
        match self {
            Comparator::Eq => order == Ordering::Equal,
            Comparator::Ne => order != Ordering::Equal,
            Comparator::Ge => order != Ordering::Less,
            Comparator::Le => order != Ordering::Greater,
            Comparator::Gt => order == Ordering::Greater,
            Comparator::Lt => order == Ordering::Less,
        }
    }
}

/// A dependency reference: either an exact identity pin or a core name with a
/// version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyFilter {
    Identity(String),
    Constraint {
        core_name: String,
        comparator: Comparator,
        version: Version,
    },
}

impl DependencyFilter {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let Some(pos) = raw.find(['<', '>', '=', '!']) else {
            return DependencyFilter::Identity(raw.to_string());
        };
        let (name, rest) = raw.split_at(pos);
        let (comparator, tail) = if let Some(tail) = rest.strip_prefix(">=") {
            (Comparator::Ge, tail)
        } else if let Some(tail) = rest.strip_prefix("<=") {
            (Comparator::Le, tail)
        } else if let Some(tail) = rest.strip_prefix("==") {
            (Comparator::Eq, tail)
        } else if let Some(tail) = rest.strip_prefix("!=") {
            (Comparator::Ne, tail)
        } else if let Some(tail) = rest.strip_prefix('>') {
            (Comparator::Gt, tail)
        } else if let Some(tail) = rest.strip_prefix('<') {
            (Comparator::Lt, tail)
        } else if let Some(tail) = rest.strip_prefix('=') {
            (Comparator::Eq, tail)
        } else {
            return DependencyFilter::Identity(raw.to_string());
        };
        let name = name.trim();
        match Version::parse(tail) {
            Some(version) if !name.is_empty() => DependencyFilter::Constraint {
                core_name: name.to_string(),
                comparator,
                version,
            },
            _ => DependencyFilter::Identity(raw.to_string()),
        }
    }

    pub fn matches(&self, identity: &str, core_name: &str, version: Option<&Version>) -> bool {
        match self {
            DependencyFilter::Identity(wanted) => wanted == identity,
            DependencyFilter::Constraint {
                core_name: wanted,
                comparator,
                version: wanted_version,
            } => {
                if !core_names_match(wanted, core_name) {
                    return false;
                }
                let empty = Version::default();
                comparator.accepts(version.unwrap_or(&empty), wanted_version)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let a = Version::parse("1.5").unwrap();
        let b = Version::parse("2.0").unwrap();
        let c = Version::parse("2.0.0").unwrap();
        let d = Version::parse("v2.3").unwrap();
        assert!(a < b);
        assert_eq!(b.cmp(&c), Ordering::Equal);
        assert!(d > c);
        assert_eq!(d.to_string(), "2.3");
        assert!(Version::parse("2.x").is_none());
        assert!(Version::parse("").is_none());
    }

    #[test]
    fn test_version_equality_matches_ordering() {
        use std::collections::HashSet;
        let short = Version::parse("2.0").unwrap();
        let long = Version::parse("2.0.0").unwrap();
        assert_eq!(short, long);
        assert_ne!(short, Version::parse("2.0.1").unwrap());
        let set: HashSet<Version> = [short, long].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(Version::parse("0.0").unwrap(), Version::default());
    }

    #[test]
    fn test_parse_identity_with_version() {
        let parsed = parse_identity("Texture_Pack_v2.3");
        assert_eq!(parsed.core_name, "Texture Pack");
        assert_eq!(parsed.version, Some(Version::parse("2.3").unwrap()));

        let parsed = parse_identity("Better Lights-1.0.2");
        assert_eq!(parsed.core_name, "Better Lights");
        assert_eq!(parsed.version.unwrap().to_string(), "1.0.2");
    }

    #[test]
    fn test_parse_identity_without_version() {
        let parsed = parse_identity("Sky_Box_HD");
        assert_eq!(parsed.core_name, "Sky Box HD");
        assert!(parsed.version.is_none());
    }

    #[test]
    fn test_identity_of_strips_known_extensions() {
        assert_eq!(identity_of(Path::new("/lib/Foo_v1.2.zip")).unwrap(), "Foo_v1.2");
        assert_eq!(identity_of(Path::new("/bak/Foo_v1.2.bak")).unwrap(), "Foo_v1.2");
        assert_eq!(identity_of(Path::new("/lib/Foo_v1.2")).unwrap(), "Foo_v1.2");
        assert!(identity_of(Path::new("/")).is_none());
    }

    #[test]
    fn test_identity_hash_is_stable() {
        assert_eq!(identity_hash("ModA"), identity_hash("ModA"));
        assert_ne!(identity_hash("ModA"), identity_hash("ModB"));
    }

    #[test]
    fn test_filter_parse_constraint() {
        let filter = DependencyFilter::parse("Texture Pack>=2.0");
        assert_eq!(
            filter,
            DependencyFilter::Constraint {
                core_name: "Texture Pack".to_string(),
                comparator: Comparator::Ge,
                version: Version::parse("2.0").unwrap(),
            }
        );
        let v15 = Version::parse("1.5").unwrap();
        let v23 = Version::parse("2.3").unwrap();
        assert!(!filter.matches("Texture_Pack_v1.5", "Texture Pack", Some(&v15)));
        assert!(filter.matches("Texture_Pack_v2.3", "texture_pack", Some(&v23)));
    }

    #[test]
    fn test_filter_parse_bare_identity() {
        let filter = DependencyFilter::parse("Texture_Pack_v2.0");
        assert_eq!(
            filter,
            DependencyFilter::Identity("Texture_Pack_v2.0".to_string())
        );
        let filter = DependencyFilter::parse("Weird=name");
        assert_eq!(filter, DependencyFilter::Identity("Weird=name".to_string()));
    }
}
