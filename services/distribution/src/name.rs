//! Repository names, tags and references

use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::RegistryError;

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// A validated repository name such as `library/app`.
///
/// One or more `/` separated components, each matching
/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName(String);

impl RepositoryName {
    /// The name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| RegistryError::NameInvalid {
            name: s.to_string(),
            reason,
        };

        if s.is_empty() {
            return Err(invalid("name is empty"));
        }

        if s.len() > MAX_NAME_LEN {
            return Err(invalid("name is longer than 255 characters"));
        }

        if !s.split('/').all(valid_component) {
            return Err(invalid("invalid path component"));
        }

        Ok(RepositoryName(s.to_string()))
    }
}

fn alphanumeric(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let mut i = 0;

    loop {
        let run = i;
        while i < bytes.len() && alphanumeric(bytes[i]) {
            i += 1;
        }
        if i == run {
            return false;
        }
        if i == bytes.len() {
            return true;
        }

        match bytes[i] {
            b'.' => i += 1,
            b'_' => {
                i += 1;
                if bytes.get(i) == Some(&b'_') {
                    i += 1;
                }
            }
            b'-' => {
                while bytes.get(i) == Some(&b'-') {
                    i += 1;
                }
            }
            _ => return false,
        }
    }
}

/// A validated tag name, matching `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    /// Parse a tag, returning `None` when it is not a valid tag name
    pub fn new(tag: &str) -> Option<Self> {
        let mut bytes = tag.bytes();
        let first = bytes.next()?;
        let valid = tag.len() <= MAX_TAG_LEN
            && (first.is_ascii_alphanumeric() || first == b'_')
            && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        valid.then(|| Tag(tag.to_string()))
    }

    /// The tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A manifest reference: either a tag or a digest literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable tag
    Tag(Tag),
    /// A self-certifying digest
    Digest(Digest),
}

impl Reference {
    /// Returns the tag, if this is a tag reference
    pub fn tag(&self) -> Option<&Tag> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }

    /// Returns the digest, if this is a digest reference
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Reference::Tag(_) => None,
            Reference::Digest(digest) => Some(digest),
        }
    }
}

impl FromStr for Reference {
    type Err = RegistryError;

    /// Anything containing `:` is a digest candidate; tags cannot contain one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            return s.parse().map(Reference::Digest);
        }

        Tag::new(s)
            .map(Reference::Tag)
            .ok_or_else(|| RegistryError::manifest_invalid(format!("invalid tag {s:?}")))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => tag.fmt(f),
            Reference::Digest(digest) => digest.fmt(f),
        }
    }
}

impl From<Digest> for Reference {
    fn from(digest: Digest) -> Self {
        Reference::Digest(digest)
    }
}

impl From<Tag> for Reference {
    fn from(tag: Tag) -> Self {
        Reference::Tag(tag)
    }
}
