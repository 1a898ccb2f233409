//! Parsing of `/v2/<name>/...` paths
//!
//! Repository names span several path segments, so the router captures
//! everything after `/v2/` and the resource kind is recognized by its suffix.

/// A registry resource addressed by a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route<'p> {
    /// `/v2/<name>/manifests/<reference>`
    Manifest { name: &'p str, reference: &'p str },
    /// `/v2/<name>/blobs/<digest>`
    Blob { name: &'p str, digest: &'p str },
    /// `/v2/<name>/blobs/uploads/`
    Uploads { name: &'p str },
    /// `/v2/<name>/blobs/uploads/<id>`
    Upload { name: &'p str, id: &'p str },
    /// `/v2/<name>/tags/list`
    Tags { name: &'p str },
}

impl<'p> Route<'p> {
    /// Parse the part of the path after `/v2/`.
    pub(crate) fn parse(path: &'p str) -> Option<Self> {
        let path = path.trim_start_matches('/');

        if let Some(name) = path.strip_suffix("/tags/list") {
            return non_empty(name).map(|name| Route::Tags { name });
        }

        if let Some(name) = path
            .strip_suffix("/blobs/uploads/")
            .or_else(|| path.strip_suffix("/blobs/uploads"))
        {
            return non_empty(name).map(|name| Route::Uploads { name });
        }

        if let Some((name, id)) = resource(path, "/blobs/uploads/") {
            return Some(Route::Upload { name, id });
        }

        if let Some((name, digest)) = resource(path, "/blobs/") {
            return Some(Route::Blob { name, digest });
        }

        if let Some((name, reference)) = resource(path, "/manifests/") {
            return Some(Route::Manifest { name, reference });
        }

        None
    }
}

/// Split `path` at the last `keyword`, if a non-empty name precedes it and a
/// single segment follows it. Names may themselves contain `blobs` or
/// `manifests` components.
fn resource<'p>(path: &'p str, keyword: &str) -> Option<(&'p str, &'p str)> {
    let (name, tail) = path.rsplit_once(keyword)?;
    Some((non_empty(name)?, segment(tail)?))
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

fn segment(value: &str) -> Option<&str> {
    non_empty(value).filter(|value| !value.contains('/'))
}
