//! Manifest document shapes
//!
//! Only what the registry needs to enforce referential integrity is modelled;
//! the stored document is always the exact bytes the client pushed.

use serde::Deserialize;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// Docker image manifest, schema 2
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list, schema 2
pub const DOCKER_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index
pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";

/// Media types accepted for image manifests
const IMAGE_MEDIA_TYPES: &[&str] = &[DOCKER_MANIFEST_V2, OCI_MANIFEST_V1];

/// Media types accepted for manifest lists
const LIST_MEDIA_TYPES: &[&str] = &[DOCKER_MANIFEST_LIST_V2, OCI_INDEX_V1];

/// Returns true when `media_type` is a manifest media type the registry stores.
pub fn is_supported(media_type: &str) -> bool {
    IMAGE_MEDIA_TYPES.contains(&media_type) || LIST_MEDIA_TYPES.contains(&media_type)
}

/// A reference from a manifest to content by digest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    #[serde(default)]
    pub media_type: Option<String>,
    /// Length of the referenced content
    pub size: u64,
    /// Digest of the referenced content
    pub digest: Digest,
}

/// The platform a manifest list entry targets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`
    pub architecture: String,
    /// Operating system, e.g. `linux`
    pub os: String,
    /// CPU variant, e.g. `v8`
    #[serde(default)]
    pub variant: Option<String>,
}

/// An entry of a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlatformDescriptor {
    /// The nested manifest
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Its target platform
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Image manifest: a config blob and an ordered list of layer blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    /// Image configuration blob
    pub config: Descriptor,
    /// Layer blobs, base layer first
    pub layers: Vec<Descriptor>,
}

/// Manifest list / image index: one nested manifest per platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestList {
    /// Nested manifests
    pub manifests: Vec<PlatformDescriptor>,
}

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// An image manifest
    Image(ImageManifest),
    /// A manifest list or image index
    List(ManifestList),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Option<Vec<Descriptor>>,
    #[serde(default)]
    manifests: Option<Vec<PlatformDescriptor>>,
}

/// A manifest with the media type it was accepted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedManifest {
    /// Effective media type
    pub media_type: String,
    /// Document contents
    pub manifest: Manifest,
}

impl Manifest {
    /// Parse `content`, checking it against the declared `content_type`.
    ///
    /// A declared content type must be a supported manifest media type, and must
    /// agree with the document's own `mediaType` when it has one.
    pub fn parse(content: &[u8], content_type: Option<&str>) -> RegistryResult<ParsedManifest> {
        let document: Document = serde_json::from_slice(content)
            .map_err(|err| RegistryError::manifest_invalid(err.to_string()))?;

        if document.schema_version != 2 {
            return Err(RegistryError::manifest_invalid(format!(
                "unsupported schema version {}",
                document.schema_version
            )));
        }

        if let Some(content_type) = content_type {
            if !is_supported(content_type) {
                return Err(RegistryError::manifest_invalid(format!(
                    "unsupported manifest media type {content_type}"
                )));
            }
        }

        let declared = match (content_type, document.media_type.as_deref()) {
            (Some(header), Some(body)) if header != body => {
                return Err(RegistryError::manifest_invalid(format!(
                    "content type {header} does not match document media type {body}"
                )));
            }
            (Some(media_type), _) | (None, Some(media_type)) => Some(media_type.to_string()),
            (None, None) => None,
        };

        let (manifest, default_media_type) = match document {
            Document {
                manifests: Some(manifests),
                config: None,
                layers: None,
                ..
            } => (Manifest::List(ManifestList { manifests }), OCI_INDEX_V1),
            Document {
                config: Some(config),
                layers,
                manifests: None,
                ..
            } => (
                Manifest::Image(ImageManifest {
                    config,
                    layers: layers.unwrap_or_default(),
                }),
                OCI_MANIFEST_V1,
            ),
            _ => {
                return Err(RegistryError::manifest_invalid(
                    "document is neither an image manifest nor a manifest list",
                ));
            }
        };

        let media_type = declared.unwrap_or_else(|| default_media_type.to_string());
        let allowed = match manifest {
            Manifest::Image(_) => IMAGE_MEDIA_TYPES,
            Manifest::List(_) => LIST_MEDIA_TYPES,
        };
        if !allowed.contains(&media_type.as_str()) {
            return Err(RegistryError::manifest_invalid(format!(
                "media type {media_type} does not match the document shape"
            )));
        }

        Ok(ParsedManifest {
            media_type,
            manifest,
        })
    }
}

/// Guess a media type for stored content that has no recorded media type.
pub fn detect_media_type(content: &[u8]) -> String {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(content) else {
        return OCI_MANIFEST_V1.to_string();
    };

    if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
        return media_type.to_string();
    }

    if json.get("manifests").is_some() {
        OCI_INDEX_V1.to_string()
    } else {
        OCI_MANIFEST_V1.to_string()
    }
}
