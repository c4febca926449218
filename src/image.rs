//! Image pull: fetches a registry manifest, resolves a platform-specific
//! variant, and unpacks the layer archives into a rootfs directory.
//!
//! This is the collaborator the container lifecycle depends on only
//! through "a path to a ready root filesystem". Layers are unpacked in
//! manifest order directly into the output directory; there is no layer
//! cache or content store.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

const REGISTRY: &str = "https://registry-1.docker.io";
const AUTH_URL: &str = "https://auth.docker.io/token";

const INDEX_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];
const IMAGE_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
];

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformInfo {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<PlatformInfo>,
}

/// A manifest response, either a multi-arch index (`manifests` set) or a
/// concrete image manifest (`layers` set), told apart by media type.
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    manifests: Vec<IndexEntry>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// Splits an `image[:tag]` reference, defaulting the tag to `latest`.
pub fn parse_reference(reference: &str) -> (&str, &str) {
    match reference.split_once(':') {
        Some((name, tag)) => (name, tag),
        None => (reference, "latest"),
    }
}

/// Downloads `image:tag` and unpacks its layers into `output_dir`,
/// leaving a ready-to-use root filesystem there.
pub fn pull(image: &str, tag: &str, output_dir: &Path) -> Result<()> {
    let client = reqwest::blocking::Client::new();
    let token = fetch_token(&client, image)?;

    let mut manifest = fetch_manifest(&client, &token, image, tag)?;
    if INDEX_MEDIA_TYPES.contains(&manifest.media_type.as_str()) {
        let digest = select_platform_digest(&manifest.manifests)?;
        manifest = fetch_manifest(&client, &token, image, &digest)?;
    }
    if !IMAGE_MEDIA_TYPES.contains(&manifest.media_type.as_str()) {
        bail!("unsupported manifest media type: {}", manifest.media_type);
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    for layer in &manifest.layers {
        unpack_layer(&client, &token, image, &layer.digest, output_dir)?;
    }

    tracing::info!(image, tag, rootfs = %output_dir.display(), "image pulled");
    Ok(())
}

fn fetch_token(client: &reqwest::blocking::Client, image: &str) -> Result<String> {
    let response: TokenResponse = client
        .get(AUTH_URL)
        .query(&[
            ("service", "registry.docker.io"),
            ("scope", &format!("repository:{image}:pull")),
        ])
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .with_context(|| format!("failed to obtain a pull token for {image}"))?
        .json()
        .context("malformed token response")?;
    Ok(response.token)
}

fn fetch_manifest(
    client: &reqwest::blocking::Client,
    token: &str,
    image: &str,
    reference: &str,
) -> Result<Manifest> {
    let url = format!("{REGISTRY}/v2/{image}/manifests/{reference}");
    let accept = INDEX_MEDIA_TYPES
        .iter()
        .chain(IMAGE_MEDIA_TYPES.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(",");
    let response = client
        .get(&url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, accept)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .with_context(|| format!("failed to fetch manifest {url}"))?;

    // Some registries omit mediaType in the body; the Content-Type
    // header carries it in that case.
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response
        .bytes()
        .with_context(|| format!("failed to read manifest body from {url}"))?;
    let mut manifest: Manifest = serde_json::from_slice(&body)
        .with_context(|| format!("malformed manifest from {url}"))?;
    if manifest.media_type.is_empty() {
        manifest.media_type = content_type;
    }
    Ok(manifest)
}

/// Picks the entry matching the current OS and architecture out of a
/// multi-arch index, falling back to the first entry with a warning.
fn select_platform_digest(entries: &[IndexEntry]) -> Result<String> {
    let os = std::env::consts::OS;
    let arch = registry_arch(std::env::consts::ARCH);
    for entry in entries {
        if let Some(platform) = &entry.platform {
            if platform.os == os && platform.architecture == arch {
                return Ok(entry.digest.clone());
            }
        }
    }
    let Some(first) = entries.first() else {
        bail!("manifest index contains no platform entries");
    };
    tracing::warn!(os, arch, "no matching platform found, using the first manifest");
    Ok(first.digest.clone())
}

/// Maps Rust's architecture names onto the registry's.
fn registry_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Streams one gzipped layer tarball from the blob store straight into
/// the output directory.
fn unpack_layer(
    client: &reqwest::blocking::Client,
    token: &str,
    image: &str,
    digest: &str,
    output_dir: &Path,
) -> Result<()> {
    tracing::info!(digest, "downloading layer");
    let url = format!("{REGISTRY}/v2/{image}/blobs/{digest}");
    let response = client
        .get(&url)
        .bearer_auth(token)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .with_context(|| format!("failed to download layer {digest}"))?;

    let decoder = flate2::read::GzDecoder::new(response);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(output_dir)
        .with_context(|| format!("failed to unpack layer {digest}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_splits_name_and_tag() {
        assert_eq!(parse_reference("library/alpine:3.20"), ("library/alpine", "3.20"));
    }

    #[test]
    fn reference_defaults_to_latest() {
        assert_eq!(parse_reference("library/alpine"), ("library/alpine", "latest"));
    }

    #[test]
    fn registry_arch_maps_common_names() {
        assert_eq!(registry_arch("x86_64"), "amd64");
        assert_eq!(registry_arch("aarch64"), "arm64");
        assert_eq!(registry_arch("riscv64"), "riscv64");
    }

    #[test]
    fn platform_selection_prefers_an_exact_match() {
        let entries = vec![
            IndexEntry {
                digest: "sha256:other".to_string(),
                platform: Some(PlatformInfo {
                    os: "linux".to_string(),
                    architecture: "s390x".to_string(),
                }),
            },
            IndexEntry {
                digest: "sha256:mine".to_string(),
                platform: Some(PlatformInfo {
                    os: std::env::consts::OS.to_string(),
                    architecture: registry_arch(std::env::consts::ARCH).to_string(),
                }),
            },
        ];
        assert_eq!(select_platform_digest(&entries).unwrap(), "sha256:mine");
    }

    #[test]
    fn platform_selection_falls_back_to_the_first_entry() {
        let entries = vec![IndexEntry {
            digest: "sha256:fallback".to_string(),
            platform: Some(PlatformInfo {
                os: "plan9".to_string(),
                architecture: "mips".to_string(),
            }),
        }];
        assert_eq!(select_platform_digest(&entries).unwrap(), "sha256:fallback");
    }

    #[test]
    fn empty_index_is_an_error() {
        assert!(select_platform_digest(&[]).is_err());
    }

    #[test]
    fn manifest_body_parses_as_an_index() {
        let body = br#"{
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"digest": "sha256:abc", "platform": {"os": "linux", "architecture": "amd64"}}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_slice(body).unwrap();
        assert!(INDEX_MEDIA_TYPES.contains(&manifest.media_type.as_str()));
        assert_eq!(manifest.manifests.len(), 1);
        assert!(manifest.layers.is_empty());
    }

    #[test]
    fn manifest_body_parses_as_an_image_manifest() {
        let body = br#"{
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "layers": [{"digest": "sha256:layer0", "size": 42}]
        }"#;
        let manifest: Manifest = serde_json::from_slice(body).unwrap();
        assert!(IMAGE_MEDIA_TYPES.contains(&manifest.media_type.as_str()));
        assert_eq!(manifest.layers[0].digest, "sha256:layer0");
    }

    #[test]
    fn index_and_image_media_types_are_disjoint() {
        for media_type in INDEX_MEDIA_TYPES {
            assert!(!IMAGE_MEDIA_TYPES.contains(&media_type));
        }
    }
}
