//! Tag derivation and the image definitions handoff file.
//!
//! The build stage publishes `imagedefinitions.json`, a one-element array of
//! `{"name": <container>, "imageUri": <uri>}`, so that later stages consume
//! the same artifact instead of looking it up again.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use cutover_core::{ArtifactReference, DeployError, DeployResult, Digest};

/// Length of the commit prefix used as the image tag.
const TAG_LEN: usize = 7;

/// One entry of `imagedefinitions.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    pub name: String,
    #[serde(rename = "imageUri")]
    pub image_uri: String,
}

/// Image tag for a commit: its first seven characters, or `latest` when empty.
pub fn image_tag_for_commit(commit: &str) -> String {
    let commit = commit.trim();
    if commit.is_empty() {
        "latest".to_string()
    } else {
        commit.chars().take(TAG_LEN).collect()
    }
}

/// Content digest (`sha256:<hex>`) of raw artifact bytes.
pub fn content_digest(bytes: &[u8]) -> Digest {
    let hash = Sha256::digest(bytes);
    // A lowercase hex string always satisfies the digest format.
    Digest::parse(&format!("sha256:{}", hex::encode(hash)))
        .unwrap_or_else(|_| unreachable!("sha256 hex is a valid digest"))
}

/// Write `imagedefinitions.json` for `artifact` into `dir`.
pub fn write_image_definitions(
    dir: &Path,
    container_name: &str,
    artifact: &ArtifactReference,
) -> DeployResult<std::path::PathBuf> {
    let defs = vec![ImageDefinition {
        name: container_name.to_string(),
        image_uri: artifact.image_uri(),
    }];
    let json = serde_json::to_vec_pretty(&defs)
        .map_err(|e| DeployError::Configuration(format!("image definitions: {e}")))?;
    let path = dir.join("imagedefinitions.json");
    std::fs::write(&path, json).map_err(|e| {
        DeployError::Configuration(format!("cannot write {}: {e}", path.display()))
    })?;
    Ok(path)
}

/// Parse an image definitions document and return the URI for `container_name`.
pub fn parse_image_definitions(json: &str, container_name: &str) -> DeployResult<String> {
    let defs: Vec<ImageDefinition> = serde_json::from_str(json)
        .map_err(|e| DeployError::Configuration(format!("malformed image definitions: {e}")))?;
    defs.into_iter()
        .find(|d| d.name == container_name)
        .map(|d| d.image_uri)
        .ok_or_else(|| {
            DeployError::Configuration(format!(
                "image definitions have no entry for container '{container_name}'"
            ))
        })
}
