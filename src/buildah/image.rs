//! Images in local buildah storage.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{BuildahCli, args};
use crate::error::{Error, Result};

/// One entry of `buildah images --json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub names: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ImageSummary {
    /// Whether `reference` names this image: full or short id, exact name,
    /// or a name whose last path segments equal the reference. An untagged
    /// reference matches `:latest`.
    pub fn matches(&self, reference: &str) -> bool {
        if self.id == reference || (reference.len() >= 12 && self.id.starts_with(reference)) {
            return true;
        }
        let tagged = format!("{reference}:latest");
        let candidates = if has_tag(reference) {
            vec![reference]
        } else {
            vec![reference, tagged.as_str()]
        };
        self.names.iter().any(|name| {
            candidates.iter().copied().any(|want| {
                name.as_str() == want
                    || name
                        .strip_suffix(want)
                        .is_some_and(|prefix| prefix.ends_with('/'))
            })
        })
    }
}

fn has_tag(reference: &str) -> bool {
    if reference.contains('@') {
        return true;
    }
    let last = reference.rsplit('/').next().unwrap_or(reference);
    last.contains(':')
}

/// A resolved image, identified by its id.
#[derive(Clone)]
pub struct Image {
    id: String,
    cli: Arc<dyn BuildahCli>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").field("id", &self.id).finish()
    }
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

impl Image {
    /// Wraps an id that is already known to exist locally.
    pub fn from_id(cli: Arc<dyn BuildahCli>, id: impl Into<String>) -> Self {
        Self { id: id.into(), cli }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Finds `reference` in local storage, pulling it on a miss.
    ///
    /// # Errors
    ///
    /// [`Error::ImageNotFound`] if the image is not local and cannot be
    /// pulled.
    pub async fn resolve(cli: &Arc<dyn BuildahCli>, reference: &str) -> Result<Self> {
        let local = Self::list(cli, None, false).await?;
        if let Some(found) = local.iter().find(|img| img.matches(reference)) {
            debug!(reference, id = %found.id, "Image found locally");
            return Ok(Self::from_id(cli.clone(), found.id.clone()));
        }

        info!(reference, "Image not found locally, pulling");
        let out = cli
            .exec(args(["pull", "--quiet", reference]), None)
            .await
            .map_err(|_| Error::ImageNotFound(reference.to_string()))?;
        let id = last_line(&out.stdout)
            .ok_or_else(|| Error::ImageNotFound(reference.to_string()))?;
        Ok(Self::from_id(cli.clone(), id))
    }

    /// Pulls `name` unconditionally.
    pub async fn pull(cli: &Arc<dyn BuildahCli>, name: &str) -> Result<Self> {
        let out = cli
            .exec(args(["pull", "--quiet", name]), None)
            .await
            .map_err(|_| Error::ImageNotFound(name.to_string()))?;
        let id = last_line(&out.stdout).ok_or_else(|| Error::ImageNotFound(name.to_string()))?;
        info!(name, id = %id, "Pulled image");
        Ok(Self::from_id(cli.clone(), id))
    }

    /// Lists local images, optionally filtered by name. `all` includes
    /// intermediate images.
    pub async fn list(
        cli: &Arc<dyn BuildahCli>,
        name: Option<&str>,
        all: bool,
    ) -> Result<Vec<ImageSummary>> {
        let mut cmd = args(["images", "--json"]);
        if all {
            cmd.push("--all".to_string());
        }
        if let Some(name) = name {
            cmd.push(name.to_string());
        }
        let out = cli.exec(cmd, None).await?;
        let trimmed = out.stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    /// Adds a name to this image.
    pub async fn add_tag(&self, tag: &str) -> Result<()> {
        self.cli
            .exec(args(["tag", self.id.as_str(), tag]), None)
            .await?;
        Ok(())
    }

    pub async fn inspect(&self) -> Result<Value> {
        let out = self
            .cli
            .exec(args(["inspect", "--type", "image", self.id.as_str()]), None)
            .await?;
        Ok(serde_json::from_str(&out.stdout)?)
    }

    /// Removes the image from local storage.
    pub async fn remove(self) -> Result<()> {
        self.cli.exec(args(["rmi", self.id.as_str()]), None).await?;
        Ok(())
    }
}

fn last_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}
