use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Folder name used in staging trees for assets without a folder.
pub const ROOT_FOLDER: &str = "root";

/// Kind of remote resource, as the media store classifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Image,
    Video,
    Raw,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [ResourceType::Image, ResourceType::Video, ResourceType::Raw];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Image => "image",
            ResourceType::Video => "video",
            ResourceType::Raw => "raw",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one remote media object.
///
/// `public_id` is a flat key; a `/` inside it denotes the logical folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub public_id: String,

    #[serde(default)]
    pub format: String,

    pub resource_type: ResourceType,

    /// Delivery type (`upload`, `private`, ...)
    #[serde(rename = "type", default = "default_delivery_type")]
    pub delivery_type: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub bytes: u64,

    #[serde(rename = "url")]
    pub secure_url: String,
}

fn default_delivery_type() -> String {
    "upload".to_string()
}

impl Asset {
    /// Logical folder, i.e. everything before the last `/`.
    pub fn folder(&self) -> Option<&str> {
        self.public_id.rsplit_once('/').map(|(folder, _)| folder)
    }

    /// Last segment of the public id.
    pub fn basename(&self) -> &str {
        self.public_id
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.public_id)
    }

    /// File name used in the staging tree: `<basename>.<format>`.
    pub fn file_name(&self) -> String {
        if self.format.is_empty() {
            self.basename().to_string()
        } else {
            format!("{}.{}", self.basename(), self.format)
        }
    }

    /// Staging sub-directory for this asset (`root` when it has no folder).
    pub fn staging_dir(&self) -> &str {
        self.folder().unwrap_or(ROOT_FOLDER)
    }
}

/// Build the public id a staged file restores to.
///
/// `folder` is the `/`-joined directory path relative to the staging root;
/// the literal `root` folder maps to an unfoldered asset.
pub fn public_id_for(folder: &str, stem: &str) -> String {
    if folder.is_empty() || folder == ROOT_FOLDER {
        stem.to_string()
    } else {
        format!("{}/{}", folder, stem)
    }
}
