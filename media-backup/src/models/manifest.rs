//! Manifest describing the asset set of one backup run.
//!
//! Serialized as `metadata.json` at the top of the staging tree, written
//! once before archiving and never modified afterwards.

use super::asset::Asset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const MANIFEST_FILE: &str = "metadata.json";

/// Folder scope requested for a run: every folder, or a named list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderScope {
    All,
    Named(Vec<String>),
}

impl FolderScope {
    pub fn from_folders(folders: &[String]) -> Self {
        if folders.is_empty() {
            FolderScope::All
        } else {
            FolderScope::Named(folders.to_vec())
        }
    }
}

impl Serialize for FolderScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FolderScope::All => serializer.serialize_str("all"),
            FolderScope::Named(folders) => folders.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FolderScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Marker(String),
            List(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Marker(s) if s == "all" => Ok(FolderScope::All),
            Repr::Marker(s) => Err(serde::de::Error::custom(format!(
                "unexpected folder scope {:?}",
                s
            ))),
            Repr::List(folders) => Ok(FolderScope::Named(folders)),
        }
    }
}

/// Backup manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub timestamp: DateTime<Utc>,
    pub total_assets: usize,
    pub folders: FolderScope,
    pub assets: Vec<Asset>,
}

impl Manifest {
    pub fn new(folders: FolderScope, assets: Vec<Asset>) -> Self {
        Self {
            timestamp: Utc::now(),
            total_assets: assets.len(),
            folders,
            assets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::ResourceType;

    #[test]
    fn test_folder_scope_json_shape() {
        assert_eq!(serde_json::to_string(&FolderScope::All).unwrap(), r#""all""#);
        assert_eq!(
            serde_json::to_string(&FolderScope::Named(vec!["avatars".into()])).unwrap(),
            r#"["avatars"]"#
        );

        let all: FolderScope = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(all, FolderScope::All);
        let named: FolderScope = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(named, FolderScope::Named(vec!["a".into(), "b".into()]));
        assert!(serde_json::from_str::<FolderScope>(r#""some""#).is_err());
    }

    #[test]
    fn test_manifest_counts_and_keys() {
        let assets = vec![Asset {
            public_id: "avatars/u1".into(),
            format: "png".into(),
            resource_type: ResourceType::Image,
            delivery_type: "upload".into(),
            created_at: None,
            bytes: 3,
            secure_url: "https://res.example.com/u1.png".into(),
        }];
        let manifest = Manifest::new(FolderScope::from_folders(&[]), assets);
        assert_eq!(manifest.total_assets, manifest.assets.len());

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["totalAssets"], 1);
        assert_eq!(json["folders"], "all");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["assets"][0]["public_id"], "avatars/u1");

        let parsed: Manifest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.total_assets, 1);
    }
}
