//! Asset enumeration across resource types and folders.

use crate::models::{Asset, ResourceType};
use crate::provider::{ListRequest, MediaStore, ProviderError};
use std::collections::HashSet;
use tracing::{debug, info};

/// List every asset in the given folders, or in the whole account when
/// `folders` is empty.
///
/// Pages are followed until the store reports no cursor. An authentication
/// failure (or any other listing error) aborts the whole enumeration so no
/// partial manifest is ever produced. Assets reachable through more than one
/// folder prefix are returned once.
pub async fn list_assets(store: &dyn MediaStore, folders: &[String]) -> Result<Vec<Asset>, ProviderError> {
    let prefixes: Vec<Option<String>> = if folders.is_empty() {
        vec![None]
    } else {
        folders
            .iter()
            .map(|f| Some(format!("{}/", f.trim_matches('/'))))
            .collect()
    };

    let mut seen: HashSet<(ResourceType, String)> = HashSet::new();
    let mut assets = Vec::new();

    for resource_type in ResourceType::ALL {
        for prefix in &prefixes {
            let mut cursor = None;
            let mut pages = 0usize;

            loop {
                let request = ListRequest {
                    resource_type,
                    prefix: prefix.clone(),
                    cursor,
                };
                let page = store.list_page(&request).await?;
                pages += 1;

                for asset in page.assets {
                    if seen.insert((asset.resource_type, asset.public_id.clone())) {
                        assets.push(asset);
                    }
                }

                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }

            debug!(
                "Enumerated {} resources under {} in {} pages",
                resource_type,
                prefix.as_deref().unwrap_or("*"),
                pages
            );
        }
    }

    info!("Enumerated {} assets", assets.len());
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeMediaStore;

    fn seeded() -> FakeMediaStore {
        let store = FakeMediaStore::new();
        store.set_page_size(2);
        for i in 0..5 {
            store.add_asset(&format!("avatars/u{}", i), ResourceType::Image, "png", b"img");
        }
        store.add_asset("events/2024/clip", ResourceType::Video, "mp4", b"vid");
        store.add_asset("logo", ResourceType::Image, "svg", b"svg");
        store.add_asset("bylaws", ResourceType::Raw, "pdf", b"pdf");
        store
    }

    #[tokio::test]
    async fn test_whole_account_follows_pagination() {
        let store = seeded();
        let assets = list_assets(&store, &[]).await.unwrap();
        assert_eq!(assets.len(), 8);
    }

    #[tokio::test]
    async fn test_folder_scope() {
        let store = seeded();
        let assets = list_assets(&store, &["avatars".to_string(), "events".to_string()])
            .await
            .unwrap();
        assert_eq!(assets.len(), 6);
        assert!(assets.iter().all(|a| a.folder().is_some()));
    }

    #[tokio::test]
    async fn test_overlapping_folders_are_deduplicated() {
        let store = seeded();
        let assets = list_assets(&store, &["events".to_string(), "events/2024".to_string()])
            .await
            .unwrap();
        assert_eq!(assets.len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_aborts() {
        let store = seeded();
        store.set_unauthorized(true);
        let err = list_assets(&store, &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unauthorized(_)));
    }
}
