use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::types::ItemRef;

pub const MANIFEST_FILE: &str = "catalog.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("catalog has no items")]
    Empty,
}

/// One entry of `catalog.json`. Field names follow the tracker API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub wiki_link: Option<String>,
    /// Icon file relative to the catalog directory; `<id>.png` when absent.
    #[serde(default)]
    pub icon: Option<String>,
}

/// An inventory item to look for, with its decoded reference icon.
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub item: ItemRef,
    /// `None` when the icon could not be loaded; such items are never matched.
    pub icon: Option<Arc<DynamicImage>>,
    /// Near 1:1 icon close to the reference cell size; selects the fixed-pixel crop.
    pub is_square_icon: bool,
}

impl CatalogItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        icon: Option<Arc<DynamicImage>>,
        config: &DetectionConfig,
    ) -> Self {
        let is_square_icon = icon
            .as_ref()
            .is_some_and(|img| is_square_icon(img.width(), img.height(), config));
        Self {
            item: ItemRef {
                id: id.into(),
                name: name.into(),
                short_name: None,
                wiki_link: None,
            },
            icon,
            is_square_icon,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    pub fn name(&self) -> &str {
        &self.item.name
    }

    /// Icon with non-zero dimensions, if any.
    pub fn usable_icon(&self) -> Option<&DynamicImage> {
        self.icon
            .as_deref()
            .filter(|img| img.width() > 0 && img.height() > 0)
    }
}

/// Square-icon test: aspect within tolerance of 1:1 and mean side within
/// tolerance of the reference cell size.
pub fn is_square_icon(width: u32, height: u32, config: &DetectionConfig) -> bool {
    if width == 0 || height == 0 {
        return false;
    }

    let aspect = width as f32 / height as f32;
    let avg_dim = (width + height) as f32 / 2.0;
    let target = config.square_icon_reference_size as f32;
    let aspect_tol = config.square_icon_aspect_tolerance;
    let size_tol = config.square_icon_size_tolerance;

    (1.0 - aspect_tol..=1.0 + aspect_tol).contains(&aspect)
        && (target * (1.0 - size_tol)..=target * (1.0 + size_tol)).contains(&avg_dim)
}

/// Read-only catalog for the duration of one or more detection runs.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: Vec<CatalogItem>,
}

impl Catalog {
    /// Builds a catalog, dropping entries without an id.
    pub fn new(items: Vec<CatalogItem>) -> Self {
        let items = items
            .into_iter()
            .filter(|item| !item.id().is_empty())
            .collect();
        Self { items }
    }

    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items whose icon can actually be matched.
    pub fn loadable(&self) -> impl Iterator<Item = &CatalogItem> {
        self.items.iter().filter(|item| item.usable_icon().is_some())
    }
}

/// Load `catalog.json` and its icons from `dir`.
///
/// Icons that are missing or fail to decode are logged and leave the item
/// without an icon; the run reports them as skipped.
pub fn load_catalog(dir: &Path, config: &DetectionConfig) -> Result<Catalog, CatalogError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&manifest_path).map_err(|source| CatalogError::Io {
        path: manifest_path.clone(),
        source,
    })?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&raw)?;

    let mut items = Vec::with_capacity(entries.len());
    let mut loaded = 0usize;

    for entry in entries {
        if entry.id.is_empty() {
            tracing::warn!("skipping catalog entry {:?} without id", entry.name);
            continue;
        }

        let filename = entry
            .icon
            .clone()
            .unwrap_or_else(|| format!("{}.png", entry.id));
        let path = dir.join(&filename);

        let icon = match image::open(&path) {
            Ok(img) => {
                tracing::debug!(
                    "loaded icon {} ({}x{}) for {}",
                    path.display(),
                    img.width(),
                    img.height(),
                    entry.name
                );
                loaded += 1;
                Some(Arc::new(img))
            }
            Err(e) => {
                tracing::warn!("icon for {} unavailable ({}): {e}", entry.name, path.display());
                None
            }
        };

        let mut item = CatalogItem::new(entry.id, entry.name, icon, config);
        item.item.short_name = entry.short_name;
        item.item.wiki_link = entry.wiki_link;
        items.push(item);
    }

    if items.is_empty() {
        return Err(CatalogError::Empty);
    }

    tracing::info!("loaded catalog: {} item(s), {loaded} icon(s)", items.len());

    Ok(Catalog::new(items))
}
