//! Parsed content and the read-through cache that serves it.
//!
//! A [`ContentSnapshot`] is the immutable, locale-scoped view of the mirror
//! produced by a [`ContentParser`]. The [`ContentCache`] hands snapshots out
//! as `Arc`s and rebuilds them lazily when the sync generation moves.

mod cache;
mod parser;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use cache::{CacheEntry, CacheError, ContentCache, EntryInfo};
pub use parser::{ContentParser, FsContentParser, ParseError};

use crate::types::Locale;

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    /// Markdown long description, if the item ships one.
    pub body: Option<String>,
    pub source_url: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub featured: bool,
    pub icon_url: Option<String>,
    pub updated_at: Option<String>,
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    /// Item slugs listed explicitly by the collection file.
    #[serde(default)]
    pub items: Vec<String>,
}

/// A static page (`pages/<slug>.md`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub body: String,
}

/// Entity counts of a snapshot, used by status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub locale: Locale,
    pub items: usize,
    pub categories: usize,
    pub tags: usize,
    pub collections: usize,
    pub pages: usize,
}

/// Immutable parsed content for one locale, with lookup indexes.
#[derive(Debug, Clone)]
pub struct ContentSnapshot {
    locale: Locale,
    items: Vec<Item>,
    categories: Vec<Category>,
    tags: Vec<Tag>,
    collections: Vec<Collection>,
    pages: Vec<Page>,
    item_by_slug: HashMap<String, usize>,
    items_by_category: HashMap<String, Vec<usize>>,
    items_by_tag: HashMap<String, Vec<usize>>,
    collection_members: HashMap<String, Vec<usize>>,
    page_by_slug: HashMap<String, usize>,
}

impl ContentSnapshot {
    /// Build a snapshot and its indexes. Entities are ordered by slug/id.
    ///
    /// Collection membership is the union of the collection's own `items`
    /// list and every item naming the collection in its `collections`.
    pub fn new(
        locale: Locale,
        mut items: Vec<Item>,
        mut categories: Vec<Category>,
        mut tags: Vec<Tag>,
        mut collections: Vec<Collection>,
        mut pages: Vec<Page>,
    ) -> Self {
        items.sort_by(|a, b| a.slug.cmp(&b.slug));
        categories.sort_by(|a, b| a.id.cmp(&b.id));
        tags.sort_by(|a, b| a.id.cmp(&b.id));
        collections.sort_by(|a, b| a.id.cmp(&b.id));
        pages.sort_by(|a, b| a.slug.cmp(&b.slug));

        let item_by_slug: HashMap<String, usize> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.slug.clone(), i))
            .collect();

        let mut items_by_category: HashMap<String, Vec<usize>> = HashMap::new();
        let mut items_by_tag: HashMap<String, Vec<usize>> = HashMap::new();
        let mut collection_members: HashMap<String, Vec<usize>> = HashMap::new();

        for (i, item) in items.iter().enumerate() {
            for category in &item.categories {
                items_by_category.entry(category.clone()).or_default().push(i);
            }
            for tag in &item.tags {
                items_by_tag.entry(tag.clone()).or_default().push(i);
            }
            for collection in &item.collections {
                collection_members
                    .entry(collection.clone())
                    .or_default()
                    .push(i);
            }
        }

        for collection in &collections {
            let members = collection_members.entry(collection.id.clone()).or_default();
            for slug in &collection.items {
                if let Some(&i) = item_by_slug.get(slug) {
                    members.push(i);
                }
            }
        }
        for members in collection_members.values_mut() {
            members.sort_unstable();
            members.dedup();
        }

        let page_by_slug = pages
            .iter()
            .enumerate()
            .map(|(i, page)| (page.slug.clone(), i))
            .collect();

        Self {
            locale,
            items,
            categories,
            tags,
            collections,
            pages,
            item_by_slug,
            items_by_category,
            items_by_tag,
            collection_members,
            page_by_slug,
        }
    }

    pub fn locale(&self) -> &Locale {
        &self.locale
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn item(&self, slug: &str) -> Option<&Item> {
        self.item_by_slug.get(slug).map(|&i| &self.items[i])
    }

    pub fn page(&self, slug: &str) -> Option<&Page> {
        self.page_by_slug.get(slug).map(|&i| &self.pages[i])
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn items_in_category(&self, category: &str) -> Vec<&Item> {
        self.resolve(self.items_by_category.get(category))
    }

    pub fn items_with_tag(&self, tag: &str) -> Vec<&Item> {
        self.resolve(self.items_by_tag.get(tag))
    }

    pub fn collection_items(&self, collection: &str) -> Vec<&Item> {
        self.resolve(self.collection_members.get(collection))
    }

    pub fn featured_items(&self) -> Vec<&Item> {
        self.items.iter().filter(|item| item.featured).collect()
    }

    pub fn summary(&self) -> ContentSummary {
        ContentSummary {
            locale: self.locale.clone(),
            items: self.items.len(),
            categories: self.categories.len(),
            tags: self.tags.len(),
            collections: self.collections.len(),
            pages: self.pages.len(),
        }
    }

    fn resolve(&self, indexes: Option<&Vec<usize>>) -> Vec<&Item> {
        indexes
            .map(|indexes| indexes.iter().map(|&i| &self.items[i]).collect())
            .unwrap_or_default()
    }
}
