//! Filesystem parser for the content repository layout.
//!
//! ```text
//! data/<slug>/<slug>[.<locale>].yml    item
//! data/<slug>/<slug>[.<locale>].md     optional long description
//! categories[.<locale>].yml            [{id, name, description?, icon?}]
//! tags[.<locale>].yml                  [{id, name}]
//! collections[.<locale>].yml           [{id, name, description?, icon?, items}]
//! pages/<slug>[.<locale>].md           front matter {title, description?} + body
//! ```
//!
//! A locale-specific file wins over the default one when both exist.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{Category, Collection, ContentSnapshot, Item, Page, Tag};
use crate::types::Locale;

/// Errors produced while parsing a working copy. Cloneable so one failed
/// build can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The working copy does not have the expected layout (or is absent).
    #[error("content structure missing: {}", .path.display())]
    MissingStructure { path: PathBuf },
    /// A file exists but its contents could not be interpreted.
    #[error("malformed content in {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
    /// A file could not be read.
    #[error("failed to read {}: {reason}", .path.display())]
    Io { path: PathBuf, reason: String },
}

impl ParseError {
    /// File or directory the error refers to.
    pub fn path(&self) -> &Path {
        match self {
            ParseError::MissingStructure { path }
            | ParseError::Malformed { path, .. }
            | ParseError::Io { path, .. } => path,
        }
    }

    fn io(path: &Path, err: io::Error) -> Self {
        ParseError::Io {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    fn malformed(path: &Path, reason: impl ToString) -> Self {
        ParseError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Turns a working copy into a [`ContentSnapshot`] for one locale.
pub trait ContentParser: Send + Sync {
    fn parse_locale(&self, root: &Path, locale: &Locale) -> Result<ContentSnapshot, ParseError>;
}

/// `category:` accepts a single id or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ItemFile {
    name: String,
    description: Option<String>,
    source_url: Option<String>,
    category: Option<OneOrMany>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    featured: bool,
    icon_url: Option<String>,
    updated_at: Option<String>,
    #[serde(default)]
    collections: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PageFrontMatter {
    title: String,
    description: Option<String>,
}

/// Parser for the on-disk layout described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsContentParser;

impl FsContentParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_items(&self, data_dir: &Path, locale: &Locale) -> Result<Vec<Item>, ParseError> {
        let mut items = Vec::new();
        for dir in sorted_entries(data_dir)? {
            if !dir.is_dir() {
                continue;
            }
            let Some(slug) = visible_name(&dir) else {
                continue;
            };
            let Some(yml) = localized(&dir, &slug, "yml", locale) else {
                log::debug!("Skipping {}: no {}.yml", dir.display(), slug);
                continue;
            };

            let file: ItemFile = read_yaml(&yml)?;
            if file.name.trim().is_empty() {
                return Err(ParseError::malformed(&yml, "item name must not be empty"));
            }
            let body = match localized(&dir, &slug, "md", locale) {
                Some(md) => Some(read_text(&md)?),
                None => None,
            };

            items.push(Item {
                slug,
                name: file.name,
                description: file.description,
                body,
                source_url: file.source_url,
                categories: file.category.map(OneOrMany::into_vec).unwrap_or_default(),
                tags: file.tags,
                featured: file.featured,
                icon_url: file.icon_url,
                updated_at: file.updated_at,
                collections: file.collections,
            });
        }
        Ok(items)
    }

    fn parse_pages(&self, pages_dir: &Path, locale: &Locale) -> Result<Vec<Page>, ParseError> {
        if !pages_dir.is_dir() {
            return Ok(Vec::new());
        }

        // Base pages plus pages that only exist in this locale.
        let mut slugs = BTreeSet::new();
        for path in sorted_entries(pages_dir)? {
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match stem.split_once('.') {
                None => {
                    slugs.insert(stem.to_string());
                }
                Some((slug, suffix)) if suffix == locale.as_str() => {
                    slugs.insert(slug.to_string());
                }
                Some(_) => {}
            }
        }

        let mut pages = Vec::with_capacity(slugs.len());
        for slug in slugs {
            let Some(path) = localized(pages_dir, &slug, "md", locale) else {
                continue;
            };
            let text = read_text(&path)?;
            let (front, body) = split_front_matter(&text)
                .ok_or_else(|| ParseError::malformed(&path, "missing front matter"))?;
            let meta: PageFrontMatter =
                serde_yaml::from_str(front).map_err(|e| ParseError::malformed(&path, e))?;
            pages.push(Page {
                slug,
                title: meta.title,
                description: meta.description,
                body: body.trim_start_matches(['\r', '\n']).to_string(),
            });
        }
        Ok(pages)
    }
}

impl ContentParser for FsContentParser {
    fn parse_locale(&self, root: &Path, locale: &Locale) -> Result<ContentSnapshot, ParseError> {
        let data_dir = root.join("data");
        if !data_dir.is_dir() {
            return Err(ParseError::MissingStructure { path: data_dir });
        }

        let items = self.parse_items(&data_dir, locale)?;
        let categories: Vec<Category> = read_optional_list(root, "categories", locale)?;
        let tags: Vec<Tag> = read_optional_list(root, "tags", locale)?;
        let collections: Vec<Collection> = read_optional_list(root, "collections", locale)?;
        let pages = self.parse_pages(&root.join("pages"), locale)?;

        report_dangling(&items, &categories, &tags, &collections);

        log::debug!(
            "Parsed {} items, {} categories, {} tags, {} collections, {} pages for {}",
            items.len(),
            categories.len(),
            tags.len(),
            collections.len(),
            pages.len(),
            locale
        );

        Ok(ContentSnapshot::new(
            locale.clone(),
            items,
            categories,
            tags,
            collections,
            pages,
        ))
    }
}

/// `<dir>/<stem>.<locale>.<ext>` if it exists, else `<dir>/<stem>.<ext>` if
/// that exists.
fn localized(dir: &Path, stem: &str, ext: &str, locale: &Locale) -> Option<PathBuf> {
    let specific = dir.join(format!("{}.{}.{}", stem, locale, ext));
    if specific.is_file() {
        return Some(specific);
    }
    let fallback = dir.join(format!("{}.{}", stem, ext));
    fallback.is_file().then_some(fallback)
}

fn read_optional_list<T: DeserializeOwned>(
    root: &Path,
    stem: &str,
    locale: &Locale,
) -> Result<Vec<T>, ParseError> {
    match localized(root, stem, "yml", locale) {
        // An empty file is an empty list.
        Some(path) => Ok(read_yaml::<Option<Vec<T>>>(&path)?.unwrap_or_default()),
        None => Ok(Vec::new()),
    }
}

fn read_text(path: &Path) -> Result<String, ParseError> {
    fs::read_to_string(path).map_err(|e| ParseError::io(path, e))
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ParseError> {
    let text = read_text(path)?;
    serde_yaml::from_str(&text).map_err(|e| ParseError::malformed(path, e))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ParseError> {
    let mut paths = fs::read_dir(dir)
        .map_err(|e| ParseError::io(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ParseError::io(dir, e))?;
    paths.sort();
    Ok(paths)
}

/// File name as UTF-8, skipping dotfiles.
fn visible_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (!name.starts_with('.')).then(|| name.to_string())
}

/// Split `---\n<yaml>\n---\n<body>`. Returns `None` without front matter.
fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let rest = text.strip_prefix("---")?;
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn report_dangling(
    items: &[Item],
    categories: &[Category],
    tags: &[Tag],
    collections: &[Collection],
) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let category_ids: HashSet<&str> = categories.iter().map(|c| c.id.as_str()).collect();
    let tag_ids: HashSet<&str> = tags.iter().map(|t| t.id.as_str()).collect();
    let item_slugs: HashSet<&str> = items.iter().map(|i| i.slug.as_str()).collect();

    for item in items {
        for category in item.categories.iter().filter(|c| !category_ids.contains(c.as_str())) {
            log::debug!("Item {} references unknown category {}", item.slug, category);
        }
        for tag in item.tags.iter().filter(|t| !tag_ids.contains(t.as_str())) {
            log::debug!("Item {} references unknown tag {}", item.slug, tag);
        }
    }
    for collection in collections {
        for slug in collection.items.iter().filter(|s| !item_slugs.contains(s.as_str())) {
            log::debug!("Collection {} references unknown item {}", collection.id, slug);
        }
    }
}
