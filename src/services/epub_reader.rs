/// EPUB Reader
///
/// Turns a local EPUB 2.x/3.x archive into a spine-ordered [`Book`]:
/// container.xml -> package document -> manifest/spine -> chapter list, with
/// chapter titles resolved from the EPUB 3 navigation document, the NCX, or
/// an href-derived fallback, and cover bytes discovered along the usual
/// fallback chain.
use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConversionError, Result};
use crate::models::{Book, Chapter};
use crate::services::archive::{BookArchive, ZipBookArchive};

const CONTAINER_PATH: &str = "META-INF/container.xml";
const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";

/// An element whose only interesting payload is its text content.
#[derive(Deserialize)]
struct TextElement {
    #[serde(rename = "$text", default)]
    value: String,
}

/// META-INF/container.xml
#[derive(Deserialize)]
struct Container {
    rootfiles: RootFiles,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RootFiles {
    #[serde(rename = "rootfile")]
    entries: Vec<RootFile>,
}

#[derive(Deserialize)]
struct RootFile {
    #[serde(rename = "@full-path")]
    full_path: Option<String>,
}

/// Package (OPF) document.
#[derive(Deserialize)]
struct Package {
    metadata: PackageMetadata,
    manifest: PackageManifest,
    spine: PackageSpine,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PackageMetadata {
    #[serde(rename = "title")]
    titles: Vec<TextElement>,
    #[serde(rename = "creator")]
    creators: Vec<TextElement>,
    #[serde(rename = "meta")]
    metas: Vec<MetaEntry>,
}

#[derive(Deserialize)]
struct MetaEntry {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@content")]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PackageManifest {
    #[serde(rename = "item")]
    items: Vec<ManifestEntry>,
}

#[derive(Deserialize)]
struct ManifestEntry {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@media-type")]
    media_type: Option<String>,
    #[serde(rename = "@properties")]
    properties: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PackageSpine {
    #[serde(rename = "itemref")]
    itemrefs: Vec<SpineItemRef>,
}

#[derive(Deserialize)]
struct SpineItemRef {
    #[serde(rename = "@idref")]
    idref: Option<String>,
}

/// EPUB 3 navigation document (XHTML).
#[derive(Deserialize)]
struct NavDoc {
    body: NavBody,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct NavBody {
    #[serde(rename = "nav")]
    navs: Vec<NavElement>,
}

#[derive(Deserialize)]
struct NavElement {
    #[serde(rename = "@type")]
    nav_type: Option<String>,
    #[serde(default, rename = "ol")]
    lists: Vec<NavList>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct NavList {
    #[serde(rename = "li")]
    items: Vec<NavListItem>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct NavListItem {
    a: Option<NavAnchor>,
    span: Option<NavAnchor>,
    ol: Option<NavList>,
}

#[derive(Deserialize)]
struct NavAnchor {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@title")]
    title: Option<String>,
    #[serde(rename = "$text", default)]
    text: String,
}

/// Legacy NCX table of contents.
#[derive(Deserialize)]
struct Ncx {
    #[serde(rename = "navMap")]
    nav_map: NcxNavMap,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct NcxNavMap {
    #[serde(rename = "navPoint")]
    points: Vec<NcxNavPoint>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct NcxNavPoint {
    #[serde(rename = "navLabel")]
    label: Option<NcxNavLabel>,
    content: Option<NcxContent>,
    #[serde(rename = "navPoint")]
    children: Vec<NcxNavPoint>,
}

#[derive(Deserialize)]
struct NcxNavLabel {
    text: Option<TextElement>,
}

#[derive(Deserialize)]
struct NcxContent {
    #[serde(rename = "@src")]
    src: Option<String>,
}

/// Manifest item with its href already resolved against the package dir.
struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
    properties: Option<String>,
}

pub struct EpubReader;

impl EpubReader {
    /// Parse an EPUB file into a [`Book`].
    pub fn read(path: &Path) -> Result<Book> {
        let archive = ZipBookArchive::open(path)?;
        Self::read_archive(&archive, path)
    }

    /// Parse from any [`BookArchive`]; `source_path` only feeds the title
    /// fallback.
    pub fn read_archive(archive: &dyn BookArchive, source_path: &Path) -> Result<Book> {
        if archive.has_entry(ENCRYPTION_PATH) {
            // No content decryption: surface DRM up front instead of failing
            // on unreadable chapter entries later.
            return Err(ConversionError::InvalidArchive(
                "the EPUB is encrypted and cannot be read".to_string(),
            ));
        }
        if !archive.has_entry(CONTAINER_PATH) {
            return Err(ConversionError::MissingContainer);
        }
        let container_xml = archive.entry_string(CONTAINER_PATH)?;
        let container: Container = quick_xml::de::from_str(&container_xml)
            .map_err(|e| ConversionError::InvalidArchive(format!("malformed container.xml: {e}")))?;

        let opf_path = container
            .rootfiles
            .entries
            .first()
            .and_then(|r| r.full_path.clone())
            .ok_or(ConversionError::MissingOpf)?;
        if !archive.has_entry(&opf_path) {
            return Err(ConversionError::MissingOpf);
        }
        let opf_dir = parent_dir(&opf_path);

        let opf_xml = archive.entry_string(&opf_path)?;
        let package: Package = quick_xml::de::from_str(&opf_xml).map_err(|e| {
            ConversionError::InvalidArchive(format!("malformed package document: {e}"))
        })?;

        let title = package
            .metadata
            .titles
            .iter()
            .map(|t| t.value.trim().to_string())
            .find(|t| !t.is_empty())
            .unwrap_or_else(|| file_stem(source_path));
        let author = package
            .metadata
            .creators
            .iter()
            .map(|c| c.value.trim().to_string())
            .find(|c| !c.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        let (manifest, by_id) = build_manifest(&package.manifest, &opf_dir);
        let title_map = build_title_map(archive, &manifest);
        let cover = discover_cover(archive, &package.metadata, &manifest, &by_id);

        let mut chapters = Vec::new();
        for itemref in &package.spine.itemrefs {
            let Some(idref) = itemref.idref.as_deref() else {
                continue;
            };
            let Some(&item_idx) = by_id.get(idref) else {
                log::warn!("[EpubReader] spine references unknown id {idref}");
                continue;
            };
            let item = &manifest[item_idx];
            if !is_html_media_type(&item.media_type) {
                continue;
            }
            if !archive.has_entry(&item.href) {
                log::warn!("[EpubReader] spine entry {} missing from archive", item.href);
                continue;
            }
            let html = archive.entry_bytes(&item.href)?;
            let index = chapters.len();
            let (chapter_title, title_from_toc) = match title_map.get(&item.href) {
                Some(label) => (label.clone(), true),
                None => (fallback_title(&item.href, index), false),
            };
            chapters.push(Chapter {
                index,
                title: chapter_title,
                title_from_toc,
                href: item.href.clone(),
                html,
            });
        }

        if chapters.is_empty() {
            return Err(ConversionError::EmptySpine);
        }

        log::info!(
            "[EpubReader] \"{}\" by {}: {} chapters, cover {}",
            title,
            author,
            chapters.len(),
            if cover.is_some() { "found" } else { "absent" }
        );

        Ok(Book {
            title,
            author,
            cover,
            chapters,
        })
    }
}

fn build_manifest(
    manifest: &PackageManifest,
    opf_dir: &str,
) -> (Vec<ManifestItem>, HashMap<String, usize>) {
    let mut items = Vec::new();
    let mut by_id = HashMap::new();
    for entry in &manifest.items {
        let (Some(id), Some(href)) = (entry.id.as_deref(), entry.href.as_deref()) else {
            continue;
        };
        let resolved = resolve_href(opf_dir, href);
        by_id.insert(id.to_string(), items.len());
        items.push(ManifestItem {
            id: id.to_string(),
            href: resolved,
            media_type: entry.media_type.clone().unwrap_or_default(),
            properties: entry.properties.clone(),
        });
    }
    (items, by_id)
}

/// `href -> displayed text`, from the EPUB 3 navigation document when the
/// manifest declares one, otherwise from the NCX. An EPUB with neither gets
/// an empty map and chapters fall back to href-derived titles.
fn build_title_map(archive: &dyn BookArchive, manifest: &[ManifestItem]) -> HashMap<String, String> {
    let nav_item = manifest.iter().find(|i| {
        i.properties
            .as_deref()
            .map_or(false, |p| p.split_whitespace().any(|w| w == "nav"))
    });
    if let Some(item) = nav_item {
        match archive
            .entry_string(&item.href)
            .and_then(|xml| parse_nav_doc(&xml, &parent_dir(&item.href)))
        {
            Ok(map) if !map.is_empty() => return map,
            Ok(_) => {}
            Err(e) => log::warn!("[EpubReader] unusable navigation document: {e}"),
        }
    }

    let ncx_item = manifest.iter().find(|i| i.media_type.contains("ncx"));
    if let Some(item) = ncx_item {
        match archive
            .entry_string(&item.href)
            .and_then(|xml| parse_ncx(&xml, &parent_dir(&item.href)))
        {
            Ok(map) => return map,
            Err(e) => log::warn!("[EpubReader] unusable NCX: {e}"),
        }
    }

    HashMap::new()
}

fn parse_nav_doc(xml: &str, base_dir: &str) -> Result<HashMap<String, String>> {
    let doc: NavDoc = quick_xml::de::from_str(xml)
        .map_err(|e| ConversionError::InvalidArchive(format!("malformed nav document: {e}")))?;

    let mut map = HashMap::new();
    for nav in &doc.body.navs {
        // Only the toc nav carries reading-order titles; landmarks and
        // page-list navs reference the same files with other labels.
        if nav.nav_type.as_deref() != Some("toc") {
            continue;
        }
        for list in &nav.lists {
            collect_nav_list(list, base_dir, &mut map);
        }
        break;
    }
    Ok(map)
}

fn collect_nav_list(list: &NavList, base_dir: &str, map: &mut HashMap<String, String>) {
    for item in &list.items {
        let anchor = item.a.as_ref().or(item.span.as_ref());
        if let Some(anchor) = anchor {
            let label = anchor
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| anchor.text.trim().to_string());
            if let (Some(href), false) = (anchor.href.as_deref(), label.is_empty()) {
                let file = strip_fragment(href);
                if !file.is_empty() {
                    let resolved = resolve_href(base_dir, file);
                    map.entry(resolved).or_insert(label);
                }
            }
        }
        if let Some(children) = &item.ol {
            collect_nav_list(children, base_dir, map);
        }
    }
}

fn parse_ncx(xml: &str, base_dir: &str) -> Result<HashMap<String, String>> {
    let ncx: Ncx = quick_xml::de::from_str(xml)
        .map_err(|e| ConversionError::InvalidArchive(format!("malformed NCX: {e}")))?;
    let mut map = HashMap::new();
    collect_nav_points(&ncx.nav_map.points, base_dir, &mut map);
    Ok(map)
}

fn collect_nav_points(
    points: &[NcxNavPoint],
    base_dir: &str,
    map: &mut HashMap<String, String>,
) {
    for point in points {
        let label = point
            .label
            .as_ref()
            .and_then(|l| l.text.as_ref())
            .map(|t| t.value.trim().to_string())
            .unwrap_or_default();
        let src = point.content.as_ref().and_then(|c| c.src.as_deref());
        if let (Some(src), false) = (src, label.is_empty()) {
            let file = strip_fragment(src);
            if !file.is_empty() {
                let resolved = resolve_href(base_dir, file);
                map.entry(resolved).or_insert(label);
            }
        }
        collect_nav_points(&point.children, base_dir, map);
    }
}

/// Cover bytes, tried in order: the `<meta name="cover">` item, a manifest
/// item with the `cover-image` property, an image item named like a cover,
/// then the first image in the manifest. Missing covers are not an error.
fn discover_cover(
    archive: &dyn BookArchive,
    metadata: &PackageMetadata,
    manifest: &[ManifestItem],
    by_id: &HashMap<String, usize>,
) -> Option<Vec<u8>> {
    let meta_item = metadata
        .metas
        .iter()
        .find(|m| m.name.as_deref() == Some("cover"))
        .and_then(|m| m.content.as_deref())
        .and_then(|id| by_id.get(id))
        .map(|&idx| &manifest[idx]);

    let item = meta_item
        .or_else(|| {
            manifest.iter().find(|i| {
                i.properties
                    .as_deref()
                    .map_or(false, |p| p.split_whitespace().any(|w| w == "cover-image"))
            })
        })
        .or_else(|| {
            manifest.iter().find(|i| {
                i.media_type.starts_with("image/")
                    && (i.id.to_lowercase().contains("cover")
                        || i.href.to_lowercase().contains("cover"))
            })
        })
        .or_else(|| manifest.iter().find(|i| i.media_type.starts_with("image/")))?;

    match archive.entry_bytes(&item.href) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::warn!("[EpubReader] cover {} unreadable: {e}", item.href);
            None
        }
    }
}

fn is_html_media_type(media_type: &str) -> bool {
    media_type.contains("xhtml") || media_type == "text/html"
}

fn fallback_title(href: &str, index: usize) -> String {
    let base = href.rsplit('/').next().unwrap_or(href);
    let stem = base.rsplit_once('.').map(|(s, _)| s).unwrap_or(base);
    let title = stem.replace('-', " ").trim().to_string();
    if title.is_empty() {
        format!("Chapter {}", index + 1)
    } else {
        title
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn strip_fragment(href: &str) -> &str {
    href.split('#').next().unwrap_or(href)
}

/// Undo percent-encoding in manifest and toc hrefs; zip entry names are
/// stored raw. Malformed escapes pass through unchanged.
fn percent_decode(input: &str) -> String {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

/// Join a possibly-relative href onto a base directory, normalizing `.` and
/// `..` segments and percent-encoding into a plain zip entry path.
fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = percent_decode(href);
    let mut segments: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}
