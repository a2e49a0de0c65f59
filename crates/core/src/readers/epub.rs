//! EPUB container access: ZIP → `container.xml` → package document.
//!
//! [`EpubArchive`] owns the open ZIP handle and the parsed [`Package`]
//! (metadata, manifest, spine). Entry reads are charged to an
//! [`ExtractionBudget`]. DRM is refused at open time; font obfuscation is not
//! DRM and passes. Content documents are not parsed here.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use percent_encoding::percent_decode_str;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader as XmlReader;

use crate::error::{ReadError, SecurityError};
use crate::security::{ExtractionBudget, SecurityLimits};

const CONTAINER_PATH: &str = "META-INF/container.xml";
const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";
const SINF_PATH: &str = "META-INF/sinf.xml";
const FONT_OBFUSCATION: [&str; 2] = [
    "http://www.idpf.org/2008/embedding",
    "http://ns.adobe.com/pdf/enc#RC",
];
const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

/// Dublin Core metadata from the package document. Missing fields stay empty;
/// defaults are applied by the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub identifiers: Vec<String>,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestItem {
    pub id: String,
    /// Archive path, resolved against the package directory.
    pub path: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn is_xhtml(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            "application/xhtml+xml" | "text/html" | "application/xml" | "text/xml"
        )
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }

    fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .map_or(false, |p| p.split_whitespace().any(|p| p == property))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpineItem {
    pub idref: String,
    pub path: String,
    pub media_type: String,
    pub linear: bool,
}

/// The parsed package document.
#[derive(Debug, Clone, Default)]
pub struct Package {
    /// Archive path of the package document itself.
    pub path: String,
    pub metadata: PackageMetadata,
    pub manifest: HashMap<String, ManifestItem>,
    path_index: HashMap<String, String>,
    pub spine: Vec<SpineItem>,
    /// Spine idrefs with no manifest entry, in spine order.
    pub skipped_idrefs: Vec<String>,
    pub ncx_id: Option<String>,
    pub nav_path: Option<String>,
    pub cover_id: Option<String>,
}

impl Package {
    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.get(id)
    }

    pub fn item_by_path(&self, path: &str) -> Option<&ManifestItem> {
        self.path_index
            .get(path)
            .and_then(|id| self.manifest.get(id))
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.path_index.contains_key(path)
    }

    pub fn ncx_path(&self) -> Option<&str> {
        self.ncx_id
            .as_deref()
            .and_then(|id| self.manifest.get(id))
            .or_else(|| {
                self.manifest
                    .values()
                    .find(|item| item.media_type == NCX_MEDIA_TYPE)
            })
            .map(|item| item.path.as_str())
    }

    /// Archive path of the declared cover image, if it names an image.
    pub fn cover_path(&self) -> Option<&str> {
        self.cover_id
            .as_deref()
            .and_then(|id| self.manifest.get(id))
            .filter(|item| item.is_image())
            .map(|item| item.path.as_str())
    }

    /// Position of a spine document, by archive path.
    pub fn spine_position(&self, path: &str) -> Option<usize> {
        self.spine.iter().position(|s| s.path == path)
    }
}

/// An open EPUB container.
pub struct EpubArchive<R: Read + Seek> {
    zip: zip::ZipArchive<R>,
    package: Package,
    budget: ExtractionBudget,
    entry_names: HashMap<String, String>,
}

impl EpubArchive<BufReader<File>> {
    pub fn open(path: &Path, limits: &SecurityLimits) -> Result<Self, ReadError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), limits)
    }
}

impl<R: Read + Seek> EpubArchive<R> {
    pub fn from_reader(reader: R, limits: &SecurityLimits) -> Result<Self, ReadError> {
        let zip = zip::ZipArchive::new(reader)
            .map_err(|e| ReadError::corrupt(format!("invalid ZIP archive: {e}")))?;
        let budget = ExtractionBudget::new(limits.clone());
        budget.admit_archive(zip.len())?;

        let entry_names = zip
            .file_names()
            .map(|name| (name.to_lowercase(), name.to_string()))
            .collect();

        let mut archive = Self {
            zip,
            package: Package::default(),
            budget,
            entry_names,
        };
        archive.refuse_drm()?;

        let container = archive
            .read_text(CONTAINER_PATH)
            .map_err(|e| ReadError::corrupt(format!("cannot read {CONTAINER_PATH}: {e}")))?;
        let package_path = find_package_path(&container)?;
        let opf = archive
            .read_text(&package_path)
            .map_err(|e| ReadError::corrupt(format!("cannot read package {package_path}: {e}")))?;
        archive.package = parse_package(&opf, &package_path)?;

        tracing::debug!(
            package = %archive.package.path,
            manifest = archive.package.manifest.len(),
            spine = archive.package.spine.len(),
            "opened EPUB container"
        );
        Ok(archive)
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn limits(&self) -> &SecurityLimits {
        self.budget.limits()
    }

    fn refuse_drm(&mut self) -> Result<(), ReadError> {
        let scheme = if self.contains(SINF_PATH) {
            Some("Apple FairPlay")
        } else if self.contains(ENCRYPTION_PATH) {
            let encryption = self.read_text(ENCRYPTION_PATH)?;
            drm_scheme(&encryption)
        } else {
            None
        };
        match scheme {
            Some(drm_type) => Err(SecurityError::DrmProtected {
                drm_type: drm_type.to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entry_name(path).is_some()
    }

    fn entry_name(&self, path: &str) -> Option<String> {
        if self.zip.index_for_name(path).is_some() {
            return Some(path.to_string());
        }
        // Case mismatches between manifest and archive are common.
        self.entry_names.get(&path.to_lowercase()).cloned()
    }

    /// Read an archive entry, charging it to the extraction budget first.
    pub fn read_bytes(&mut self, path: &str) -> Result<Vec<u8>, ReadError> {
        let name = self
            .entry_name(path)
            .ok_or_else(|| ReadError::MissingEntry(path.to_string()))?;
        let mut file = self
            .zip
            .by_name(&name)
            .map_err(|e| ReadError::corrupt(format!("cannot open entry {name}: {e}")))?;

        self.budget
            .admit_entry(&name, file.compressed_size(), file.size())?;

        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read an entry as text. XML documents are UTF-8 unless they carry a BOM.
    pub fn read_text(&mut self, path: &str) -> Result<String, ReadError> {
        let bytes = self.read_bytes(path)?;
        let (text, _, _) = encoding_rs::UTF_8.decode(&bytes);
        Ok(text.into_owned())
    }
}

// --- encryption.xml ---

fn known_scheme(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    if lower.contains("ns.adobe.com/adept") || lower.contains("digitaleditions") {
        Some("Adobe DRM")
    } else if lower.contains("apple.com/ibooks") || lower.contains("fairplay") {
        Some("Apple FairPlay")
    } else if lower.contains("urms.org") || lower.contains("marlin") {
        Some("Sony URMS")
    } else {
        None
    }
}

/// The DRM scheme an `encryption.xml` declares, if any. Books whose only
/// encrypted resources are obfuscated fonts are readable.
fn drm_scheme(encryption: &str) -> Option<&'static str> {
    let mut reader = XmlReader::from_str(encryption);
    let mut buf = Vec::new();
    let mut encrypted = 0usize;
    let mut obfuscated = 0usize;
    let mut scheme = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"EncryptedData" => encrypted += 1,
                    b"EncryptionMethod" => {
                        let font = e.attributes().flatten().any(|a| {
                            a.key.local_name().as_ref() == b"Algorithm"
                                && FONT_OBFUSCATION.contains(&attr_value(&a).as_str())
                        });
                        if font {
                            obfuscated += 1;
                        }
                    }
                    _ => {}
                }
                if scheme.is_none() {
                    scheme = e
                        .attributes()
                        .flatten()
                        .find_map(|a| known_scheme(&attr_value(&a)));
                }
            }
            Ok(Event::Eof) => break,
            // Unparseable manifest: assume the worst.
            Err(_) => return known_scheme(encryption).or(Some("Unknown DRM")),
            _ => {}
        }
        buf.clear();
    }

    if encrypted > obfuscated {
        Some(scheme.unwrap_or("Unknown DRM"))
    } else {
        None
    }
}

// --- container.xml / package document ---

fn attr_value(attr: &Attribute<'_>) -> String {
    attr.unescape_value()
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned())
}

fn find_package_path(container: &str) -> Result<String, ReadError> {
    let mut reader = XmlReader::from_str(container);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"full-path" {
                        let path = normalize_path(&decode_href(&attr_value(&attr)));
                        if let Some(path) = path.filter(|p| !p.is_empty()) {
                            return Ok(path);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ReadError::corrupt(format!(
                    "failed to parse {CONTAINER_PATH}: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Err(ReadError::corrupt(format!(
        "no rootfile declared in {CONTAINER_PATH}"
    )))
}

#[derive(Clone, Copy, PartialEq)]
enum DcField {
    Title,
    Creator,
    Language,
    Publisher,
    Date,
    Description,
    Identifier,
    Subject,
}

impl DcField {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"title" => DcField::Title,
            b"creator" => DcField::Creator,
            b"language" => DcField::Language,
            b"publisher" => DcField::Publisher,
            b"date" => DcField::Date,
            b"description" => DcField::Description,
            b"identifier" => DcField::Identifier,
            b"subject" => DcField::Subject,
            _ => return None,
        })
    }
}

fn parse_package(content: &str, package_path: &str) -> Result<Package, ReadError> {
    let package_dir = parent_dir(package_path);
    let mut reader = XmlReader::from_str(content);
    let mut buf = Vec::new();

    let mut package = Package {
        path: package_path.to_string(),
        ..Package::default()
    };
    let mut spine_refs: Vec<(String, bool)> = Vec::new();
    let mut in_metadata = false;
    let mut field: Option<DcField> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ReadError::corrupt(format!("failed to parse {package_path}: {e}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                match e.local_name().as_ref() {
                    b"metadata" => in_metadata = is_start,
                    name if in_metadata && is_start && DcField::from_local_name(name).is_some() => {
                        field = DcField::from_local_name(name);
                        text.clear();
                    }
                    b"meta" if in_metadata => {
                        let mut name = None;
                        let mut meta_content = None;
                        for attr in e.attributes().flatten() {
                            match attr.key.local_name().as_ref() {
                                b"name" => name = Some(attr_value(&attr)),
                                b"content" => meta_content = Some(attr_value(&attr)),
                                _ => {}
                            }
                        }
                        // EPUB2: <meta name="cover" content="cover-image-id"/>
                        if name.as_deref() == Some("cover") && package.cover_id.is_none() {
                            package.cover_id = meta_content;
                        }
                    }
                    b"item" => {
                        if let Some(item) = manifest_item(e, &package_dir) {
                            if item.has_property("nav") && package.nav_path.is_none() {
                                package.nav_path = Some(item.path.clone());
                            }
                            if item.has_property("cover-image") {
                                package.cover_id = Some(item.id.clone());
                            }
                            package
                                .path_index
                                .entry(item.path.clone())
                                .or_insert_with(|| item.id.clone());
                            package.manifest.insert(item.id.clone(), item);
                        }
                    }
                    b"spine" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"toc" {
                                package.ncx_id = Some(attr_value(&attr));
                            }
                        }
                    }
                    b"itemref" => {
                        let mut idref = None;
                        let mut linear = true;
                        for attr in e.attributes().flatten() {
                            match attr.key.local_name().as_ref() {
                                b"idref" => idref = Some(attr_value(&attr)),
                                b"linear" => linear = attr_value(&attr).trim() != "no",
                                _ => {}
                            }
                        }
                        if let Some(idref) = idref {
                            spine_refs.push((idref, linear));
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref e) => {
                if field.is_some() {
                    text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Event::CData(ref e) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Event::End(ref e) => {
                if e.local_name().as_ref() == b"metadata" {
                    in_metadata = false;
                }
                if let Some(current) = field.take() {
                    let value = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !value.is_empty() {
                        store_metadata(&mut package.metadata, current, value);
                    }
                    text.clear();
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    for (idref, linear) in spine_refs {
        match package.manifest.get(&idref) {
            Some(item) => package.spine.push(SpineItem {
                idref,
                path: item.path.clone(),
                media_type: item.media_type.clone(),
                linear,
            }),
            None => package.skipped_idrefs.push(idref),
        }
    }

    Ok(package)
}

fn manifest_item(e: &BytesStart<'_>, package_dir: &str) -> Option<ManifestItem> {
    let mut id = String::new();
    let mut href = String::new();
    let mut media_type = String::new();
    let mut properties = None;
    for attr in e.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"id" => id = attr_value(&attr),
            b"href" => href = attr_value(&attr),
            b"media-type" => media_type = attr_value(&attr).to_lowercase(),
            b"properties" => properties = Some(attr_value(&attr)),
            _ => {}
        }
    }
    if id.is_empty() || href.is_empty() {
        return None;
    }
    let Some(path) = resolve_in_dir(package_dir, &decode_href(&href)) else {
        tracing::warn!("Ignoring manifest item '{}' with href {}", id, href);
        return None;
    };
    Some(ManifestItem {
        id,
        path,
        media_type,
        properties,
    })
}

fn store_metadata(metadata: &mut PackageMetadata, field: DcField, value: String) {
    match field {
        DcField::Title => {
            metadata.title.get_or_insert(value);
        }
        DcField::Creator => metadata.authors.push(value),
        DcField::Language => {
            metadata.language.get_or_insert(value);
        }
        DcField::Publisher => {
            metadata.publisher.get_or_insert(value);
        }
        DcField::Date => {
            metadata.date.get_or_insert(value);
        }
        DcField::Description => {
            metadata.description.get_or_insert(value);
        }
        DcField::Identifier => metadata.identifiers.push(value),
        DcField::Subject => metadata.subjects.push(value),
    }
}

// --- Archive path helpers ---

/// Directory part of an archive path, with trailing slash (`""` at the root).
pub fn parent_dir(path: &str) -> String {
    path.rfind('/')
        .map(|i| path[..=i].to_string())
        .unwrap_or_default()
}

/// Percent-decode an href component.
pub fn decode_href(href: &str) -> String {
    percent_decode_str(href).decode_utf8_lossy().into_owned()
}

/// Collapse `.` and `..` segments. Returns `None` when the path climbs above
/// the archive root.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

fn resolve_in_dir(dir: &str, relative: &str) -> Option<String> {
    if relative.starts_with('/') {
        return normalize_path(relative);
    }
    normalize_path(&format!("{dir}{relative}"))
}

/// A same-book reference, resolved to an archive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHref {
    pub path: String,
    pub fragment: Option<String>,
}

/// Whether an href points outside the book (`http:`, `mailto:`, ...).
pub fn is_external(href: &str) -> bool {
    let href = href.trim();
    if href.starts_with("//") {
        return true;
    }
    match href.find(':') {
        Some(colon) => {
            let scheme = &href[..colon];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Resolve an href found in the document at `base_path`. Returns `None` for
/// external or unresolvable references. An empty path part refers to the
/// base document itself.
pub fn resolve_href(base_path: &str, href: &str) -> Option<ResolvedHref> {
    let href = href.trim();
    if href.is_empty() || is_external(href) {
        return None;
    }
    let (path_part, fragment) = match href.split_once('#') {
        Some((p, f)) => (p, Some(f)),
        None => (href, None),
    };
    let path_part = path_part.split('?').next().unwrap_or_default();
    let fragment = fragment
        .map(decode_href)
        .filter(|f| !f.is_empty());

    let path = if path_part.is_empty() {
        base_path.to_string()
    } else {
        resolve_in_dir(&parent_dir(base_path), &decode_href(path_part))?
    };
    if path.is_empty() {
        return None;
    }
    Some(ResolvedHref { path, fragment })
}
