//! Document parsing for PDF and EPUB files.
//!
//! [`FileParser`] turns a document into plain UTF-8 text plus any embedded
//! raster images, which are written to the configured image directory under
//! deterministic names (see [`image_file_name`]). Text extraction failures
//! are errors; image extraction is best-effort and only logged.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use tracing::{debug, warn};

use crate::error::{RagError, Result};
use crate::hash::short_tag;
use crate::models::FileType;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum images taken from one document.
const MAX_IMAGES: usize = 200;
/// Skip tiny PDF images (icons, bullets, rules).
const MIN_PDF_IMAGE_DIMENSION: i64 = 32;

const HTML_EXTENSIONS: &[&str] = &["xhtml", "html", "htm"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "bmp"];
/// Elements whose text never belongs in the extracted body.
const SKIPPED_ELEMENTS: &[&[u8]] = &[b"head", b"script", b"style"];
/// Elements that end a line of text.
const BLOCK_ELEMENTS: &[&[u8]] = &[
    b"p", b"div", b"br", b"li", b"tr", b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"blockquote",
    b"section", b"pre",
];

/// An image written to disk during parsing.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub index: usize,
    pub file_path: PathBuf,
}

/// Parser output: document text, extracted images, and page count.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub text: String,
    pub images: Vec<ExtractedImage>,
    pub page_count: usize,
}

/// Converts a document file into text and images.
///
/// Implementations are synchronous; the ingestion pipeline runs them on the
/// blocking thread pool.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedDocument>;
}

/// Parser for the two supported formats, dispatching on file extension.
pub struct FileParser {
    /// Where extracted images are written. `None` disables image extraction.
    image_dir: Option<PathBuf>,
}

impl FileParser {
    pub fn new(image_dir: Option<PathBuf>) -> Self {
        Self { image_dir }
    }
}

impl DocumentParser for FileParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let file_type = FileType::from_path(path)?;
        let bytes = std::fs::read(path).map_err(|e| RagError::io(path, e))?;
        let sink = match &self.image_dir {
            Some(dir) => Some(ImageSink::new(dir, path)?),
            None => None,
        };
        match file_type {
            FileType::Pdf => parse_pdf(path, &bytes, sink),
            FileType::Epub => parse_epub(path, &bytes, sink),
        }
    }
}

/// Deterministic name for an extracted image.
///
/// Combines the format discriminator, the sanitized source stem, a short
/// hash of the full source path (so same-named files in different folders
/// never collide), and the extraction index.
pub fn image_file_name(source: &Path, kind: &str, index: usize, ext: &str) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let tag = short_tag(&source.to_string_lossy());
    format!("{}_{}_{}_{}.{}", kind, stem, tag, index, ext)
}

/// Writes extracted images for one source document.
struct ImageSink {
    dir: PathBuf,
    source: PathBuf,
    images: Vec<ExtractedImage>,
}

impl ImageSink {
    fn new(dir: &Path, source: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| RagError::io(dir, e))?;
        let source = std::fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
        Ok(Self {
            dir: dir.to_path_buf(),
            source,
            images: Vec::new(),
        })
    }

    fn is_full(&self) -> bool {
        self.images.len() >= MAX_IMAGES
    }

    fn write(&mut self, kind: &str, ext: &str, data: &[u8]) {
        let index = self.images.len();
        let path = self
            .dir
            .join(image_file_name(&self.source, kind, index, ext));
        match std::fs::write(&path, data) {
            Ok(()) => self.images.push(ExtractedImage {
                index,
                file_path: path,
            }),
            Err(e) => warn!(path = %path.display(), "failed to write extracted image: {}", e),
        }
    }
}

// ============ PDF ============

fn parse_pdf(path: &Path, bytes: &[u8], sink: Option<ImageSink>) -> Result<ParsedDocument> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| RagError::parse(path, e.to_string()))?;

    let (page_count, images) = match lopdf::Document::load_mem(bytes) {
        Ok(doc) => {
            let images = match sink {
                Some(mut sink) => {
                    extract_pdf_images(&doc, &mut sink);
                    sink.images
                }
                None => Vec::new(),
            };
            (doc.get_pages().len(), images)
        }
        Err(e) => {
            warn!(path = %path.display(), "cannot load PDF structure, skipping images: {}", e);
            (0, Vec::new())
        }
    };

    debug!(
        path = %path.display(),
        pages = page_count,
        images = images.len(),
        "parsed PDF"
    );

    Ok(ParsedDocument {
        text,
        images,
        page_count,
    })
}

fn extract_pdf_images(doc: &lopdf::Document, sink: &mut ImageSink) {
    for (page_num, page_id) in doc.get_pages() {
        if sink.is_full() {
            debug!("reached image limit ({}), stopping extraction", MAX_IMAGES);
            break;
        }
        let page_images = match doc.get_page_images(page_id) {
            Ok(images) => images,
            Err(e) => {
                debug!("failed to get images from page {}: {}", page_num, e);
                continue;
            }
        };
        for image in page_images {
            if sink.is_full() {
                break;
            }
            if image.width < MIN_PDF_IMAGE_DIMENSION || image.height < MIN_PDF_IMAGE_DIMENSION {
                continue;
            }
            let filters = image.filters.clone().unwrap_or_default();
            // Only encodings that are complete image files as stored.
            let ext = if filters.iter().any(|f| f == "DCTDecode") {
                "jpg"
            } else if filters.iter().any(|f| f == "JPXDecode") {
                "jp2"
            } else {
                debug!("skipping image with filters {:?} on page {}", filters, page_num);
                continue;
            };
            sink.write("pdf", ext, image.content);
        }
    }
}

// ============ EPUB ============

/// A manifest entry from the OPF package document.
struct ManifestItem {
    path: String,
    media_type: String,
}

fn parse_epub(path: &Path, bytes: &[u8], sink: Option<ImageSink>) -> Result<ParsedDocument> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| RagError::parse(path, format!("not a valid EPUB archive: {}", e)))?;

    let entry_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
        .collect();

    let (content_paths, image_paths) = match read_package(&mut archive) {
        Some((manifest, spine)) => {
            let content: Vec<String> = spine
                .iter()
                .filter_map(|id| manifest.get(id))
                .map(|item| item.path.clone())
                .collect();
            let mut images: Vec<&ManifestItem> = manifest
                .values()
                .filter(|item| item.media_type.starts_with("image/"))
                .collect();
            images.sort_by(|a, b| a.path.cmp(&b.path));
            let images: Vec<String> = images.into_iter().map(|item| item.path.clone()).collect();
            (content, images)
        }
        None => {
            debug!(path = %path.display(), "EPUB package not resolvable, walking archive");
            let content = entry_names
                .iter()
                .filter(|n| has_extension(n, HTML_EXTENSIONS))
                .cloned()
                .collect();
            let images = entry_names
                .iter()
                .filter(|n| has_extension(n, IMAGE_EXTENSIONS))
                .cloned()
                .collect();
            (content, images)
        }
    };

    if content_paths.is_empty() {
        return Err(RagError::parse(path, "EPUB contains no content documents"));
    }

    let mut parts = Vec::new();
    let mut unreadable = 0usize;
    for name in &content_paths {
        let markup = match read_entry_bounded(&mut archive, name) {
            Ok(markup) => markup,
            Err(e) => {
                warn!(path = %path.display(), entry = %name, "skipping unreadable EPUB entry: {}", e);
                unreadable += 1;
                continue;
            }
        };
        let text = markup_to_text(&markup);
        if !text.trim().is_empty() {
            parts.push(text);
        }
    }

    if unreadable == content_paths.len() {
        return Err(RagError::parse(
            path,
            format!("none of the {} EPUB content documents could be read", unreadable),
        ));
    }

    let images = match sink {
        Some(mut sink) => {
            for name in &image_paths {
                if sink.is_full() {
                    break;
                }
                match read_entry_bounded(&mut archive, name) {
                    Ok(data) => {
                        let ext = extension_of(name).unwrap_or_else(|| "img".to_string());
                        sink.write("epub", &ext, &data);
                    }
                    Err(e) => debug!(entry = %name, "skipping EPUB image: {}", e),
                }
            }
            sink.images
        }
        None => Vec::new(),
    };

    debug!(
        path = %path.display(),
        sections = parts.len(),
        images = images.len(),
        "parsed EPUB"
    );

    Ok(ParsedDocument {
        page_count: parts.len(),
        text: parts.join("\n\n"),
        images,
    })
}

fn read_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_ENTRY_BYTES
        ));
    }
    Ok(out)
}

/// Resolve the OPF package: manifest by id, and spine order.
fn read_package(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Option<(HashMap<String, ManifestItem>, Vec<String>)> {
    let container = read_entry_bounded(archive, "META-INF/container.xml").ok()?;
    let opf_path = find_rootfile(&container)?;
    let opf = read_entry_bounded(archive, &opf_path).ok()?;
    let base = match opf_path.rfind('/') {
        Some(pos) => &opf_path[..pos],
        None => "",
    };

    let mut manifest = HashMap::new();
    let mut spine = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(opf.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    let id = attr(&e, b"id");
                    let href = attr(&e, b"href");
                    if let (Some(id), Some(href)) = (id, href) {
                        manifest.insert(
                            id,
                            ManifestItem {
                                path: resolve_href(base, &href),
                                media_type: attr(&e, b"media-type").unwrap_or_default(),
                            },
                        );
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attr(&e, b"idref") {
                        spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!("malformed OPF package: {}", e);
                return None;
            }
            _ => {}
        }
        buf.clear();
    }

    if spine.is_empty() {
        return None;
    }
    Some((manifest, spine))
}

fn find_rootfile(container: &[u8]) -> Option<String> {
    let mut reader = quick_xml::Reader::from_reader(container);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"rootfile" {
                    return attr(&e, b"full-path");
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn attr(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Join an OPF-relative href onto the package directory, folding `..` segments.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href).replace("%20", " ");
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
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

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn has_extension(name: &str, exts: &[&str]) -> bool {
    extension_of(name).is_some_and(|e| exts.contains(&e.as_str()))
}

/// Extract readable text from (X)HTML.
///
/// Uses a lenient XML pass; markup the reader rejects falls back to a plain
/// tag stripper.
pub fn markup_to_text(markup: &[u8]) -> String {
    match xml_text(markup) {
        Some(text) => text,
        None => strip_tags(&String::from_utf8_lossy(markup)),
    }
}

fn xml_text(markup: &[u8]) -> Option<String> {
    let mut reader = quick_xml::Reader::from_reader(markup);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if skip_depth > 0 || SKIPPED_ELEMENTS.contains(&name.as_ref()) {
                    skip_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else if BLOCK_ELEMENTS.contains(&e.local_name().as_ref()) {
                    end_line(&mut out);
                }
            }
            Ok(Event::Empty(e)) => {
                if skip_depth == 0 && BLOCK_ELEMENTS.contains(&e.local_name().as_ref()) {
                    end_line(&mut out);
                }
            }
            Ok(Event::Text(te)) if skip_depth == 0 => {
                let text = match te.unescape() {
                    Ok(t) => t.into_owned(),
                    Err(_) => decode_entities(&String::from_utf8_lossy(&te)),
                };
                push_word_run(&mut out, &text);
            }
            Ok(Event::CData(cd)) if skip_depth == 0 => {
                push_word_run(&mut out, &String::from_utf8_lossy(&cd));
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }

    Some(out.trim().to_string())
}

fn push_word_run(out: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push(' ');
    }
    out.push_str(text);
}

fn end_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

/// Remove anything between `<` and `>` and decode common entities.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    let decoded = decode_entities(&out);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
