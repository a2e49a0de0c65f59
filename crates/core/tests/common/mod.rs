//! In-memory EPUB fixtures.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use folio_core::config::PipelineConfig;
use folio_core::pipeline::Pipeline;
use zip::write::FileOptions;

const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Builds a small EPUB 3 package under `OEBPS/`.
#[derive(Default)]
pub struct EpubBuilder {
    title: String,
    documents: Vec<(String, String)>,
    images: Vec<(String, Vec<u8>)>,
    nav: Option<String>,
    cover: Option<String>,
    extra: Vec<(String, String)>,
}

impl EpubBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }

    /// Spine document at `OEBPS/<href>`, wrapped in XHTML boilerplate.
    pub fn document(mut self, href: &str, title: &str, body: &str) -> Self {
        let xhtml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>{title}</title></head>
<body>{body}</body>
</html>"#
        );
        self.documents.push((href.to_string(), xhtml));
        self
    }

    pub fn image(mut self, href: &str, data: &[u8]) -> Self {
        self.images.push((href.to_string(), data.to_vec()));
        self
    }

    /// Navigation document with one `<li>` per `(label, href)`.
    pub fn nav(mut self, entries: &[(&str, &str)]) -> Self {
        let items: String = entries
            .iter()
            .map(|(label, href)| format!(r#"<li><a href="{href}">{label}</a></li>"#))
            .collect();
        self.nav = Some(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body><nav epub:type="toc"><h1>Contents</h1><ol>{items}</ol></nav></body>
</html>"#
        ));
        self
    }

    pub fn cover(mut self, image_href: &str) -> Self {
        self.cover = Some(image_href.to_string());
        self
    }

    /// Arbitrary archive entry, outside the manifest.
    pub fn entry(mut self, name: &str, content: &str) -> Self {
        self.extra.push((name.to_string(), content.to_string()));
        self
    }

    fn opf(&self) -> String {
        let mut manifest = String::new();
        if self.nav.is_some() {
            manifest.push_str(
                r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#,
            );
        }
        for (i, (href, _)) in self.documents.iter().enumerate() {
            manifest.push_str(&format!(
                r#"<item id="doc{i}" href="{href}" media-type="application/xhtml+xml"/>"#
            ));
        }
        for (i, (href, _)) in self.images.iter().enumerate() {
            let media_type = if href.ends_with(".png") {
                "image/png"
            } else {
                "image/jpeg"
            };
            let properties = if self.cover.as_deref() == Some(href.as_str()) {
                r#" properties="cover-image""#
            } else {
                ""
            };
            manifest.push_str(&format!(
                r#"<item id="img{i}" href="{href}" media-type="{media_type}"{properties}/>"#
            ));
        }
        let spine: String = (0..self.documents.len())
            .map(|i| format!(r#"<itemref idref="doc{i}"/>"#))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="id">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="id">urn:uuid:fixture</dc:identifier>
    <dc:title>{}</dc:title>
    <dc:creator>Test Author</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#,
            self.title
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let stored = FileOptions::<'_, ()>::default()
            .compression_method(zip::CompressionMethod::Stored);
        let deflated = FileOptions::<'_, ()>::default();

        zip.start_file("mimetype", stored).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", deflated).unwrap();
        zip.write_all(CONTAINER.as_bytes()).unwrap();
        zip.start_file("OEBPS/content.opf", deflated).unwrap();
        zip.write_all(self.opf().as_bytes()).unwrap();
        if let Some(nav) = &self.nav {
            zip.start_file("OEBPS/nav.xhtml", deflated).unwrap();
            zip.write_all(nav.as_bytes()).unwrap();
        }
        for (href, content) in &self.documents {
            zip.start_file(format!("OEBPS/{href}"), deflated).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        for (href, data) in &self.images {
            zip.start_file(format!("OEBPS/{href}"), stored).unwrap();
            zip.write_all(data).unwrap();
        }
        for (name, content) in &self.extra {
            zip.start_file(name.as_str(), deflated).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    pub fn write_to(&self, path: &Path) -> PathBuf {
        std::fs::write(path, self.to_bytes()).unwrap();
        path.to_path_buf()
    }
}

/// A pipeline whose cache and upload directories live under `root`.
pub fn pipeline(root: &Path) -> Pipeline {
    Pipeline::new(PipelineConfig::new(root.join("cache"), root.join("uploads")))
}

/// Three chapters, each showing the same image, with a navigation document.
pub fn three_chapter_book() -> EpubBuilder {
    let mut builder = EpubBuilder::new("Three Little Chapters")
        .image("images/shared.png", b"\x89PNG\r\n\x1a\nfake")
        .nav(&[
            ("One", "text/ch1.xhtml"),
            ("Two", "text/ch2.xhtml"),
            ("Three", "text/ch3.xhtml"),
        ]);
    for (n, name) in ["One", "Two", "Three"].iter().enumerate() {
        let n = n + 1;
        builder = builder.document(
            &format!("text/ch{n}.xhtml"),
            name,
            &format!(
                r#"<h1 id="top{n}">{name}</h1><p>Body of chapter {n}.</p><p><img src="../images/shared.png" alt="shared"/></p><p><a href="ch1.xhtml#top1">start</a></p>"#
            ),
        );
    }
    builder
}
