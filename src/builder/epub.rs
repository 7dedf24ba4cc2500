//! EPUB 3 builder: mimetype, container, OPF, nav + NCX, cover and annotation pages,
//! chapters, images and auxiliary assets.

use crate::builder::{
    artifact_path, read_assets, write_atomically, xml_escape, AssetKind, BookParts, Builder,
    BuilderError,
};
use crate::model::Image;
use crate::text;
use scraper::{ElementRef, Html, Node};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const DEFAULT_LANG: &str = "en";
/// Fixed so that rebuilding the same book yields the same archive.
const MODIFIED: &str = "2000-01-01T00:00:00Z";
const VOID_ELEMENTS: [&str; 13] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

#[derive(Debug, Default)]
pub struct EpubBuilder {
    parts: BookParts,
}

impl EpubBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Builder for EpubBuilder {
    fn extension(&self) -> &'static str {
        "epub"
    }

    fn parts(&mut self) -> &mut BookParts {
        &mut self.parts
    }

    fn as_dyn(&mut self) -> &mut dyn Builder {
        self
    }

    fn with_files(
        &mut self,
        dir: &Path,
        pattern: &str,
        kind: AssetKind,
    ) -> Result<&mut dyn Builder, BuilderError> {
        let assets = read_assets(dir, pattern, kind)?;
        self.parts.assets.extend(assets);
        Ok(self)
    }

    fn build(self: Box<Self>, dir: &Path, name: &str) -> Result<PathBuf, BuilderError> {
        validate(&self.parts)?;
        let path = artifact_path(dir, name, self.extension());
        write_atomically(&path, |file| write_archive(&self.parts, file))?;
        info!(path = %path.display(), chapters = self.parts.chapters.len(), "EPUB written");
        Ok(path)
    }
}

fn validate(parts: &BookParts) -> Result<(), BuilderError> {
    let incomplete = |reason: &str| BuilderError::Incomplete {
        format: "EPUB",
        reason: reason.to_string(),
    };
    if parts.title.trim().is_empty() {
        return Err(incomplete("book title is empty"));
    }
    if parts.authors.iter().all(|a| a.name.trim().is_empty()) {
        return Err(incomplete("book author is empty"));
    }
    if parts.chapters.is_empty() {
        return Err(incomplete("book has no chapters"));
    }
    Ok(())
}

fn write_archive(parts: &BookParts, file: File) -> Result<(), BuilderError> {
    let mut zip = ZipWriter::new(BufWriter::new(file));

    let options_stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let options_deflate = options_stored.compression_method(zip::CompressionMethod::Deflated);

    // Mimetype first, uncompressed
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(MIMETYPE).map_err(ZipError::Io)?;

    zip.start_file("META-INF/container.xml", options_deflate)?;
    zip.write_all(CONTAINER_XML).map_err(ZipError::Io)?;

    let images = parts.images();
    write_entry(&mut zip, "content.opf", &opf(parts, &images), options_deflate)?;
    write_entry(&mut zip, "nav.xhtml", &nav_xhtml(parts), options_deflate)?;
    write_entry(&mut zip, "toc.ncx", &ncx(parts), options_deflate)?;
    if let Some(cover) = &parts.cover {
        write_entry(&mut zip, "cover.xhtml", &cover_xhtml(parts, cover), options_deflate)?;
    }
    if let Some(annotation) = &parts.annotation {
        let body = format!("<h1>{}</h1>\n{}", xml_escape(&parts.title), to_xhtml(annotation));
        let page = page_xhtml(parts, "Annotation", &body);
        write_entry(&mut zip, "annotation.xhtml", &page, options_deflate)?;
    }
    for (i, ch) in parts.chapters.iter().enumerate() {
        let body = format!("<h2>{}</h2>\n{}", xml_escape(&ch.title), to_xhtml(&ch.content));
        let page = page_xhtml(parts, &ch.title, &body);
        write_entry(&mut zip, &chapter_file(i), &page, options_deflate)?;
    }
    for image in &images {
        zip.start_file(format!("{}{}", OEBPS_PREFIX, image.path()), options_deflate)?;
        zip.write_all(&image.content).map_err(ZipError::Io)?;
    }
    for asset in &parts.assets {
        zip.start_file(format!("{}{}", OEBPS_PREFIX, asset.path()), options_deflate)?;
        zip.write_all(&asset.content).map_err(ZipError::Io)?;
    }

    let mut out = zip.finish()?;
    out.flush().map_err(ZipError::Io)?;
    Ok(())
}

fn write_entry(
    zip: &mut ZipWriter<impl Write + Seek>,
    name: &str,
    content: &str,
    options: SimpleFileOptions,
) -> Result<(), BuilderError> {
    zip.start_file(format!("{OEBPS_PREFIX}{name}"), options)?;
    zip.write_all(content.as_bytes()).map_err(ZipError::Io)?;
    Ok(())
}

fn chapter_file(index: usize) -> String {
    format!("chapter-{}.xhtml", index + 1)
}

fn identifier(parts: &BookParts) -> String {
    parts
        .url
        .as_ref()
        .map(|u| u.to_string())
        .unwrap_or_else(|| "urn:ficfetch:book".to_string())
}

fn lang(parts: &BookParts) -> &str {
    parts.lang.as_deref().unwrap_or(DEFAULT_LANG)
}

fn opf(parts: &BookParts, images: &[&Image]) -> String {
    let mut metadata = format!(
        "    <dc:identifier id=\"book-id\">{}</dc:identifier>\n    <dc:title>{}</dc:title>\n    <dc:language>{}</dc:language>\n    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(&identifier(parts)),
        xml_escape(&parts.title),
        xml_escape(lang(parts)),
        MODIFIED
    );
    for (i, author) in parts.authors.iter().enumerate() {
        metadata.push_str(&format!(
            "    <dc:creator id=\"creator-{}\">{}</dc:creator>\n",
            i + 1,
            xml_escape(&author.name)
        ));
    }
    if let Some(annotation) = &parts.annotation {
        metadata.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            xml_escape(&text::plain_text(annotation))
        ));
    }
    if let Some(seria) = &parts.seria {
        let name = xml_escape(&seria.name);
        metadata.push_str(&format!(
            "    <meta property=\"belongs-to-collection\" id=\"series\">{name}</meta>\n    <meta refines=\"#series\" property=\"collection-type\">series</meta>\n    <meta name=\"calibre:series\" content=\"{name}\"/>\n"
        ));
        if !seria.number.is_empty() {
            let number = xml_escape(&seria.number);
            metadata.push_str(&format!(
                "    <meta refines=\"#series\" property=\"group-position\">{number}</meta>\n    <meta name=\"calibre:series_index\" content=\"{number}\"/>\n"
            ));
        }
    }
    if parts.cover.is_some() {
        metadata.push_str("    <meta name=\"cover\" content=\"cover-img\"/>\n");
    }

    let mut manifest = String::from(
        r#"    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
"#,
    );
    let mut spine = String::new();
    if parts.cover.is_some() {
        manifest.push_str(
            "    <item id=\"cover\" href=\"cover.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
        );
        spine.push_str("    <itemref idref=\"cover\"/>\n");
    }
    if parts.annotation.is_some() {
        manifest.push_str("    <item id=\"annotation\" href=\"annotation.xhtml\" media-type=\"application/xhtml+xml\"/>\n");
        spine.push_str("    <itemref idref=\"annotation\"/>\n");
    }
    for i in 0..parts.chapters.len() {
        manifest.push_str(&format!(
            "    <item id=\"chapter-{}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
            i + 1,
            chapter_file(i)
        ));
        spine.push_str(&format!("    <itemref idref=\"chapter-{}\"/>\n", i + 1));
    }
    let cover_name = parts.cover.as_ref().map(|c| c.name.as_str());
    for (i, image) in images.iter().enumerate() {
        let (id, properties) = if Some(image.name.as_str()) == cover_name {
            ("cover-img".to_string(), " properties=\"cover-image\"")
        } else {
            (format!("image-{}", i + 1), "")
        };
        manifest.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"{}/>\n",
            id,
            xml_escape(&image.path()),
            image.media_type(),
            properties
        ));
    }
    for (i, asset) in parts.assets.iter().enumerate() {
        manifest.push_str(&format!(
            "    <item id=\"asset-{}\" href=\"{}\" media-type=\"{}\"/>\n",
            i + 1,
            xml_escape(&asset.path()),
            asset.kind.media_type(&asset.name)
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
{metadata}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#
    )
}

fn nav_xhtml(parts: &BookParts) -> String {
    let mut links = String::new();
    for (i, ch) in parts.chapters.iter().enumerate() {
        links.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            chapter_file(i),
            xml_escape(&ch.title)
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}" lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
  <nav epub:type="toc" id="toc">
    <h1>{title}</h1>
    <ol>
{links}    </ol>
  </nav>
</body>
</html>
"#,
        lang = xml_escape(lang(parts)),
        title = xml_escape(&parts.title),
    )
}

fn ncx(parts: &BookParts) -> String {
    let mut nav_points = String::new();
    for (i, ch) in parts.chapters.iter().enumerate() {
        nav_points.push_str(&format!(
            r#"    <navPoint id="navpoint-{n}" playOrder="{n}">
      <navLabel><text>{label}</text></navLabel>
      <content src="{src}"/>
    </navPoint>
"#,
            n = i + 1,
            label = xml_escape(&ch.title),
            src = chapter_file(i)
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{}"/>
  </head>
  <docTitle>
    <text>{}</text>
  </docTitle>
  <navMap>
{}  </navMap>
</ncx>
"#,
        xml_escape(&identifier(parts)),
        xml_escape(&parts.title),
        nav_points
    )
}

fn cover_xhtml(parts: &BookParts, cover: &Image) -> String {
    let body = format!(
        "<div style=\"text-align: center;\">\n  <img src=\"{}\" alt=\"{}\" style=\"max-width: 100%; height: auto;\"/>\n</div>",
        xml_escape(&cover.path()),
        xml_escape(&parts.title)
    );
    page_xhtml(parts, "Cover", &body)
}

/// Full XHTML document around an already-XHTML `body`. Styles among the assets are linked.
fn page_xhtml(parts: &BookParts, title: &str, body: &str) -> String {
    let styles: String = parts
        .assets
        .iter()
        .filter(|a| a.kind == AssetKind::Style)
        .map(|a| {
            format!(
                "  <link rel=\"stylesheet\" type=\"text/css\" href=\"{}\"/>\n",
                xml_escape(&a.path())
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="{lang}" lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
{styles}</head>
<body>
{body}
</body>
</html>
"#,
        lang = xml_escape(lang(parts)),
        title = xml_escape(title),
    )
}

/// Re-serialize an HTML fragment as well-formed XHTML: void elements self-closed,
/// text and attributes escaped.
fn to_xhtml(fragment: &str) -> String {
    let doc = Html::parse_fragment(fragment);
    let mut out = String::with_capacity(fragment.len());
    write_children(doc.root_element(), &mut out);
    out
}

fn write_children(parent: ElementRef<'_>, out: &mut String) {
    for child in parent.children() {
        match child.value() {
            Node::Text(t) => out.push_str(&escape_text(t)),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    write_element(el, out);
                }
            }
            _ => {}
        }
    }
}

fn write_element(el: ElementRef<'_>, out: &mut String) {
    let name = el.value().name();
    out.push('<');
    out.push_str(name);
    let mut attrs: Vec<(&str, &str)> = el
        .value()
        .attrs()
        .filter(|(name, _)| is_xml_name(name))
        .collect();
    attrs.sort_by(|a, b| a.0.cmp(b.0));
    for (attr, value) in attrs {
        out.push_str(&format!(" {}=\"{}\"", attr, xml_escape(value)));
    }
    if VOID_ELEMENTS.contains(&name) {
        out.push_str("/>");
        return;
    }
    out.push('>');
    write_children(el, out);
    out.push_str(&format!("</{name}>"));
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn is_xml_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}
