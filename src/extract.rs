//! Text extraction for uploaded documents.
//!
//! Turns the stored blob into a sequence of page texts so passages can carry
//! page-level locators. PDF and DOCX are supported in addition to plain text
//! and Markdown; anything else is refused at upload time.

use std::io::Read;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedContentType(String),
    Pdf(String),
    Ooxml(String),
    Encoding(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content-type: {}", ct)
            }
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
            ExtractError::Encoding(e) => write!(f, "text decoding failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

pub fn is_supported(content_type: &str) -> bool {
    matches!(content_type, MIME_PDF | MIME_DOCX | MIME_TEXT | MIME_MARKDOWN)
}

/// Extracts page texts from binary content. Pages are 1-based in locators;
/// formats without an intrinsic page structure yield a single page.
pub fn extract_pages(bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf_pages(bytes),
        MIME_DOCX => extract_docx(bytes).map(|text| vec![text]),
        MIME_TEXT | MIME_MARKDOWN => {
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|e| ExtractError::Encoding(e.to_string()))?;
            Ok(split_form_feed_pages(&text))
        }
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(split_form_feed_pages(&text))
}

/// Splits on form feeds where the extractor emitted them; otherwise the whole
/// text is one page.
fn split_form_feed_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = text
        .split('\u{c}')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if pages.is_empty() {
        vec![text.trim().to_string()]
    } else {
        pages
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::Ooxml(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }
    extract_text_runs(&doc_xml)
}

/// Collects `w:t` text runs, inserting paragraph breaks at `w:p` boundaries so
/// the passage splitter sees real paragraphs.
fn extract_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => out.push_str("\n\n"),
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract_pages(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_pages(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_pages(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn plain_text_is_one_page() {
        let pages = extract_pages(b"alpha\n\nbeta", MIME_TEXT).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].contains("alpha"));
    }

    #[test]
    fn form_feeds_split_pages() {
        let pages = extract_pages(b"page one\x0cpage two\x0cpage three", MIME_TEXT).unwrap();
        assert_eq!(pages, vec!["page one", "page two", "page three"]);
    }

    #[test]
    fn empty_trailing_pages_are_dropped() {
        let pages = extract_pages(b"only page\x0c\x0c", MIME_TEXT).unwrap();
        assert_eq!(pages, vec!["only page"]);
    }
}
