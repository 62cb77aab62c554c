//! Format dispatch for document text extraction.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use super::pdf::{OcrEngine, PdfExtractor};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Direct,
    Ocr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub method: ExtractionMethod,
    pub pages_processed: usize,
    pub timing_ms: u64,
    pub pages_with_direct_text: usize,
    pub pages_with_ocr: usize,
}

#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub stats: ExtractionStats,
}

pub struct TextExtractor {
    ocr: Option<Arc<dyn OcrEngine>>,
    max_pdf_pages: usize,
}

impl TextExtractor {
    pub fn new(max_pdf_pages: usize) -> Self {
        Self {
            ocr: None,
            max_pdf_pages,
        }
    }

    pub fn with_ocr(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(engine);
        self
    }

    /// Extract plain text from a document. Dispatch is by file extension;
    /// unknown extensions are treated as plain text.
    pub fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText> {
        let extension = filename
            .rsplit('.')
            .next()
            .unwrap_or("txt")
            .to_lowercase();

        match extension.as_str() {
            "pdf" => {
                let extractor = PdfExtractor {
                    ocr: self.ocr.as_deref(),
                    max_pages: self.max_pdf_pages,
                };
                extractor.extract(bytes)
            }
            "docx" => self.extract_docx(bytes),
            "rtf" => self.plain(extract_rtf(bytes)?),
            _ => self.plain(decode_text(bytes)),
        }
    }

    fn plain(&self, text: String) -> Result<ExtractedText> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::Permanent("document contains no text".into()));
        }
        Ok(ExtractedText {
            text: trimmed.to_string(),
            stats: ExtractionStats {
                method: ExtractionMethod::Direct,
                pages_processed: 1,
                timing_ms: 0,
                pages_with_direct_text: 1,
                pages_with_ocr: 0,
            },
        })
    }

    fn extract_docx(&self, bytes: &[u8]) -> Result<ExtractedText> {
        let started = Instant::now();
        let cursor = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(cursor)
            .map_err(|e| Error::Permanent(format!("DOCX is not a valid ZIP: {e}")))?;

        let mut xml = String::new();
        {
            let mut entry = archive
                .by_name("word/document.xml")
                .map_err(|_| Error::Permanent("DOCX missing word/document.xml".into()))?;
            entry
                .read_to_string(&mut xml)
                .map_err(|e| Error::Permanent(format!("DOCX document.xml read: {e}")))?;
        }

        let text = extract_docx_text(&xml);
        if text.trim().is_empty() {
            return Err(Error::Permanent("DOCX contains no extractable text".into()));
        }

        Ok(ExtractedText {
            text,
            stats: ExtractionStats {
                method: ExtractionMethod::Direct,
                pages_processed: 1,
                timing_ms: started.elapsed().as_millis() as u64,
                pages_with_direct_text: 1,
                pages_with_ocr: 0,
            },
        })
    }
}

/// Decode bytes as UTF-8; when replacement characters show up, reinterpret
/// as Windows-1252 (the practical superset of latin-1 in the wild).
fn decode_text(bytes: &[u8]) -> String {
    let utf8 = String::from_utf8_lossy(bytes);
    if utf8.contains('\u{FFFD}') {
        let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
        decoded.into_owned()
    } else {
        utf8.into_owned()
    }
}

/// Strip RTF control words and group braces, keeping the visible text.
/// Destination groups (font tables, color tables, metadata) are skipped
/// entirely.
fn extract_rtf(bytes: &[u8]) -> Result<String> {
    let raw = decode_text(bytes);
    if !raw.starts_with("{\\rtf") {
        return Err(Error::Permanent("not an RTF document".into()));
    }

    const DESTINATIONS: [&str; 5] = ["fonttbl", "colortbl", "stylesheet", "info", "pict"];

    let mut out = String::new();
    let mut chars = raw.chars().peekable();
    // Brace depth of the innermost destination group being skipped.
    let mut skip_until_depth: Option<i32> = None;
    let mut depth: i32 = 0;

    while let Some(c) = chars.next() {
        if let Some(target) = skip_until_depth {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth < target {
                        skip_until_depth = None;
                    }
                }
                _ => {}
            }
            continue;
        }

        match c {
            '{' => {
                depth += 1;
                // A group opening with \* or a destination word is skipped.
                if chars.peek() == Some(&'\\') {
                    let lookahead: String = chars.clone().take(12).collect();
                    if lookahead.starts_with("\\*")
                        || DESTINATIONS.iter().any(|d| lookahead[1..].starts_with(d))
                    {
                        skip_until_depth = Some(depth);
                    }
                }
            }
            '}' => depth -= 1,
            '\\' => {
                match chars.peek() {
                    // Escaped literal braces and backslash
                    Some(&next @ ('{' | '}' | '\\')) => {
                        out.push(next);
                        chars.next();
                    }
                    // Hex escape \'hh
                    Some('\'') => {
                        chars.next();
                        let hi = chars.next();
                        let lo = chars.next();
                        if let (Some(hi), Some(lo)) = (hi, lo) {
                            if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                                let bytes = [byte];
                                let (decoded, _, _) =
                                    encoding_rs::WINDOWS_1252.decode(&bytes);
                                out.push_str(&decoded);
                            }
                        }
                    }
                    _ => {
                        // Control word: letters then optional numeric argument
                        let mut word = String::new();
                        while let Some(&next) = chars.peek() {
                            if next.is_ascii_alphabetic() {
                                word.push(next);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        while let Some(&next) = chars.peek() {
                            if next.is_ascii_digit() || next == '-' {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        // A single space after a control word is part of it
                        if chars.peek() == Some(&' ') {
                            chars.next();
                        }
                        if word == "par" || word == "line" {
                            out.push('\n');
                        }
                    }
                }
            }
            '\r' | '\n' => {}
            _ => out.push(c),
        }
    }

    Ok(out.trim().to_string())
}

/// Extract text from DOCX XML by walking `<w:t>` runs within `<w:p>`
/// paragraphs.
fn extract_docx_text(xml: &str) -> String {
    let mut result = String::new();
    let mut pos = 0;

    while pos < xml.len() {
        let Some(p_start) = xml[pos..].find("<w:p") else {
            break;
        };
        let abs_p_start = pos + p_start;
        let p_end = xml[abs_p_start..]
            .find("</w:p>")
            .map(|e| abs_p_start + e + 6)
            .unwrap_or(xml.len());

        let paragraph = &xml[abs_p_start..p_end];
        let mut para_text = String::new();
        let mut t_pos = 0;

        while let Some(t_start) = paragraph[t_pos..].find("<w:t") {
            let abs_t_start = t_pos + t_start;
            let Some(tag_end) = paragraph[abs_t_start..].find('>') else {
                break;
            };
            let content_start = abs_t_start + tag_end + 1;
            let Some(t_end) = paragraph[content_start..].find("</w:t>") else {
                t_pos = content_start;
                continue;
            };
            para_text.push_str(&paragraph[content_start..content_start + t_end]);
            t_pos = content_start + t_end + 6;
        }

        if !para_text.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&para_text);
        }

        pos = p_end;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::pdf::fixtures::{dense_page_text, pdf_with_pages};
    use crate::processing::{chunk_text, ChunkOptions};

    #[test]
    fn text_pdf_extracts_directly_and_chunks() {
        crate::test_logging::init();
        let page = dense_page_text();
        let bytes = pdf_with_pages(&[&page, &page, &page]);

        let extractor = TextExtractor::new(1000);
        let result = extractor.extract(&bytes, "bericht.pdf").unwrap();

        assert_eq!(result.stats.method, ExtractionMethod::Direct);
        assert_eq!(result.stats.pages_processed, 3);
        assert!(result.text.contains("## Seite 1"));

        let chunks = chunk_text(&result.text, &ChunkOptions::default());
        assert!(!chunks.is_empty());
    }

    #[test]
    fn scanned_pdf_without_ocr_fails_with_no_text() {
        crate::test_logging::init();
        let bytes = pdf_with_pages(&["", ""]);

        let extractor = TextExtractor::new(1000);
        match extractor.extract(&bytes, "scan.pdf") {
            Err(Error::Permanent(reason)) => assert!(reason.contains("no text")),
            other => panic!("expected permanent no-text failure, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_extracts_as_is() {
        let extractor = TextExtractor::new(1000);
        let result = extractor
            .extract("Kommunaler Klimaschutz".as_bytes(), "notiz.txt")
            .unwrap();
        assert_eq!(result.text, "Kommunaler Klimaschutz");
        assert_eq!(result.stats.method, ExtractionMethod::Direct);
    }

    #[test]
    fn empty_document_is_a_permanent_error() {
        let extractor = TextExtractor::new(1000);
        assert!(matches!(
            extractor.extract(b"   ", "leer.txt"),
            Err(Error::Permanent(_))
        ));
    }

    #[test]
    fn latin1_bytes_fall_back_cleanly() {
        // "Straße" encoded as Windows-1252: ß = 0xDF
        let bytes = [b'S', b't', b'r', b'a', 0xDF, b'e'];
        assert_eq!(decode_text(&bytes), "Straße");
    }

    #[test]
    fn rtf_controls_and_destinations_are_stripped() {
        let rtf = r"{\rtf1\ansi\deff0 {\fonttbl{\f0 Arial;}}Antrag zur \b Verkehrswende\b0 .\par Zweite Zeile.}";
        let text = extract_rtf(rtf.as_bytes()).unwrap();
        assert!(text.contains("Antrag zur Verkehrswende."));
        assert!(text.contains("Zweite Zeile."));
        assert!(!text.contains("Arial"));
        assert!(!text.contains('\\'));
    }

    #[test]
    fn rtf_requires_the_magic() {
        assert!(matches!(
            extract_rtf(b"plain text"),
            Err(Error::Permanent(_))
        ));
    }

    #[test]
    fn docx_paragraph_walker_reads_runs() {
        let xml = r#"<w:document><w:body><w:p><w:r><w:t>Erster Absatz</w:t></w:r></w:p><w:p><w:r><w:t xml:space="preserve">Zweiter </w:t></w:r><w:r><w:t>Absatz</w:t></w:r></w:p></w:body></w:document>"#;
        let text = extract_docx_text(xml);
        assert_eq!(text, "Erster Absatz\nZweiter Absatz");
    }
}
