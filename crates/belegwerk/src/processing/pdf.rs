//! PDF text extraction: a fast direct path when the file yields text, an OCR
//! path through a pluggable engine when it does not.

use anyhow::Result as AnyResult;
use std::time::Instant;

use super::extractor::{ExtractedText, ExtractionMethod, ExtractionStats};
use crate::error::{Error, Result};

/// Page-level OCR. Rasterization is the engine's concern; the pipeline hands
/// over the original PDF bytes and a 1-based page number.
pub trait OcrEngine: Send + Sync {
    fn ocr_page(&self, pdf_bytes: &[u8], page_number: u32) -> AnyResult<String>;
}

/// Direct extraction wins when the sampled score reaches this value.
const PARSEABLE_THRESHOLD: f64 = 0.8;
/// A sampled page counts as a success when it yields at least this many chars.
const PAGE_SUCCESS_CHARS: usize = 20;
/// Char density per page that maps to a full density score.
const FULL_DENSITY_CHARS: f64 = 200.0;
const SAMPLE_PAGES: usize = 8;
/// Direct extraction runs page batches of this size in parallel.
const PAGE_BATCH: usize = 8;

pub struct PdfExtractor<'a> {
    pub ocr: Option<&'a dyn OcrEngine>,
    pub max_pages: usize,
}

impl<'a> PdfExtractor<'a> {
    pub fn extract(&self, bytes: &[u8]) -> Result<ExtractedText> {
        let started = Instant::now();

        let doc = match lopdf::Document::load_mem(bytes) {
            Ok(doc) => doc,
            Err(e) => {
                // Structurally odd PDFs sometimes still yield to pdf-extract's
                // whole-document pass.
                tracing::debug!(error = %e, "lopdf parse failed, trying whole-document extraction");
                return self.whole_document_fallback(bytes, started);
            }
        };

        let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
        let page_count = page_numbers.len().min(self.max_pages);
        if page_count == 0 {
            return Err(Error::Permanent("PDF has no pages".into()));
        }
        let pages = &page_numbers[..page_count];

        let score = parseability_score(&doc, pages);
        tracing::debug!(score = format!("{:.2}", score), pages = page_count, "PDF parseability");

        if score >= PARSEABLE_THRESHOLD {
            self.direct_extract(&doc, pages, started)
        } else {
            self.ocr_extract(&doc, bytes, pages, started)
        }
    }

    /// Page-by-page direct extraction with `## Seite N` section headers,
    /// batched across threads.
    fn direct_extract(
        &self,
        doc: &lopdf::Document,
        pages: &[u32],
        started: Instant,
    ) -> Result<ExtractedText> {
        let mut page_texts: Vec<(u32, String)> = Vec::with_capacity(pages.len());

        for batch in pages.chunks(PAGE_BATCH) {
            let mut batch_results: Vec<(u32, String)> = std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|&page| {
                        scope.spawn(move || {
                            let text = doc.extract_text(&[page]).unwrap_or_default();
                            (page, text)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or((0, String::new())))
                    .collect()
            });
            batch_results.sort_by_key(|(page, _)| *page);
            page_texts.extend(batch_results);
        }

        let mut text = String::new();
        let mut pages_with_text = 0usize;
        for (page, page_text) in &page_texts {
            let cleaned = clean_page_text(page_text);
            if cleaned.is_empty() {
                continue;
            }
            pages_with_text += 1;
            text.push_str(&format!("## Seite {}\n\n{}\n\n", page, cleaned));
        }

        if text.trim().is_empty() {
            return Err(Error::Permanent(
                "PDF contains no extractable text (scanned/image-based): no text".into(),
            ));
        }

        Ok(ExtractedText {
            text,
            stats: ExtractionStats {
                method: ExtractionMethod::Direct,
                pages_processed: pages.len(),
                timing_ms: started.elapsed().as_millis() as u64,
                pages_with_direct_text: pages_with_text,
                pages_with_ocr: 0,
            },
        })
    }

    /// OCR path: per page, keep direct text where it exists, run the engine
    /// where it does not, then apply the markdown cleanup pass.
    fn ocr_extract(
        &self,
        doc: &lopdf::Document,
        bytes: &[u8],
        pages: &[u32],
        started: Instant,
    ) -> Result<ExtractedText> {
        let Some(ocr) = self.ocr else {
            // Without an engine a low-parseability PDF either still has some
            // direct text, or it fails with a clear reason.
            return self.direct_extract(doc, pages, started);
        };

        let mut text = String::new();
        let mut pages_with_direct = 0usize;
        let mut pages_with_ocr = 0usize;

        for &page in pages {
            let direct = doc
                .extract_text(&[page])
                .map(|t| clean_page_text(&t))
                .unwrap_or_default();

            let page_text = if direct.len() >= PAGE_SUCCESS_CHARS {
                pages_with_direct += 1;
                direct
            } else {
                match ocr.ocr_page(bytes, page) {
                    Ok(recognized) if !recognized.trim().is_empty() => {
                        pages_with_ocr += 1;
                        markdown_cleanup(&recognized)
                    }
                    Ok(_) => String::new(),
                    Err(e) => {
                        tracing::warn!(page, error = %e, "OCR failed for page");
                        String::new()
                    }
                }
            };

            if !page_text.is_empty() {
                text.push_str(&format!("## Seite {}\n\n{}\n\n", page, page_text));
            }
        }

        if text.trim().is_empty() {
            return Err(Error::Permanent(
                "PDF contains no extractable text (scanned/image-based): no text".into(),
            ));
        }

        Ok(ExtractedText {
            text,
            stats: ExtractionStats {
                method: ExtractionMethod::Ocr,
                pages_processed: pages.len(),
                timing_ms: started.elapsed().as_millis() as u64,
                pages_with_direct_text: pages_with_direct,
                pages_with_ocr,
            },
        })
    }

    fn whole_document_fallback(&self, bytes: &[u8], started: Instant) -> Result<ExtractedText> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| Error::Permanent(format!("PDF extraction failed: {e}")))?;
        let cleaned = clean_page_text(&text);
        if cleaned.is_empty() {
            return Err(Error::Permanent(
                "PDF contains no extractable text (scanned/image-based): no text".into(),
            ));
        }
        Ok(ExtractedText {
            text: cleaned,
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

/// 0–1 estimate of how well this PDF yields text without OCR, from text
/// density and per-page success rate over an evenly spaced sample.
pub fn parseability_score(doc: &lopdf::Document, pages: &[u32]) -> f64 {
    if pages.is_empty() {
        return 0.0;
    }

    let step = (pages.len() / SAMPLE_PAGES).max(1);
    let sampled: Vec<u32> = pages.iter().step_by(step).take(SAMPLE_PAGES).copied().collect();

    let mut total_chars = 0usize;
    let mut successes = 0usize;
    for &page in &sampled {
        let chars = doc
            .extract_text(&[page])
            .map(|t| t.trim().chars().count())
            .unwrap_or(0);
        total_chars += chars;
        if chars >= PAGE_SUCCESS_CHARS {
            successes += 1;
        }
    }

    let density = (total_chars as f64 / sampled.len() as f64 / FULL_DENSITY_CHARS).min(1.0);
    let success_rate = successes as f64 / sampled.len() as f64;
    0.6 * density + 0.4 * success_rate
}

fn clean_page_text(text: &str) -> String {
    text.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Light markdown pass over OCR output: promote likely headings, collapse
/// whitespace. Heading cues: short ALL-CAPS lines, trailing colons, numbered
/// leads ("3.1 Finanzierung").
pub fn markdown_cleanup(text: &str) -> String {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let collapsed = collapse_spaces(line);
        if looks_like_heading(&collapsed) {
            out.push(format!("### {}", collapsed.trim_end_matches(':')));
        } else {
            out.push(collapsed);
        }
    }
    out.join("\n")
}

fn collapse_spaces(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_heading(line: &str) -> bool {
    let words = line.split_whitespace().count();
    if words == 0 || words > 8 {
        return false;
    }

    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    let all_caps = !letters.is_empty() && letters.iter().all(|c| c.is_uppercase());
    if all_caps {
        return true;
    }
    if line.ends_with(':') && words <= 6 {
        return true;
    }
    // Numbered lead: "2. Maßnahmen" / "3.1 Finanzierung"
    let mut parts = line.splitn(2, ' ');
    if let (Some(lead), Some(_)) = (parts.next(), parts.next()) {
        let lead = lead.trim_end_matches('.');
        if !lead.is_empty() && lead.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return true;
        }
    }
    false
}

/// Minimal in-memory PDFs for the extraction tests. Built through lopdf so
/// the bytes are valid by construction; an empty page text produces a page
/// with no text operations, which is what a scanned page looks like to the
/// extractor.
#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    pub(crate) fn pdf_with_pages(page_texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in page_texts {
            let mut operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![50.into(), 780.into()]),
            ];
            for line in text.lines() {
                operations.push(Operation::new("Tj", vec![Object::string_literal(line)]));
                operations.push(Operation::new("Td", vec![0.into(), (-14).into()]));
            }
            operations.push(Operation::new("ET", vec![]));

            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(
                dictionary! {},
                content.encode().expect("content stream encodes"),
            ));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("pdf serializes");
        bytes
    }

    /// A text page with enough density to count as directly parseable.
    /// ASCII only so font-encoding quirks stay out of the assertions.
    pub(crate) fn dense_page_text() -> String {
        "Der Gemeinderat beraet ueber den Haushalt und den Klimaschutz der Stadt.\n"
            .repeat(8)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{dense_page_text, pdf_with_pages};
    use super::*;

    struct StubOcr;

    impl OcrEngine for StubOcr {
        fn ocr_page(&self, _pdf_bytes: &[u8], page_number: u32) -> AnyResult<String> {
            Ok(format!(
                "ERFASSTER ABSCHNITT\nGescannter Inhalt von Seite {page_number} mit ausreichend Zeichen."
            ))
        }
    }

    #[test]
    fn parseability_separates_text_from_scanned_pages() {
        let page = dense_page_text();
        let texty = pdf_with_pages(&[&page, &page, &page]);
        let doc = lopdf::Document::load_mem(&texty).unwrap();
        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        assert!(parseability_score(&doc, &pages) >= PARSEABLE_THRESHOLD);

        let scanned = pdf_with_pages(&["", ""]);
        let doc = lopdf::Document::load_mem(&scanned).unwrap();
        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        assert!(parseability_score(&doc, &pages) < PARSEABLE_THRESHOLD);
    }

    #[test]
    fn text_pdf_takes_the_direct_path_with_page_headers() {
        let page = dense_page_text();
        let bytes = pdf_with_pages(&[&page, &page, &page]);

        let extractor = PdfExtractor {
            ocr: None,
            max_pages: 1000,
        };
        let result = extractor.extract(&bytes).unwrap();

        assert_eq!(result.stats.method, ExtractionMethod::Direct);
        assert_eq!(result.stats.pages_processed, 3);
        assert_eq!(result.stats.pages_with_direct_text, 3);
        assert_eq!(result.stats.pages_with_ocr, 0);
        assert!(result.text.contains("## Seite 1"));
        assert!(result.text.contains("## Seite 3"));
        assert!(result.text.contains("Klimaschutz"));
    }

    #[test]
    fn scanned_pdf_without_engine_fails_with_no_text() {
        let bytes = pdf_with_pages(&["", ""]);
        let extractor = PdfExtractor {
            ocr: None,
            max_pages: 1000,
        };
        let outcome = extractor.extract(&bytes);
        match outcome {
            Err(Error::Permanent(reason)) => assert!(reason.contains("no text")),
            other => panic!("expected permanent no-text failure, got {other:?}"),
        }
    }

    #[test]
    fn scanned_pdf_with_engine_takes_the_ocr_path() {
        let bytes = pdf_with_pages(&["", ""]);
        let extractor = PdfExtractor {
            ocr: Some(&StubOcr),
            max_pages: 1000,
        };
        let result = extractor.extract(&bytes).unwrap();

        assert_eq!(result.stats.method, ExtractionMethod::Ocr);
        assert_eq!(result.stats.pages_processed, 2);
        assert_eq!(result.stats.pages_with_ocr, 2);
        assert_eq!(result.stats.pages_with_direct_text, 0);
        assert!(result.text.contains("## Seite 1"));
        // The markdown pass promotes the all-caps OCR line to a heading.
        assert!(result.text.contains("### ERFASSTER ABSCHNITT"));
    }

    #[test]
    fn mixed_pdf_keeps_direct_pages_and_ocrs_the_rest() {
        // One dense page against two empty ones keeps the parseability
        // score below the direct threshold.
        let page = dense_page_text();
        let bytes = pdf_with_pages(&[&page, "", ""]);
        let extractor = PdfExtractor {
            ocr: Some(&StubOcr),
            max_pages: 1000,
        };
        let result = extractor.extract(&bytes).unwrap();

        assert_eq!(result.stats.method, ExtractionMethod::Ocr);
        assert_eq!(result.stats.pages_with_direct_text, 1);
        assert_eq!(result.stats.pages_with_ocr, 2);
        assert!(result.text.contains("Gemeinderat"));
        assert!(result.text.contains("Gescannter Inhalt"));
    }

    #[test]
    fn heading_detection_covers_the_three_cues() {
        assert!(looks_like_heading("ZUSAMMENFASSUNG"));
        assert!(looks_like_heading("Finanzierung im Detail:"));
        assert!(looks_like_heading("3.1 Maßnahmenkatalog"));
        assert!(!looks_like_heading(
            "Dies ist ein ganz normaler Satz aus dem Fließtext des Dokuments ohne Auszeichnung"
        ));
    }

    #[test]
    fn markdown_cleanup_promotes_headings_and_collapses_whitespace() {
        let raw = "EINLEITUNG\nDer   Text   mit   Lücken.\nNächste Schritte:\n";
        let cleaned = markdown_cleanup(raw);
        assert!(cleaned.contains("### EINLEITUNG"));
        assert!(cleaned.contains("### Nächste Schritte"));
        assert!(cleaned.contains("Der Text mit Lücken."));
    }
}
