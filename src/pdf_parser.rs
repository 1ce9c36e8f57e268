use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Status of PDF text extraction
#[derive(Debug, Clone)]
pub enum PdfStatus {
    /// Successfully extracted text from text layer
    Success { text: String, page_count: usize },
    /// PDF appears to be scanned (no text layer)
    ScannedPdf { page_count: usize },
}

/// Raw text of a document before splitting
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub text: String,
    pub page_count: usize,
    /// Chunk type recorded in chunk metadata
    pub kind: &'static str,
}

/// Turns a file on disk into text. Blocking; called from the blocking pool.
pub trait DocumentLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedDocument>;
}

/// Loader backed by pdf-extract
#[derive(Debug, Default, Clone)]
pub struct PdfLoader;

impl DocumentLoader for PdfLoader {
    fn load(&self, path: &Path) -> Result<LoadedDocument> {
        match extract_text_from_pdf(path)? {
            PdfStatus::Success { text, page_count } => Ok(LoadedDocument {
                text,
                page_count,
                kind: "pdf",
            }),
            // No OCR: a scanned document simply has nothing to index
            PdfStatus::ScannedPdf { page_count } => Ok(LoadedDocument {
                text: String::new(),
                page_count,
                kind: "pdf",
            }),
        }
    }
}

/// Reads the file as UTF-8 text, one "page" per form feed.
#[derive(Debug, Default, Clone)]
pub struct PlainTextLoader;

impl DocumentLoader for PlainTextLoader {
    fn load(&self, path: &Path) -> Result<LoadedDocument> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read text file: {:?}", path))?;
        let page_count = text.matches('\u{c}').count() + 1;
        Ok(LoadedDocument {
            text,
            page_count,
            kind: "text",
        })
    }
}

/// Extract text from a PDF file
pub fn extract_text_from_pdf(path: &Path) -> Result<PdfStatus> {
    log::info!("Extracting text from PDF: {:?}", path);

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read PDF file: {:?}", path))?;

    let extracted = pdf_extract::extract_text_from_mem(&bytes)
        .map_err(|e| anyhow!("Failed to extract PDF text from {:?}: {}", path, e))?;

    let page_count = estimate_page_count(&bytes);

    if is_scanned_pdf(&extracted, page_count) {
        log::warn!("Detected scanned PDF (no text layer): {:?}", path);
        return Ok(PdfStatus::ScannedPdf { page_count });
    }

    log::info!(
        "Successfully extracted {} chars from PDF with {} pages",
        extracted.len(),
        page_count
    );

    Ok(PdfStatus::Success {
        text: extracted,
        page_count,
    })
}

/// Detect if a PDF is scanned (no text layer)
/// Heuristic: If text is very sparse relative to page count, likely scanned
fn is_scanned_pdf(text: &str, page_count: usize) -> bool {
    let text_length = text.trim().len();

    if text_length == 0 {
        return true;
    }

    // A typical page has 1000-3000 characters
    let chars_per_page = text_length / page_count.max(1);
    if chars_per_page < 50 {
        log::debug!(
            "PDF appears scanned: {} chars / {} pages = {} chars/page",
            text_length,
            page_count,
            chars_per_page
        );
        return true;
    }

    false
}

/// Estimate page count from PDF bytes
/// This is a rough heuristic based on "/Type /Page" occurrences
fn estimate_page_count(bytes: &[u8]) -> usize {
    let content = String::from_utf8_lossy(bytes);
    let page_markers = content.matches("/Type /Page").count();

    // "/Type /Pages" also matches the marker above
    let pages_object = content.matches("/Type /Pages").count();

    (page_markers.saturating_sub(pages_object)).max(1)
}
