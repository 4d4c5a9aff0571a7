//! PDF agent: raw PDF bytes in, page-sectioned text out.

use async_trait::async_trait;
use serde_json::Value;

use super::Transform;
use crate::error::TransformError;
use crate::message::{Payload, PayloadKind};
use crate::schema::PdfResponse;

const PDF_MAGIC: &[u8] = b"%PDF-";

pub struct PdfTransform;

#[async_trait]
impl Transform for PdfTransform {
    fn name(&self) -> &str {
        "pdf"
    }

    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Binary
    }

    async fn apply(&self, payload: Payload) -> Result<Value, TransformError> {
        let bytes = match payload {
            Payload::Binary(bytes) => bytes,
            Payload::Json(_) => return Err(TransformError::invalid("pdf expects raw bytes")),
        };
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(TransformError::invalid("payload is not a PDF document"));
        }

        // pdf-extract is synchronous and may panic on damaged files.
        let response = tokio::task::spawn_blocking(move || extract(&bytes))
            .await
            .map_err(|e| TransformError::failed(format!("pdf extraction aborted: {}", e)))??;

        serde_json::to_value(response).map_err(|e| TransformError::failed(e.to_string()))
    }
}

fn extract(bytes: &[u8]) -> Result<PdfResponse, TransformError> {
    let raw = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| TransformError::failed(format!("pdf extraction failed: {}", e)))?;

    Ok(PdfResponse {
        text: sectioned_text(&raw),
        images: image_summary(count_images(bytes)),
    })
}

/// Lay extracted text out as `--- Page N ---` sections. Pages are separated
/// by form feeds in the extractor's output.
fn sectioned_text(raw: &str) -> String {
    let mut pages: Vec<&str> = raw.split('\x0C').map(str::trim).collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.is_empty()) {
        pages.pop();
    }

    let mut out = String::new();
    for (index, page) in pages.into_iter().enumerate() {
        out.push_str(&format!("\n\n--- Page {} ---\n", index + 1));
        if page.is_empty() {
            out.push_str("[No text found]");
        } else {
            out.push_str(page);
        }
    }
    out
}

/// Count image XObjects by scanning the raw file for their subtype marker.
fn count_images(bytes: &[u8]) -> usize {
    let spaced = count_occurrences(bytes, b"/Subtype /Image");
    let compact = count_occurrences(bytes, b"/Subtype/Image");
    spaced + compact
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

fn image_summary(count: usize) -> String {
    match count {
        0 => String::new(),
        1 => "1 embedded image (content not extracted)".to_string(),
        n => format!("{} embedded images (content not extracted)", n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sectioned_text_numbers_pages() {
        let text = sectioned_text("first page\x0C\x0Cthird page\x0C");
        assert!(text.contains("--- Page 1 ---\nfirst page"));
        assert!(text.contains("--- Page 2 ---\n[No text found]"));
        assert!(text.contains("--- Page 3 ---\nthird page"));
        assert!(!text.contains("--- Page 4 ---"));
    }

    #[test]
    fn test_image_count() {
        let raw = b"<< /Type /XObject /Subtype /Image >> << /Subtype/Image >>";
        assert_eq!(count_images(raw), 2);
        assert_eq!(image_summary(0), "");
    }

    #[tokio::test]
    async fn test_non_pdf_bytes_are_invalid_input() {
        let err = PdfTransform
            .apply(Payload::Binary(b"This is not a PDF".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidInput(_)));
    }
}
