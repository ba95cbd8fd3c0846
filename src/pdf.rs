use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
	#[error("Invalid or corrupted PDF file: {path}")]
	Corrupted {
		path: String,
		reason: String,
	},

	#[error("Invalid page numbers: {invalid:?}. Valid range is 1-{total}.")]
	InvalidPages {
		invalid: Vec<i64>,
		total: usize,
	},

	#[error("PDF support is not available in this build")]
	Unavailable,

	#[error("Failed to process PDF file {path}: {reason}")]
	Extraction {
		path: String,
		reason: String,
	},
}

impl PdfError {
	pub fn code(&self) -> &'static str {
		match self {
			PdfError::InvalidPages { .. } => "INVALID_PAGES",
			PdfError::Unavailable => "UNSUPPORTED",
			PdfError::Corrupted { .. } | PdfError::Extraction { .. } => "PDF_ERROR",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PdfPage {
	pub page_number: i64,
	pub text_content: String,
}

#[derive(Debug)]
pub struct ExtractedPdf {
	pub total_pages: usize,
	pub pages: Vec<PdfPage>,
}

/// Pages outside `1..=total` are rejected as a group before any text is read.
/// `None` selects every page; an empty selection yields no pages.
pub fn select_pages(requested: Option<&[i64]>, total: usize) -> Result<Vec<i64>, PdfError> {
	let Some(requested) = requested else {
		return Ok((1..=total as i64).collect());
	};
	let invalid: Vec<i64> = requested.iter()
		.copied()
		.filter(|page| *page < 1 || *page > total as i64)
		.collect();
	if !invalid.is_empty() {
		return Err(PdfError::InvalidPages {
			invalid,
			total
		});
	}
	Ok(requested.to_vec())
}

/// Blocking. Callers run this on the blocking pool.
#[cfg(feature = "pdf")]
pub fn extract_pages(path: &Path, requested: Option<&[i64]>) -> Result<ExtractedPdf, PdfError> {
	let display = path.display().to_string();
	let document = lopdf::Document::load(path).map_err(
		|err| PdfError::Corrupted {
			path: display.clone(),
			reason: err.to_string()
		}
	)?;
	let page_ids = document.get_pages();
	let total_pages = page_ids.len();
	let selected = select_pages(requested, total_pages)?;
	let mut pages = Vec::with_capacity(selected.len());
	for page_number in selected {
		let text = document.extract_text(&[page_number as u32]).map_err(
			|err| PdfError::Extraction {
				path: display.clone(),
				reason: err.to_string()
			}
		)?;
		pages.push(PdfPage {
			page_number,
			text_content: text.trim().to_string()
		});
	}
	Ok(ExtractedPdf {
		total_pages,
		pages
	})
}

#[cfg(not(feature = "pdf"))]
pub fn extract_pages(_path: &Path, _requested: Option<&[i64]>) -> Result<ExtractedPdf, PdfError> {
	Err(PdfError::Unavailable)
}
