//! VitalSource e-books: `vitalsource://book/bookID/{id}/cfi/{cfi}` or
//! `vitalsource://book/bookID/{id}/page/{page}`, with an optional
//! `?end_cfi=` or `?end_page=` range end.
//!
//! These are not RFC 3986 URLs (`book` would parse as a host), so they get
//! a parser of their own.

use serde_json::{json, Value};

use super::{ContentSource, FileDisplayConfig};
use crate::config::VitalSourceConfig;
use crate::error::{MarginError, Result};
use crate::models::application_instance::ApplicationInstance;

const SCHEME: &str = "vitalsource://";
const PREFIX: &str = "vitalsource://book/bookID/";
const READER_URL: &str = "https://hypothesis.vitalsource.com/books";

/// Where in a book a reading starts, and optionally ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VSBookLocation {
    pub book_id: String,
    pub start: Option<BookPosition>,
    pub end: Option<BookPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookPosition {
    Cfi(String),
    Page(String),
}

impl VSBookLocation {
    pub fn from_document_url(document_url: &str) -> Result<Self> {
        let invalid = || MarginError::Validation(format!("invalid VitalSource URL: {document_url}"));
        let rest = document_url.strip_prefix(PREFIX).ok_or_else(invalid)?;
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };

        let mut parts = path.splitn(3, '/');
        let book_id = parts.next().filter(|b| !b.is_empty()).ok_or_else(invalid)?;
        let start = match (parts.next(), parts.next()) {
            (None, _) => None,
            (Some("cfi"), Some(cfi)) if !cfi.is_empty() => Some(BookPosition::Cfi(decode(cfi)?)),
            (Some("page"), Some(page)) if !page.is_empty() => {
                Some(BookPosition::Page(decode(page)?))
            }
            _ => return Err(invalid()),
        };

        let mut end = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("end_cfi", v)) => end = Some(BookPosition::Cfi(decode(v)?)),
                Some(("end_page", v)) => end = Some(BookPosition::Page(decode(v)?)),
                _ => {}
            }
        }

        Ok(Self {
            book_id: book_id.to_string(),
            start,
            end,
        })
    }

    pub fn document_url(&self) -> String {
        let mut url = format!("{PREFIX}{}", self.book_id);
        match &self.start {
            Some(BookPosition::Cfi(cfi)) => url.push_str(&format!("/cfi/{}", encode_path(cfi))),
            Some(BookPosition::Page(page)) => {
                url.push_str(&format!("/page/{}", encode_path(page)))
            }
            None => {}
        }
        match &self.end {
            Some(BookPosition::Cfi(cfi)) => {
                url.push_str(&format!("?end_cfi={}", urlencoding::encode(cfi)))
            }
            Some(BookPosition::Page(page)) => {
                url.push_str(&format!("?end_page={}", urlencoding::encode(page)))
            }
            None => {}
        }
        url
    }

    /// The reader URL that opens the book at the start position.
    pub fn reader_url(&self) -> String {
        let mut url = format!("{READER_URL}/{}", self.book_id);
        match &self.start {
            Some(BookPosition::Cfi(cfi)) => url.push_str(&format!("/cfi/{}", encode_path(cfi))),
            Some(BookPosition::Page(page)) => {
                url.push_str(&format!("/page/{}", encode_path(page)))
            }
            None => {}
        }
        url
    }
}

/// Percent-encode a start position, leaving the characters CFI paths are
/// made of readable.
fn encode_path(s: &str) -> String {
    urlencoding::encode(s)
        .replace("%2F", "/")
        .replace("%5B", "[")
        .replace("%5D", "]")
        .replace("%21", "!")
}

fn decode(s: &str) -> Result<String> {
    urlencoding::decode(s)
        .map(|s| s.into_owned())
        .map_err(|e| MarginError::Validation(format!("invalid escape in VitalSource URL: {e}")))
}

pub struct VitalSourceSource {
    enabled: bool,
}

impl VitalSourceSource {
    pub fn new(config: &VitalSourceConfig) -> Self {
        Self {
            enabled: config.enabled && config.api_key.is_some(),
        }
    }
}

impl ContentSource for VitalSourceSource {
    fn url_scheme(&self) -> &'static str {
        SCHEME
    }

    fn is_enabled(&self, ai: &ApplicationInstance) -> bool {
        self.enabled && ai.settings.get_bool("vitalsource", "enabled")
    }

    fn picker_config(&self, ai: &ApplicationInstance) -> Value {
        json!({ "enabled": self.is_enabled(ai) })
    }

    fn file_display_config(&self, document_url: &str) -> Result<FileDisplayConfig> {
        let location = VSBookLocation::from_document_url(document_url)?;
        Ok(FileDisplayConfig::DirectUrl(location.reader_url()))
    }
}
