//! Content sources: turning an assignment's document URL into something the
//! frontend can open.
//!
//! Each source owns a URL scheme. Plain `http(s)` documents fall through to
//! Via.

pub mod files;
pub mod jstor;
pub mod via;
pub mod vitalsource;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::MarginConfig;
use crate::error::{MarginError, Result};
use crate::models::application_instance::ApplicationInstance;

use self::files::LmsFileSource;
use self::jstor::JstorSource;
use self::via::ViaUrlBuilder;
use self::vitalsource::VitalSourceSource;

/// An internal API call the frontend makes to get the viewer URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallback {
    pub method: String,
    pub path: String,
    pub data: Value,
}

/// How the frontend gets the document to annotate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDisplayConfig {
    /// Load this URL directly.
    DirectUrl(String),
    /// Ask our API for a short-lived URL first.
    Callback(ApiCallback),
}

impl FileDisplayConfig {
    pub fn callback(path: impl Into<String>, data: Value) -> Self {
        FileDisplayConfig::Callback(ApiCallback {
            method: "POST".into(),
            path: path.into(),
            data,
        })
    }
}

/// A kind of document an assignment can point at.
pub trait ContentSource: Send + Sync {
    /// Scheme prefix including `://`.
    fn url_scheme(&self) -> &'static str;

    fn is_enabled(&self, ai: &ApplicationInstance) -> bool;

    /// Settings the file picker needs for this source.
    fn picker_config(&self, ai: &ApplicationInstance) -> Value;

    fn file_display_config(&self, document_url: &str) -> Result<FileDisplayConfig>;
}

/// Web pages and PDFs on the open web, proxied through Via.
pub struct ViaSource {
    via: ViaUrlBuilder,
}

impl ViaSource {
    pub fn new(via: ViaUrlBuilder) -> Self {
        Self { via }
    }

    fn handles(document_url: &str) -> bool {
        let lower = document_url.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }
}

impl ContentSource for ViaSource {
    fn url_scheme(&self) -> &'static str {
        "https://"
    }

    fn is_enabled(&self, _ai: &ApplicationInstance) -> bool {
        true
    }

    fn picker_config(&self, _ai: &ApplicationInstance) -> Value {
        json!({ "enabled": true })
    }

    fn file_display_config(&self, document_url: &str) -> Result<FileDisplayConfig> {
        if !Self::handles(document_url) {
            return Err(MarginError::Validation(format!(
                "unsupported document URL: {document_url}"
            )));
        }
        Ok(FileDisplayConfig::DirectUrl(self.via.build(document_url, None, None)?))
    }
}

/// Dispatches document URLs to the source owning their scheme.
pub struct ContentRegistry {
    sources: Vec<Box<dyn ContentSource>>,
    fallback: ViaSource,
}

impl ContentRegistry {
    pub fn new(config: &MarginConfig) -> Self {
        let via = ViaUrlBuilder::new(&config.h);
        Self {
            sources: vec![
                Box::new(LmsFileSource::canvas()),
                Box::new(LmsFileSource::blackboard()),
                Box::new(LmsFileSource::d2l()),
                Box::new(LmsFileSource::moodle()),
                Box::new(VitalSourceSource::new(&config.vitalsource)),
                Box::new(JstorSource::new(&config.jstor, via.clone())),
            ],
            fallback: ViaSource::new(via),
        }
    }

    /// The source for `document_url`: the first whose scheme matches, else Via.
    pub fn source_for(&self, document_url: &str) -> &dyn ContentSource {
        self.sources
            .iter()
            .find(|s| document_url.starts_with(s.url_scheme()))
            .map(|s| s.as_ref())
            .unwrap_or(&self.fallback)
    }

    pub fn file_display_config(
        &self,
        ai: &ApplicationInstance,
        document_url: &str,
    ) -> Result<FileDisplayConfig> {
        let source = self.source_for(document_url);
        if !source.is_enabled(ai) {
            return Err(MarginError::Validation(format!(
                "{} documents are not enabled for this LMS",
                source.url_scheme().trim_end_matches("://")
            )));
        }
        source.file_display_config(document_url)
    }

    /// Picker settings for every source, keyed by scheme name.
    pub fn picker_config(&self, ai: &ApplicationInstance) -> Map<String, Value> {
        let mut out = Map::new();
        for source in &self.sources {
            out.insert(
                source.url_scheme().trim_end_matches("://").to_string(),
                source.picker_config(ai),
            );
        }
        out.insert("url".into(), self.fallback.picker_config(ai));
        out
    }
}
