//! Best-effort language detection through a fastText HTTP service.
//!
//! The service answers `GET {base}/language_detect?text=...` with a JSON array
//! whose first element starts with the language code, e.g.
//! `[["en", 0.97], ["de", 0.01]]`. Any failure yields [`DEFAULT_LANGUAGE`].

use crate::error::{ChatError, Result};
use std::time::Duration;
use tracing::{debug, error};

/// Tag returned whenever detection fails.
pub const DEFAULT_LANGUAGE: &str = "en";

/// HTTP client for the language detection endpoint.
#[derive(Debug, Clone)]
pub struct LanguageDetector {
    base_url: String,
    client: reqwest::Client,
}

impl LanguageDetector {
    /// Create a detector for `base_url`, bounding each request by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
        })
    }

    /// Detect the language of `text`, falling back to `"en"`.
    pub async fn detect(&self, text: &str) -> String {
        debug!("detecting language for: {text}");
        match self.try_detect(text).await {
            Ok(tag) => tag,
            Err(e) => {
                error!("lang detect error: {e}");
                DEFAULT_LANGUAGE.to_owned()
            }
        }
    }

    async fn try_detect(&self, text: &str) -> Result<String> {
        let url = format!(
            "{}/language_detect?text={}",
            self.base_url,
            urlencoding::encode(text)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChatError::Detection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Detection(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ChatError::Detection(e.to_string()))?;
        parse_detection(&body)
    }
}

/// Pull the language code out of a detection reply and normalize it.
pub(crate) fn parse_detection(body: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ChatError::MalformedDetectionResponse(format!("not JSON: {e}")))?;

    let code = value
        .get(0)
        .and_then(|first| first.get(0))
        .and_then(|code| code.as_str())
        .ok_or_else(|| {
            ChatError::MalformedDetectionResponse(format!("missing lang in reply: {body}"))
        })?;

    let tag = standardize_tag(code);
    if tag.is_empty() {
        return Err(ChatError::MalformedDetectionResponse(format!(
            "empty lang in reply: {body}"
        )));
    }
    Ok(tag)
}

/// Normalize a language code to BCP-47 casing.
///
/// Strips the fastText `__label__` prefix, accepts `_` as a separator,
/// lowercases the language, title-cases a 4-letter script and uppercases a
/// 2-letter region. A few legacy codes are mapped to their modern form.
pub fn standardize_tag(code: &str) -> String {
    let code = code.trim();
    let code = code.strip_prefix("__label__").unwrap_or(code);

    let mut parts = code.split(['-', '_']).filter(|p| !p.is_empty());

    let Some(language) = parts.next() else {
        return String::new();
    };
    let language = language.to_ascii_lowercase();
    let mut tag = canonical_language(&language).to_owned();

    for subtag in parts {
        tag.push('-');
        match subtag.len() {
            4 if subtag.chars().all(|c| c.is_ascii_alphabetic()) => {
                let mut chars = subtag.chars();
                if let Some(first) = chars.next() {
                    tag.push(first.to_ascii_uppercase());
                    tag.extend(chars.map(|c| c.to_ascii_lowercase()));
                }
            }
            2 => tag.push_str(&subtag.to_ascii_uppercase()),
            _ => tag.push_str(&subtag.to_ascii_lowercase()),
        }
    }
    tag
}

/// Map deprecated or 3-letter codes that have a 2-letter equivalent.
fn canonical_language(language: &str) -> &str {
    match language {
        "eng" => "en",
        "deu" | "ger" => "de",
        "fra" | "fre" => "fr",
        "spa" => "es",
        "ita" => "it",
        "nld" | "dut" => "nl",
        "por" => "pt",
        "rus" => "ru",
        "zho" | "chi" => "zh",
        "jpn" => "ja",
        "iw" => "he",
        "in" => "id",
        "ji" => "yi",
        "jw" => "jv",
        "mo" => "ro",
        other => other,
    }
}
