//! Language detection and placeholder protection.
//! Wraps any provider so that untranslatable tokens survive translation and
//! text already in the target language never reaches the network.

use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{TranslateError, TranslationBackend};

/// A placeholder substitution that must be restored after translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderEntry {
    pub tag: String,      // e.g. "<<PH0>>"
    pub original: String, // e.g. "https://example.com"
}

/// Detects the dominant language of `text` using whatlang.
/// Returns an ISO 639-1 code or None if detection is unreliable.
pub fn detect_language(text: &str) -> Option<&'static str> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    Some(lang_to_code(info.lang()))
}

fn lang_to_code(lang: whatlang::Lang) -> &'static str {
    use whatlang::Lang::*;
    match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Hin => "hi",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        _ => "other",
    }
}

/// `zh-CN` and `zh` both match detected `zh`.
fn same_language(detected: &str, target: &str) -> bool {
    let primary = target.split(['-', '_']).next().unwrap_or(target);
    primary.eq_ignore_ascii_case(detected)
}

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Inline code (backtick-wrapped)
            r"`[^`\n]+`",
            // URLs
            r"https?://[^\s,，。)）\]>]+",
            // Emails
            r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("placeholder pattern is valid"))
        .collect()
    })
}

/// Replace protected tokens with `<<PH0>>`, `<<PH1>>`, etc.
/// Returns the protected text and the entries for later restoration.
pub fn protect(text: &str) -> (String, Vec<PlaceholderEntry>) {
    let mut entries: Vec<PlaceholderEntry> = Vec::new();
    let mut result = text.to_string();

    for pat in patterns() {
        let mut out = String::with_capacity(result.len());
        let mut last = 0;
        for m in pat.find_iter(&result) {
            let tag = format!("<<PH{}>>", entries.len());
            out.push_str(&result[last..m.start()]);
            out.push_str(&tag);
            entries.push(PlaceholderEntry {
                tag,
                original: m.as_str().to_string(),
            });
            last = m.end();
        }
        out.push_str(&result[last..]);
        result = out;
    }

    (result, entries)
}

/// Restore placeholders in the translated text.
pub fn restore(text: &str, entries: &[PlaceholderEntry]) -> String {
    let mut result = text.to_string();
    for entry in entries.iter().rev() {
        result = result.replace(&entry.tag, &entry.original);
    }
    result
}

/// Provider decorator: same-language pass-through plus placeholder protection.
pub struct Normalizing {
    inner: Arc<dyn TranslationBackend>,
    target_lang: String,
}

impl Normalizing {
    pub fn new(inner: Arc<dyn TranslationBackend>, target_lang: &str) -> Self {
        Self {
            inner,
            target_lang: target_lang.to_string(),
        }
    }

    async fn run(&self, text: &str, cancel: &CancellationToken) -> Result<String, TranslateError> {
        if let Some(lang) = detect_language(text) {
            if same_language(lang, &self.target_lang) {
                debug!(lang, "source already in target language, passing through");
                return Ok(text.to_string());
            }
        }

        let (protected, placeholders) = protect(text);
        let residual = placeholders
            .iter()
            .fold(protected.clone(), |acc, p| acc.replace(&p.tag, ""));
        if residual.trim().is_empty() {
            // Nothing left to translate.
            return Ok(text.to_string());
        }

        let translated = self.inner.translate(&protected, cancel).await?;
        Ok(restore(&translated, &placeholders))
    }
}

impl TranslationBackend for Normalizing {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn translate<'a>(
        &'a self,
        text: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, TranslateError>> {
        Box::pin(self.run(text, cancel))
    }
}
