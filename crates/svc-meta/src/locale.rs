//! Locale fallback chains.

/// Locale every service manifest must provide.
pub const DEFAULT_LOCALE: &str = "en";

/// Expand `locale` into the ordered list of keys to try.
///
/// `"de-DE"` yields `["de-DE", "de_DE", "de", "en"]`. The chain always ends
/// with [`DEFAULT_LOCALE`] and never repeats an entry.
pub fn candidates(locale: &str) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    let mut push = |s: String| {
        if !s.is_empty() && !chain.contains(&s) {
            chain.push(s);
        }
    };

    let locale = locale.trim();
    push(locale.to_string());
    if locale.contains('-') {
        push(locale.replace('-', "_"));
    } else if locale.contains('_') {
        push(locale.replace('_', "-"));
    }
    if let Some(language) = locale.split(['-', '_']).next() {
        push(language.to_string());
    }
    push(DEFAULT_LOCALE.to_string());
    chain
}
