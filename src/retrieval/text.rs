//! Tokenizing shared by keyword matching and the hashing embedder.

const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "by", "can", "do", "each",
    "every", "for", "from", "get", "give", "have", "how", "i", "in", "is", "it", "list", "many",
    "me", "much", "my", "of", "on", "or", "our", "per", "please", "show", "tell", "that", "the",
    "their", "there", "to", "top", "us", "was", "what", "which",
];

/// Folds common English plurals onto their singular form.
pub fn stem(word: &str) -> String {
    let w = word.to_lowercase();
    if w.len() <= 3 {
        return w;
    }
    if let Some(base) = w.strip_suffix("ies") {
        if base.len() > 1 {
            return format!("{}y", base);
        }
    }
    for suffix in ["sses", "xes", "ches", "shes"] {
        if w.ends_with(suffix) {
            return w[..w.len() - 2].to_string();
        }
    }
    if w.ends_with("ss") || w.ends_with("us") || w.ends_with("is") {
        return w;
    }
    match w.strip_suffix('s') {
        Some(base) => base.to_string(),
        None => w,
    }
}

/// Lower-cased alphanumeric runs; underscores split words.
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Stemmed content words of free text, stop words and bare numbers removed, in order.
pub fn terms(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in words(text) {
        if STOP_WORDS.contains(&word.as_str()) || word.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let stemmed = stem(&word);
        if !out.contains(&stemmed) {
            out.push(stemmed);
        }
    }
    out
}

/// Stemmed parts of a snake_case identifier, without the ubiquitous `id`.
pub fn identifier_terms(identifier: &str) -> Vec<String> {
    words(identifier)
        .filter(|w| w != "id")
        .map(|w| stem(&w))
        .collect()
}
