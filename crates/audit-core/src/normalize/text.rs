//! Text folding and similarity helpers shared by the matching routines.

use std::collections::BTreeSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Lowercase, strip accents, expand ligatures, turn punctuation into spaces and
/// collapse whitespace. "Expérimentations à petite-échelle !" -> "experimentations a petite echelle".
pub fn fold(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.nfd() {
        if is_combining_mark(c) {
            continue;
        }
        match c {
            'œ' | 'Œ' => out.push_str("oe"),
            'æ' | 'Æ' => out.push_str("ae"),
            'ß' => out.push_str("ss"),
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            _ => out.push(' '),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folded tokens, de-duplicated.
pub fn tokens(input: &str) -> BTreeSet<String> {
    fold(input).split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}

/// Share of `option`'s tokens present in `input`.
pub fn token_overlap(input: &str, option: &str) -> f64 {
    let option_tokens = tokens(option);
    if option_tokens.is_empty() {
        return 0.0;
    }
    let input_tokens = tokens(input);
    let shared = option_tokens.intersection(&input_tokens).count();
    shared as f64 / option_tokens.len() as f64
}

/// Sørensen–Dice coefficient over character bigrams of the folded strings.
pub fn bigram_similarity(a: &str, b: &str) -> f64 {
    let a = bigrams(&fold(a));
    let b = bigrams(&fold(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut remaining = b.clone();
    let mut shared = 0usize;
    for pair in &a {
        if let Some(pos) = remaining.iter().position(|p| p == pair) {
            remaining.swap_remove(pos);
            shared += 1;
        }
    }
    (2 * shared) as f64 / (a.len() + b.len()) as f64
}

fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().filter(|c| *c != ' ').collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// True when the folded `pattern` occurs in the folded `text` starting at a word boundary.
/// Patterns may be stems: "factur" matches "facturation".
pub fn contains_pattern(folded_text: &str, pattern: &str) -> bool {
    let pattern = fold(pattern);
    if pattern.is_empty() {
        return false;
    }
    let haystack = format!(" {folded_text} ");
    haystack.contains(&format!(" {pattern}"))
}

/// Count of alphanumeric characters, used to tell real utterances from noise.
pub fn alnum_len(input: &str) -> usize {
    input.chars().filter(|c| c.is_alphanumeric()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_strips_accents_case_and_punctuation() {
        assert_eq!(fold("Expérimentations à petite-échelle !"), "experimentations a petite echelle");
        assert_eq!(fold("Mise en Œuvre"), "mise en oeuvre");
        assert_eq!(fold("  l'IA   "), "l ia");
    }

    #[test]
    fn overlap_is_relative_to_option_tokens() {
        assert_eq!(token_overlap("analyse de données clients", "Analyse de données"), 1.0);
        assert_eq!(token_overlap("rien", "Analyse de données"), 0.0);
    }

    #[test]
    fn bigram_similarity_prefers_closer_strings() {
        let close = bigram_similarity("strategique", "Intégration stratégique");
        let far = bigram_similarity("strategique", "Inexistante");
        assert!(close > far);
    }

    #[test]
    fn pattern_matching_respects_word_start() {
        let text = fold("On teste un peu la facturation");
        assert!(contains_pattern(&text, "test"));
        assert!(contains_pattern(&text, "factur"));
        assert!(!contains_pattern(&text, "este"));
    }
}
