//! Sentence-boundary detection over the stream accumulator.
//!
//! A single linear scan, no backtracking: for each terminator character
//! we check two guards — the character before must not be a decimal
//! digit (so `3.14` never splits) and the word before must not be a
//! known abbreviation or a single initial (so `Dr. Smith` and `J. Doe`
//! never split).

/// Terminators used when no custom set is configured.
pub const DEFAULT_TERMINATORS: &[char] = &['.', '!', '?'];

/// Lowercased abbreviations that suppress a following period.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "inc", "ltd", "approx",
];

/// Scanner configured with a terminator set and abbreviation list.
#[derive(Debug, Clone)]
pub struct BoundaryScanner {
    terminators: Vec<char>,
    abbreviations: Vec<String>,
}

impl Default for BoundaryScanner {
    fn default() -> Self {
        Self {
            terminators: DEFAULT_TERMINATORS.to_vec(),
            abbreviations: ABBREVIATIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BoundaryScanner {
    pub fn new(terminators: Vec<char>, abbreviations: Vec<String>) -> Self {
        Self {
            terminators,
            abbreviations: abbreviations
                .into_iter()
                .map(|a| a.to_lowercase())
                .collect(),
        }
    }

    /// Byte offset just past the latest valid sentence terminator, or
    /// `None` when the text contains no valid boundary.
    ///
    /// The returned offset is always a char boundary, so
    /// `text.split_at(offset)` yields the flushable prefix.
    pub fn latest_boundary(&self, text: &str) -> Option<usize> {
        let mut last: Option<usize> = None;
        let mut prev: Option<char> = None;
        // Running buffer of the alphabetic word immediately before the
        // cursor, reset on any non-alphabetic character.
        let mut word = String::new();

        for (idx, ch) in text.char_indices() {
            if self.terminators.contains(&ch) {
                if self.is_valid_boundary(ch, prev, &word) {
                    last = Some(idx + ch.len_utf8());
                }
            }
            if ch.is_alphabetic() {
                word.push(ch);
            } else if ch != '\'' {
                // Apostrophes stay inside a word ("don't"); anything else
                // starts a new one.
                word.clear();
            }
            prev = Some(ch);
        }
        last
    }

    fn is_valid_boundary(&self, terminator: char, prev: Option<char>, word: &str) -> bool {
        if terminator != '.' {
            return true;
        }
        match prev {
            // Decimal guard: "3.14" must not split.
            Some(p) if p.is_ascii_digit() => false,
            // A period needs something before it to end a sentence.
            None => false,
            _ => {
                let word = word.to_lowercase();
                // Initials ("J.") and known abbreviations don't end sentences.
                !(word.chars().count() == 1
                    || self.abbreviations.iter().any(|a| *a == word))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> Option<&str> {
        BoundaryScanner::default()
            .latest_boundary(text)
            .map(|idx| &text[..idx])
    }

    #[test]
    fn plain_sentence() {
        assert_eq!(scan("Hello there. How are"), Some("Hello there."));
    }

    #[test]
    fn latest_terminator_wins() {
        assert_eq!(
            scan("Hello there. How are you today? I am"),
            Some("Hello there. How are you today?")
        );
    }

    #[test]
    fn question_and_exclamation() {
        assert_eq!(scan("Really! And then"), Some("Really!"));
        assert_eq!(scan("Why? Because"), Some("Why?"));
    }

    #[test]
    fn decimal_digit_guard() {
        assert_eq!(scan("pi is 3.14 and"), None);
        assert_eq!(scan("The time is 3:14."), None);
    }

    #[test]
    fn abbreviation_guard() {
        assert_eq!(scan("Dr. Smith said"), None);
        assert_eq!(scan("Mr. Jones and Mrs. Jones"), None);
        assert_eq!(scan("etc. and so on"), None);
    }

    #[test]
    fn single_initial_guard() {
        assert_eq!(scan("J. Smith arrived"), None);
        // "e.g." — both periods follow single letters.
        assert_eq!(scan("see e.g. the docs"), None);
    }

    #[test]
    fn abbreviation_then_real_boundary() {
        assert_eq!(
            scan("Dr. Smith is here. And waiting"),
            Some("Dr. Smith is here.")
        );
    }

    #[test]
    fn no_boundary_at_all() {
        assert_eq!(scan("just some words"), None);
        assert_eq!(scan(""), None);
    }

    #[test]
    fn leading_period_is_not_a_boundary() {
        assert_eq!(scan(". leading"), None);
    }

    #[test]
    fn non_ascii_text() {
        assert_eq!(scan("Καλημέρα. Τι κάνεις"), Some("Καλημέρα."));
    }

    #[test]
    fn custom_terminator_set() {
        let scanner = BoundaryScanner::new(vec!['…'], vec![]);
        let text = "wait… sure";
        let idx = scanner.latest_boundary(text).unwrap();
        assert_eq!(&text[..idx], "wait…");
    }
}
