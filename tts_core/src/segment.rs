//! Sentence-aware text segmentation.
//!
//! Input text is split at sentence-terminal punctuation (`.`, `!`, `?`)
//! followed by whitespace, and consecutive sentences are packed greedily
//! into units of at most `limit` characters. A sentence longer than the
//! limit is never cut; it becomes its own oversized unit so the model
//! still sees a complete prosodic phrase.

use serde::Serialize;

/// Default unit size in characters.
pub const DEFAULT_SEGMENT_LIMIT: usize = 200;

/// One piece of input text sized for a single synthesis call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextUnit {
    pub ordinal: usize,
    pub content: String,
}

impl TextUnit {
    /// Length in characters, the unit the limit is expressed in.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Split `text` into ordered synthesis units of at most `limit` characters.
///
/// Whitespace runs inside a unit are collapsed to single spaces. Returns an
/// empty vector when the input holds no non-whitespace characters.
pub fn segment(text: &str, limit: usize) -> Vec<TextUnit> {
    let mut units = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for sentence in split_sentences(text) {
        let len = sentence.chars().count();
        if current.is_empty() {
            current = sentence;
            current_len = len;
        } else if current_len + len + 1 <= limit {
            current.push(' ');
            current.push_str(&sentence);
            current_len += len + 1;
        } else {
            close_unit(&mut units, std::mem::replace(&mut current, sentence));
            current_len = len;
        }
    }
    close_unit(&mut units, current);

    units
}

fn close_unit(units: &mut Vec<TextUnit>, content: String) {
    if content.is_empty() {
        return;
    }
    units.push(TextUnit {
        ordinal: units.len(),
        content,
    });
}

/// Split at `.`, `!` or `?` followed by whitespace. Sentences come back
/// trimmed and whitespace-normalized; empty ones are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(false, |next| next.is_whitespace());
        if at_boundary {
            push_sentence(&mut sentences, &current);
            current.clear();
        }
    }
    push_sentence(&mut sentences, &current);

    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        sentences.push(normalized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn rejoin(units: &[TextUnit]) -> String {
        units
            .iter()
            .map(|u| u.content.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_single_sentence() {
        let units = segment("Hello world.", 200);
        assert_eq!(
            units,
            vec![TextUnit {
                ordinal: 0,
                content: "Hello world.".to_string()
            }]
        );
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(segment("", 200).is_empty());
        assert!(segment("  \n\t  ", 200).is_empty());
    }

    #[test]
    fn test_repeated_short_sentences_are_packed() {
        let text = "A. B. C. ".repeat(30);
        assert!(text.len() > 200);

        let units = segment(&text, 200);
        assert!(units.len() >= 2);
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.ordinal, i);
            assert!(unit.len() <= 200, "unit {} has {} chars", i, unit.len());
            assert!(!unit.is_empty());
        }
        assert_eq!(rejoin(&units), normalize(&text));
    }

    #[test]
    fn test_oversized_sentence_kept_intact() {
        let long = format!("{}.", "word ".repeat(60).trim_end());
        let text = format!("Short one. {long} Tail here.");

        let units = segment(&text, 50);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].content, "Short one.");
        assert_eq!(units[1].content, long);
        assert!(units[1].len() > 50);
        assert_eq!(units[2].content, "Tail here.");
    }

    #[test]
    fn test_limit_boundary_is_inclusive() {
        // "Aaaa." + " " + "Bbbb." is exactly 11 characters.
        let units = segment("Aaaa. Bbbb.", 11);
        assert_eq!(units.len(), 1);
        let units = segment("Aaaa. Bbbb.", 10);
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_punctuation_without_whitespace_does_not_split() {
        let sentences = split_sentences("Version 1.5 is out! Really?Yes. e.g.this");
        assert_eq!(
            sentences,
            vec!["Version 1.5 is out!", "Really?Yes.", "e.g.this"]
        );
    }

    #[test]
    fn test_whitespace_inside_units_is_collapsed() {
        let units = segment("  Hello\n\n  there.   How   are you?  ", 200);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content, "Hello there. How are you?");
    }

    #[test]
    fn test_round_trip_over_varied_inputs() {
        let inputs = vec![
            "One. Two! Three? Four.".to_string(),
            "No terminal punctuation at all but quite long ".repeat(8),
            "Mixed!  spacing.\tand\nnewlines?   end".to_string(),
            "Ünïcödé sentences are counted by chars. ".repeat(12),
        ];
        for text in inputs {
            for limit in [1, 10, 40, 200] {
                let units = segment(&text, limit);
                assert_eq!(rejoin(&units), normalize(&text), "limit {limit}");
                for unit in &units {
                    assert!(!unit.is_empty());
                    if unit.len() > limit {
                        assert_eq!(split_sentences(&unit.content).len(), 1);
                    }
                }
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "First sentence here. Second one follows! And a third? ".repeat(10);
        assert_eq!(segment(&text, 60), segment(&text, 60));
    }
}
