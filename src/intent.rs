//! Intent matching on transcripts and replies
//!
//! All matching happens on normalized text: lowercase, punctuation removed,
//! whitespace collapsed.

/// Normalize text for phrase matching
#[must_use]
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c.to_lowercase().next().unwrap_or(c))
            } else if c.is_whitespace() || c == '-' {
                Some(' ')
            } else {
                None
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a transcript asks the assistant to stop
///
/// A phrase matches as a run of whole words anywhere in the normalized
/// transcript, so "okay goodbye" stops but "stopwatch" does not.
#[must_use]
pub fn is_stop_intent(transcript: &str, phrases: &[String]) -> bool {
    let text = normalize(transcript);
    if text.is_empty() {
        return false;
    }
    let padded = format!(" {text} ");

    phrases.iter().any(|phrase| {
        let phrase = normalize(phrase);
        if phrase.is_empty() {
            return false;
        }
        padded.contains(&format!(" {phrase} "))
    })
}

/// Whether a reply carries the shutdown sentinel
#[must_use]
pub fn contains_sentinel(reply: &str, sentinel: &str) -> bool {
    let sentinel = normalize(sentinel);
    !sentinel.is_empty() && normalize(reply).contains(&sentinel)
}

/// Parse "[wake phrase] volume <level>" into a level from 1 to 10
#[must_use]
pub fn parse_volume(transcript: &str, wake_words: &[String]) -> Option<u8> {
    let text = normalize(transcript);

    // Longest wake phrase first so "winter fresh" beats "winter"
    let mut wakes: Vec<String> = wake_words.iter().map(|w| normalize(w)).collect();
    wakes.sort_by_key(|w| std::cmp::Reverse(w.len()));

    let rest = wakes
        .iter()
        .filter(|w| !w.is_empty())
        .find_map(|w| text.strip_prefix(w.as_str()).map(str::trim_start))
        .unwrap_or(text.as_str());

    let mut words = rest.split(' ');
    if words.next() != Some("volume") {
        return None;
    }
    let mut level = words.next()?;
    if matches!(level, "to" | "at") {
        level = words.next()?;
    }
    if words.next().is_some() {
        return None;
    }

    let level = match level {
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" | "for" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        digits => digits.parse().ok()?,
    };

    (1..=10).contains(&level).then_some(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_STOP_PHRASES, DEFAULT_WAKE_WORDS};

    fn phrases() -> Vec<String> {
        DEFAULT_STOP_PHRASES.iter().map(ToString::to_string).collect()
    }

    fn wakes() -> Vec<String> {
        DEFAULT_WAKE_WORDS.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn normalize_strips_case_and_punctuation() {
        assert_eq!(normalize("  That's ALL, folks!  "), "thats all folks");
        assert_eq!(normalize("Good-night."), "good night");
        assert_eq!(normalize("?!"), "");
    }

    #[test]
    fn exact_stop_phrases_match() {
        assert!(is_stop_intent("Stop.", &phrases()));
        assert!(is_stop_intent("Goodbye!", &phrases()));
        assert!(is_stop_intent("That's all", &phrases()));
    }

    #[test]
    fn multi_word_phrases_match_inside_sentence() {
        assert!(is_stop_intent("okay go to sleep now", &phrases()));
        assert!(!is_stop_intent("what's the best way to go to sleeper trains", &phrases()));
    }

    #[test]
    fn single_words_match_as_whole_words() {
        assert!(is_stop_intent("Okay, goodbye.", &phrases()));
        assert!(is_stop_intent("thanks bye", &phrases()));
        assert!(is_stop_intent("alright stop", &phrases()));
        assert!(!is_stop_intent("start the stopwatch", &phrases()));
        assert!(!is_stop_intent("how many bytes is that", &phrases()));
        assert!(!is_stop_intent("", &phrases()));
    }

    #[test]
    fn sentinel_detected_loosely() {
        assert!(contains_sentinel("Sure. Going to sleep now!", "Going to sleep now."));
        assert!(!contains_sentinel("Going to the shop now", "Going to sleep now."));
        assert!(!contains_sentinel("anything", ""));
    }

    #[test]
    fn volume_with_and_without_wake_phrase() {
        assert_eq!(parse_volume("Winter fresh, volume five.", &wakes()), Some(5));
        assert_eq!(parse_volume("volume 10", &wakes()), Some(10));
        assert_eq!(parse_volume("winterfresh volume to three", &wakes()), Some(3));
    }

    #[test]
    fn volume_rejects_out_of_range_and_chatter() {
        assert_eq!(parse_volume("volume eleven", &wakes()), None);
        assert_eq!(parse_volume("volume 0", &wakes()), None);
        assert_eq!(parse_volume("turn the volume up please", &wakes()), None);
        assert_eq!(parse_volume("volume five please", &wakes()), None);
    }
}
