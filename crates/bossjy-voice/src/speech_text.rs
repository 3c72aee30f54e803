//! Turning assistant text into something pleasant to listen to.
//!
//! Markdown is stripped, the text is cut into short spoken segments with a pause
//! after each, and every segment gets an emotion and a speed hint that the local
//! engine turns into pitch/rate changes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*").expect("valid regex"));
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*#{1,6}\s+").expect("valid regex"));
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("valid regex"));
static LONG_LATIN_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]{5,}").expect("valid regex"));

const PAUSE_DEFAULT: Duration = Duration::from_millis(200);
const PAUSE_COMMA: Duration = Duration::from_millis(300);
const PAUSE_SENTENCE: Duration = Duration::from_millis(500);
const PAUSE_CLAUSE: Duration = Duration::from_millis(700);

/// Sentences longer than this (in chars) are split again on full-width commas.
const LONG_SENTENCE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Neutral,
    Gentle,
    Excited,
    Concerned,
}

impl Emotion {
    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Gentle => "gentle",
            Emotion::Excited => "excited",
            Emotion::Concerned => "concerned",
        }
    }

    /// Unknown tags fall back to neutral.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "gentle" => Emotion::Gentle,
            "excited" | "happy" => Emotion::Excited,
            "concerned" => Emotion::Concerned,
            _ => Emotion::Neutral,
        }
    }

    /// (pitch factor, rate factor)
    pub fn prosody(self) -> (f32, f32) {
        match self {
            Emotion::Neutral => (1.0, 1.0),
            Emotion::Gentle => (1.12, 0.95),
            Emotion::Excited => (1.2, 1.08),
            Emotion::Concerned => (0.95, 0.9),
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword-based tone detection.
pub fn detect_emotion(text: &str) -> Emotion {
    const GENTLE: &[&str] = &["✅", "成功", "幫您", "好的呢", "喔", "～"];
    const EXCITED: &[&str] = &["🌟", "真厲害", "太棒", "讚", "耶"];
    const CONCERNED: &[&str] = &["⚠️", "提醒", "注意", "小心", "危險"];

    let has = |words: &[&str]| words.iter().any(|w| text.contains(w));
    if has(GENTLE) {
        Emotion::Gentle
    } else if has(EXCITED) {
        Emotion::Excited
    } else if has(CONCERNED) {
        Emotion::Concerned
    } else {
        Emotion::Neutral
    }
}

/// Numbers are read slower, embedded English a little faster.
pub fn speed_hint(text: &str) -> f32 {
    if text.chars().filter(char::is_ascii_digit).count() > 3 {
        0.85
    } else if LONG_LATIN_WORD.is_match(text) {
        1.05
    } else {
        1.0
    }
}

/// Remove markdown that should not be read aloud.
pub fn clean_for_speech(text: &str) -> String {
    let text = CODE_FENCE.replace_all(text, "");
    let text = BOLD.replace_all(&text, "");
    let text = HEADING.replace_all(&text, "");
    let text = LINK.replace_all(&text, "$1");
    text.trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    pub text: String,
    /// Silence to leave after this segment
    pub pause: Duration,
    pub emotion: Emotion,
    pub speed: f32,
}

fn is_spoken_punctuation(c: char) -> bool {
    matches!(c, '，' | '。' | '！' | '？' | '；' | '、' | '\n')
}

fn sentence_break(c: char, next: Option<char>) -> Option<Duration> {
    match c {
        '。' | '！' | '？' | '!' | '?' => Some(PAUSE_SENTENCE),
        // "3.5" is a number, not a sentence end
        '.' if next.map_or(true, char::is_whitespace) => Some(PAUSE_SENTENCE),
        '；' | ';' | '\n' => Some(PAUSE_CLAUSE),
        _ => None,
    }
}

/// Split into sentences, each with the pause its terminator calls for.
fn sentences(text: &str) -> Vec<(String, Duration)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match sentence_break(c, chars.peek().copied()) {
            Some(mut pause) => {
                // Runs like "！？" or "。\n" end one sentence; the longest pause wins
                while let Some(&n) = chars.peek() {
                    match sentence_break(n, None) {
                        Some(p) => {
                            pause = pause.max(p);
                            chars.next();
                        }
                        None => break,
                    }
                }
                current.push(c);
                out.push((std::mem::take(&mut current), pause));
            }
            None => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push((current, PAUSE_DEFAULT));
    }
    out
}

fn make_segment(raw: &str, pause: Duration) -> Option<SpeechSegment> {
    let spoken: String = raw.chars().filter(|c| !is_spoken_punctuation(*c)).collect();
    let spoken = spoken.trim().trim_end_matches(['.', '!', '?', ';']).trim_end();
    if spoken.is_empty() {
        return None;
    }
    Some(SpeechSegment {
        text: spoken.to_string(),
        pause,
        emotion: detect_emotion(raw),
        speed: speed_hint(raw),
    })
}

/// Clean `text` and cut it into spoken segments.
pub fn segment(text: &str) -> Vec<SpeechSegment> {
    let cleaned = clean_for_speech(text);
    let mut segments = Vec::new();
    for (sentence, pause) in sentences(&cleaned) {
        if sentence.chars().count() > LONG_SENTENCE && sentence.contains('，') {
            let clauses: Vec<&str> = sentence.split_inclusive('，').collect();
            let last = clauses.len() - 1;
            for (i, clause) in clauses.into_iter().enumerate() {
                let clause_pause = if i == last { pause } else { PAUSE_COMMA };
                segments.extend(make_segment(clause, clause_pause));
            }
        } else {
            segments.extend(make_segment(&sentence, pause));
        }
    }
    segments
}
