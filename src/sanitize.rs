//! Output sanitization and quality classification.
//!
//! Everything the model produces passes through here before a user can see
//! it. The pipeline is fail-closed: if any classifier flags the text, the
//! result carries an empty string and the caller falls back to filler.
//!
//! Steps, in order:
//! 1. Strip control and invisible characters (newlines survive)
//! 2. Strip hidden-reasoning wrappers and final-answer markers
//! 3. Classify: prompt leak, reasoning leak, gibberish
//! 4. Strip metadata-header lines into the `stripped` variant
//! 5. Re-classify the stripped variant (leaks can surface post-strip)
//! 6. Truncate, only after every classification pass

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

/// A single character repeated this many times consecutively is babble.
const CHAR_RUN_LIMIT: usize = 13;

/// Consecutive digits past this length are noise, not content.
const DIGIT_RUN_LIMIT: usize = 20;

/// The same word this many times in a row is looping output.
const WORD_REPEAT_LIMIT: usize = 5;

/// A 2–8 char substring repeated this many times back-to-back is looping.
const SUBSTRING_REPEAT_LIMIT: usize = 4;
const SUBSTRING_MIN_LEN: usize = 2;
const SUBSTRING_MAX_LEN: usize = 8;

/// Diversity check only applies to texts of at least this many tokens.
const DIVERSITY_MIN_TOKENS: usize = 12;

/// Unique/total token ratio below this is babble.
const DIVERSITY_FLOOR: f64 = 0.35;

/// Single line emitted when a whole block collapses to nothing.
const COLLAPSE_FILLER: &str = "…";

/// Internal metadata-header markers that must never reach a user.
/// Matched case-insensitively as substrings of the whole text.
const PROMPT_LEAK_MARKERS: &[&str] = &[
    "trigger:",
    "server:",
    "channel:",
    "member facts:",
    "conversation history",
    "new message from",
    "system prompt",
    "instructions:",
];

/// A line that is exactly one of these labels (with or without a trailing
/// colon) is an echoed section header.
const METADATA_LINE_LABELS: &[&str] = &[
    "context",
    "instructions",
    "conversation history",
    "member facts",
    "persona",
];

/// A line starting with one of these prefixes is an echoed metadata line.
const METADATA_LINE_PREFIXES: &[&str] = &[
    "trigger:",
    "server:",
    "channel:",
    "member facts:",
    "new message from",
    "system prompt",
];

/// Hidden-reasoning wrapper tags to remove wholesale.
const REASONING_TAGS: &[&str] = &["think", "thinking", "reasoning", "thought"];

/// Classification flags. Any one of them blocks the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeFlags {
    pub prompt_leak: bool,
    pub reasoning_leak: bool,
    pub gibberish: bool,
    pub empty_after_strip: bool,
}

impl SanitizeFlags {
    pub fn blocking(&self) -> bool {
        self.prompt_leak || self.reasoning_leak || self.gibberish || self.empty_after_strip
    }
}

/// Full analysis of one sanitization pass.
#[derive(Debug, Clone)]
pub struct SanitizeAnalysis {
    /// Text after character and wrapper stripping.
    pub cleaned: String,
    /// Text after metadata-line stripping.
    pub stripped: String,
    pub flags: SanitizeFlags,
    /// Human-readable notes on what fired, for logs and review artifacts.
    pub reasons: Vec<String>,
}

/// Sanitizer output: `text` is empty whenever any flag blocked it.
#[derive(Debug, Clone)]
pub struct Sanitized {
    pub text: String,
    pub analysis: SanitizeAnalysis,
}

/// Output sanitizer holding the compiled pattern tables.
pub struct Sanitizer {
    max_output_len: usize,
    wrapper_patterns: Vec<Regex>,
    final_marker: Regex,
    reasoning_prefix: Regex,
    narration: Regex,
    planning: Regex,
}

impl Sanitizer {
    pub fn new(max_output_len: usize) -> Self {
        let wrapper_patterns = REASONING_TAGS
            .iter()
            .map(|tag| Regex::new(&format!(r"(?is)<{tag}>.*?</{tag}>")).unwrap())
            .collect();

        Self {
            max_output_len,
            wrapper_patterns,
            final_marker: Regex::new(r"(?im)^\s*(?:final answer|final response|final reply)\s*:\s*")
                .unwrap(),
            reasoning_prefix: Regex::new(r"(?im)^\s*(?:reasoning|analysis|thought process)\s*:")
                .unwrap(),
            narration: Regex::new(r"(?i)\bthe user\b").unwrap(),
            planning: Regex::new(r"(?i)\bi (?:should|need|must)\b").unwrap(),
        }
    }

    /// Run the full pipeline over raw generated text.
    pub fn sanitize(&self, raw: &str) -> Sanitized {
        let cleaned = strip_invisible(raw);
        let cleaned = self.strip_reasoning_wrappers(&cleaned);

        let mut flags = SanitizeFlags::default();
        let mut reasons = Vec::new();

        self.classify(&cleaned, &mut flags, &mut reasons);

        let stripped = strip_metadata_lines(&cleaned);
        if stripped.trim().is_empty() {
            flags.empty_after_strip = true;
            reasons.push("nothing left after metadata strip".to_string());
        } else {
            // Second gate: leaks that only become visible post-strip.
            self.classify(&stripped, &mut flags, &mut reasons);
        }

        let text = if flags.blocking() {
            debug!(?flags, reasons = ?reasons, "Sanitizer rejected output");
            String::new()
        } else {
            truncate_chars(&stripped, self.max_output_len)
        };

        Sanitized {
            text,
            analysis: SanitizeAnalysis {
                cleaned,
                stripped,
                flags,
                reasons,
            },
        }
    }

    fn classify(&self, text: &str, flags: &mut SanitizeFlags, reasons: &mut Vec<String>) {
        if !flags.prompt_leak && let Some(r) = self.prompt_leak_reason(text) {
            flags.prompt_leak = true;
            reasons.push(r);
        }
        if !flags.reasoning_leak && let Some(r) = self.reasoning_leak_reason(text) {
            flags.reasoning_leak = true;
            reasons.push(r.to_string());
        }
        if !flags.gibberish && let Some(r) = gibberish_reason(text) {
            flags.gibberish = true;
            reasons.push(r.to_string());
        }
    }

    /// Remove hidden-reasoning wrappers, then keep only the content after
    /// the last final-answer marker if one is present.
    fn strip_reasoning_wrappers(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.wrapper_patterns {
            out = pattern.replace_all(&out, "").into_owned();
        }
        if let Some(m) = self.final_marker.find_iter(&out).last() {
            out = out[m.end()..].to_string();
        }
        out.trim().to_string()
    }

    fn prompt_leak_reason(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        PROMPT_LEAK_MARKERS
            .iter()
            .find(|marker| lower.contains(*marker))
            .map(|marker| format!("prompt leak: contains `{marker}`"))
    }

    fn reasoning_leak_reason(&self, text: &str) -> Option<&'static str> {
        if self.reasoning_prefix.is_match(text) {
            return Some("reasoning leak: chain-of-thought prefix");
        }
        if self.narration.is_match(text) && self.planning.is_match(text) {
            return Some("reasoning leak: narration plus planning language");
        }
        None
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(2000)
    }
}

/// Drop control characters (keeping `\n`/`\r`) and invisible
/// zero-width/bidi-control characters that can hide data or break rendering.
fn strip_invisible(text: &str) -> String {
    text.chars()
        .filter(|&c| match c {
            '\n' | '\r' => true,
            c if c.is_control() => false,
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2069}'
            | '\u{FEFF}' => false,
            _ => true,
        })
        .collect()
}

/// Remove echoed metadata-header lines, discarding empty lines.
fn strip_metadata_lines(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|line| {
            let t = line.trim().to_lowercase();
            if t.is_empty() {
                return false;
            }
            if METADATA_LINE_LABELS
                .iter()
                .any(|label| t == *label || t == format!("{label}:"))
            {
                return false;
            }
            !METADATA_LINE_PREFIXES.iter().any(|p| t.starts_with(p))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn gibberish_reason(text: &str) -> Option<&'static str> {
    if has_char_run(text, CHAR_RUN_LIMIT) {
        return Some("gibberish: repeated character run");
    }
    if has_digit_run(text, DIGIT_RUN_LIMIT) {
        return Some("gibberish: digit run");
    }
    if has_word_repeat(text, WORD_REPEAT_LIMIT) {
        return Some("gibberish: repeated word");
    }
    if has_substring_repeat(text, SUBSTRING_MIN_LEN, SUBSTRING_MAX_LEN, SUBSTRING_REPEAT_LIMIT) {
        return Some("gibberish: looping substring");
    }
    if has_low_diversity(text) {
        return Some("gibberish: low token diversity");
    }
    None
}

/// Whitespace runs are formatting, not babble; they reset the count.
fn has_char_run(text: &str, limit: usize) -> bool {
    let mut last = None;
    let mut run = 0usize;
    for c in text.chars() {
        if c.is_whitespace() {
            last = None;
            run = 0;
            continue;
        }
        if last == Some(c) {
            run += 1;
        } else {
            last = Some(c);
            run = 1;
        }
        if run >= limit {
            return true;
        }
    }
    false
}

fn has_digit_run(text: &str, limit: usize) -> bool {
    let mut run = 0usize;
    for c in text.chars() {
        if c.is_ascii_digit() {
            run += 1;
            if run >= limit {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

fn has_word_repeat(text: &str, limit: usize) -> bool {
    let mut last: Option<String> = None;
    let mut run = 0usize;
    for word in text.split_whitespace() {
        let word = word.to_lowercase();
        if last.as_deref() == Some(word.as_str()) {
            run += 1;
        } else {
            last = Some(word);
            run = 1;
        }
        if run >= limit {
            return true;
        }
    }
    false
}

/// Back-to-back repetition of a short substring. The `regex` crate has no
/// back-references, so this is a direct scan.
fn has_substring_repeat(text: &str, min_len: usize, max_len: usize, reps: usize) -> bool {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    for len in min_len..=max_len {
        if n < len * reps {
            continue;
        }
        'start: for start in 0..=(n - len * reps) {
            let block = &chars[start..start + len];
            // Uniform blocks belong to the char-run rule, which has its own
            // threshold; whitespace runs are formatting.
            if block.iter().all(|c| c.is_whitespace()) || block.iter().all(|&c| c == block[0]) {
                continue;
            }
            for k in 1..reps {
                let offset = start + k * len;
                if chars[offset..offset + len] != *block {
                    continue 'start;
                }
            }
            return true;
        }
    }
    false
}

fn has_low_diversity(text: &str) -> bool {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if tokens.len() < DIVERSITY_MIN_TOKENS {
        return false;
    }
    let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
    (unique.len() as f64) / (tokens.len() as f64) < DIVERSITY_FLOOR
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Collapse a multi-line block (e.g. a list-style answer) by removing
/// duplicate lines, case- and punctuation-insensitively, preserving first
/// occurrence order. A block where every line is spammy collapses to a
/// single filler line (never to nothing), so the caller always has
/// something to show.
pub fn collapse_repetitive_lines<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    if lines.is_empty() {
        return Vec::new();
    }

    let cleaned: Vec<String> = lines
        .iter()
        .map(|line| strip_list_marker(line.as_ref()))
        .collect();

    if cleaned.iter().all(|line| is_spammy_line(line)) {
        return vec![COLLAPSE_FILLER.to_string()];
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in cleaned {
        let key = normalize_key(&line);
        if key.is_empty() {
            continue;
        }
        if seen.insert(key) {
            out.push(line);
        }
    }
    out
}

/// Remove a leading bullet or numbering marker and surrounding whitespace.
fn strip_list_marker(line: &str) -> String {
    let t = line.trim();
    let rest = t
        .strip_prefix(['-', '*', '•'])
        .map(str::trim_start)
        .unwrap_or_else(|| strip_numbering(t));
    rest.trim().to_string()
}

fn strip_numbering(line: &str) -> &str {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
    }
    line
}

/// Case-folded, punctuation-free comparison key for a line.
fn normalize_key(line: &str) -> String {
    line.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Near-empty, or a run of one repeated character.
fn is_spammy_line(line: &str) -> bool {
    let t = line.trim();
    if t.chars().filter(|c| c.is_alphanumeric()).count() < 2 {
        return true;
    }
    let mut chars = t.chars().filter(|c| !c.is_whitespace());
    match chars.next() {
        Some(first) => chars.all(|c| c == first),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(2000)
    }

    // ── Character stripping ─────────────────────────────────────────

    #[test]
    fn strips_zero_width_and_control_chars() {
        let s = sanitizer();
        let result = s.sanitize("he\u{200B}llo\u{0007} wor\u{202E}ld");
        assert_eq!(result.text, "hello world");
        assert!(!result.analysis.flags.blocking());
    }

    #[test]
    fn newlines_survive_stripping() {
        let s = sanitizer();
        let result = s.sanitize("line one\nline two");
        assert_eq!(result.text, "line one\nline two");
    }

    // ── Wrapper stripping ───────────────────────────────────────────

    #[test]
    fn strips_thinking_wrapper() {
        let s = sanitizer();
        let result = s.sanitize("<think>let me ponder this</think>The answer is 4.");
        assert_eq!(result.text, "The answer is 4.");
    }

    #[test]
    fn keeps_content_after_last_final_marker() {
        let s = sanitizer();
        let result = s.sanitize("Working through it.\nFinal answer: 42");
        assert_eq!(result.text, "42");
    }

    // ── Prompt leak ─────────────────────────────────────────────────

    #[test]
    fn prompt_leak_blocks_output() {
        let s = sanitizer();
        let result = s.sanitize("Server: prod");
        assert!(result.analysis.flags.prompt_leak);
        assert_eq!(result.text, "");
    }

    #[test]
    fn prompt_leak_is_case_insensitive() {
        let s = sanitizer();
        let result = s.sanitize("here you go. MEMBER FACTS: loves trains");
        assert!(result.analysis.flags.prompt_leak);
        assert_eq!(result.text, "");
    }

    #[test]
    fn normal_text_is_not_a_prompt_leak() {
        let s = sanitizer();
        let result = s.sanitize("The server restarted twice last night.");
        assert!(!result.analysis.flags.prompt_leak);
        assert_eq!(result.text, "The server restarted twice last night.");
    }

    // ── Reasoning leak ──────────────────────────────────────────────

    #[test]
    fn reasoning_prefix_blocks_output() {
        let s = sanitizer();
        let result = s.sanitize("Analysis: the request is ambiguous.");
        assert!(result.analysis.flags.reasoning_leak);
        assert_eq!(result.text, "");
    }

    #[test]
    fn narration_plus_planning_blocks_output() {
        let s = sanitizer();
        let result = s.sanitize("The user wants a joke, I should pick a short one.");
        assert!(result.analysis.flags.reasoning_leak);
        assert_eq!(result.text, "");
    }

    #[test]
    fn narration_alone_is_fine() {
        let s = sanitizer();
        let result = s.sanitize("The user manual covers that in chapter two.");
        assert!(!result.analysis.flags.reasoning_leak);
        assert!(!result.text.is_empty());
    }

    // ── Gibberish ───────────────────────────────────────────────────

    #[test]
    fn char_run_is_gibberish() {
        let s = sanitizer();
        let result = s.sanitize(&"a".repeat(13));
        assert!(result.analysis.flags.gibberish);
        assert_eq!(result.text, "");
    }

    #[test]
    fn twelve_char_run_is_not_gibberish() {
        let s = sanitizer();
        let result = s.sanitize(&"a".repeat(12));
        assert!(!result.analysis.flags.gibberish);
    }

    #[test]
    fn hello_world_is_clean() {
        let s = sanitizer();
        let result = s.sanitize("hello world");
        assert!(!result.analysis.flags.blocking());
        assert_eq!(result.text, "hello world");
    }

    #[test]
    fn long_digit_run_is_gibberish() {
        let s = sanitizer();
        let result = s.sanitize("id is 12345678901234567890 ok");
        assert!(result.analysis.flags.gibberish);
    }

    #[test]
    fn word_loop_is_gibberish() {
        let s = sanitizer();
        let result = s.sanitize("spam spam spam spam spam");
        assert!(result.analysis.flags.gibberish);
    }

    #[test]
    fn substring_loop_is_gibberish() {
        let s = sanitizer();
        let result = s.sanitize("hahahahaha that was funny");
        assert!(result.analysis.flags.gibberish);
    }

    #[test]
    fn low_diversity_is_gibberish() {
        let s = sanitizer();
        let result = s.sanitize("go go go go stop stop stop stop go go go go");
        assert!(result.analysis.flags.gibberish);
    }

    #[test]
    fn normal_long_answer_is_not_low_diversity() {
        let s = sanitizer();
        let text = "The quick brown fox jumps over the lazy dog while the cat naps nearby in the warm afternoon sun.";
        let result = s.sanitize(text);
        assert!(!result.analysis.flags.gibberish);
        assert_eq!(result.text, text);
    }

    // ── Metadata line strip ─────────────────────────────────────────

    #[test]
    fn metadata_lines_are_stripped() {
        let s = sanitizer();
        let result = s.sanitize("New message from alice\nsure, sounds good!");
        // The leak flag fires on the pre-strip text; output stays empty.
        assert!(result.analysis.flags.prompt_leak);
        assert_eq!(result.analysis.stripped, "sure, sounds good!");
        assert_eq!(result.text, "");
    }

    #[test]
    fn all_metadata_means_empty_after_strip() {
        let s = sanitizer();
        let result = s.sanitize("Server: prod\nTrigger: mention");
        assert!(result.analysis.flags.empty_after_strip);
        assert_eq!(result.text, "");
    }

    // ── Truncation ──────────────────────────────────────────────────

    #[test]
    fn truncation_happens_after_classification() {
        // The marker sits past the truncation point; classification must
        // still see it.
        let s = Sanitizer::new(5);
        let result = s.sanitize("okay, Server: prod");
        assert!(result.analysis.flags.prompt_leak);
        assert_eq!(result.text, "");
    }

    #[test]
    fn clean_text_is_truncated() {
        let s = Sanitizer::new(10);
        let result = s.sanitize("a perfectly normal answer");
        assert_eq!(result.text.chars().count(), 10);
    }

    // ── collapse_repetitive_lines ───────────────────────────────────

    #[test]
    fn dedupes_case_and_punctuation_insensitively() {
        let out = collapse_repetitive_lines(&["- ok", "- OK!", "- ok"]);
        assert_eq!(out, vec!["ok"]);
    }

    #[test]
    fn all_spammy_collapses_to_filler() {
        let out = collapse_repetitive_lines(&["..", "."]);
        assert_eq!(out, vec![COLLAPSE_FILLER]);
    }

    #[test]
    fn preserves_first_occurrence_order() {
        let out = collapse_repetitive_lines(&["1. alpha", "2. beta", "3. Alpha", "4. gamma"]);
        assert_eq!(out, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn empty_input_stays_empty() {
        let out = collapse_repetitive_lines::<&str>(&[]);
        assert!(out.is_empty());
    }

    #[test]
    fn mixed_block_drops_noise_lines() {
        let out = collapse_repetitive_lines(&["- real point", "...", "- real point"]);
        assert_eq!(out, vec!["real point"]);
    }
}
