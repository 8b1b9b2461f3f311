//! Language table and text preparation ahead of tokenization.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;
use unicode_normalization::UnicodeNormalization;

/// Language codes the multilingual model was trained on, with display names.
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("ar", "Arabic"),
    ("da", "Danish"),
    ("de", "German"),
    ("el", "Greek"),
    ("en", "English"),
    ("es", "Spanish"),
    ("fi", "Finnish"),
    ("fr", "French"),
    ("he", "Hebrew"),
    ("hi", "Hindi"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("ms", "Malay"),
    ("nl", "Dutch"),
    ("no", "Norwegian"),
    ("pl", "Polish"),
    ("pt", "Portuguese"),
    ("ru", "Russian"),
    ("sv", "Swedish"),
    ("sw", "Swahili"),
    ("tr", "Turkish"),
    ("zh", "Chinese"),
];

/// Token the tokenizer vocabulary uses in place of a literal space.
const SPACE_TOKEN: &str = "[SPACE]";

const EMPTY_TEXT_FALLBACK: &str = "You need to add some text for me to talk.";

const SENTENCE_ENDERS: &[char] = &['.', '!', '?', '-', ',', '、', '，', '。', '？', '！'];

const PUNCTUATION_REPLACEMENTS: &[(&str, &str)] = &[
    ("...", ", "),
    ("…", ", "),
    (":", ","),
    (" - ", ", "),
    (";", ", "),
    ("—", "-"),
    ("–", "-"),
    (" ,", ","),
    ("\u{201C}", "\""),
    ("\u{201D}", "\""),
    ("\u{2018}", "'"),
    ("\u{2019}", "'"),
];

pub fn is_supported_language(code: &str) -> bool {
    SUPPORTED_LANGUAGES.iter().any(|(c, _)| *c == code)
}

pub fn language_name(code: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Clean up punctuation the model handles poorly.
///
/// Capitalises the first letter, collapses whitespace, maps uncommon or
/// LLM-style punctuation to plain forms and appends a full stop when the text
/// has no sentence ending.
pub fn normalize_punctuation(text: &str) -> String {
    if text.is_empty() {
        return EMPTY_TEXT_FALLBACK.to_string();
    }

    let mut chars = text.chars();
    let mut out: String = match chars.next() {
        Some(first) if first.is_lowercase() => first.to_uppercase().chain(chars).collect(),
        _ => text.to_string(),
    };

    out = out.split_whitespace().collect::<Vec<_>>().join(" ");

    for (from, to) in PUNCTUATION_REPLACEMENTS {
        out = out.replace(from, to);
    }

    let trimmed_len = out.trim_end_matches(' ').len();
    out.truncate(trimmed_len);
    if !out.ends_with(SENTENCE_ENDERS) {
        out.push('.');
    }
    out
}

/// Turn normalized text into the string form the multilingual tokenizer
/// expects: lowercase and NFKD-decomposed (this also splits Hangul syllables
/// into jamo), then the language-specific pass, then the `[lang]` tag, with
/// spaces spelled as `[SPACE]`.
///
/// Chinese characters become Cangjie code tokens and Japanese kanji are
/// rewritten as hiragana. Hebrew is passed through without added diacritics.
pub fn prepare_for_tokenizer(text: &str, language: &str, cangjie: &CangjieTable) -> String {
    let decomposed: String = text.to_lowercase().nfkd().collect();
    let language = language.to_lowercase();
    let converted = match language.as_str() {
        "zh" => cangjie.convert(&decomposed),
        "ja" => hiragana_normalize(&decomposed),
        _ => decomposed,
    };
    format!("[{language}]{converted}").replace(' ', SPACE_TOKEN)
}

/// Glyph to Cangjie-code mapping used to spell Chinese characters for the
/// tokenizer, loaded from the `Cangjie5_TC.json` table shipped with the model.
#[derive(Debug, Clone, Default)]
pub struct CangjieTable {
    word_to_code: HashMap<String, String>,
    code_to_words: HashMap<String, Vec<String>>,
}

impl CangjieTable {
    /// Build from `"glyph\tcode"` entries, in table order.
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut table = Self::default();
        for entry in entries {
            let mut fields = entry.split('\t');
            let (Some(word), Some(code)) = (fields.next(), fields.next()) else {
                continue;
            };
            table.word_to_code.insert(word.to_string(), code.to_string());
            table
                .code_to_words
                .entry(code.to_string())
                .or_default()
                .push(word.to_string());
        }
        table
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open Cangjie table: {}", path.display()))?;
        let entries: Vec<String> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse Cangjie table: {}", path.display()))?;
        Ok(Self::from_entries(entries.iter().map(String::as_str)))
    }

    pub fn len(&self) -> usize {
        self.word_to_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_to_code.is_empty()
    }

    /// Cangjie code of a glyph. Glyphs sharing a code get their position in
    /// the table appended (`"a"`, `"a1"`, `"a2"`, ...).
    pub fn encode(&self, glyph: char) -> Option<String> {
        let mut buf = [0u8; 4];
        let glyph: &str = glyph.encode_utf8(&mut buf);
        let code = self.word_to_code.get(glyph)?;
        let index = self
            .code_to_words
            .get(code)
            .and_then(|words| words.iter().position(|w| w == glyph))
            .unwrap_or(0);
        if index > 0 {
            Some(format!("{code}{index}"))
        } else {
            Some(code.clone())
        }
    }

    /// Replace every Chinese character with `[cj_x]` tokens, one per code
    /// letter, closed by `[cj_.]`. Characters missing from the table are kept.
    pub fn convert(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() * 4);
        for c in text.chars() {
            match is_chinese_char(c).then(|| self.encode(c)).flatten() {
                Some(code) => {
                    for letter in code.chars() {
                        out.push_str("[cj_");
                        out.push(letter);
                        out.push(']');
                    }
                    out.push_str("[cj_.]");
                }
                None => out.push(c),
            }
        }
        out
    }
}

fn is_chinese_char(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
            | 0xF900..=0xFAFF
            | 0x2F800..=0x2FA1F
    )
}

fn is_kanji(c: char) -> bool {
    c == '\u{3005}' || matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

fn is_hiragana(c: char) -> bool {
    matches!(c as u32, 0x3041..=0x309F)
}

/// Rewrite kanji as hiragana readings, leaving kana and other text alone.
///
/// Each run of kanji and hiragana is read as a unit so okurigana give the
/// reading its context (`食べる` reads as `たべる`).
pub fn hiragana_normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = String::new();

    let flush = |run: &mut String, out: &mut String| {
        if run.chars().any(is_kanji) {
            let composed: String = run.nfc().collect();
            out.extend(kakasi::convert(&composed).hiragana.nfkd());
        } else {
            out.push_str(run);
        }
        run.clear();
    };

    for c in text.chars() {
        if is_kanji(c) || is_hiragana(c) {
            run.push(c);
        } else {
            flush(&mut run, &mut out);
            out.push(c);
        }
    }
    flush(&mut run, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_languages() {
        assert_eq!(SUPPORTED_LANGUAGES.len(), 23);
        assert!(is_supported_language("en"));
        assert!(is_supported_language("zh"));
        assert!(!is_supported_language("EN"));
        assert!(!is_supported_language("en_US"));
        assert_eq!(language_name("fr"), Some("French"));
        assert_eq!(language_name("xx"), None);
    }

    #[test]
    fn test_normalize_empty_text() {
        assert_eq!(normalize_punctuation(""), EMPTY_TEXT_FALLBACK);
    }

    #[test]
    fn test_normalize_capitalizes_and_terminates() {
        assert_eq!(normalize_punctuation("hello   world"), "Hello world.");
        assert_eq!(normalize_punctuation("Already done!"), "Already done!");
    }

    #[test]
    fn test_normalize_replaces_uncommon_punctuation() {
        assert_eq!(
            normalize_punctuation("Wait\u{2026} it\u{2019}s here: now"),
            "Wait,  it's here, now."
        );
        assert_eq!(normalize_punctuation("One \u{2014} two"), "One - two.");
        assert_eq!(normalize_punctuation("\u{201C}Quoted\u{201D}"), "\"Quoted\".");
    }

    #[test]
    fn test_normalize_keeps_cjk_enders() {
        assert_eq!(normalize_punctuation("你好。"), "你好。");
    }

    fn sample_cangjie() -> CangjieTable {
        CangjieTable::from_entries(["日\ta", "曰\ta", "月\tb", "明\tab", "你\tonf", "好\tvnd"])
    }

    #[test]
    fn test_prepare_for_tokenizer() {
        assert_eq!(
            prepare_for_tokenizer("Hello World.", "en", &CangjieTable::default()),
            "[en]hello[SPACE]world."
        );
    }

    #[test]
    fn test_prepare_decomposes_accents_and_hangul() {
        let none = CangjieTable::default();
        let fr = prepare_for_tokenizer("é", "fr", &none);
        assert_eq!(fr, "[fr]e\u{0301}");

        let ko = prepare_for_tokenizer("가", "ko", &none);
        assert_eq!(ko, "[ko]\u{1100}\u{1161}");
    }

    #[test]
    fn test_cangjie_encode_indexes_shared_codes() {
        let table = sample_cangjie();
        assert_eq!(table.len(), 6);
        assert_eq!(table.encode('日').as_deref(), Some("a"));
        assert_eq!(table.encode('曰').as_deref(), Some("a1"));
        assert_eq!(table.encode('明').as_deref(), Some("ab"));
        assert_eq!(table.encode('猫'), None);
    }

    #[test]
    fn test_prepare_chinese_spells_cangjie_codes() {
        let table = sample_cangjie();
        assert_eq!(
            prepare_for_tokenizer("你好 猫!", "zh", &table),
            "[zh][cj_o][cj_n][cj_f][cj_.][cj_v][cj_n][cj_d][cj_.][SPACE]猫!"
        );
        assert_eq!(table.convert("曰"), "[cj_a][cj_1][cj_.]");
    }

    #[test]
    fn test_cangjie_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Cangjie5_TC.json");
        std::fs::write(&path, r#"["日\ta", "月\tb\textra", "broken"]"#).unwrap();
        let table = CangjieTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.encode('月').as_deref(), Some("b"));

        std::fs::write(&path, "{}").unwrap();
        assert!(CangjieTable::load(&path).is_err());
    }

    #[test]
    fn test_hiragana_normalize_keeps_kana_and_latin() {
        assert_eq!(hiragana_normalize("カタカナ abc"), "カタカナ abc");
        assert_eq!(hiragana_normalize("ひらがな"), "ひらがな");
    }

    #[test]
    fn test_hiragana_normalize_reads_kanji() {
        let out = hiragana_normalize("日本");
        assert!(!out.chars().any(is_kanji), "{out}");
        assert!(out.chars().all(is_hiragana), "{out}");

        let prepared = prepare_for_tokenizer("東京へ", "ja", &CangjieTable::default());
        assert!(prepared.starts_with("[ja]"));
        assert!(!prepared.chars().any(is_kanji), "{prepared}");
    }
}
