//! Mention, hashtag and URL extraction for short free-text messages.
//!
//! All functions are pure. Empty input yields an empty result, never an
//! error. Offsets reported by the `*_with_indices` variants are zero-based
//! character (Unicode scalar) positions into the original text.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

const AT_SIGNS: &str = r"[@\x{FF20}]";
const HASH_SIGNS: &str = r"[#\x{FF03}]";
const LATIN_ACCENTS: &str = r"\x{00C0}-\x{00D6}\x{00D8}-\x{00F6}\x{00F8}-\x{00FF}";
const UNICODE_SPACES: &str = r"\x{0009}-\x{000D}\x{0020}\x{0085}\x{00A0}\x{1680}\x{180E}\x{2000}-\x{200A}\x{2028}\x{2029}\x{202F}\x{205F}\x{3000}";

/// Anything but ASCII punctuation and ASCII whitespace.
const DOMAIN_CHAR: &str = r"[^\x09-\x0D\x20-\x2F\x3A-\x40\x5B-\x60\x7B-\x7E]";
const PATH_CHAR: &str = r"[A-Za-z0-9!*';:=+$/%#\[\]\-_,~]";
const PATH_CHAR_NO_SLASH: &str = r"[A-Za-z0-9!*';:=+$%#\[\]\-_,~]";
const PATH_CHAR_NO_COMMA: &str = r"[A-Za-z0-9!*';:=+$/%#\[\]\-_~]";
const QUERY_CHAR: &str = r"[A-Za-z0-9!*'();:&=+$/%#\[\]\-_.,~]";
const QUERY_END_CHAR: &str = r"[A-Za-z0-9_&=#/]";

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:^|[^A-Za-z0-9_]){AT_SIGNS}(?P<name>[A-Za-z0-9_]{{1,20}})"
    ))
    .expect("valid mention regex")
});

static REPLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^[{UNICODE_SPACES}]*{AT_SIGNS}(?P<name>[A-Za-z0-9_]{{1,20}})"
    ))
    .expect("valid reply regex")
});

static HASHTAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:^|[^0-9A-Za-z&/]+){HASH_SIGNS}(?P<tag>[0-9A-Za-z_]*[A-Za-z_]+[A-Za-z0-9_{LATIN_ACCENTS}]*)"
    ))
    .expect("valid hashtag regex")
});

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    let balanced_parens = format!(r"\({PATH_CHAR}+\)");
    let path_chars = format!(
        r"(?:{balanced_parens}|@{PATH_CHAR_NO_SLASH}+/|(?:[.,]*{PATH_CHAR_NO_COMMA})+)"
    );
    let path_ending = format!(r"(?:[A-Za-z0-9=_#/\-+]+|{balanced_parens})");
    let domain = format!(r"{DOMAIN_CHAR}(?:[.\-]?{DOMAIN_CHAR})*\.[A-Za-z]{{2,}}(?::[0-9]+)?");

    Regex::new(&format!(
        r#"(?:[^\-/"':!=A-Za-z0-9_@\x{{FF20}}]+|^|:)(?P<url>(?P<protocol>(?i:https?://))(?P<domain>{domain})(?P<path>/(?:{path_chars}+|{path_ending})?)?(?P<query>\?{QUERY_CHAR}*{QUERY_END_CHAR})?)"#
    ))
    .expect("valid url regex")
});

static HANDLE_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][a-z]*").expect("valid handle regex"));

/// Kind of entity found in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Mention,
    Hashtag,
    Url,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Mention => write!(f, "mention"),
            EntityKind::Hashtag => write!(f, "hashtag"),
            EntityKind::Url => write!(f, "url"),
        }
    }
}

/// One entity occurrence with its character span in the source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntityIndex {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
    pub value: String,
}

impl fmt::Display for EntityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Index(start={}, end={}, val={}, type={})",
            self.start, self.end, self.value, self.kind
        )
    }
}

/// Result of reply detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTarget<'a> {
    /// The input was empty.
    EmptyInput,
    /// The text does not begin with a mention.
    NotAReply,
    /// The text is a reply to this screen name.
    Reply(&'a str),
}

/// Converts byte offsets to character offsets for matches visited in order.
struct CharCursor<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
}

impl<'a> CharCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            chars: 0,
        }
    }

    fn offset(&mut self, byte: usize) -> usize {
        if byte < self.byte {
            self.byte = 0;
            self.chars = 0;
        }
        self.chars += self.text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}

/// A mention is rejected when immediately followed by another at-sign, a
/// Latin accented letter, or `://` (email- or URL-like text).
fn mention_is_terminated(rest: &str) -> bool {
    if rest.starts_with("://") {
        return false;
    }
    match rest.chars().next() {
        Some('@' | '\u{FF20}') => false,
        Some(c) => !matches!(c, '\u{00C0}'..='\u{00D6}' | '\u{00D8}'..='\u{00F6}' | '\u{00F8}'..='\u{00FF}'),
        None => true,
    }
}

fn mention_matches(text: &str) -> impl Iterator<Item = regex::Match<'_>> + '_ {
    MENTION_RE.captures_iter(text).filter_map(move |caps| {
        let whole = caps.get(0)?;
        if mention_is_terminated(&text[whole.end()..]) {
            caps.name("name")
        } else {
            None
        }
    })
}

/// Screen names mentioned in `text`, without the leading sigil, in order of
/// appearance. Duplicates are preserved.
pub fn extract_mentions(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    mention_matches(text).map(|m| m.as_str()).collect()
}

/// Like [`extract_mentions`], with spans that include the leading sigil.
pub fn extract_mentions_with_indices(text: &str) -> Vec<EntityIndex> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut cursor = CharCursor::new(text);
    mention_matches(text)
        .map(|m| {
            let start = cursor.offset(m.start());
            let end = cursor.offset(m.end());
            EntityIndex {
                kind: EntityKind::Mention,
                start: start.saturating_sub(1),
                end,
                value: m.as_str().to_string(),
            }
        })
        .collect()
}

/// The screen name a message replies to.
///
/// A reply is a mention at the very beginning of the text, optionally
/// preceded by any Unicode whitespace.
pub fn extract_reply_screen_name(text: &str) -> ReplyTarget<'_> {
    if text.is_empty() {
        return ReplyTarget::EmptyInput;
    }
    match REPLY_RE.captures(text).and_then(|caps| caps.name("name")) {
        Some(name) => ReplyTarget::Reply(name.as_str()),
        None => ReplyTarget::NotAReply,
    }
}

/// Hashtags in `text`, without the leading sigil.
///
/// A tag needs at least one letter or underscore; `#2011` is not a tag.
pub fn extract_hashtags(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    HASHTAG_RE
        .captures_iter(text)
        .filter_map(|caps| caps.name("tag"))
        .map(|m| m.as_str())
        .collect()
}

/// Like [`extract_hashtags`], with spans that include the leading sigil.
pub fn extract_hashtags_with_indices(text: &str) -> Vec<EntityIndex> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut cursor = CharCursor::new(text);
    HASHTAG_RE
        .captures_iter(text)
        .filter_map(|caps| caps.name("tag"))
        .map(|m| {
            let start = cursor.offset(m.start());
            let end = cursor.offset(m.end());
            EntityIndex {
                kind: EntityKind::Hashtag,
                start: start.saturating_sub(1),
                end,
                value: m.as_str().to_string(),
            }
        })
        .collect()
}

/// `http://` and `https://` URLs in `text`, protocol included.
///
/// Trailing sentence punctuation is not part of the match.
pub fn extract_urls(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    URL_RE
        .captures_iter(text)
        .filter_map(|caps| caps.name("url"))
        .map(|m| m.as_str())
        .collect()
}

pub fn extract_urls_with_indices(text: &str) -> Vec<EntityIndex> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut cursor = CharCursor::new(text);
    URL_RE
        .captures_iter(text)
        .filter_map(|caps| caps.name("url"))
        .map(|m| EntityIndex {
            kind: EntityKind::Url,
            start: cursor.offset(m.start()),
            end: cursor.offset(m.end()),
            value: m.as_str().to_string(),
        })
        .collect()
}

/// Best-effort display token for a login handle.
///
/// Splits on case boundaries, folds runs of single capitals into an
/// acronym, and returns only the first word, capitalized:
/// `"JohnDoe"` -> `"John"`, `"XMLParser"` -> `"XML"`.
pub fn humanize_handle(handle: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut acronym = String::new();

    for found in HANDLE_WORD_RE.find_iter(handle).map(|m| m.as_str()) {
        if found.len() == 1 && found.chars().all(|c| c.is_ascii_uppercase()) {
            acronym.push_str(found);
        } else {
            if !acronym.is_empty() {
                tokens.push(std::mem::take(&mut acronym));
            }
            tokens.push(found.to_lowercase());
        }
    }
    if !acronym.is_empty() {
        tokens.push(acronym);
    }

    match tokens.first() {
        Some(first) => {
            let mut chars = first.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
        None => handle.split(' ').next().unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- mentions ---

    #[test]
    fn mentions_in_order_of_appearance() {
        assert_eq!(
            extract_mentions("hello @bob and @carol_99!"),
            vec!["bob", "carol_99"]
        );
    }

    #[test]
    fn duplicate_mentions_are_preserved() {
        assert_eq!(extract_mentions("@amy @amy"), vec!["amy", "amy"]);
    }

    #[test]
    fn fullwidth_at_sign_is_a_mention() {
        assert_eq!(extract_mentions("hi \u{FF20}dana"), vec!["dana"]);
    }

    #[test]
    fn email_addresses_are_not_mentions() {
        assert!(extract_mentions("mail me at jo@example.com").is_empty());
    }

    #[test]
    fn mention_followed_by_at_sign_is_rejected() {
        assert!(extract_mentions("@bob@carol").is_empty());
    }

    #[test]
    fn mention_followed_by_accent_or_scheme_is_rejected() {
        assert!(extract_mentions("@bob\u{00E9}").is_empty());
        assert!(extract_mentions("@http://x.com").is_empty());
    }

    #[test]
    fn mention_names_are_capped_at_twenty_chars() {
        let text = format!("@{}", "a".repeat(25));
        assert_eq!(extract_mentions(&text), vec!["a".repeat(20).as_str()]);
    }

    #[test]
    fn mention_indices_include_sigil() {
        let indices = extract_mentions_with_indices("hi @bob");
        assert_eq!(
            indices,
            vec![EntityIndex {
                kind: EntityKind::Mention,
                start: 3,
                end: 7,
                value: "bob".into(),
            }]
        );
    }

    #[test]
    fn indices_count_characters_not_bytes() {
        let indices = extract_mentions_with_indices("caf\u{00E9} @zoe");
        assert_eq!(indices[0].start, 5);
        assert_eq!(indices[0].end, 9);
    }

    // --- replies ---

    #[test]
    fn reply_detected_after_unicode_whitespace() {
        assert_eq!(
            extract_reply_screen_name("\u{3000} @sam thanks"),
            ReplyTarget::Reply("sam")
        );
    }

    #[test]
    fn mention_later_in_text_is_not_a_reply() {
        assert_eq!(
            extract_reply_screen_name("thanks @sam"),
            ReplyTarget::NotAReply
        );
    }

    #[test]
    fn empty_input_is_distinct_from_not_a_reply() {
        assert_eq!(extract_reply_screen_name(""), ReplyTarget::EmptyInput);
    }

    // --- hashtags ---

    #[test]
    fn hashtags_need_a_letter_or_underscore() {
        assert_eq!(extract_hashtags("great #Day but #2011"), vec!["Day"]);
        assert_eq!(extract_hashtags("#_"), vec!["_"]);
    }

    #[test]
    fn hashtag_with_leading_digit_and_letters_is_valid() {
        assert_eq!(extract_hashtags("great #Day but #2cold"), vec!["Day", "2cold"]);
    }

    #[test]
    fn hashtag_glued_to_word_is_ignored() {
        assert!(extract_hashtags("abc#tag").is_empty());
        assert!(extract_hashtags("AT&T#deal").is_empty());
        assert!(extract_hashtags("path/#frag").is_empty());
    }

    #[test]
    fn hashtag_keeps_accented_tail() {
        assert_eq!(extract_hashtags("#caf\u{00E9}"), vec!["caf\u{00E9}"]);
    }

    #[test]
    fn hashtag_indices_include_sigil() {
        let indices = extract_hashtags_with_indices("go #team");
        assert_eq!(indices[0].start, 3);
        assert_eq!(indices[0].end, 8);
        assert_eq!(indices[0].kind, EntityKind::Hashtag);
    }

    // --- urls ---

    #[test]
    fn url_with_path_and_query() {
        assert_eq!(
            extract_urls("see http://example.com/page?q=1 now"),
            vec!["http://example.com/page?q=1"]
        );
    }

    #[test]
    fn trailing_period_is_not_swallowed() {
        assert_eq!(
            extract_urls("Read https://t.co/abc."),
            vec!["https://t.co/abc"]
        );
    }

    #[test]
    fn url_at_start_of_text() {
        assert_eq!(
            extract_urls("https://www.rust-lang.org rocks"),
            vec!["https://www.rust-lang.org"]
        );
    }

    #[test]
    fn url_with_port_and_balanced_parens() {
        assert_eq!(
            extract_urls("wiki http://en.wikipedia.org:8080/wiki/Primer_(film) ok"),
            vec!["http://en.wikipedia.org:8080/wiki/Primer_(film)"]
        );
    }

    #[test]
    fn url_glued_to_word_is_ignored() {
        assert!(extract_urls("xhttp://example.com").is_empty());
    }

    #[test]
    fn url_without_tld_is_ignored() {
        assert!(extract_urls("see http://localhost/page").is_empty());
    }

    #[test]
    fn url_indices_exclude_preceding_context() {
        let indices = extract_urls_with_indices("a http://b.com");
        assert_eq!(indices[0].start, 2);
        assert_eq!(indices[0].end, 14);
        assert_eq!(indices[0].value, "http://b.com");
    }

    #[test]
    fn empty_text_yields_empty_results() {
        assert!(extract_mentions("").is_empty());
        assert!(extract_hashtags("").is_empty());
        assert!(extract_urls("").is_empty());
        assert!(extract_urls_with_indices("").is_empty());
    }

    // --- handles ---

    #[test]
    fn handle_without_case_boundaries_is_capitalized() {
        assert_eq!(humanize_handle("huascarsanchez"), "Huascarsanchez");
    }

    #[test]
    fn camel_case_handle_keeps_first_word() {
        assert_eq!(humanize_handle("JohnDoe"), "John");
        assert_eq!(humanize_handle("john_doe"), "John");
    }

    #[test]
    fn leading_capitals_collapse_into_acronym() {
        assert_eq!(humanize_handle("XMLParser"), "XML");
    }

    #[test]
    fn handle_without_letters_is_returned_as_is() {
        assert_eq!(humanize_handle("1234"), "1234");
        assert_eq!(humanize_handle(""), "");
    }
}
