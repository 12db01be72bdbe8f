//! Repair of UTF-8 text that was decoded as Windows-1252 somewhere upstream.
//!
//! Converters regularly hand back `â€™` for `’` or `Ã©` for `é`. The
//! substitution table is derived once from the Windows-1252 code page: for
//! every character in U+00A0..U+00FF plus the 27 printable Windows-1252
//! specials, its UTF-8 bytes are read back as Windows-1252 to produce the
//! garbled form. Replacement runs to a fixpoint, which also unwinds text that
//! went through the mismatch twice and makes [`fix`] idempotent.

use std::borrow::Cow;
use std::collections::HashMap;

use encoding_rs::WINDOWS_1252;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// The garbled form `c` takes when its UTF-8 encoding is read as Windows-1252.
fn garble(c: char) -> String {
    let mut buf = [0u8; 4];
    let bytes = c.encode_utf8(&mut buf).as_bytes();
    WINDOWS_1252
        .decode_without_bom_handling(bytes)
        .0
        .into_owned()
}

/// Characters Windows-1252 places in 0x80..=0x9F outside Latin-1.
fn cp1252_specials() -> Vec<char> {
    let high: Vec<u8> = (0x80..=0x9f).collect();
    WINDOWS_1252
        .decode_without_bom_handling(&high)
        .0
        .chars()
        .filter(|c| *c as u32 > 0xff)
        .collect()
}

static TABLE: Lazy<HashMap<String, char>> = Lazy::new(|| {
    ('\u{a0}'..='\u{ff}')
        .chain(cp1252_specials())
        .map(|c| (garble(c), c))
        .collect()
});

static PATTERN: Lazy<Regex> = Lazy::new(|| {
    let mut keys: Vec<&String> = TABLE.keys().collect();
    // Longest first so `â€™` wins over any shorter prefix
    keys.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
    let alternation = keys
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&alternation).expect("mojibake table builds a valid regex")
});

/// Replace every known mis-decoded sequence with the intended character.
///
/// Pure and idempotent: `fix(&fix(s)) == fix(s)`.
pub fn fix(input: &str) -> Cow<'_, str> {
    let mut current = Cow::Borrowed(input);
    // Each pass shortens the text, so this terminates
    while PATTERN.is_match(&current) {
        let replaced = PATTERN
            .replace_all(&current, |caps: &Captures| TABLE[&caps[0]].to_string())
            .into_owned();
        current = Cow::Owned(replaced);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_punctuation_restored() {
        assert_eq!(fix("It\u{e2}\u{20ac}\u{2122}s"), "It\u{2019}s");
        assert_eq!(
            fix("\u{e2}\u{20ac}\u{153}quoted\u{e2}\u{20ac}\u{9d}"),
            "\u{201c}quoted\u{201d}"
        );
        assert_eq!(fix("a \u{e2}\u{20ac}\u{201c} b"), "a \u{2013} b");
        assert_eq!(fix("\u{e2}\u{201a}\u{ac}5"), "\u{20ac}5");
    }

    #[test]
    fn latin1_letters_restored() {
        assert_eq!(fix("caf\u{c3}\u{a9}"), "café");
        assert_eq!(fix("\u{c3}\u{a0} la"), "à la");
        assert_eq!(fix("\u{c2}\u{a9} NHS"), "© NHS");
    }

    #[test]
    fn clean_text_is_borrowed() {
        let input = "Plain ASCII and proper ’quotes’ and café";
        assert!(matches!(fix(input), Cow::Borrowed(_)));
    }

    #[test]
    fn double_encoding_unwound_and_idempotent() {
        // "é" garbled twice
        let twice = garble('\u{c3}') + &garble('\u{a9}');
        let once = fix(&twice).into_owned();
        assert_eq!(once, "é");
        assert_eq!(fix(&once), once);
    }

    #[test]
    fn fix_is_pure_and_idempotent() {
        let samples = [
            "Don\u{e2}\u{20ac}\u{2122}t \u{e2}\u{20ac}\u{201d} na\u{c3}\u{af}ve",
            "\u{c3}\u{2020}\u{e2}\u{20ac}\u{2122}",
            "nothing to see",
        ];
        for s in samples {
            let first = fix(s).into_owned();
            assert_eq!(fix(s), first);
            assert_eq!(fix(&first), first);
        }
    }

    #[test]
    fn table_covers_every_special() {
        let specials = cp1252_specials();
        assert_eq!(specials.len(), 27);
        for c in &specials {
            assert_eq!(TABLE.get(&garble(*c)), Some(c));
        }
        assert_eq!(TABLE.len(), 96 + 27);
    }
}
