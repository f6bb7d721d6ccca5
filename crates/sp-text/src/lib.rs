#![forbid(unsafe_code)]

//! Documents, tokens and the lexical attributes the text models hash.

use std::collections::BTreeMap;
use std::fmt;

use sp_core::det64_str;

/// English example sentences used as the fixed prediction corpus.
pub const EN_SENTENCES: [&str; 8] = [
    "Apple is looking at buying U.K. startup for $1 billion",
    "Autonomous cars shift insurance liability toward manufacturers",
    "San Francisco considers banning sidewalk delivery robots",
    "London is a big city in the United Kingdom.",
    "Where are you?",
    "Who is the president of France?",
    "What is the capital of the United States?",
    "When was Barack Obama born?",
];

/// The example sentences followed by all of them joined with spaces.
#[must_use]
pub fn example_texts() -> Vec<String> {
    let mut texts: Vec<String> = EN_SENTENCES.iter().map(|text| (*text).to_string()).collect();
    texts.push(EN_SENTENCES.join(" "));
    texts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attr {
    Orth,
    Lower,
    Norm,
    Prefix,
    Suffix,
    Shape,
}

impl Attr {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Orth => "ORTH",
            Self::Lower => "LOWER",
            Self::Norm => "NORM",
            Self::Prefix => "PREFIX",
            Self::Suffix => "SUFFIX",
            Self::Shape => "SHAPE",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    text: String,
    idx: usize,
    whitespace: bool,
}

impl Token {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Character offset of the token in the document text.
    #[must_use]
    pub fn idx(&self) -> usize {
        self.idx
    }

    #[must_use]
    pub fn has_trailing_space(&self) -> bool {
        self.whitespace
    }

    #[must_use]
    pub fn attr_string(&self, attr: Attr) -> String {
        match attr {
            Attr::Orth => self.text.clone(),
            Attr::Lower | Attr::Norm => self.text.to_lowercase(),
            Attr::Prefix => self.text.chars().take(1).collect(),
            Attr::Suffix => {
                let chars: Vec<char> = self.text.chars().collect();
                let start = chars.len().saturating_sub(3);
                chars[start..].iter().collect()
            }
            Attr::Shape => word_shape(&self.text),
        }
    }

    /// Hashed attribute id.
    #[must_use]
    pub fn attr(&self, attr: Attr) -> u64 {
        det64_str(&self.attr_string(attr))
    }
}

/// `Apple` -> `Xxxxx`, `U.K.` -> `X.X.`, `$1` -> `$d`. Runs longer than four
/// of the same class collapse.
#[must_use]
pub fn word_shape(text: &str) -> String {
    let mut shape = String::with_capacity(text.len());
    let mut last: Option<char> = None;
    let mut run = 0usize;
    for ch in text.chars() {
        let class = if ch.is_uppercase() {
            'X'
        } else if ch.is_lowercase() {
            'x'
        } else if ch.is_ascii_digit() {
            'd'
        } else {
            ch
        };
        if Some(class) == last {
            run += 1;
        } else {
            run = 1;
            last = Some(class);
        }
        if run <= 4 {
            shape.push(class);
        }
    }
    shape
}

#[derive(Debug, Clone, PartialEq)]
pub struct Doc {
    text: String,
    tokens: Vec<Token>,
    pub cats: BTreeMap<String, f64>,
}

impl Doc {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// One row of hashed attribute ids per token.
    #[must_use]
    pub fn to_attr_rows(&self, attrs: &[Attr]) -> Vec<Vec<u64>> {
        self.tokens
            .iter()
            .map(|token| attrs.iter().map(|attr| token.attr(*attr)).collect())
            .collect()
    }
}

const PREFIX_PUNCT: &[char] = &['"', '\'', '(', '[', '{', '$', '#', '¿', '¡'];
const SUFFIX_PUNCT: &[char] = &['"', '\'', ')', ']', '}', '.', ',', '!', '?', ':', ';', '%'];

/// Whitespace tokenizer that peels leading and trailing punctuation.
///
/// A trailing period stays attached when the rest of the token already
/// contains one, so abbreviations like `U.K.` survive intact.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer;

impl Tokenizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn tokenize(&self, text: &str) -> Doc {
        let mut tokens = Vec::new();
        let chars: Vec<(usize, char)> = text.chars().enumerate().collect();
        let mut start = 0usize;
        while start < chars.len() {
            if chars[start].1.is_whitespace() {
                start += 1;
                continue;
            }
            let mut end = start;
            while end < chars.len() && !chars[end].1.is_whitespace() {
                end += 1;
            }
            let chunk: String = chars[start..end].iter().map(|(_, ch)| *ch).collect();
            let whitespace = end < chars.len();
            split_chunk(&chunk, start, whitespace, &mut tokens);
            start = end;
        }
        Doc {
            text: text.to_string(),
            tokens,
            cats: BTreeMap::new(),
        }
    }
}

fn split_chunk(chunk: &str, offset: usize, whitespace: bool, out: &mut Vec<Token>) {
    let chars: Vec<char> = chunk.chars().collect();
    let mut lo = 0usize;
    let mut hi = chars.len();
    let mut prefixes = Vec::new();
    while lo + 1 < hi && PREFIX_PUNCT.contains(&chars[lo]) {
        prefixes.push(lo);
        lo += 1;
    }
    let mut suffixes = Vec::new();
    while hi > lo + 1 && SUFFIX_PUNCT.contains(&chars[hi - 1]) {
        if chars[hi - 1] == '.' && chars[lo..hi - 1].contains(&'.') {
            break;
        }
        hi -= 1;
        suffixes.push(hi);
    }

    for position in prefixes {
        out.push(Token {
            text: chars[position].to_string(),
            idx: offset + position,
            whitespace: false,
        });
    }
    out.push(Token {
        text: chars[lo..hi].iter().collect(),
        idx: offset + lo,
        whitespace: whitespace && suffixes.is_empty(),
    });
    let last = suffixes.first().copied();
    for position in suffixes.into_iter().rev() {
        out.push(Token {
            text: chars[position].to_string(),
            idx: offset + position,
            whitespace: whitespace && Some(position) == last,
        });
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{Attr, EN_SENTENCES, Tokenizer, example_texts, word_shape};

    fn texts(text: &str) -> Vec<String> {
        Tokenizer::new()
            .tokenize(text)
            .tokens()
            .iter()
            .map(|token| token.text().to_string())
            .collect()
    }

    #[test]
    fn tokenizer_splits_punctuation_and_keeps_abbreviations() {
        assert_eq!(
            texts(EN_SENTENCES[0]),
            vec![
                "Apple", "is", "looking", "at", "buying", "U.K.", "startup", "for", "$", "1",
                "billion"
            ]
        );
        assert_eq!(texts("Where are you?"), vec!["Where", "are", "you", "?"]);
        assert_eq!(
            texts("the United Kingdom."),
            vec!["the", "United", "Kingdom", "."]
        );
    }

    #[test]
    fn token_offsets_point_into_text() {
        let doc = Tokenizer::new().tokenize("Who is (really) there?");
        for token in doc.tokens() {
            let from_text: String = doc
                .text()
                .chars()
                .skip(token.idx())
                .take(token.text().chars().count())
                .collect();
            assert_eq!(from_text, token.text());
        }
    }

    #[test]
    fn attributes_follow_lexical_rules() {
        let doc = Tokenizer::new().tokenize("Barack");
        let token = &doc.tokens()[0];
        assert_eq!(token.attr_string(Attr::Lower), "barack");
        assert_eq!(token.attr_string(Attr::Prefix), "B");
        assert_eq!(token.attr_string(Attr::Suffix), "ack");
        assert_eq!(token.attr_string(Attr::Shape), "Xxxxx");
        assert_ne!(token.attr(Attr::Orth), token.attr(Attr::Lower));
    }

    #[test]
    fn shapes_collapse_long_runs() {
        assert_eq!(word_shape("manufacturers"), "xxxx");
        assert_eq!(word_shape("U.K."), "X.X.");
        assert_eq!(word_shape("$1"), "$d");
    }

    #[test]
    fn example_corpus_appends_joined_text() {
        let corpus = example_texts();
        assert_eq!(corpus.len(), EN_SENTENCES.len() + 1);
        assert!(corpus[8].starts_with("Apple is looking"));
    }

    #[test]
    fn empty_text_gives_empty_doc() {
        let doc = Tokenizer::new().tokenize("   ");
        assert!(doc.is_empty());
        assert!(doc.to_attr_rows(&[Attr::Orth]).is_empty());
    }

    proptest! {
        #[test]
        fn prop_tokens_never_contain_whitespace(text in "[a-zA-Z .,?$()]{0,40}") {
            let doc = Tokenizer::new().tokenize(&text);
            for token in doc.tokens() {
                prop_assert!(!token.text().is_empty());
                prop_assert!(!token.text().chars().any(char::is_whitespace));
            }
        }

        #[test]
        fn prop_tokenizing_twice_is_identical(text in "[a-zA-Z .,?]{0,40}") {
            let tokenizer = Tokenizer::new();
            prop_assert_eq!(tokenizer.tokenize(&text), tokenizer.tokenize(&text));
        }
    }
}
