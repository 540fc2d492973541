//! Document identifier extraction and per-batch allocation.
//!
//! Output documents are named after a case reference found in the extracted
//! reply, e.g. `DO24-00123` (two capital letters, two digits, hyphen, five
//! digits). The reply text is searched first and the message subject second.
//! When neither contains a reference, a random fallback such as
//! `email_3fa9c1` is used instead.
//!
//! Extraction ([`IdentifierExtractor`]) is pure and deterministic. Choosing
//! the final, batch-unique filename stem is the job of
//! [`IdentifierAllocator`], which is the only place randomness enters.

use regex::Regex;
use std::collections::HashSet;
use uuid::Uuid;

/// Default identifier pattern: `AA00-00000`.
pub const DEFAULT_PATTERN: &str = r"\b[A-Z]{2}[0-9]{2}-[0-9]{5}\b";

/// Default prefix of fallback identifiers.
pub const DEFAULT_FALLBACK_PREFIX: &str = "email";

/// Number of hex characters in a fallback token.
const FALLBACK_TOKEN_LEN: usize = 6;

/// Finds identifiers in text using a fixed pattern.
#[derive(Debug, Clone)]
pub struct IdentifierExtractor {
    pattern: Regex,
}

impl IdentifierExtractor {
    /// Compiles an extractor for `pattern`.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// First identifier in `text`, if any.
    pub fn find<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.pattern.find(text).map(|m| m.as_str())
    }

    /// Searches the segment, then the subject.
    ///
    /// The segment always wins when both contain an identifier.
    pub fn extract(&self, segment: &str, subject: Option<&str>) -> Option<String> {
        self.find(segment)
            .or_else(|| subject.and_then(|s| self.find(s)))
            .map(str::to_string)
    }
}

impl Default for IdentifierExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_PATTERN).expect("default identifier pattern compiles")
    }
}

/// Hands out filename stems that are unique within one batch.
///
/// - an extracted identifier is used as is the first time it is seen;
/// - repeats get a numeric suffix: `DO24-00123-2`, `DO24-00123-3`, ...;
/// - absent identifiers get `<prefix>_<6 hex>`, redrawn until unused.
///
/// Stems never include a file extension.
#[derive(Debug)]
pub struct IdentifierAllocator {
    prefix: String,
    used: HashSet<String>,
}

impl IdentifierAllocator {
    /// `prefix` is reduced to filename-safe characters; an empty result
    /// falls back to [`DEFAULT_FALLBACK_PREFIX`].
    pub fn new(prefix: &str) -> Self {
        let prefix = match sanitize_stem(prefix) {
            p if p.is_empty() => DEFAULT_FALLBACK_PREFIX.to_string(),
            p => p,
        };
        Self {
            prefix,
            used: HashSet::new(),
        }
    }

    /// Returns the stem for a container whose extracted identifier is `found`.
    pub fn allocate(&mut self, found: Option<&str>) -> String {
        let stem = match found.map(sanitize_stem).filter(|s| !s.is_empty()) {
            Some(base) => {
                let mut candidate = base.clone();
                let mut n = 2;
                while self.used.contains(&candidate) {
                    candidate = format!("{}-{}", base, n);
                    n += 1;
                }
                candidate
            }
            None => loop {
                let candidate = self.fallback();
                if !self.used.contains(&candidate) {
                    break candidate;
                }
            },
        };
        self.used.insert(stem.clone());
        stem
    }

    fn fallback(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        format!("{}_{}", self.prefix, &token[..FALLBACK_TOKEN_LEN])
    }
}

impl Default for IdentifierAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_PREFIX)
    }
}

/// Keeps only characters that are safe in a filename on every platform.
pub fn sanitize_stem(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// Whether `stem` has the shape of a fallback identifier for `prefix`.
pub fn is_fallback(stem: &str, prefix: &str) -> bool {
    stem.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .map(|token| {
            token.len() == FALLBACK_TOKEN_LEN
                && token
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_identifier_in_segment() {
        let ex = IdentifierExtractor::default();
        assert_eq!(
            ex.extract("Please file this under DO24-00123 today.", None),
            Some("DO24-00123".to_string())
        );
    }

    #[test]
    fn test_segment_takes_priority_over_subject() {
        let ex = IdentifierExtractor::default();
        let id = ex.extract("ref AB12-34567", Some("Re: CD98-76543"));
        assert_eq!(id.as_deref(), Some("AB12-34567"));
    }

    #[test]
    fn test_subject_used_when_segment_has_none() {
        let ex = IdentifierExtractor::default();
        let id = ex.extract("nothing here", Some("Re: CD98-76543 status"));
        assert_eq!(id.as_deref(), Some("CD98-76543"));
    }

    #[test]
    fn test_pattern_shape_is_strict() {
        let ex = IdentifierExtractor::default();
        assert_eq!(ex.find("do24-00123"), None);
        assert_eq!(ex.find("DO24-0012"), None);
        assert_eq!(ex.find("XDO24-00123"), None);
        assert_eq!(ex.find("DO24-001234"), None);
        assert_eq!(ex.find("(DO24-00123)"), Some("DO24-00123"));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let ex = IdentifierExtractor::default();
        let text = "first XY11-11111 then ZZ22-22222";
        for _ in 0..5 {
            assert_eq!(ex.find(text), Some("XY11-11111"));
        }
    }

    #[test]
    fn test_fallback_shape_and_uniqueness() {
        let mut alloc = IdentifierAllocator::default();
        let stems: Vec<String> = (0..50).map(|_| alloc.allocate(None)).collect();
        let unique: HashSet<&String> = stems.iter().collect();
        assert_eq!(unique.len(), stems.len());
        for stem in &stems {
            assert!(is_fallback(stem, "email"), "bad fallback: {}", stem);
        }
    }

    #[test]
    fn test_repeated_identifier_gets_suffix() {
        let mut alloc = IdentifierAllocator::default();
        assert_eq!(alloc.allocate(Some("DO24-00123")), "DO24-00123");
        assert_eq!(alloc.allocate(Some("DO24-00123")), "DO24-00123-2");
        assert_eq!(alloc.allocate(Some("DO24-00123")), "DO24-00123-3");
        assert_eq!(alloc.allocate(Some("DO24-00124")), "DO24-00124");
    }

    #[test]
    fn test_fallback_prefix_is_made_filename_safe() {
        let mut alloc = IdentifierAllocator::new("mail/box");
        let stem = alloc.allocate(None);
        assert!(is_fallback(&stem, "mail_box"), "{}", stem);

        let mut alloc = IdentifierAllocator::new("...");
        assert!(is_fallback(&alloc.allocate(None), DEFAULT_FALLBACK_PREFIX));
    }

    #[test]
    fn test_unsafe_characters_are_replaced() {
        assert_eq!(sanitize_stem("../a/b c"), "_a_b_c");
        let mut alloc = IdentifierAllocator::new("msg");
        let stem = alloc.allocate(Some("..."));
        assert!(is_fallback(&stem, "msg"));
    }

    #[test]
    fn test_is_fallback_rejects_other_shapes() {
        assert!(!is_fallback("email_12345", "email"));
        assert!(!is_fallback("email_ABCDEF", "email"));
        assert!(!is_fallback("DO24-00123", "email"));
        assert!(is_fallback("email_0a1b2c", "email"));
    }
}
