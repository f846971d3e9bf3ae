//! Prompt patterns for synchronizing on interactive output.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use memchr::memmem;
use regex::bytes::Regex;

use crate::error::ChannelError;

/// Trait for prompt matching - regex by default, extensible for custom parsers.
pub trait PromptMatcher: Send + Sync {
    /// Returns the byte range of the first match, or None if no match.
    fn find_match(&self, data: &[u8]) -> Option<Range<usize>>;

    /// Check if the data matches the pattern.
    fn is_match(&self, data: &[u8]) -> bool {
        self.find_match(data).is_some()
    }
}

/// Regex-based prompt matcher (the default implementation).
impl PromptMatcher for Regex {
    fn find_match(&self, data: &[u8]) -> Option<Range<usize>> {
        self.find(data).map(|m| m.range())
    }
}

/// The pattern a channel waits for after sending a command.
///
/// Matching only looks at bytes; the channel has no notion of the shell
/// grammar that produced them.
#[derive(Clone)]
pub enum Prompt {
    /// An exact byte sequence, e.g. `=> ` for U-Boot.
    Literal(Bytes),

    /// A regular expression over raw bytes.
    Pattern(Regex),

    /// Any other matcher.
    Custom(Arc<dyn PromptMatcher>),
}

impl Prompt {
    /// Create a literal prompt.
    pub fn literal(text: impl AsRef<[u8]>) -> Self {
        Prompt::Literal(Bytes::copy_from_slice(text.as_ref()))
    }

    /// Compile a regex prompt.
    pub fn regex(pattern: &str) -> Result<Self, ChannelError> {
        Ok(Prompt::Pattern(Regex::new(pattern)?))
    }

    /// Compile a regex prompt that only matches at the end of the output
    /// seen so far. See [`compile_prompt_pattern`].
    pub fn anchored(pattern: &str) -> Result<Self, ChannelError> {
        Ok(Prompt::Pattern(compile_prompt_pattern(pattern)?))
    }

    /// Wrap a custom matcher.
    pub fn custom(matcher: impl PromptMatcher + 'static) -> Self {
        Prompt::Custom(Arc::new(matcher))
    }

    /// Minimum look-behind needed to find a match straddling two reads.
    pub(crate) fn overlap(&self) -> Option<usize> {
        match self {
            Prompt::Literal(lit) => Some(lit.len().saturating_sub(1)),
            Prompt::Pattern(_) | Prompt::Custom(_) => None,
        }
    }
}

impl PromptMatcher for Prompt {
    fn find_match(&self, data: &[u8]) -> Option<Range<usize>> {
        match self {
            Prompt::Literal(lit) if lit.is_empty() => None,
            Prompt::Literal(lit) => memmem::find(data, lit).map(|start| start..start + lit.len()),
            Prompt::Pattern(re) => re.find_match(data),
            Prompt::Custom(matcher) => matcher.find_match(data),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::literal(text)
    }
}

impl From<&[u8]> for Prompt {
    fn from(bytes: &[u8]) -> Self {
        Prompt::literal(bytes)
    }
}

impl From<Regex> for Prompt {
    fn from(re: Regex) -> Self {
        Prompt::Pattern(re)
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Literal(lit) => write!(f, "Literal({:?})", String::from_utf8_lossy(lit)),
            Prompt::Pattern(re) => write!(f, "Pattern({:?})", re.as_str()),
            Prompt::Custom(_) => f.write_str("Custom(<PromptMatcher>)"),
        }
    }
}

/// Compile a prompt pattern string into a regex anchored at the end of output.
///
/// Adds trailing ASCII whitespace and `$` unless the pattern already ends
/// with an anchor.
pub fn compile_prompt_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = if pattern.ends_with('$') {
        pattern.to_string()
    } else {
        format!("{}(?-u:\\s)*$", pattern)
    };

    Regex::new(&pattern)
}
