use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SchemaError;

/// Checks that `name` is a dotted path of lowercase alphanumeric words.
/// Hyphens are allowed inside a word (`vdc-relay`) but not at either end.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(is_valid_word)
}

fn is_valid_word(word: &str) -> bool {
    let Some(first) = word.chars().next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && !word.ends_with('-')
        && word
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Last dotted segment of a node name or handle
pub fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// A [`Handle`] is the dotted path expressing the current chain of
/// command for a node, e.g. `auto.home.vdc-relay`. The parent of a
/// node in the command tree is found by dropping the last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handle(String);

impl Handle {
    pub fn new(handle: impl Into<String>) -> Result<Self, SchemaError> {
        let handle = handle.into();
        if is_valid_name(&handle) {
            Ok(Self(handle))
        } else {
            Err(SchemaError::InvalidHandle(handle))
        }
    }

    /// Sidelined handle for a node name that was validated on load
    pub(crate) fn from_name(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    pub fn leaf(&self) -> &str {
        last_segment(&self.0)
    }

    pub fn depth(&self) -> usize {
        self.0.split('.').count()
    }

    /// Handle of the boss, `None` for a root handle
    pub fn parent(&self) -> Option<Handle> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| Handle(parent.to_string()))
    }

    /// Replace the first segment, keeping the rest of the chain
    pub fn with_root(&self, root: &str) -> Handle {
        match self.0.split_once('.') {
            Some((_, rest)) => Handle(format!("{root}.{rest}")),
            None => Handle(root.to_string()),
        }
    }

    pub fn child(&self, leaf: &str) -> Handle {
        Handle(format!("{}.{leaf}", self.0))
    }

    /// A node whose handle is just its own name sits outside the chain of
    /// command
    pub fn is_sidelined(&self, name: &str) -> bool {
        self.0 == name
    }

    pub fn is_descendant_of(&self, ancestor: &Handle) -> bool {
        self.0
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Handle {
    type Error = SchemaError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Handle::new(value)
    }
}

impl TryFrom<String> for Handle {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Handle::new(value)
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl PartialEq<str> for Handle {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Handle {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
