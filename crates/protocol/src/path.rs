use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder substituted with the owning path name inside any configured
/// target URL, e.g. `srt://sink:8890?streamid=publish:$MTX_PATH`.
pub const PATH_PLACEHOLDER: &str = "$MTX_PATH";

/// A forward-slash-separated path identifier, e.g. `live/foo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathName(String);

impl PathName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Replace every occurrence of `$MTX_PATH` in `template` with this path's
    /// name. Replacing before parsing a URL is equivalent to parsing a URL
    /// that had the literal path baked in, since the substitution happens on
    /// the raw string.
    pub fn expand(&self, template: &str) -> String {
        template.replace(PATH_PLACEHOLDER, &self.0)
    }
}

impl fmt::Display for PathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PathName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_placeholder() {
        let path = PathName::new("live/foo");
        assert_eq!(
            path.expand("srt://sink:8890?streamid=publish:$MTX_PATH"),
            "srt://sink:8890?streamid=publish:live/foo"
        );
    }

    #[test]
    fn leaves_url_without_placeholder_untouched() {
        let path = PathName::new("live/foo");
        assert_eq!(path.expand("srt://sink:8890"), "srt://sink:8890");
    }
}
