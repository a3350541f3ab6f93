//! Diagnostic utilities to preserve source context for actionable errors.
//!
//! Parsing should produce `Spanned<T>` values wherever a later error might
//! need to point back at where `T` came from. Used together with `miette` to
//! render source snippets with file, line and column information.

#![deny(clippy::all)]

use std::{
    fmt::Display,
    ops::{Deref, DerefMut, Range},
    sync::Arc,
};

use miette::{NamedSource, SourceSpan};
use serde::{Deserialize, Serialize};

/// A value plus the byte range, file path, and source text it was parsed
/// from. Range and text are optional: values constructed programmatically
/// simply have none.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Spanned<T> {
    pub value: T,
    #[serde(skip)]
    pub range: Option<Range<usize>>,
    #[serde(skip)]
    pub path: Option<Arc<str>>,
    #[serde(skip)]
    pub text: Option<Arc<str>>,
}

impl<T> Spanned<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            range: None,
            path: None,
            text: None,
        }
    }

    pub fn with_range(self, range: impl Into<Range<usize>>) -> Self {
        Self {
            range: Some(range.into()),
            ..self
        }
    }

    pub fn with_path(self, path: Arc<str>) -> Self {
        Self {
            path: Some(path),
            ..self
        }
    }

    pub fn with_text(self, text: impl Into<Arc<str>>) -> Self {
        Self {
            text: Some(text.into()),
            ..self
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn as_inner(&self) -> &T {
        &self.value
    }

    pub fn as_ref(&self) -> Spanned<&T> {
        Spanned {
            value: &self.value,
            range: self.range.clone(),
            path: self.path.clone(),
            text: self.text.clone(),
        }
    }

    /// Splits out the span info from the value.
    pub fn split(self) -> (T, Spanned<()>) {
        (
            self.value,
            Spanned {
                value: (),
                range: self.range,
                path: self.path,
                text: self.text,
            },
        )
    }

    /// Keeps the span, replaces the value.
    pub fn to<U>(&self, value: U) -> Spanned<U> {
        Spanned {
            value,
            range: self.range.clone(),
            path: self.path.clone(),
            text: self.text.clone(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            value: f(self.value),
            range: self.range,
            path: self.path,
            text: self.text,
        }
    }

    /// Gets the span and source for miette rendering. miette requires a
    /// non-optional `NamedSource`, so a missing span yields an empty one.
    pub fn span_and_text(&self, default_path: &str) -> (Option<SourceSpan>, NamedSource) {
        let path = self.path.as_ref().map_or(default_path, |p| p.as_ref());
        match self.range.clone().zip(self.text.as_ref()) {
            Some((range, text)) => (Some(range.into()), NamedSource::new(path, text.to_string())),
            None => (None, NamedSource::new(path, String::new())),
        }
    }
}

impl<T: Display> Display for Spanned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

impl<T> Deref for Spanned<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for Spanned<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

/// Attaches file path and source text to already-parsed spanned values.
pub trait WithMetadata {
    fn add_text(&mut self, text: Arc<str>);
    fn add_path(&mut self, path: Arc<str>);
}

impl<T> WithMetadata for Spanned<T> {
    fn add_text(&mut self, text: Arc<str>) {
        self.text = Some(text);
    }

    fn add_path(&mut self, path: Arc<str>) {
        self.path = Some(path);
    }
}

impl<T: WithMetadata> WithMetadata for Option<T> {
    fn add_text(&mut self, text: Arc<str>) {
        if let Some(inner) = self {
            inner.add_text(text);
        }
    }

    fn add_path(&mut self, path: Arc<str>) {
        if let Some(inner) = self {
            inner.add_path(path);
        }
    }
}

impl<T: WithMetadata> WithMetadata for Vec<T> {
    fn add_text(&mut self, text: Arc<str>) {
        for item in self {
            item.add_text(text.clone());
        }
    }

    fn add_path(&mut self, path: Arc<str>) {
        for item in self {
            item.add_path(path.clone());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_serialize_is_transparent() {
        let spanned = Spanned::new(10).with_range(0..2);
        assert_eq!(serde_json::to_string(&spanned).unwrap(), "10");
    }

    #[test]
    fn test_span_and_text() {
        let spanned = Spanned::new("build")
            .with_range(4..9)
            .with_text("{ \"build\": {} }");
        let (span, _source) = spanned.span_and_text("turbo.json");
        assert_eq!(span, Some((4usize..9usize).into()));

        let unspanned = Spanned::new("build");
        let (span, _source) = unspanned.span_and_text("turbo.json");
        assert_eq!(span, None);
    }
}
