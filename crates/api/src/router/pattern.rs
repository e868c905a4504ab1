//! Route pattern syntax.
//!
//! Segments are static text, `:name`, `{name}`, `{name:int}`, `{name:string}`, `*name` or `*`.
//! One pattern uses a single parameter style; a catch-all must be the last segment.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern `{0}` must start with `/`")]
    NoLeadingSlash(String),

    #[error("pattern `{0}` mixes `:name` and `{{name}}` parameter styles")]
    MixedStyles(String),

    #[error("pattern `{pattern}` declares parameter `{name}` twice")]
    DuplicateParam { pattern: String, name: String },

    #[error("pattern `{pattern}` has a malformed segment `{segment}`")]
    Malformed { pattern: String, segment: String },

    #[error("pattern `{pattern}` uses unknown parameter type `{kind}`")]
    UnknownType { pattern: String, kind: String },

    #[error("pattern `{0}` has a catch-all before its last segment")]
    CatchAllNotLast(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Int,
    CatchAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    name: String,
    kind: ParamKind,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Colon,
    Brace,
}

const ANONYMOUS_CATCH_ALL: &str = "wildcard";

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    matcher: String,
    openapi: String,
    params: Vec<Param>,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if !raw.starts_with('/') {
            return Err(PatternError::NoLeadingSlash(raw.to_owned()));
        }
        let malformed = |segment: &str| PatternError::Malformed { pattern: raw.to_owned(), segment: segment.to_owned() };

        let segments: Vec<&str> = raw[1..].split('/').collect();
        let mut style: Option<Style> = None;
        let mut params: Vec<Param> = Vec::new();
        let mut matcher = String::with_capacity(raw.len());
        let mut openapi = String::with_capacity(raw.len());

        for (i, segment) in segments.iter().enumerate() {
            matcher.push('/');
            openapi.push('/');

            let (param, segment_style) = if let Some(name) = segment.strip_prefix(':') {
                (Param { name: name.to_owned(), kind: ParamKind::String }, Some(Style::Colon))
            } else if let Some(inner) = segment.strip_prefix('{') {
                let inner = inner.strip_suffix('}').ok_or_else(|| malformed(segment))?;
                let (name, kind) = match inner.split_once(':') {
                    None => (inner, ParamKind::String),
                    Some((name, "int")) => (name, ParamKind::Int),
                    Some((name, "string")) => (name, ParamKind::String),
                    Some((_, other)) => {
                        return Err(PatternError::UnknownType { pattern: raw.to_owned(), kind: other.to_owned() });
                    }
                };
                (Param { name: name.to_owned(), kind }, Some(Style::Brace))
            } else if let Some(name) = segment.strip_prefix('*') {
                if i + 1 != segments.len() {
                    return Err(PatternError::CatchAllNotLast(raw.to_owned()));
                }
                let name = if name.is_empty() { ANONYMOUS_CATCH_ALL } else { name };
                (Param { name: name.to_owned(), kind: ParamKind::CatchAll }, None)
            } else {
                if segment.contains(['{', '}', ':', '*']) {
                    return Err(malformed(segment));
                }
                matcher.push_str(segment);
                openapi.push_str(segment);
                continue;
            };

            if param.name.is_empty() || !param.name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
                return Err(malformed(segment));
            }
            if let Some(segment_style) = segment_style {
                match style {
                    Some(existing) if existing != segment_style => {
                        return Err(PatternError::MixedStyles(raw.to_owned()));
                    }
                    _ => style = Some(segment_style),
                }
            }
            if params.iter().any(|p| p.name == param.name) {
                return Err(PatternError::DuplicateParam { pattern: raw.to_owned(), name: param.name });
            }

            if param.kind == ParamKind::CatchAll {
                matcher.push_str(&format!("{{*{}}}", param.name));
            } else {
                matcher.push_str(&format!("{{{}}}", param.name));
            }
            openapi.push_str(&format!("{{{}}}", param.name));
            params.push(param);
        }

        Ok(Self { raw: raw.to_owned(), matcher, openapi, params })
    }

    /// The pattern as registered.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The pattern in the matcher's syntax.
    pub fn matcher(&self) -> &str {
        &self.matcher
    }

    /// The pattern with every parameter written as `{name}`.
    pub fn openapi_path(&self) -> &str {
        &self.openapi
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Whether captured values satisfy the declared parameter types.
    pub fn accepts(&self, captured: &[(String, String)]) -> bool {
        self.params.iter().filter(|p| p.kind == ParamKind::Int).all(|p| {
            captured.iter().find(|(name, _)| *name == p.name).is_some_and(|(_, value)| value.parse::<i64>().is_ok())
        })
    }
}

/// Joins a group prefix and a route path. A bare `/` route maps to the prefix itself.
pub fn join(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{path}"),
        (false, true) => prefix.to_owned(),
        (false, false) => format!("{prefix}/{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brace_and_typed_params() {
        let pattern = RoutePattern::parse("/items/{id:int}/tags/{tag}").unwrap();
        assert_eq!(pattern.matcher(), "/items/{id}/tags/{tag}");
        assert_eq!(pattern.openapi_path(), "/items/{id}/tags/{tag}");
        assert_eq!(pattern.params()[0].kind(), ParamKind::Int);
        assert!(pattern.accepts(&[("id".into(), "7".into()), ("tag".into(), "x".into())]));
        assert!(!pattern.accepts(&[("id".into(), "seven".into()), ("tag".into(), "x".into())]));
    }

    #[test]
    fn test_colon_and_catch_all() {
        let pattern = RoutePattern::parse("/files/:bucket/*path").unwrap();
        assert_eq!(pattern.matcher(), "/files/{bucket}/{*path}");
        assert_eq!(pattern.openapi_path(), "/files/{bucket}/{path}");

        let anonymous = RoutePattern::parse("/static/*").unwrap();
        assert_eq!(anonymous.matcher(), "/static/{*wildcard}");
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(RoutePattern::parse("/a/:x/{y}"), Err(PatternError::MixedStyles(_))));
        assert!(matches!(RoutePattern::parse("/a/{x}/{x}"), Err(PatternError::DuplicateParam { .. })));
        assert!(matches!(RoutePattern::parse("/a/{x"), Err(PatternError::Malformed { .. })));
        assert!(matches!(RoutePattern::parse("/a/{x:uuid}"), Err(PatternError::UnknownType { .. })));
        assert!(matches!(RoutePattern::parse("/a/*rest/b"), Err(PatternError::CatchAllNotLast(_))));
        assert!(matches!(RoutePattern::parse("a"), Err(PatternError::NoLeadingSlash(_))));
        assert!(matches!(RoutePattern::parse("/a/:"), Err(PatternError::Malformed { .. })));
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/api/", "/books"), "/api/books");
        assert_eq!(join("/api", "/"), "/api");
        assert_eq!(join("", "/"), "/");
        assert_eq!(join("/", "books"), "/books");
    }
}
