//! Per-field annotations.
//!
//! A [`TagSet`] is the parsed form of one struct field's `#[bind(...)]` attribute. The derive
//! macro only records raw `(key, value)` pairs; everything in here is validated at runtime when
//! the owning type's bind plan is first built. The Struct Binder, the Validator and the OpenAPI
//! synthesizer all read the same `TagSet`, so an annotation means the same thing everywhere.

use crate::format::Format;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Where a field value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Path,
    Query,
    Header,
    Cookie,
    Form,
    FormFile,
    Json,
    Xml,
    Yaml,
}

impl Source {
    /// Textual sources in the order they are tried. The first one yielding a non-empty value wins.
    pub const PRECEDENCE: [Source; 5] = [Source::Path, Source::Query, Source::Form, Source::Header, Source::Cookie];

    pub fn key(&self) -> &'static str {
        match self {
            Source::Path => "path",
            Source::Query => "query",
            Source::Header => "header",
            Source::Cookie => "cookie",
            Source::Form => "form",
            Source::FormFile => "form-file",
            Source::Json => "json",
            Source::Xml => "xml",
            Source::Yaml => "yaml",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let source = match key {
            "path" => Source::Path,
            "query" => Source::Query,
            "header" => Source::Header,
            "cookie" => Source::Cookie,
            "form" => Source::Form,
            "form-file" => Source::FormFile,
            "json" => Source::Json,
            "xml" => Source::Xml,
            "yaml" => Source::Yaml,
            _ => return None,
        };
        Some(source)
    }

    /// Structured body documents.
    pub fn is_document(&self) -> bool {
        matches!(self, Source::Json | Source::Xml | Source::Yaml)
    }

    /// Sources that become OpenAPI parameters.
    pub fn is_parameter(&self) -> bool {
        matches!(self, Source::Path | Source::Query | Source::Header | Source::Cookie)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A malformed annotation, reported when a route using the type is registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("{owner}.{field}: unknown annotation `{key}`")]
    UnknownKey { owner: String, field: String, key: String },

    #[error("{owner}.{field}: annotation `{key}` expects {expected}, got `{value}`")]
    InvalidValue { owner: String, field: String, key: String, expected: &'static str, value: String },

    #[error("{owner}.{field}: invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { owner: String, field: String, pattern: String, reason: String },

    #[error("{owner}.{field}: unknown format `{format}`")]
    UnknownFormat { owner: String, field: String, format: String },

    #[error("{owner}.{field}: {reason}")]
    Conflict { owner: String, field: String, reason: String },

    #[error("{owner}: more than one field carries the request body")]
    MultipleBodies { owner: String },

    #[error("{owner}: generic types cannot be bound")]
    Generic { owner: String },
}

/// The parsed annotations of one field.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    field: String,
    sources: Vec<(Source, String)>,
    body: bool,
    nested: bool,

    required: bool,
    default: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    multiple_of: Option<f64>,
    min_items: Option<usize>,
    max_items: Option<usize>,
    unique_items: bool,
    pattern: Option<Regex>,
    enum_values: Vec<String>,
    format: Option<Format>,

    description: Option<String>,
    example: Option<String>,
    deprecated: bool,
    hidden: bool,
}

struct Parser<'a> {
    owner: &'a str,
    field: &'a str,
}

impl Parser<'_> {
    fn invalid(&self, key: &str, expected: &'static str, value: &str) -> TagError {
        TagError::InvalidValue {
            owner: self.owner.to_owned(),
            field: self.field.to_owned(),
            key: key.to_owned(),
            expected,
            value: value.to_owned(),
        }
    }

    fn flag(&self, key: &str, value: &str) -> Result<bool, TagError> {
        match value.trim() {
            "" | "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(self.invalid(key, "a boolean", value)),
        }
    }

    fn number(&self, key: &str, value: &str) -> Result<f64, TagError> {
        value.trim().parse::<f64>().ok().filter(|n| n.is_finite()).ok_or_else(|| self.invalid(key, "a number", value))
    }

    fn count(&self, key: &str, value: &str) -> Result<usize, TagError> {
        value.trim().parse::<usize>().map_err(|_| self.invalid(key, "a non-negative integer", value))
    }

    fn name(&self, key: &str, value: &str) -> Result<String, TagError> {
        let name = value.trim();
        if name.is_empty() { Err(self.invalid(key, "a non-empty name", value)) } else { Ok(name.to_owned()) }
    }

    fn conflict(&self, reason: impl Into<String>) -> TagError {
        TagError::Conflict { owner: self.owner.to_owned(), field: self.field.to_owned(), reason: reason.into() }
    }
}

impl TagSet {
    /// Parses the raw annotation pairs of field `field` declared on `owner`.
    ///
    /// Keys use the canonical spelling (`minLength`, `multipleOf`, `form-file`, ...).
    pub fn parse(owner: &str, field: &str, pairs: &[(&str, &str)]) -> Result<TagSet, TagError> {
        let parser = Parser { owner, field };
        let mut tags = TagSet { field: field.to_owned(), ..TagSet::default() };

        for &(key, value) in pairs {
            if let Some(source) = Source::from_key(key) {
                let name = parser.name(key, value)?;
                if tags.sources.iter().any(|(s, _)| *s == source) {
                    return Err(parser.conflict(format!("source `{key}` declared twice")));
                }
                tags.sources.push((source, name));
                continue;
            }

            match key {
                "body" => tags.body = parser.flag(key, value)?,
                "nested" => tags.nested = parser.flag(key, value)?,
                "required" => tags.required = parser.flag(key, value)?,
                "default" => tags.default = Some(value.to_owned()),
                "min" => tags.min = Some(parser.number(key, value)?),
                "max" => tags.max = Some(parser.number(key, value)?),
                "minLength" => tags.min_length = Some(parser.count(key, value)?),
                "maxLength" => tags.max_length = Some(parser.count(key, value)?),
                "multipleOf" => {
                    let n = parser.number(key, value)?;
                    if n <= 0.0 {
                        return Err(parser.invalid(key, "a positive number", value));
                    }
                    tags.multiple_of = Some(n);
                }
                "minItems" => tags.min_items = Some(parser.count(key, value)?),
                "maxItems" => tags.max_items = Some(parser.count(key, value)?),
                "uniqueItems" => tags.unique_items = parser.flag(key, value)?,
                "pattern" => {
                    let regex = Regex::new(value).map_err(|e| TagError::InvalidPattern {
                        owner: owner.to_owned(),
                        field: field.to_owned(),
                        pattern: value.to_owned(),
                        reason: e.to_string(),
                    })?;
                    tags.pattern = Some(regex);
                }
                "enum" => {
                    tags.enum_values =
                        value.split(',').map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned).collect();
                    if tags.enum_values.is_empty() {
                        return Err(parser.invalid(key, "a comma separated list", value));
                    }
                }
                "format" => {
                    let format = Format::parse(value).ok_or_else(|| TagError::UnknownFormat {
                        owner: owner.to_owned(),
                        field: field.to_owned(),
                        format: value.to_owned(),
                    })?;
                    tags.format = Some(format);
                }
                "description" => tags.description = Some(value.to_owned()),
                "example" => tags.example = Some(value.to_owned()),
                "deprecated" => tags.deprecated = parser.flag(key, value)?,
                "hidden" => tags.hidden = parser.flag(key, value)?,
                _ => {
                    return Err(TagError::UnknownKey {
                        owner: owner.to_owned(),
                        field: field.to_owned(),
                        key: key.to_owned(),
                    });
                }
            }
        }

        if let (Some(min), Some(max)) = (tags.min, tags.max)
            && min > max
        {
            return Err(parser.conflict(format!("min {min} is greater than max {max}")));
        }
        if let (Some(min), Some(max)) = (tags.min_length, tags.max_length)
            && min > max
        {
            return Err(parser.conflict(format!("minLength {min} is greater than maxLength {max}")));
        }
        if let (Some(min), Some(max)) = (tags.min_items, tags.max_items)
            && min > max
        {
            return Err(parser.conflict(format!("minItems {min} is greater than maxItems {max}")));
        }
        if tags.body && tags.nested {
            return Err(parser.conflict("a field cannot be both `body` and `nested`"));
        }

        if tags.sources.is_empty() && !tags.body && !tags.nested {
            tags.sources.push((Source::Json, field.to_owned()));
        }

        Ok(tags)
    }

    /// The Rust identifier of the field.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn sources(&self) -> &[(Source, String)] {
        &self.sources
    }

    /// The wire name under `source`, if the field reads from it.
    pub fn source_name(&self, source: Source) -> Option<&str> {
        self.sources.iter().find(|(s, _)| *s == source).map(|(_, name)| name.as_str())
    }

    /// Textual sources of this field, in precedence order.
    pub fn textual_sources(&self) -> impl Iterator<Item = (Source, &str)> {
        Source::PRECEDENCE.into_iter().filter_map(|source| self.source_name(source).map(|name| (source, name)))
    }

    pub fn has_textual_source(&self) -> bool {
        self.textual_sources().next().is_some()
    }

    /// The name of the uploaded file part this field reads, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.source_name(Source::FormFile)
    }

    /// The key used for this field inside a document of the given format.
    pub fn document_name(&self, source: Source) -> Option<&str> {
        debug_assert!(source.is_document());
        self.source_name(source).or_else(|| {
            // a field declared for one document format is read under the same name from the others
            self.sources.iter().find(|(s, _)| s.is_document()).map(|(_, name)| name.as_str())
        })
    }

    pub fn has_document_source(&self) -> bool {
        self.sources.iter().any(|(s, _)| s.is_document())
    }

    /// The name used in error messages and OpenAPI properties.
    pub fn wire_name(&self) -> &str {
        self.sources.first().map(|(_, name)| name.as_str()).unwrap_or(&self.field)
    }

    /// The field carries the whole request payload.
    pub fn is_body(&self) -> bool {
        self.body
    }

    /// The field's value is read from the request body in some way.
    pub fn reads_body(&self) -> bool {
        self.body || self.has_document_source()
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn min_length(&self) -> Option<usize> {
        self.min_length
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Lower length bound for strings. `min` stands in when `minLength` is absent.
    pub fn string_min_length(&self) -> Option<usize> {
        self.min_length.or_else(|| self.min.filter(|n| *n >= 0.0).map(|n| n.ceil() as usize))
    }

    /// Upper length bound for strings. `max` stands in when `maxLength` is absent.
    pub fn string_max_length(&self) -> Option<usize> {
        self.max_length.or_else(|| self.max.filter(|n| *n >= 0.0).map(|n| n.floor() as usize))
    }

    pub fn multiple_of(&self) -> Option<f64> {
        self.multiple_of
    }

    pub fn min_items(&self) -> Option<usize> {
        self.min_items
    }

    pub fn max_items(&self) -> Option<usize> {
        self.max_items
    }

    pub fn unique_items(&self) -> bool {
        self.unique_items
    }

    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref()
    }

    pub fn enum_values(&self) -> &[String] {
        &self.enum_values
    }

    pub fn format(&self) -> Option<Format> {
        self.format
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn example(&self) -> Option<&str> {
        self.example.as_deref()
    }

    pub fn deprecated(&self) -> bool {
        self.deprecated
    }

    pub fn hidden(&self) -> bool {
        self.hidden
    }
}
