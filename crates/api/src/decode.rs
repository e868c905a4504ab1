//! Per-kind value decoding.
//!
//! [`FieldValue`] is implemented for every type a bound field may have. Textual sources hand
//! over raw strings, body documents hand over `serde_json::Value`s (XML and YAML bodies are
//! normalised into the same shape), multipart uploads hand over files. Each kind also exposes a
//! [`FieldView`] so the validator can re-walk a populated record without knowing its types.

use crate::bind::UploadedFile;
use crate::codec::{self, CodecError, MediaType};
use crate::constraint;
use crate::openapi::ToSchema;
use crate::tag::TagSet;
use crate::validate::Validate;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;

/// Why a raw value could not become a field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for DecodeError {}

/// A type-erased, borrowed view of a field's current value.
pub enum FieldView<'a> {
    Absent,
    Str(&'a str),
    Int(i128),
    Float(f64),
    Bool(bool),
    List(Vec<FieldView<'a>>),
    File(&'a UploadedFile),
    Record(&'a dyn Validate),
    Json(&'a Value),
    Opaque,
}

impl FieldView<'_> {
    /// Whether the value is the zero value of its kind.
    pub fn is_zero(&self) -> bool {
        match self {
            FieldView::Absent => true,
            FieldView::Str(s) => s.is_empty(),
            FieldView::Int(i) => *i == 0,
            FieldView::Float(f) => *f == 0.0,
            FieldView::Bool(b) => !*b,
            FieldView::List(items) => items.is_empty(),
            FieldView::File(file) => file.is_empty(),
            FieldView::Json(value) => value.is_null(),
            FieldView::Record(_) | FieldView::Opaque => false,
        }
    }

    /// A comparable rendering for uniqueness checks. Records never compare equal.
    pub(crate) fn identity(&self) -> Option<String> {
        match self {
            FieldView::Absent => Some("null".to_owned()),
            FieldView::Str(s) => Some(format!("s:{s}")),
            FieldView::Int(i) => Some(format!("n:{i}")),
            FieldView::Float(f) => Some(format!("n:{f}")),
            FieldView::Bool(b) => Some(format!("b:{b}")),
            FieldView::Json(v) => Some(format!("j:{v}")),
            FieldView::List(items) => {
                let parts: Option<Vec<_>> = items.iter().map(FieldView::identity).collect();
                parts.map(|p| format!("[{}]", p.join(",")))
            }
            FieldView::File(_) | FieldView::Record(_) | FieldView::Opaque => None,
        }
    }

    /// The value as shown in validation errors.
    pub(crate) fn display(&self) -> Option<String> {
        match self {
            FieldView::Str(s) => Some((*s).to_owned()),
            FieldView::Int(i) => Some(i.to_string()),
            FieldView::Float(f) => Some(f.to_string()),
            FieldView::Bool(b) => Some(b.to_string()),
            FieldView::Json(v) => Some(v.to_string()),
            _ => None,
        }
    }
}

/// Decoding entry points for one field kind.
pub trait FieldValue: ToSchema + Sized + Send {
    /// Whether this kind is populated from multipart file parts.
    const ACCEPTS_FILES: bool = false;

    /// Decodes the raw textual values of one source. `values` is never empty.
    fn from_text(values: &[String], tags: &TagSet) -> Result<Self, DecodeError>;

    /// Decodes a value from a parsed body document.
    fn from_json(value: Value, tags: &TagSet) -> Result<Self, DecodeError>;

    fn from_files(files: Vec<UploadedFile>) -> Result<Self, DecodeError> {
        let _ = files;
        Err(DecodeError::new("does not accept uploaded files"))
    }

    /// Decodes the whole request payload, for fields flagged `body`.
    fn from_payload(media: MediaType, payload: &Bytes, tags: &TagSet) -> Result<Self, CodecError> {
        let document = codec::decode_document(media, payload)?;
        Self::from_json(document, tags).map_err(|e| CodecError::malformed(media, e.reason()))
    }

    fn view(&self) -> FieldView<'_>;
}

fn first(values: &[String]) -> Result<&str, DecodeError> {
    values.first().map(String::as_str).ok_or_else(|| DecodeError::new("no value"))
}

fn unexpected(expected: &str, value: &Value) -> DecodeError {
    let found = match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    DecodeError::new(format!("expected {expected}, found {found}"))
}

impl FieldValue for String {
    fn from_text(values: &[String], tags: &TagSet) -> Result<Self, DecodeError> {
        let value = first(values)?;
        constraint::check_str(value, tags).map_err(DecodeError::new)?;
        Ok(value.to_owned())
    }

    fn from_json(value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
        match value {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(unexpected("a string", &other)),
        }
    }

    fn view(&self) -> FieldView<'_> {
        FieldView::Str(self)
    }
}

/// Accepts `true/false/1/0/yes/no/on/off`, case-insensitively.
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl FieldValue for bool {
    fn from_text(values: &[String], _tags: &TagSet) -> Result<Self, DecodeError> {
        let text = first(values)?;
        parse_bool(text).ok_or_else(|| DecodeError::new(format!("`{text}` is not a valid boolean")))
    }

    fn from_json(value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
        match value {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            Value::String(s) => parse_bool(&s).ok_or_else(|| DecodeError::new(format!("`{s}` is not a valid boolean"))),
            other => Err(unexpected("a boolean", &other)),
        }
    }

    fn view(&self) -> FieldView<'_> {
        FieldView::Bool(*self)
    }
}

macro_rules! impl_integer_field {
    ($($ty:ty),*) => {
        $(
            impl FieldValue for $ty {
                fn from_text(values: &[String], tags: &TagSet) -> Result<Self, DecodeError> {
                    let text = first(values)?;
                    let value = text
                        .trim()
                        .parse::<$ty>()
                        .map_err(|_| DecodeError::new(format!("`{text}` is not a valid {}", stringify!($ty))))?;
                    constraint::check_int(value as i128, tags).map_err(DecodeError::new)?;
                    Ok(value)
                }

                fn from_json(value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
                    match &value {
                        Value::Number(n) => n
                            .as_i64()
                            .and_then(|v| <$ty>::try_from(v).ok())
                            .or_else(|| n.as_u64().and_then(|v| <$ty>::try_from(v).ok()))
                            .ok_or_else(|| DecodeError::new(format!("{n} is not a valid {}", stringify!($ty)))),
                        Value::String(s) => s
                            .trim()
                            .parse::<$ty>()
                            .map_err(|_| DecodeError::new(format!("`{s}` is not a valid {}", stringify!($ty)))),
                        Value::Null => Ok(0),
                        other => Err(unexpected("an integer", other)),
                    }
                }

                fn view(&self) -> FieldView<'_> {
                    FieldView::Int(*self as i128)
                }
            }
        )*
    };
}

impl_integer_field!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! impl_float_field {
    ($($ty:ty),*) => {
        $(
            impl FieldValue for $ty {
                fn from_text(values: &[String], tags: &TagSet) -> Result<Self, DecodeError> {
                    let text = first(values)?;
                    let value = text
                        .trim()
                        .parse::<$ty>()
                        .map_err(|_| DecodeError::new(format!("`{text}` is not a valid number")))?;
                    constraint::check_float(value as f64, tags).map_err(DecodeError::new)?;
                    Ok(value)
                }

                fn from_json(value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
                    match &value {
                        Value::Number(n) => n
                            .as_f64()
                            .map(|v| v as $ty)
                            .ok_or_else(|| DecodeError::new(format!("{n} is not a valid number"))),
                        Value::String(s) => s
                            .trim()
                            .parse::<$ty>()
                            .map_err(|_| DecodeError::new(format!("`{s}` is not a valid number"))),
                        Value::Null => Ok(0.0),
                        other => Err(unexpected("a number", other)),
                    }
                }

                fn view(&self) -> FieldView<'_> {
                    FieldView::Float(*self as f64)
                }
            }
        )*
    };
}

impl_float_field!(f32, f64);

impl<T: FieldValue> FieldValue for Option<T> {
    const ACCEPTS_FILES: bool = T::ACCEPTS_FILES;

    fn from_text(values: &[String], tags: &TagSet) -> Result<Self, DecodeError> {
        T::from_text(values, tags).map(Some)
    }

    fn from_json(value: Value, tags: &TagSet) -> Result<Self, DecodeError> {
        match value {
            Value::Null => Ok(None),
            value => T::from_json(value, tags).map(Some),
        }
    }

    fn from_files(files: Vec<UploadedFile>) -> Result<Self, DecodeError> {
        if files.is_empty() { Ok(None) } else { T::from_files(files).map(Some) }
    }

    fn from_payload(media: MediaType, payload: &Bytes, tags: &TagSet) -> Result<Self, CodecError> {
        if payload.is_empty() { Ok(None) } else { T::from_payload(media, payload, tags).map(Some) }
    }

    fn view(&self) -> FieldView<'_> {
        match self {
            Some(value) => value.view(),
            None => FieldView::Absent,
        }
    }
}

fn split_items(values: &[String]) -> impl Iterator<Item = &str> {
    values.iter().flat_map(|v| v.split(',')).map(str::trim).filter(|item| !item.is_empty())
}

impl<T: FieldValue> FieldValue for Vec<T> {
    const ACCEPTS_FILES: bool = T::ACCEPTS_FILES;

    /// Repeated values are merged, each value is split on commas. Items are trimmed and empty
    /// items are dropped.
    fn from_text(values: &[String], tags: &TagSet) -> Result<Self, DecodeError> {
        let items: Vec<&str> = split_items(values).collect();
        let unique = {
            let mut seen = std::collections::HashSet::new();
            items.iter().all(|item| seen.insert(*item))
        };
        constraint::check_items(items.len(), unique, tags).map_err(DecodeError::new)?;
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                T::from_text(&[item.to_owned()], tags).map_err(|e| DecodeError::new(format!("item {i}: {}", e.reason())))
            })
            .collect()
    }

    fn from_json(value: Value, tags: &TagSet) -> Result<Self, DecodeError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    T::from_json(item, tags).map_err(|e| DecodeError::new(format!("item {i}: {}", e.reason())))
                })
                .collect(),
            Value::Null => Ok(Vec::new()),
            Value::String(s) => split_items(std::slice::from_ref(&s))
                .map(|item| T::from_json(Value::String(item.to_owned()), tags))
                .collect(),
            // a lone element, as XML produces for single repeated children
            other => T::from_json(other, tags).map(|item| vec![item]),
        }
    }

    fn from_files(files: Vec<UploadedFile>) -> Result<Self, DecodeError> {
        files.into_iter().map(|file| T::from_files(vec![file])).collect()
    }

    fn view(&self) -> FieldView<'_> {
        FieldView::List(self.iter().map(FieldValue::view).collect())
    }
}

impl FieldValue for Value {
    fn from_text(values: &[String], _tags: &TagSet) -> Result<Self, DecodeError> {
        let text = first(values)?;
        Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned())))
    }

    fn from_json(value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
        Ok(value)
    }

    fn view(&self) -> FieldView<'_> {
        FieldView::Json(self)
    }
}

impl FieldValue for UploadedFile {
    const ACCEPTS_FILES: bool = true;

    fn from_text(_values: &[String], _tags: &TagSet) -> Result<Self, DecodeError> {
        Err(DecodeError::new("expected an uploaded file"))
    }

    fn from_json(value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
        Err(unexpected("an uploaded file", &value))
    }

    fn from_files(files: Vec<UploadedFile>) -> Result<Self, DecodeError> {
        files.into_iter().next().ok_or_else(|| DecodeError::new("no file uploaded"))
    }

    fn view(&self) -> FieldView<'_> {
        FieldView::File(self)
    }
}
