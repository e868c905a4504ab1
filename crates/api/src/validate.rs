//! Post-bind validation.
//!
//! The validator re-walks a populated record through its bind plan and checks every field
//! against its annotations, recursing into nested records and lists of records. It runs after
//! every bind, so values decoded from a body document get the same checks as textual ones.

use crate::bind::{Bind, BindPlan};
use crate::constraint;
use crate::decode::FieldView;
use crate::error::{BindError, WebError};
use crate::tag::TagSet;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into(), value: None }
    }

    fn with_value(mut self, value: Option<String>) -> Self {
        self.value = value;
        self
    }
}

/// Several failed checks, reported together with status 422.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<ValidationError>> for ValidationErrors {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self(errors)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", error.field, error.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Records that can be swept by the validator.
pub trait Validate {
    /// Appends the failures of this record, with field names prefixed by `prefix`.
    fn validate_into(&self, prefix: &str, errors: &mut Vec<ValidationError>);
}

impl<T: Bind> Validate for T {
    fn validate_into(&self, prefix: &str, errors: &mut Vec<ValidationError>) {
        // a broken plan fails at route registration, there is nothing to sweep here
        if let Ok(plan) = T::plan() {
            sweep(self, plan, prefix, errors);
        }
    }
}

/// Validates a record. One failure is a `BindError`, several are `ValidationErrors`.
pub fn validate<T: Bind>(value: &T) -> Result<(), WebError> {
    into_result(collect(value))
}

pub(crate) fn collect<T: Bind>(value: &T) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    value.validate_into("", &mut errors);
    errors
}

pub(crate) fn into_result(mut errors: Vec<ValidationError>) -> Result<(), WebError> {
    match errors.len() {
        0 => Ok(()),
        1 => {
            let error = errors.remove(0);
            Err(BindError::new(error.field, error.message).into())
        }
        _ => Err(ValidationErrors(errors).into()),
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() { name.to_owned() } else { format!("{prefix}.{name}") }
}

fn sweep<S>(record: &S, plan: &BindPlan<S>, prefix: &str, errors: &mut Vec<ValidationError>) {
    for field in plan.fields() {
        let tags = field.tags();
        // the body record stands for the payload itself, its fields are not prefixed
        let name = if tags.is_body() { prefix.to_owned() } else { join(prefix, tags.wire_name()) };
        let view = field.view(record);

        if view.is_zero() {
            // unset optional fields are not checked against their bounds
            if tags.required() {
                errors.push(ValidationError::new(name, "required"));
            }
            continue;
        }
        check_view(&view, tags, &name, errors);
    }
}

fn check_view(view: &FieldView<'_>, tags: &TagSet, name: &str, errors: &mut Vec<ValidationError>) {
    let result = match view {
        FieldView::Str(s) => constraint::check_str(s, tags),
        FieldView::Int(i) => constraint::check_int(*i, tags),
        FieldView::Float(f) => constraint::check_float(*f, tags),
        FieldView::Record(record) => {
            record.validate_into(name, errors);
            Ok(())
        }
        FieldView::List(items) => {
            let unique = {
                let mut seen = HashSet::new();
                items.iter().all(|item| item.identity().is_none_or(|id| seen.insert(id)))
            };
            if let Err(message) = constraint::check_items(items.len(), unique, tags) {
                errors.push(ValidationError::new(name, message));
            }
            for (i, item) in items.iter().enumerate() {
                let item_name = format!("{name}[{i}]");
                match item {
                    FieldView::List(_) | FieldView::Absent => {}
                    other => check_view(other, tags, &item_name, errors),
                }
            }
            Ok(())
        }
        FieldView::Absent | FieldView::Bool(_) | FieldView::File(_) | FieldView::Json(_) | FieldView::Opaque => Ok(()),
    };

    if let Err(message) = result {
        errors.push(ValidationError::new(name, message).with_value(view.display()));
    }
}
