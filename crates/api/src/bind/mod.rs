//! Request binding.
//!
//! `#[derive(Bind)]` produces a [`BindPlan`] per record type: one [`FieldSpec`] per field, holding
//! the raw annotations and monomorphic accessors. The plan is built once, on first use, and its
//! parsed [`TagSet`]s are shared by binding, validation and schema generation.

mod multipart;
mod sources;

pub use multipart::UploadedFile;
pub use sources::Sources;

use crate::codec::{CodecError, MediaType, decode_document};
use crate::context::Context;
use crate::decode::{DecodeError, FieldView};
use crate::error::{BindError, WebError};
use crate::openapi::{Schema, SchemaRegistry};
use crate::tag::{Source, TagError, TagSet};
use crate::validate::{self, ValidationError};
use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Types that can be populated from a request.
///
/// Implemented by `#[derive(Bind)]`; the derive also implements `FieldValue` and `ToSchema` so a
/// record can be nested in another record or carried in a body.
pub trait Bind: Default + Send + Sync + 'static {
    fn plan() -> Result<&'static BindPlan<Self>, TagError>;
}

/// Generated description of one field of record `S`.
pub struct FieldSpec<S> {
    pub ident: &'static str,
    pub annotations: &'static [(&'static str, &'static str)],
    pub schema: fn(&mut SchemaRegistry) -> Schema,
    pub accepts_files: bool,
    pub set_text: fn(&mut S, &[String], &TagSet) -> Result<(), DecodeError>,
    pub set_json: fn(&mut S, Value, &TagSet) -> Result<(), DecodeError>,
    pub set_files: fn(&mut S, Vec<UploadedFile>) -> Result<(), DecodeError>,
    pub set_payload: fn(&mut S, MediaType, &Bytes, &TagSet) -> Result<(), CodecError>,
    pub set_nested: Option<fn(&mut S, &mut Sources<'_>) -> Result<(), WebError>>,
    pub nested_plan: Option<fn() -> Result<&'static dyn PlanInfo, TagError>>,
    pub view: for<'a> fn(&'a S) -> FieldView<'a>,
}

/// A field spec with its parsed annotations.
pub struct FieldPlan<S> {
    spec: FieldSpec<S>,
    tags: TagSet,
}

impl<S> FieldPlan<S> {
    pub fn ident(&self) -> &'static str {
        self.spec.ident
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn view<'a>(&self, record: &'a S) -> FieldView<'a> {
        (self.spec.view)(record)
    }

    fn info(&self) -> FieldInfo<'_> {
        FieldInfo {
            ident: self.spec.ident,
            tags: &self.tags,
            schema: self.spec.schema,
            accepts_files: self.spec.accepts_files,
            nested_plan: self.spec.nested_plan,
        }
    }
}

/// The cached binding recipe of record `S`.
pub struct BindPlan<S> {
    type_name: &'static str,
    fields: Vec<FieldPlan<S>>,
    reads_body: bool,
    has_documents: bool,
}

impl<S> BindPlan<S> {
    pub fn new(type_name: &'static str, specs: Vec<FieldSpec<S>>) -> Result<Self, TagError> {
        let mut fields = Vec::with_capacity(specs.len());
        for spec in specs {
            let tags = TagSet::parse(type_name, spec.ident, spec.annotations)?;
            fields.push(FieldPlan { spec, tags });
        }

        if fields.iter().filter(|f| f.tags.is_body()).count() > 1 {
            return Err(TagError::MultipleBodies { owner: type_name.to_owned() });
        }

        let reads_body = fields.iter().any(|f| {
            f.tags.reads_body()
                || f.tags.is_nested()
                || f.spec.accepts_files
                || f.tags.sources().iter().any(|(s, _)| matches!(s, Source::Form | Source::FormFile))
        });
        let has_documents = fields.iter().any(|f| f.tags.has_document_source());
        debug!(record = type_name, fields = fields.len(), "bind plan built");
        Ok(BindPlan { type_name, fields, reads_body, has_documents })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn fields(&self) -> &[FieldPlan<S>] {
        &self.fields
    }

    fn body_field(&self) -> Option<&FieldPlan<S>> {
        self.fields.iter().find(|f| f.tags.is_body())
    }
}

/// Borrowed, type-erased view of one field, for schema generation.
pub struct FieldInfo<'a> {
    pub ident: &'static str,
    pub tags: &'a TagSet,
    pub schema: fn(&mut SchemaRegistry) -> Schema,
    pub accepts_files: bool,
    pub nested_plan: Option<fn() -> Result<&'static dyn PlanInfo, TagError>>,
}

/// A bind plan with its record type erased.
pub trait PlanInfo: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn fields(&self) -> Vec<FieldInfo<'_>>;
}

impl<S: Send + Sync + 'static> PlanInfo for BindPlan<S> {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn fields(&self) -> Vec<FieldInfo<'_>> {
        self.fields.iter().map(FieldPlan::info).collect()
    }
}

pub fn plan_info<T: Bind>() -> Result<&'static dyn PlanInfo, TagError> {
    T::plan().map(|plan| plan as &'static dyn PlanInfo)
}

/// Binds and validates a `T` from the request.
pub async fn bind<T: Bind>(ctx: &mut Context) -> Result<T, WebError> {
    let plan = T::plan()?;
    let mut sources = Sources::collect(ctx, plan.reads_body).await?;
    let mut dest = T::default();

    let body_sourced = apply_body(&mut dest, plan, &mut sources);
    bind_fields(&mut dest, plan, &mut sources, &body_sourced)?;

    let errors = validate::collect(&dest);
    let codec_error = sources.take_codec_error();
    if errors.is_empty() {
        if let Some(e) = codec_error {
            warn!(record = plan.type_name, cause = %e, "ignored undecodable request body");
        }
        return Ok(dest);
    }
    if let Some(e) = codec_error
        && errors.iter().any(|error| blames_body(plan, error))
    {
        return Err(e.into());
    }
    validate::into_result(errors).map(|_| dest)
}

/// Binds a `nested` record from the textual sources of the enclosing request.
pub fn bind_nested<T: Bind>(dest: &mut T, sources: &mut Sources<'_>) -> Result<(), WebError> {
    bind_fields(dest, T::plan()?, sources, &[])
}

/// Populates a record from a JSON-shaped document. Used for records nested in bodies.
pub fn record_from_json<T: Bind>(value: Value) -> Result<T, DecodeError> {
    let plan = T::plan().map_err(|e| DecodeError::new(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(DecodeError::new(format!("expected an object for {}", plan.type_name)));
    };
    let mut dest = T::default();
    apply_document(&mut dest, plan, &map, Source::Json)
        .map_err(|(name, e)| DecodeError::new(format!("field `{name}`: {}", e.reason())))?;
    Ok(dest)
}

/// Sets every document-sourced field present in `map`. Returns which fields were set.
fn apply_document<S>(
    dest: &mut S,
    plan: &BindPlan<S>,
    map: &Map<String, Value>,
    source: Source,
) -> Result<Vec<bool>, (String, DecodeError)> {
    let mut sourced = vec![false; plan.fields.len()];
    for (i, field) in plan.fields.iter().enumerate() {
        if !field.tags.has_document_source() {
            continue;
        }
        let Some(name) = field.tags.document_name(source) else { continue };
        let Some(value) = map.get(name) else { continue };
        (field.spec.set_json)(dest, value.clone(), &field.tags).map_err(|e| (name.to_owned(), e))?;
        sourced[i] = true;
    }
    Ok(sourced)
}

/// Decodes the request payload into body fields. Failures are remembered, not raised.
///
/// Returns, per field, whether the body provided a value.
fn apply_body<S>(dest: &mut S, plan: &BindPlan<S>, sources: &mut Sources<'_>) -> Vec<bool> {
    let mut sourced = vec![false; plan.fields.len()];
    let Some((media, payload)) = sources.payload() else {
        return sourced;
    };

    if let Some(i) = plan.fields.iter().position(|f| f.tags.is_body()) {
        let field = &plan.fields[i];
        match (field.spec.set_payload)(dest, media, &payload, &field.tags) {
            Ok(()) => sourced[i] = true,
            Err(e) => sources.tolerate(e),
        }
    }

    let Some(source) = media.document_source() else { return sourced };
    if !plan.has_documents {
        return sourced;
    }
    match decode_document(media, &payload) {
        Ok(Value::Object(map)) => match apply_document(dest, plan, &map, source) {
            Ok(hits) => {
                for (slot, hit) in sourced.iter_mut().zip(hits) {
                    *slot |= hit;
                }
            }
            Err((name, e)) => sources.tolerate(CodecError::malformed(media, format!("field `{name}`: {e}"))),
        },
        Ok(_) => sources.tolerate(CodecError::malformed(media, "expected an object")),
        Err(e) => sources.tolerate(e),
    }
    sourced
}

/// Binds textual, file and nested fields, then applies defaults and `required`.
fn bind_fields<S>(
    dest: &mut S,
    plan: &BindPlan<S>,
    sources: &mut Sources<'_>,
    body_sourced: &[bool],
) -> Result<(), WebError> {
    for (i, field) in plan.fields.iter().enumerate() {
        let tags = &field.tags;
        if tags.is_body() {
            continue;
        }
        if let Some(set_nested) = field.spec.set_nested {
            set_nested(dest, sources)?;
            continue;
        }

        let mut sourced = false;
        if field.spec.accepts_files || tags.file_name().is_some() {
            let name = tags.file_name().unwrap_or(tags.wire_name());
            let files = sources.files(name);
            if !files.is_empty() {
                (field.spec.set_files)(dest, files).map_err(|e| BindError::new(name, e.reason()))?;
                sourced = true;
            }
        }

        if !sourced {
            for (source, name) in tags.textual_sources() {
                let values = sources.values(source, name);
                if values.is_empty() {
                    continue;
                }
                (field.spec.set_text)(dest, &values, tags).map_err(|e| BindError::new(name, e.reason()))?;
                sourced = true;
                break;
            }
        }

        if sourced || body_sourced.get(i).copied().unwrap_or(false) {
            continue;
        }
        if let Some(default) = tags.default_value() {
            (field.spec.set_text)(dest, &[default.to_owned()], tags)
                .map_err(|e| BindError::new(tags.wire_name(), format!("invalid default: {}", e.reason())))?;
            continue;
        }
        if tags.required() && !tags.reads_body() {
            return Err(BindError::required(tags.wire_name()).into());
        }
    }
    Ok(())
}

/// Whether a validation failure can be explained by an undecodable body.
fn blames_body<S>(plan: &BindPlan<S>, error: &ValidationError) -> bool {
    let head = error.field.split(['.', '[']).next().unwrap_or_default();
    match plan.fields.iter().find(|f| !f.tags.is_body() && f.tags.wire_name() == head) {
        Some(field) => field.tags.reads_body() && (field.tags.required() || error.message == "required"),
        None => plan.body_field().is_some(),
    }
}
