//! Schema derivation for Rust types and annotated fields.

use crate::bind::{Bind, FieldInfo, PlanInfo, UploadedFile};
use crate::codec::Protobuf;
use crate::openapi::spec::{Schema, number};
use crate::tag::{Source, TagSet};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Types that can describe themselves as an OpenAPI schema.
///
/// Named types return a `schema_name` and are emitted once under `components/schemas`; every use
/// site receives a `$ref`. Unnamed types are inlined.
pub trait ToSchema {
    fn schema_name() -> Option<Cow<'static, str>> {
        None
    }

    fn schema(registry: &mut SchemaRegistry) -> Schema;
}

/// Collects the named schemas referenced while building a document.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Schema>,
    pending: HashSet<String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a `$ref` for named types (registering them on first sight) or the inline schema.
    pub fn resolve<T: ToSchema + ?Sized>(&mut self) -> Schema {
        let Some(name) = T::schema_name() else {
            return T::schema(self);
        };
        let name = name.into_owned();
        // recursive types see their own name as pending and get a plain $ref
        if !self.schemas.contains_key(&name) && self.pending.insert(name.clone()) {
            let schema = T::schema(self);
            self.pending.remove(&name);
            self.schemas.insert(name.clone(), schema);
        }
        Schema::reference(&name)
    }

    pub fn get(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn into_schemas(self) -> BTreeMap<String, Schema> {
        self.schemas
    }
}

/// Object schema of a bound record: one property per document-sourced field.
pub fn record_schema<T: Bind>(registry: &mut SchemaRegistry) -> Schema {
    match T::plan() {
        Ok(plan) => plan_schema(plan, registry),
        Err(_) => Schema::object(),
    }
}

pub(crate) fn plan_schema(plan: &dyn PlanInfo, registry: &mut SchemaRegistry) -> Schema {
    let mut schema = Schema::object();
    for field in plan.fields() {
        if field.tags.hidden() {
            continue;
        }
        let Some(name) = field.tags.document_name(Source::Json) else {
            continue;
        };
        schema.properties.insert(name.to_owned(), field_schema(&field, registry));
        if field.tags.required() {
            schema.required.push(name.to_owned());
        }
    }
    schema
}

/// The schema of one field: its type's schema overlaid with the field's annotations.
pub fn field_schema(field: &FieldInfo<'_>, registry: &mut SchemaRegistry) -> Schema {
    apply_tags((field.schema)(registry), field.tags)
}

/// Overlays annotation constraints and docs onto a type's schema.
pub(crate) fn apply_tags(schema: Schema, tags: &TagSet) -> Schema {
    if schema.is_reference() {
        if tags.description().is_none() && !tags.deprecated() {
            return schema;
        }
        // siblings of $ref are ignored in 3.0
        return Schema {
            all_of: vec![schema],
            description: tags.description().map(str::to_owned),
            deprecated: tags.deprecated(),
            ..Default::default()
        };
    }

    let mut schema = schema;
    schema.description = tags.description().map(str::to_owned).or(schema.description);
    schema.deprecated |= tags.deprecated();

    if schema.is_type("array") {
        schema.min_items = tags.min_items();
        schema.max_items = tags.max_items();
        schema.unique_items = tags.unique_items();
        if let Some(items) = schema.items.take() {
            let items = apply_value_constraints(*items, tags);
            schema.items = Some(Box::new(items));
        }
        schema.default = tags.default_value().map(|v| Value::Array(split_list(v).map(Value::from).collect()));
        schema.example = tags.example().map(|v| Value::Array(split_list(v).map(Value::from).collect()));
        return schema;
    }

    let schema = apply_value_constraints(schema, tags);
    let kind = schema.schema_type.clone();
    Schema {
        default: tags.default_value().map(|v| typed_literal(kind.as_deref(), v)),
        example: tags.example().map(|v| typed_literal(kind.as_deref(), v)),
        ..schema
    }
}

fn apply_value_constraints(mut schema: Schema, tags: &TagSet) -> Schema {
    if schema.is_reference() {
        return schema;
    }
    match schema.schema_type.as_deref() {
        Some("integer") | Some("number") => {
            schema.minimum = tags.min().and_then(number).or(schema.minimum);
            schema.maximum = tags.max().and_then(number).or(schema.maximum);
            schema.multiple_of = tags.multiple_of().and_then(number);
        }
        Some("string") => {
            schema.min_length = tags.string_min_length();
            schema.max_length = tags.string_max_length();
            schema.pattern = tags.pattern().map(|p| p.as_str().to_owned());
            if let Some(format) = tags.format() {
                schema.format = Some(format.as_str().to_owned());
            }
        }
        _ => {}
    }
    if !tags.enum_values().is_empty() {
        let kind = schema.schema_type.clone();
        schema.enum_values = tags.enum_values().iter().map(|v| typed_literal(kind.as_deref(), v)).collect();
    }
    schema
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

/// Converts an annotation literal into a JSON value of the schema's type.
fn typed_literal(schema_type: Option<&str>, text: &str) -> Value {
    match schema_type {
        Some("integer") => text.trim().parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(text)),
        Some("number") => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(number)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(text)),
        Some("boolean") => match text.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::from(text),
        },
        _ => Value::from(text),
    }
}

impl ToSchema for String {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::of_type("string")
    }
}

impl ToSchema for str {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::of_type("string")
    }
}

impl ToSchema for bool {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::of_type("boolean")
    }
}

macro_rules! impl_integer_schema {
    ($format:literal, $minimum:expr => $($ty:ty),*) => {
        $(
            impl ToSchema for $ty {
                fn schema(_: &mut SchemaRegistry) -> Schema {
                    let mut schema = Schema::of_type("integer").with_format($format);
                    schema.minimum = $minimum;
                    schema
                }
            }
        )*
    };
}

impl_integer_schema!("int32", None => i8, i16, i32);
impl_integer_schema!("int32", Some(0.into()) => u8, u16);
impl_integer_schema!("int64", None => i64, isize, i128);
impl_integer_schema!("int64", Some(0.into()) => u32, u64, usize, u128);

impl ToSchema for f32 {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::of_type("number").with_format("float")
    }
}

impl ToSchema for f64 {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::of_type("number").with_format("double")
    }
}

impl ToSchema for Value {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::default()
    }
}

impl ToSchema for () {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::default()
    }
}

impl<T: ToSchema> ToSchema for Option<T> {
    fn schema(registry: &mut SchemaRegistry) -> Schema {
        let mut schema = registry.resolve::<T>();
        if !schema.is_reference() {
            schema.nullable = true;
        }
        schema
    }
}

impl<T: ToSchema> ToSchema for Vec<T> {
    fn schema(registry: &mut SchemaRegistry) -> Schema {
        Schema::array(registry.resolve::<T>())
    }
}

impl<T: ToSchema> ToSchema for [T] {
    fn schema(registry: &mut SchemaRegistry) -> Schema {
        Schema::array(registry.resolve::<T>())
    }
}

impl<T: ToSchema, S> ToSchema for HashMap<String, T, S> {
    fn schema(registry: &mut SchemaRegistry) -> Schema {
        Schema { additional_properties: Some(Box::new(registry.resolve::<T>())), ..Schema::object() }
    }
}

impl<T: ToSchema> ToSchema for BTreeMap<String, T> {
    fn schema(registry: &mut SchemaRegistry) -> Schema {
        Schema { additional_properties: Some(Box::new(registry.resolve::<T>())), ..Schema::object() }
    }
}

impl<T: ToSchema + ?Sized> ToSchema for Box<T> {
    fn schema_name() -> Option<Cow<'static, str>> {
        T::schema_name()
    }

    fn schema(registry: &mut SchemaRegistry) -> Schema {
        T::schema(registry)
    }
}

impl ToSchema for UploadedFile {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::of_type("string").with_format("binary")
    }
}

impl<M> ToSchema for Protobuf<M> {
    fn schema(_: &mut SchemaRegistry) -> Schema {
        Schema::of_type("string").with_format("binary")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Node;

    impl ToSchema for Node {
        fn schema_name() -> Option<Cow<'static, str>> {
            Some("Node".into())
        }

        fn schema(registry: &mut SchemaRegistry) -> Schema {
            let mut schema = Schema::object();
            schema.properties.insert("children".into(), registry.resolve::<Vec<Node>>());
            schema
        }
    }

    #[test]
    fn test_named_types_are_registered_once() {
        let mut registry = SchemaRegistry::new();
        let first = registry.resolve::<Node>();
        let second = registry.resolve::<Option<Node>>();

        assert_eq!(first, Schema::reference("Node"));
        assert_eq!(second, Schema::reference("Node"));
        let node = registry.get("Node").unwrap();
        assert_eq!(node.properties["children"], Schema::array(Schema::reference("Node")));
    }

    #[test]
    fn test_tag_overlay_on_string() {
        let tags = TagSet::parse(
            "T",
            "name",
            &[("minLength", "4"), ("maxLength", "50"), ("format", "email"), ("example", "a@b.io")],
        )
        .unwrap();
        let schema = apply_tags(String::schema(&mut SchemaRegistry::new()), &tags);
        assert_eq!(
            serde_json::to_value(&schema).unwrap(),
            json!({"type": "string", "format": "email", "minLength": 4, "maxLength": 50, "example": "a@b.io"})
        );
    }

    #[test]
    fn test_tag_overlay_on_integer_list() {
        let tags =
            TagSet::parse("T", "ids", &[("min", "1"), ("maxItems", "3"), ("uniqueItems", ""), ("default", "1,2")])
                .unwrap();
        let schema = apply_tags(Vec::<u32>::schema(&mut SchemaRegistry::new()), &tags);
        assert_eq!(
            serde_json::to_value(&schema).unwrap(),
            json!({
                "type": "array",
                "items": {"type": "integer", "format": "int64", "minimum": 1},
                "maxItems": 3,
                "uniqueItems": true,
                "default": ["1", "2"]
            })
        );
    }

    #[test]
    fn test_described_reference_is_wrapped() {
        let tags = TagSet::parse("T", "node", &[("description", "the root")]).unwrap();
        let schema = apply_tags(Schema::reference("Node"), &tags);
        assert_eq!(schema.all_of, vec![Schema::reference("Node")]);
        assert_eq!(schema.description.as_deref(), Some("the root"));
    }

    #[test]
    fn test_enum_literals_follow_type() {
        let tags = TagSet::parse("T", "level", &[("enum", "1,2,3")]).unwrap();
        let schema = apply_tags(i32::schema(&mut SchemaRegistry::new()), &tags);
        assert_eq!(schema.enum_values, vec![json!(1), json!(2), json!(3)]);
    }
}
