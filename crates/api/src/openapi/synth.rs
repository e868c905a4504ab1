//! Builds the OpenAPI document from the route table.

use crate::bind::{FieldInfo, PlanInfo};
use crate::openapi::OpenApiConfig;
use crate::openapi::schema::{SchemaRegistry, field_schema, plan_schema};
use crate::openapi::spec::{
    Components, Content, Document, Header, Info, OPENAPI_VERSION, Operation, Parameter, ParameterLocation,
    RequestBody, Response, Schema, Tag,
};
use crate::router::{Route, Router};
use crate::tag::Source;
use http::{Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const MULTIPART: &str = "multipart/form-data";
const JSON: &str = "application/json";

pub(crate) fn synthesize(router: &Router, config: &OpenApiConfig) -> Document {
    let mut registry = SchemaRegistry::new();
    let mut document = Document {
        openapi: OPENAPI_VERSION.to_owned(),
        info: Info {
            title: config.title.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
        },
        servers: config.servers.clone(),
        ..Default::default()
    };

    let mut tags: Vec<String> = Vec::new();
    for route in router.routes().filter(|r| !r.doc().hidden) {
        let operation = operation(route, &mut registry);
        for tag in &operation.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        document
            .paths
            .entry(route.pattern().openapi_path().to_owned())
            .or_default()
            .insert(route.method().as_str().to_ascii_lowercase(), operation);
    }

    document.tags = tags.into_iter().map(|name| Tag { name }).collect();
    document.components = Components {
        schemas: registry.into_schemas(),
        security_schemes: config.security_schemes.clone(),
    };
    document
}

/// `get /users/{id}/posts` becomes `get_users_id_posts`.
pub(crate) fn default_operation_id(method: &Method, path: &str) -> String {
    let mut id = method.as_str().to_ascii_lowercase();
    for word in path.split(|c: char| !c.is_ascii_alphanumeric()).filter(|w| !w.is_empty()) {
        id.push('_');
        id.push_str(word);
    }
    id
}

fn operation(route: &Route, registry: &mut SchemaRegistry) -> Operation {
    let doc = route.doc();
    let contract = route.contract();
    let mut operation = Operation {
        operation_id: Some(
            doc.operation_id
                .clone()
                .unwrap_or_else(|| default_operation_id(route.method(), route.pattern().openapi_path())),
        ),
        summary: doc.summary.clone(),
        description: doc.description.clone(),
        tags: doc.tags.clone(),
        deprecated: doc.deprecated,
        security: (!doc.security.is_empty()).then(|| doc.security.clone()),
        ..Default::default()
    };

    if let Some(input) = contract.input {
        match input() {
            Ok(plan) => {
                collect_parameters(plan, registry, &mut operation.parameters);
                operation.request_body = request_body(plan, registry);
            }
            Err(e) => warn!(pattern = route.pattern().as_str(), cause = %e, "input type left out of the document"),
        }
    }
    // every declared path parameter is documented, typed or not
    for param in route.pattern().params() {
        if !operation.parameters.iter().any(|p| p.location == ParameterLocation::Path && p.name == param.name()) {
            let schema = match param.kind() {
                crate::router::ParamKind::Int => Schema::of_type("integer").with_format("int64"),
                _ => Schema::of_type("string"),
            };
            operation.parameters.push(Parameter {
                name: param.name().to_owned(),
                location: ParameterLocation::Path,
                description: None,
                required: true,
                deprecated: false,
                schema,
                example: None,
            });
        }
    }

    let status = if route.method() == Method::POST { StatusCode::CREATED } else { StatusCode::OK };
    let mut response = Response { description: reason(status), ..Default::default() };
    if let Some(output) = contract.output {
        let output = output(registry);
        if let Some(body) = output.body {
            response.content = output
                .content_types
                .iter()
                .map(|ct| ((*ct).to_owned(), Content { schema: body.clone() }))
                .collect();
        }
        response.headers = output
            .headers
            .into_iter()
            .map(|(name, schema)| (name, Header { description: None, schema }))
            .collect();
    }
    operation.responses.insert(status.as_str().to_owned(), response);

    for extra in &doc.responses {
        let mut response = Response { description: extra.description.clone(), ..Default::default() };
        if let Some(schema) = extra.schema {
            response.content.insert(JSON.to_owned(), Content { schema: schema(registry) });
        }
        operation.responses.insert(extra.status.to_string(), response);
    }
    operation
}

fn reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("Response").to_owned()
}

fn location(source: Source) -> Option<ParameterLocation> {
    match source {
        Source::Path => Some(ParameterLocation::Path),
        Source::Query => Some(ParameterLocation::Query),
        Source::Header => Some(ParameterLocation::Header),
        Source::Cookie => Some(ParameterLocation::Cookie),
        _ => None,
    }
}

fn collect_parameters(plan: &dyn PlanInfo, registry: &mut SchemaRegistry, out: &mut Vec<Parameter>) {
    for field in plan.fields() {
        if field.tags.hidden() {
            continue;
        }
        if field.tags.is_nested() {
            if let Some(nested) = field.nested_plan
                && let Ok(nested) = nested()
            {
                collect_parameters(nested, registry, out);
            }
            continue;
        }
        for (source, name) in field.tags.sources() {
            let Some(location) = location(*source) else {
                continue;
            };
            if out.iter().any(|p| p.location == location && p.name == *name) {
                continue;
            }
            let schema = field_schema(&field, registry);
            let example = schema.example.clone().or_else(|| field.tags.example().map(Value::from));
            out.push(Parameter {
                name: name.clone(),
                location,
                description: field.tags.description().map(str::to_owned),
                required: location == ParameterLocation::Path || field.tags.required(),
                deprecated: field.tags.deprecated(),
                schema,
                example,
            });
        }
    }
}

fn request_body(plan: &dyn PlanInfo, registry: &mut SchemaRegistry) -> Option<RequestBody> {
    let fields = plan.fields();

    if let Some(body) = fields.iter().find(|f| f.tags.is_body()) {
        return Some(RequestBody {
            description: body.tags.description().map(str::to_owned),
            required: body.tags.required(),
            content: BTreeMap::from([(JSON.to_owned(), Content { schema: (body.schema)(registry) })]),
        });
    }

    let form_fields: Vec<&FieldInfo<'_>> = fields
        .iter()
        .filter(|f| !f.tags.hidden() && (f.tags.source_name(Source::Form).is_some() || f.tags.file_name().is_some()))
        .collect();
    if !form_fields.is_empty() {
        let multipart = form_fields.iter().any(|f| f.tags.file_name().is_some() || f.accepts_files);
        let mut schema = Schema::object();
        for field in &form_fields {
            let Some(name) = field.tags.file_name().or_else(|| field.tags.source_name(Source::Form)) else {
                continue;
            };
            schema.properties.insert(name.to_owned(), field_schema(field, registry));
            if field.tags.required() {
                schema.required.push(name.to_owned());
            }
        }
        let content_type = if multipart { MULTIPART } else { FORM_URLENCODED };
        return Some(RequestBody {
            description: None,
            required: !schema.required.is_empty(),
            content: BTreeMap::from([(content_type.to_owned(), Content { schema })]),
        });
    }

    if !fields.iter().any(|f| !f.tags.hidden() && f.tags.has_document_source()) {
        return None;
    }
    let schema = plan_schema(plan, registry);
    Some(RequestBody {
        description: None,
        required: !schema.required.is_empty(),
        content: BTreeMap::from([(JSON.to_owned(), Content { schema })]),
    })
}
