//! Body codecs.
//!
//! Request bodies are selected by the literal `Content-Type` prefix. JSON, XML and YAML bodies are
//! parsed into one `serde_json::Value` document the binder reads fields from; protobuf payloads
//! are handed whole to a [`Protobuf`] field; form bodies become textual sources.
//!
//! Response payloads are negotiated from `Accept` between JSON, XML and YAML.

use crate::bind::UploadedFile;
use crate::decode::{DecodeError, FieldValue, FieldView};
use crate::tag::{Source, TagSet};
use bytes::Bytes;
use http::StatusCode;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use thiserror::Error;

/// A request body media type the framework can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Json,
    Xml,
    Yaml,
    Protobuf,
    FormUrlEncoded,
    Multipart,
}

impl MediaType {
    /// Selects a codec by the literal prefix of a `Content-Type` value.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let content_type = content_type.trim().to_ascii_lowercase();
        let prefixes: [(&str, MediaType); 9] = [
            ("application/json", MediaType::Json),
            ("application/xml", MediaType::Xml),
            ("text/xml", MediaType::Xml),
            ("application/x-yaml", MediaType::Yaml),
            ("application/yaml", MediaType::Yaml),
            ("text/yaml", MediaType::Yaml),
            ("application/x-protobuf", MediaType::Protobuf),
            ("application/x-www-form-urlencoded", MediaType::FormUrlEncoded),
            ("multipart/form-data", MediaType::Multipart),
        ];
        prefixes.into_iter().find(|(prefix, _)| content_type.starts_with(prefix)).map(|(_, media)| media)
    }

    /// The canonical MIME string.
    pub fn mime(&self) -> &'static str {
        match self {
            MediaType::Json => "application/json",
            MediaType::Xml => "application/xml",
            MediaType::Yaml => "application/x-yaml",
            MediaType::Protobuf => "application/x-protobuf",
            MediaType::FormUrlEncoded => "application/x-www-form-urlencoded",
            MediaType::Multipart => "multipart/form-data",
        }
    }

    /// JSON, XML or YAML: formats parsed into a field document.
    pub fn is_document(&self) -> bool {
        self.document_source().is_some()
    }

    pub fn is_form(&self) -> bool {
        matches!(self, MediaType::FormUrlEncoded | MediaType::Multipart)
    }

    /// The field source that reads from documents of this type.
    pub fn document_source(&self) -> Option<Source> {
        match self {
            MediaType::Json => Some(Source::Json),
            MediaType::Xml => Some(Source::Xml),
            MediaType::Yaml => Some(Source::Yaml),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaType::Json => "JSON",
            MediaType::Xml => "XML",
            MediaType::Yaml => "YAML",
            MediaType::Protobuf => "protobuf",
            MediaType::FormUrlEncoded => "urlencoded form",
            MediaType::Multipart => "multipart form",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed {media} body: {reason}")]
    Malformed { media: MediaType, reason: String },

    #[error("unsupported media type `{0}`")]
    UnsupportedMediaType(String),

    #[error("request body exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(String),

    #[error("failed to encode {format} payload: {reason}")]
    Encode { format: PayloadFormat, reason: String },
}

impl CodecError {
    pub fn malformed(media: MediaType, reason: impl fmt::Display) -> Self {
        CodecError::Malformed { media, reason: reason.to_string() }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CodecError::Malformed { .. } | CodecError::Read(_) => StatusCode::BAD_REQUEST,
            CodecError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            CodecError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CodecError::Encode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Parses a JSON, XML or YAML body into a document.
pub fn decode_document(media: MediaType, payload: &[u8]) -> Result<Value, CodecError> {
    match media {
        MediaType::Json => serde_json::from_slice(payload).map_err(|e| CodecError::malformed(media, e)),
        MediaType::Yaml => serde_yaml::from_slice(payload).map_err(|e| CodecError::malformed(media, e)),
        MediaType::Xml => {
            let text = std::str::from_utf8(payload).map_err(|e| CodecError::malformed(media, e))?;
            xml_document(text).map_err(|e| CodecError::malformed(media, e))
        }
        other => Err(CodecError::UnsupportedMediaType(other.mime().to_owned())),
    }
}

/// Parses a urlencoded body into repeated-key form values.
pub fn decode_form(payload: &[u8]) -> Result<HashMap<String, Vec<String>>, CodecError> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(payload).map_err(|e| CodecError::malformed(MediaType::FormUrlEncoded, e))?;
    let mut form: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in pairs {
        form.entry(key).or_default().push(value);
    }
    Ok(form)
}

/// Converts an XML document into the fields of its root element.
///
/// Leaf elements become strings, repeated children become arrays, attributes are kept under
/// `@name` and mixed text under `$text`.
fn xml_document(text: &str) -> Result<Value, quick_xml::Error> {
    struct Element {
        name: String,
        fields: Map<String, Value>,
        text: String,
    }

    fn finish(element: Element) -> Value {
        let Element { mut fields, text, .. } = element;
        if fields.is_empty() {
            return Value::String(text);
        }
        if !text.is_empty() {
            fields.insert("$text".to_owned(), Value::String(text));
        }
        Value::Object(fields)
    }

    fn insert(fields: &mut Map<String, Value>, name: String, value: Value) {
        match fields.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                fields.insert(name, value);
            }
        }
    }

    fn open(start: &quick_xml::events::BytesStart<'_>) -> Result<Element, quick_xml::Error> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut fields = Map::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(quick_xml::Error::from)?;
            let key = format!("@{}", String::from_utf8_lossy(attribute.key.as_ref()));
            fields.insert(key, Value::String(attribute.unescape_value()?.into_owned()));
        }
        Ok(Element { name, fields, text: String::new() })
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;
    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(open(&start)?),
            Event::Empty(start) => {
                let element = open(&start)?;
                let name = element.name.clone();
                let value = finish(element);
                match stack.last_mut() {
                    Some(parent) => insert(&mut parent.fields, name, value),
                    None => root = Some(value),
                }
            }
            Event::Text(content) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&content.unescape()?);
                }
            }
            Event::CData(content) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&content.into_inner()));
                }
            }
            Event::End(_) => {
                let Some(element) = stack.pop() else { continue };
                let name = element.name.clone();
                let value = finish(element);
                match stack.last_mut() {
                    Some(parent) => insert(&mut parent.fields, name, value),
                    None => root = Some(value),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(match root {
        Some(Value::String(text)) if text.is_empty() => Value::Object(Map::new()),
        Some(value) => value,
        None => Value::Object(Map::new()),
    })
}

/// Response payload formats chosen by `Accept` negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Xml,
    Yaml,
}

impl PayloadFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadFormat::Json => "application/json",
            PayloadFormat::Xml => "application/xml",
            PayloadFormat::Yaml => "application/x-yaml",
        }
    }

    /// Picks the highest-weighted supported format from an `Accept` header. JSON is the fallback.
    pub fn negotiate(accept: Option<&str>) -> PayloadFormat {
        let Some(accept) = accept else {
            return PayloadFormat::Json;
        };

        let mut best: Option<(f32, PayloadFormat)> = None;
        for entry in accept.split(',') {
            let mut parts = entry.split(';');
            let range = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
            let quality = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if quality <= 0.0 {
                continue;
            }
            let format = match range.as_str() {
                "application/json" | "application/*" | "*/*" => PayloadFormat::Json,
                "application/xml" | "text/xml" => PayloadFormat::Xml,
                "application/x-yaml" | "application/yaml" | "text/yaml" => PayloadFormat::Yaml,
                _ => continue,
            };
            if best.is_none_or(|(q, _)| quality > q) {
                best = Some((quality, format));
            }
        }
        best.map(|(_, format)| format).unwrap_or(PayloadFormat::Json)
    }

    /// Serializes `payload` in this format.
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Bytes, CodecError> {
        let encode_error = |reason: String| CodecError::Encode { format: *self, reason };
        match self {
            PayloadFormat::Json => serde_json::to_vec(payload).map(Bytes::from).map_err(|e| encode_error(e.to_string())),
            PayloadFormat::Yaml => {
                serde_yaml::to_string(payload).map(Bytes::from).map_err(|e| encode_error(e.to_string()))
            }
            PayloadFormat::Xml => quick_xml::se::to_string(payload)
                .or_else(|_| quick_xml::se::to_string_with_root("response", payload))
                .map(Bytes::from)
                .map_err(|e| encode_error(e.to_string())),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadFormat::Json => "JSON",
            PayloadFormat::Xml => "XML",
            PayloadFormat::Yaml => "YAML",
        };
        f.write_str(name)
    }
}

/// A protobuf message carried as the whole request payload.
///
/// Declare it on a field flagged `body`; the request must be `application/x-protobuf`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Protobuf<M>(pub M);

impl<M> Protobuf<M> {
    pub fn into_inner(self) -> M {
        self.0
    }
}

impl<M> Deref for Protobuf<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.0
    }
}

impl<M> DerefMut for Protobuf<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.0
    }
}

impl<M: prost::Message + Default + Send> FieldValue for Protobuf<M> {
    fn from_text(_values: &[String], _tags: &TagSet) -> Result<Self, DecodeError> {
        Err(DecodeError::new("protobuf messages are only read from the request body"))
    }

    fn from_json(_value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
        Err(DecodeError::new("protobuf messages are only read from the request body"))
    }

    fn from_files(_files: Vec<UploadedFile>) -> Result<Self, DecodeError> {
        Err(DecodeError::new("protobuf messages are only read from the request body"))
    }

    fn from_payload(media: crate::codec::MediaType, payload: &Bytes, _tags: &TagSet) -> Result<Self, CodecError> {
        if media != MediaType::Protobuf {
            return Err(CodecError::UnsupportedMediaType(media.mime().to_owned()));
        }
        M::decode(payload.as_ref()).map(Protobuf).map_err(|e| CodecError::malformed(media, e))
    }

    fn view(&self) -> FieldView<'_> {
        FieldView::Opaque
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_type_by_prefix() {
        assert_eq!(MediaType::from_content_type("application/json; charset=utf-8"), Some(MediaType::Json));
        assert_eq!(MediaType::from_content_type("Text/XML"), Some(MediaType::Xml));
        assert_eq!(MediaType::from_content_type("text/yaml"), Some(MediaType::Yaml));
        assert_eq!(
            MediaType::from_content_type("multipart/form-data; boundary=x"),
            Some(MediaType::Multipart)
        );
        assert_eq!(MediaType::from_content_type("application/x-protobuf"), Some(MediaType::Protobuf));
        assert_eq!(MediaType::from_content_type("text/plain"), None);
    }

    #[test]
    fn test_xml_document() {
        let xml = r#"<book id="7"><Name>Dune</Name><Tags>a</Tags><Tags>b</Tags><Price>10</Price><Empty/></book>"#;
        let value = decode_document(MediaType::Xml, xml.as_bytes()).unwrap();
        assert_eq!(
            value,
            json!({"@id": "7", "Name": "Dune", "Tags": ["a", "b"], "Price": "10", "Empty": ""})
        );
    }

    #[test]
    fn test_yaml_and_json_documents() {
        let yaml = decode_document(MediaType::Yaml, b"Name: Dune\nPrice: 10\n").unwrap();
        assert_eq!(yaml, json!({"Name": "Dune", "Price": 10}));

        let err = decode_document(MediaType::Json, b"{").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_form_keeps_repeated_keys() {
        let form = decode_form(b"tag=a&tag=b&name=x+y").unwrap();
        assert_eq!(form["tag"], vec!["a", "b"]);
        assert_eq!(form["name"], vec!["x y"]);
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(PayloadFormat::negotiate(None), PayloadFormat::Json);
        assert_eq!(PayloadFormat::negotiate(Some("application/xml")), PayloadFormat::Xml);
        assert_eq!(
            PayloadFormat::negotiate(Some("application/json;q=0.5, application/x-yaml")),
            PayloadFormat::Yaml
        );
        assert_eq!(PayloadFormat::negotiate(Some("text/html")), PayloadFormat::Json);
    }

    #[test]
    fn test_encode_xml_and_yaml() {
        #[derive(Serialize)]
        struct Book {
            name: String,
        }
        let book = Book { name: "Dune".into() };
        let xml = PayloadFormat::Xml.encode(&book).unwrap();
        assert_eq!(xml, Bytes::from_static(b"<Book><name>Dune</name></Book>"));

        let yaml = PayloadFormat::Yaml.encode(&book).unwrap();
        assert_eq!(yaml, Bytes::from_static(b"name: Dune\n"));
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        message: String,
    }

    #[test]
    fn test_protobuf_payload() {
        use prost::Message;
        let payload = Bytes::from(Ping { message: "hi".into() }.encode_to_vec());
        let tags = TagSet::parse("T", "ping", &[("body", "")]).unwrap();

        let decoded = Protobuf::<Ping>::from_payload(MediaType::Protobuf, &payload, &tags).unwrap();
        assert_eq!(decoded.message, "hi");

        let err = Protobuf::<Ping>::from_payload(MediaType::Json, &payload, &tags).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
