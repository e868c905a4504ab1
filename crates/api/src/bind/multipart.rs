use crate::body::RequestBody;
use crate::codec::{CodecError, MediaType};
use crate::context::Limits;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A file received in a multipart form part.
///
/// Small parts are kept in memory; parts larger than `max_multipart_memory` are spilled to a
/// temporary file that is removed once the last clone is dropped.
#[derive(Debug, Clone, Default)]
pub struct UploadedFile {
    field_name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    size: u64,
    storage: Storage,
}

#[derive(Debug, Clone, Default)]
enum Storage {
    #[default]
    Empty,
    Memory(Bytes),
    Spilled(Arc<NamedTempFile>),
}

impl UploadedFile {
    /// An in-memory file, mostly useful in tests.
    pub fn in_memory(field_name: impl Into<String>, file_name: Option<String>, content: Bytes) -> Self {
        UploadedFile {
            field_name: field_name.into(),
            file_name,
            content_type: None,
            size: content.len() as u64,
            storage: Storage::Memory(content),
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.storage, Storage::Empty)
    }

    /// Whether the content lives in a temporary file.
    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::Spilled(_))
    }

    /// The temporary file holding the content, when spilled.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Spilled(file) => Some(file.path()),
            _ => None,
        }
    }

    /// Reads the whole content.
    pub async fn bytes(&self) -> io::Result<Bytes> {
        match &self.storage {
            Storage::Empty => Ok(Bytes::new()),
            Storage::Memory(bytes) => Ok(bytes.clone()),
            Storage::Spilled(file) => tokio::fs::read(file.path()).await.map(Bytes::from),
        }
    }
}

pub(crate) struct MultipartForm {
    pub(crate) fields: HashMap<String, Vec<String>>,
    pub(crate) files: HashMap<String, Vec<UploadedFile>>,
}

fn malformed(e: impl std::fmt::Display) -> CodecError {
    CodecError::malformed(MediaType::Multipart, e)
}

fn storage_error(e: io::Error) -> CodecError {
    CodecError::Read(format!("failed to buffer multipart file: {e}"))
}

/// Splits a `multipart/form-data` body into text fields and files.
///
/// A part is a file when it carries a file name or a non-text content type.
pub(crate) async fn parse(body: RequestBody, content_type: &str, limits: &Limits) -> Result<MultipartForm, CodecError> {
    let boundary = multer::parse_boundary(content_type).map_err(malformed)?;
    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().whole_stream(limits.max_body_size as u64));
    let mut multipart = multer::Multipart::with_constraints(body.into_data_stream(), boundary, constraints);

    let mut form = MultipartForm { fields: HashMap::new(), files: HashMap::new() };
    while let Some(mut field) = multipart.next_field().await.map_err(|e| match e {
        multer::Error::StreamSizeExceeded { .. } => CodecError::PayloadTooLarge { limit: limits.max_body_size },
        e => malformed(e),
    })? {
        let name = field.name().unwrap_or_default().to_owned();
        let file_name = field.file_name().map(str::to_owned);
        let content_type = field.content_type().map(|m| m.to_string());
        let is_file = file_name.is_some() || content_type.as_deref().is_some_and(|ct| !ct.starts_with("text/plain"));

        if !is_file {
            let text = field.text().await.map_err(malformed)?;
            form.fields.entry(name).or_default().push(text);
            continue;
        }

        let mut buffer = BytesMut::new();
        let mut spilled: Option<(NamedTempFile, tokio::fs::File)> = None;
        let mut size = 0u64;
        while let Some(chunk) = field.chunk().await.map_err(malformed)? {
            size += chunk.len() as u64;
            match spilled.as_mut() {
                Some((_, file)) => file.write_all(&chunk).await.map_err(storage_error)?,
                None if buffer.len() + chunk.len() > limits.max_multipart_memory => {
                    let temp = NamedTempFile::new().map_err(storage_error)?;
                    let mut file = tokio::fs::File::from_std(temp.reopen().map_err(storage_error)?);
                    file.write_all(&buffer).await.map_err(storage_error)?;
                    file.write_all(&chunk).await.map_err(storage_error)?;
                    buffer.clear();
                    debug!(field = %name, path = %temp.path().display(), "multipart part spilled to disk");
                    spilled = Some((temp, file));
                }
                None => buffer.extend_from_slice(&chunk),
            }
        }

        let storage = match spilled {
            Some((temp, mut file)) => {
                file.flush().await.map_err(storage_error)?;
                Storage::Spilled(Arc::new(temp))
            }
            None => Storage::Memory(buffer.freeze()),
        };
        let file = UploadedFile { field_name: name.clone(), file_name, content_type, size, storage };
        form.files.entry(name).or_default().push(file);
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "X-BOUNDARY";

    fn body(parts: &[(&str, Option<&str>, &str)]) -> RequestBody {
        let mut text = String::new();
        for (name, file_name, content) in parts {
            text.push_str(&format!("--{BOUNDARY}\r\n"));
            match file_name {
                Some(file_name) => text.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )),
                None => text.push_str(&format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")),
            }
            text.push_str(content);
            text.push_str("\r\n");
        }
        text.push_str(&format!("--{BOUNDARY}--\r\n"));
        RequestBody::from(text)
    }

    fn limits(max_multipart_memory: usize) -> Limits {
        Limits { max_multipart_memory, ..Limits::default() }
    }

    #[tokio::test]
    async fn test_fields_and_files() {
        let body = body(&[("Name", None, "Acme"), ("Tags", None, "a,b"), ("Logo", Some("logo.png"), "PNGDATA")]);
        let form = parse(body, &format!("multipart/form-data; boundary={BOUNDARY}"), &limits(1024)).await.unwrap();

        assert_eq!(form.fields["Name"], vec!["Acme"]);
        assert_eq!(form.fields["Tags"], vec!["a,b"]);
        let logo = &form.files["Logo"][0];
        assert_eq!(logo.file_name(), Some("logo.png"));
        assert_eq!(logo.size(), 7);
        assert!(!logo.is_spilled());
        assert_eq!(logo.bytes().await.unwrap(), Bytes::from_static(b"PNGDATA"));
    }

    #[tokio::test]
    async fn test_large_part_spills_to_disk() {
        let content = "x".repeat(4096);
        let body = body(&[("Blob", Some("blob.bin"), &content)]);
        let form = parse(body, &format!("multipart/form-data; boundary={BOUNDARY}"), &limits(100)).await.unwrap();

        let blob = &form.files["Blob"][0];
        assert!(blob.is_spilled());
        assert!(blob.path().unwrap().exists());
        assert_eq!(blob.bytes().await.unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_missing_boundary() {
        let result = parse(RequestBody::empty(), "multipart/form-data", &limits(100)).await;
        assert!(matches!(result, Err(CodecError::Malformed { .. })));
    }
}
