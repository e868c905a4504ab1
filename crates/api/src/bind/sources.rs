use crate::bind::multipart;
use crate::bind::UploadedFile;
use crate::codec::{self, CodecError, MediaType};
use crate::context::Context;
use crate::error::WebError;
use crate::tag::Source;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use std::collections::HashMap;
use tracing::debug;

/// The raw values a request offers to the binder.
pub struct Sources<'c> {
    ctx: &'c Context,
    query: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    form: HashMap<String, Vec<String>>,
    files: HashMap<String, Vec<UploadedFile>>,
    payload: Option<(MediaType, Bytes)>,
    codec_error: Option<CodecError>,
}

impl<'c> Sources<'c> {
    /// Gathers the request's sources, reading the body when `read_body` is set.
    ///
    /// Form bodies become form values and files; any other supported body is kept as the payload.
    pub(crate) async fn collect(ctx: &'c mut Context, read_body: bool) -> Result<Sources<'c>, WebError> {
        let mut form = HashMap::new();
        let mut files = HashMap::new();
        let mut payload = None;

        let content_type = ctx.header(CONTENT_TYPE).map(str::to_owned);
        let media = content_type.as_deref().and_then(MediaType::from_content_type);
        if read_body && let Some(media) = media && let Some(body) = ctx.take_body() {
            let limits = ctx.limits();
            match media {
                MediaType::Multipart => {
                    let parsed =
                        multipart::parse(body, content_type.as_deref().unwrap_or_default(), &limits).await?;
                    form = parsed.fields;
                    files = parsed.files;
                }
                MediaType::FormUrlEncoded => {
                    let bytes = body.collect_limited(limits.max_body_size).await?;
                    form = codec::decode_form(&bytes)?;
                }
                other => {
                    let bytes = body.collect_limited(limits.max_body_size).await?;
                    if !bytes.is_empty() {
                        payload = Some((other, bytes));
                    }
                }
            }
        }

        let ctx: &'c Context = ctx;
        Ok(Sources {
            query: ctx.query_pairs(),
            cookies: ctx.cookie_pairs(),
            ctx,
            form,
            files,
            payload,
            codec_error: None,
        })
    }

    /// Non-empty raw values of `name` under a textual source.
    pub fn values(&self, source: Source, name: &str) -> Vec<String> {
        let values: Vec<String> = match source {
            Source::Path => self.ctx.param(name).map(str::to_owned).into_iter().collect(),
            Source::Query => pick(&self.query, name),
            Source::Cookie => pick(&self.cookies, name),
            Source::Form => self.form.get(name).cloned().unwrap_or_default(),
            Source::Header => self
                .ctx
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        };
        values.into_iter().filter(|v| !v.is_empty()).collect()
    }

    /// Uploaded files of the multipart part `name`.
    pub fn files(&self, name: &str) -> Vec<UploadedFile> {
        self.files.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn payload(&self) -> Option<(MediaType, Bytes)> {
        self.payload.clone()
    }

    /// Remembers a body decoding failure. Only the first one is kept.
    pub(crate) fn tolerate(&mut self, error: CodecError) {
        debug!(cause = %error, "body decoding failed, continuing with the remaining sources");
        self.codec_error.get_or_insert(error);
    }

    pub(crate) fn take_codec_error(&mut self) -> Option<CodecError> {
        self.codec_error.take()
    }
}

fn pick(pairs: &[(String, String)], name: &str) -> Vec<String> {
    pairs.iter().filter(|(k, _)| k == name).map(|(_, v)| v.clone()).collect()
}
