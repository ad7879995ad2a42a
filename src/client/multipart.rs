//! multipart/form-data

use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use mime::Mime;

use crate::util::fast_random;

/// A multipart/form-data request body.
///
/// ```
/// let form = gyre::multipart::Form::new()
///     .text("username", "seanmonstar")
///     .text("password", "secret");
/// ```
pub struct Form {
    boundary: String,
    fields: Vec<(Cow<'static, str>, Part)>,
}

/// A field in a multipart form.
pub struct Part {
    value: Bytes,
    mime: Option<Mime>,
    file_name: Option<Cow<'static, str>>,
}

impl Form {
    /// Creates a new form with a freshly generated boundary.
    pub fn new() -> Form {
        Form {
            boundary: format!(
                "{:016x}-{:016x}-{:016x}-{:016x}",
                fast_random(),
                fast_random(),
                fast_random(),
                fast_random()
            ),
            fields: Vec::new(),
        }
    }

    /// Get the boundary that this form will use.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Add a data field with supplied name and value.
    pub fn text<T, U>(self, name: T, value: U) -> Form
    where
        T: Into<Cow<'static, str>>,
        U: Into<Cow<'static, str>>,
    {
        self.part(name, Part::text(value))
    }

    /// Adds a customized Part.
    pub fn part<T>(mut self, name: T, part: Part) -> Form
    where
        T: Into<Cow<'static, str>>,
    {
        self.fields.push((name.into(), part));
        self
    }

    pub(crate) fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Flatten the form into wire bytes.
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for (name, part) in &self.fields {
            buf.put_slice(b"--");
            buf.put_slice(self.boundary.as_bytes());
            buf.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
            buf.put_slice(escape_token(name).as_bytes());
            buf.put_slice(b"\"");
            if let Some(file_name) = &part.file_name {
                buf.put_slice(b"; filename=\"");
                buf.put_slice(escape_token(file_name).as_bytes());
                buf.put_slice(b"\"");
            }
            buf.put_slice(b"\r\n");
            if let Some(mime) = part.effective_mime() {
                buf.put_slice(b"Content-Type: ");
                buf.put_slice(mime.as_ref().as_bytes());
                buf.put_slice(b"\r\n");
            }
            buf.put_slice(b"\r\n");
            buf.put_slice(&part.value);
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"--");
        buf.put_slice(self.boundary.as_bytes());
        buf.put_slice(b"--\r\n");
        buf.freeze()
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for Form {
    fn default() -> Self {
        Form::new()
    }
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Form")
            .field("boundary", &self.boundary)
            .field("parts", &self.fields.len())
            .finish()
    }
}

impl Part {
    /// Makes a text parameter.
    pub fn text<T>(value: T) -> Part
    where
        T: Into<Cow<'static, str>>,
    {
        let value = match value.into() {
            Cow::Borrowed(s) => Bytes::from_static(s.as_bytes()),
            Cow::Owned(s) => Bytes::from(s.into_bytes()),
        };
        Part {
            value,
            mime: None,
            file_name: None,
        }
    }

    /// Makes a new parameter from arbitrary bytes.
    pub fn bytes<T>(value: T) -> Part
    where
        T: Into<Bytes>,
    {
        Part {
            value: value.into(),
            mime: None,
            file_name: None,
        }
    }

    /// Tries to set the mime of this part.
    pub fn mime_str(mut self, mime: &str) -> crate::Result<Part> {
        self.mime = Some(mime.parse().map_err(crate::Error::builder)?);
        Ok(self)
    }

    /// Sets the filename, building a `filename=` directive into the field.
    pub fn file_name<T>(mut self, filename: T) -> Part
    where
        T: Into<Cow<'static, str>>,
    {
        self.file_name = Some(filename.into());
        self
    }

    fn effective_mime(&self) -> Option<Mime> {
        if let Some(mime) = &self.mime {
            return Some(mime.clone());
        }
        // A named file without an explicit type gets a guess by extension.
        self.file_name
            .as_deref()
            .map(|name| mime_guess::from_path(name).first_or_octet_stream())
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Part")
            .field("len", &self.value.len())
            .field("file_name", &self.file_name)
            .finish()
    }
}

fn escape_token(s: &str) -> Cow<'_, str> {
    if s.contains(&['"', '\r', '\n', '\\'][..]) {
        let mut escaped = String::with_capacity(s.len() + 2);
        for c in s.chars() {
            match c {
                '"' => escaped.push_str("%22"),
                '\r' => escaped.push_str("%0D"),
                '\n' => escaped.push_str("%0A"),
                '\\' => escaped.push_str("%5C"),
                c => escaped.push(c),
            }
        }
        Cow::Owned(escaped)
    } else {
        Cow::Borrowed(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_text_fields() {
        let form = Form::new().text("key", "value").text("other", "more");
        let boundary = form.boundary().to_owned();
        let body = form.encode();
        let text = std::str::from_utf8(&body).unwrap();

        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("Content-Disposition: form-data; name=\"key\"\r\n\r\nvalue\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn file_part_gets_guessed_mime() {
        let form = Form::new().part(
            "upload",
            Part::bytes(&b"pixels"[..]).file_name("shot.png"),
        );
        let body = form.encode();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("filename=\"shot.png\""));
        assert!(text.contains("Content-Type: image/png"));
    }

    #[test]
    fn quotes_in_names_are_escaped() {
        let form = Form::new().text("na\"me", "v");
        let body = form.encode();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("name=\"na%22me\""));
    }

    #[test]
    fn boundaries_differ_between_forms() {
        assert_ne!(Form::new().boundary(), Form::new().boundary());
    }
}
