use std::fmt;

use bytes::Bytes;

/// A buffered request body.
///
/// Bodies are byte buffers; the higher-level encodings (forms, JSON,
/// multipart) all flatten into one before the request is written.
#[derive(Clone, Default)]
pub struct Body {
    bytes: Bytes,
}

impl Body {
    /// The body bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the body in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the body has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn clone_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body { bytes }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body { bytes: vec.into() }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body {
            bytes: s.into_bytes().into(),
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body {
            bytes: Bytes::from_static(s.as_bytes()),
        }
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Body {
        Body {
            bytes: Bytes::from_static(s),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Body").field("len", &self.len()).finish()
    }
}
