//! Content-encoding decompression.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::header::{HeaderMap, CONTENT_ENCODING, TRANSFER_ENCODING};

/// Decode a buffered body according to its `Content-Encoding` chain.
///
/// Encodings are applied by servers in listed order, so they are undone in
/// reverse. Unknown encodings fail with a decode error rather than handing
/// back compressed bytes as if they were plain.
pub(crate) fn decode_content(headers: &HeaderMap, body: &Bytes) -> crate::Result<Bytes> {
    let encodings = content_encodings(headers);
    if encodings.is_empty() {
        return Ok(body.clone());
    }

    let mut data = body.to_vec();
    for encoding in encodings.iter().rev() {
        data = match encoding.as_str() {
            "gzip" | "x-gzip" => decode_gzip(&data)?,
            "deflate" => decode_deflate(&data)?,
            "identity" => data,
            other => {
                return Err(crate::Error::decode(format!(
                    "unsupported content encoding: {other}"
                )))
            }
        };
    }
    Ok(data.into())
}

fn content_encodings(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .chain(headers.get_all(TRANSFER_ENCODING).iter())
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty() && token != "chunked")
        .collect()
}

fn decode_gzip(data: &[u8]) -> crate::Result<Vec<u8>> {
    // An empty compressed body decodes to an empty body.
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(crate::Error::decode)?;
    Ok(out)
}

fn decode_deflate(data: &[u8]) -> crate::Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    // Servers disagree on whether "deflate" means zlib-wrapped or raw.
    let mut out = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(crate::Error::decode)?;
    Ok(out)
}
