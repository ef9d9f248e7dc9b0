use std::io::Read;

use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};

#[derive(Debug)]
pub(crate) struct DecodeBodyError {
    pub(crate) encoding: String,
    pub(crate) message: String,
}

fn read_to_end(reader: &mut impl Read, encoding: &str) -> Result<Vec<u8>, DecodeBodyError> {
    let mut decoded = Vec::new();
    reader
        .read_to_end(&mut decoded)
        .map_err(|error| DecodeBodyError {
            encoding: encoding.to_owned(),
            message: error.to_string(),
        })?;
    Ok(decoded)
}

/// Decodes a buffered body according to its `Content-Encoding`.
///
/// `gzip`, `br` and `deflate` are decoded; an absent or unrecognized
/// encoding passes the bytes through untouched.
pub(crate) fn decode_body(body: Bytes, headers: &HeaderMap) -> Result<Bytes, DecodeBodyError> {
    let Some(encoding) = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(body);
    };

    let decoded = match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
            read_to_end(&mut decoder, encoding)?
        }
        "deflate" => {
            let mut decoder = flate2::read::ZlibDecoder::new(body.as_ref());
            read_to_end(&mut decoder, encoding)?
        }
        "br" => {
            let mut decoder = brotli::Decompressor::new(body.as_ref(), 4096);
            read_to_end(&mut decoder, encoding)?
        }
        _ => return Ok(body),
    };

    Ok(Bytes::from(decoded))
}

/// Replaces the headers' `Content-Length` with the decoded body length so
/// downstream readers see a consistent buffer.
pub(crate) fn update_content_length(headers: &mut HeaderMap, body_len: usize) {
    if let Ok(value) = http::HeaderValue::from_str(&body_len.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
}
