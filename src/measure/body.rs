//! Incremental decoding of origin body bytes into text.
//!
//! Every delivered network unit is run through the content decoder and the
//! UTF-8 decoder right away, so text comes out with the origin's delivery
//! boundaries.

use crate::Error;
use crate::Result;
use brotli::DecompressorWriter;
use flate2::write::GzDecoder;
use flate2::write::ZlibDecoder;
use std::io::Write;

const BROTLI_BUFFER: usize = 4096;
const BOM: char = '\u{FEFF}';

/// Content encoding of a response, from its `Content-Encoding` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl Encoding {
    /// Detects the encoding, `None` when it is not one this crate decodes.
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        let Some(value) = value else {
            return Some(Encoding::Identity);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Encoding::Identity),
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "br" => Some(Encoding::Brotli),
            _ => None,
        }
    }
}

enum Inflate {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
    Brotli(Box<DecompressorWriter<Vec<u8>>>),
}

impl Inflate {
    fn new(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Identity => Inflate::Identity,
            Encoding::Gzip => Inflate::Gzip(GzDecoder::new(Vec::new())),
            Encoding::Deflate => Inflate::Deflate(ZlibDecoder::new(Vec::new())),
            Encoding::Brotli => Inflate::Brotli(Box::new(DecompressorWriter::new(Vec::new(), BROTLI_BUFFER))),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Inflate::Identity => Ok(bytes.to_vec()),
            Inflate::Gzip(decoder) => {
                decoder.write_all(bytes)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Inflate::Deflate(decoder) => {
                decoder.write_all(bytes)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Inflate::Brotli(decoder) => {
                decoder.write_all(bytes)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }

    fn finish(&mut self) -> std::io::Result<Vec<u8>> {
        match self {
            Inflate::Identity => Ok(Vec::new()),
            Inflate::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Inflate::Deflate(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Inflate::Brotli(decoder) => {
                decoder.close()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }
}

/// Streaming UTF-8 decoder.
///
/// An incomplete sequence at the end of a piece is held back for the next one,
/// invalid sequences become U+FFFD and a leading byte order mark is dropped.
#[derive(Default, Debug)]
pub struct Utf8 {
    pending: Vec<u8>,
    started: bool,
}

impl Utf8 {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::with_capacity(self.pending.len());
        let mut offset = 0;
        while offset < self.pending.len() {
            match std::str::from_utf8(&self.pending[offset..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    offset = self.pending.len();
                }
                Err(error) => {
                    let valid = offset + error.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[offset..valid]));
                    match error.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            offset = valid + len;
                        }
                        None => {
                            offset = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..offset);
        self.strip(text)
    }

    /// Flushes a dangling incomplete sequence.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).into_owned();
        self.strip(text)
    }

    fn strip(&mut self, text: String) -> String {
        if self.started || text.is_empty() {
            return text;
        }
        self.started = true;
        match text.strip_prefix(BOM) {
            Some(rest) => rest.to_owned(),
            None => text,
        }
    }
}

/// Turns origin body bytes into text, one delivery at a time.
pub struct Body {
    inflate: Inflate,
    utf8: Utf8,
}

impl Body {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            inflate: Inflate::new(encoding),
            utf8: Utf8::default(),
        }
    }

    /// Decodes one delivered unit, the text may be empty.
    pub fn push(&mut self, bytes: &[u8]) -> Result<String> {
        let bytes = self.inflate.push(bytes).map_err(Error::Decompress)?;
        Ok(self.utf8.decode(&bytes))
    }

    /// Decodes what is left once the origin is exhausted.
    pub fn finish(&mut self) -> Result<String> {
        let bytes = self.inflate.finish().map_err(Error::Decompress)?;
        let mut text = self.utf8.decode(&bytes);
        text.push_str(&self.utf8.finish());
        Ok(text)
    }
}

#[cfg(test)]
pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

#[cfg(test)]
pub fn brotli(text: &str) -> Vec<u8> {
    let mut encoder = brotli::CompressorWriter::new(Vec::new(), 4096, 5, 22);
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.into_inner()
}

#[test]
fn test_encoding_from_header() {
    assert_eq!(Some(Encoding::Identity), Encoding::from_header(None));
    assert_eq!(Some(Encoding::Identity), Encoding::from_header(Some("identity")));
    assert_eq!(Some(Encoding::Gzip), Encoding::from_header(Some("GZIP")));
    assert_eq!(Some(Encoding::Gzip), Encoding::from_header(Some("x-gzip")));
    assert_eq!(Some(Encoding::Deflate), Encoding::from_header(Some(" deflate ")));
    assert_eq!(Some(Encoding::Brotli), Encoding::from_header(Some("br")));
    assert_eq!(None, Encoding::from_header(Some("zstd")));
}

#[test]
fn test_utf8_split_sequence() {
    let bytes = "a✓b".as_bytes();
    let mut utf8 = Utf8::default();
    assert_eq!("a", utf8.decode(&bytes[..2]));
    assert_eq!("", utf8.decode(&bytes[2..3]));
    assert_eq!("✓b", utf8.decode(&bytes[3..]));
    assert_eq!("", utf8.finish());
}

#[test]
fn test_utf8_invalid_and_dangling() {
    let mut utf8 = Utf8::default();
    assert_eq!("a\u{FFFD}b", utf8.decode(b"a\xFFb"));
    assert_eq!("c", utf8.decode(b"c\xE2\x9C"));
    assert_eq!("\u{FFFD}", utf8.finish());
}

#[test]
fn test_utf8_strips_leading_bom_once() {
    let mut utf8 = Utf8::default();
    assert_eq!("", utf8.decode(b"\xEF\xBB"));
    assert_eq!("hi", utf8.decode(b"\xBFhi"));
    assert_eq!("\u{FEFF}x", utf8.decode("\u{FEFF}x".as_bytes()));
}

#[test]
fn test_body_identity() {
    let mut body = Body::new(Encoding::Identity);
    assert_eq!("ab", body.push(b"ab").unwrap());
    assert_eq!("c", body.push(b"c").unwrap());
    assert_eq!("", body.finish().unwrap());
}

#[test]
fn test_body_gzip_in_pieces() {
    let text = "hello streaming world\n".repeat(50);
    let compressed = gzip(&text);
    let mut body = Body::new(Encoding::Gzip);
    let mut decoded = String::new();
    for piece in compressed.chunks(13) {
        decoded.push_str(&body.push(piece).unwrap());
    }
    decoded.push_str(&body.finish().unwrap());
    assert_eq!(text, decoded);
}

#[test]
fn test_body_deflate() {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"deflated text").unwrap();
    let compressed = encoder.finish().unwrap();
    let mut body = Body::new(Encoding::Deflate);
    let mut decoded = body.push(&compressed).unwrap();
    decoded.push_str(&body.finish().unwrap());
    assert_eq!("deflated text", decoded);
}

#[test]
fn test_body_brotli_in_pieces() {
    let text = "brotli body ✓ ".repeat(40);
    let compressed = brotli(&text);
    let mut body = Body::new(Encoding::Brotli);
    let mut decoded = String::new();
    for piece in compressed.chunks(7) {
        decoded.push_str(&body.push(piece).unwrap());
    }
    decoded.push_str(&body.finish().unwrap());
    assert_eq!(text, decoded);
}

#[test]
fn test_body_corrupt_gzip() {
    let mut body = Body::new(Encoding::Gzip);
    let result = body.push(b"definitely not gzip data").and_then(|_| body.finish());
    assert!(matches!(result, Err(Error::Decompress(_))));
}
