//! SPDY/3 header blocks
//!
//! A header block is a list of name/value pairs:
//!
//! ```text
//! +------------------------------------+
//! | Number of Name/Value pairs (32)    |
//! +------------------------------------+
//! |     Length of name (32)            |
//! +------------------------------------+
//! |           Name (string)            |
//! +------------------------------------+
//! |     Length of value (32)           |
//! +------------------------------------+
//! |          Value   (string)          |
//! +------------------------------------+
//! |           (repeats)                |
//! ```
//!
//! On the wire every block is deflated with zlib. Each direction of a session
//! keeps one compression context for its whole lifetime, primed with the
//! SPDY/3 dictionary, and every block ends with a sync flush.

use crate::{ProtoError, ProtoResult, MAX_HEADER_BLOCK_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use std::sync::OnceLock;

/// Header names that open the SPDY/3 dictionary, each preceded by its
/// 32-bit big-endian length.
const DICTIONARY_WORDS: &[&str] = &[
    "options",
    "head",
    "post",
    "put",
    "delete",
    "trace",
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "accept-ranges",
    "age",
    "allow",
    "authorization",
    "cache-control",
    "connection",
    "content-base",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-md5",
    "content-range",
    "content-type",
    "date",
    "etag",
    "expect",
    "expires",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "last-modified",
    "location",
    "max-forwards",
    "pragma",
    "proxy-authenticate",
    "proxy-authorization",
    "range",
    "referer",
    "retry-after",
    "server",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "user-agent",
    "vary",
    "via",
    "warning",
    "www-authenticate",
    "method",
    "get",
    "status",
    "200 OK",
    "version",
    "HTTP/1.1",
    "url",
    "public",
    "set-cookie",
    "keep-alive",
    "origin",
];

/// Raw text that closes the SPDY/3 dictionary.
const DICTIONARY_TAIL: &str = concat!(
    "100101201202205206300302303304305306307402405406407408409410411412413414415416417502504505",
    "203 Non-Authoritative Information",
    "204 No Content",
    "301 Moved Permanently",
    "400 Bad Request",
    "401 Unauthorized",
    "403 Forbidden",
    "404 Not Found",
    "500 Internal Server Error",
    "501 Not Implemented",
    "503 Service Unavailable",
    "Jan Feb Mar Apr May Jun Jul Aug Sept Oct Nov Dec 00:00:00 ",
    "Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMT",
    "chunked,text/html,image/png,image/jpg,image/gif,application/xml,application/xhtml+xml,",
    "text/plain,text/javascript,public",
    "privatemax-age=gzip,deflate,sdch",
    "charset=utf-8charset=iso-8859-1,utf-,*,enq=0.",
);

/// The SPDY/3 zlib dictionary
pub fn dictionary() -> &'static [u8] {
    static DICTIONARY: OnceLock<Vec<u8>> = OnceLock::new();
    DICTIONARY.get_or_init(|| {
        let mut dict = Vec::with_capacity(1424);
        for word in DICTIONARY_WORDS {
            dict.extend_from_slice(&(word.len() as u32).to_be_bytes());
            dict.extend_from_slice(word.as_bytes());
        }
        dict.extend_from_slice(DICTIONARY_TAIL.as_bytes());
        dict
    })
}

/// Ordered list of header name/value pairs
///
/// Names are stored lowercase, as SPDY requires. Lookups are
/// case-insensitive so callers may use the canonical HTTP spelling
/// (`streamType`, `requestID`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<(String, String)>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value for the same name
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder-style [`HeaderBlock::insert`]
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Get a header value by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the uncompressed block layout
    pub fn to_bytes(&self) -> Bytes {
        let size = 4 + self
            .entries
            .iter()
            .map(|(n, v)| 8 + n.len() + v.len())
            .sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(self.entries.len() as u32);
        for (name, value) in &self.entries {
            buf.put_u32(name.len() as u32);
            buf.put_slice(name.as_bytes());
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        buf.freeze()
    }

    /// Parse the uncompressed block layout
    pub fn from_bytes(mut buf: &[u8]) -> ProtoResult<Self> {
        if buf.remaining() < 4 {
            return Err(ProtoError::MalformedHeaders(
                "missing pair count".to_string(),
            ));
        }
        let count = buf.get_u32() as usize;
        // Each pair needs at least two length fields
        if count > buf.remaining() / 8 {
            return Err(ProtoError::MalformedHeaders(format!(
                "{} pairs cannot fit in {} bytes",
                count,
                buf.remaining()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_string(&mut buf, "name")?;
            if name.is_empty() {
                return Err(ProtoError::MalformedHeaders(
                    "empty header name".to_string(),
                ));
            }
            let value = read_string(&mut buf, "value")?;
            entries.push((name, value));
        }

        if buf.has_remaining() {
            return Err(ProtoError::MalformedHeaders(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self { entries })
    }
}

fn read_string(buf: &mut &[u8], what: &str) -> ProtoResult<String> {
    if buf.remaining() < 4 {
        return Err(ProtoError::MalformedHeaders(format!(
            "truncated {} length",
            what
        )));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtoError::MalformedHeaders(format!(
            "{} length {} exceeds block",
            what, len
        )));
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw)
        .map_err(|_| ProtoError::MalformedHeaders(format!("{} is not valid UTF-8", what)))
}

/// Outbound half of a session's header compression context
pub struct HeaderCompressor {
    inner: Compress,
}

impl std::fmt::Debug for HeaderCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderCompressor")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl HeaderCompressor {
    pub fn new() -> ProtoResult<Self> {
        let mut inner = Compress::new(Compression::default(), true);
        inner
            .set_dictionary(dictionary())
            .map_err(|e| ProtoError::Compression(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Compress one header block, ending with a sync flush
    pub fn compress(&mut self, block: &HeaderBlock) -> ProtoResult<Bytes> {
        let raw = block.to_bytes();
        let mut out = Vec::with_capacity(raw.len() + 64);
        let start = self.inner.total_in();

        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            self.inner
                .compress_vec(&raw[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| ProtoError::Compression(e.to_string()))?;

            let consumed = (self.inner.total_in() - start) as usize;
            // The flush is complete once all input is in and zlib left room
            if consumed == raw.len() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(64));
        }

        Ok(Bytes::from(out))
    }
}

/// Inbound half of a session's header compression context
pub struct HeaderDecompressor {
    inner: Decompress,
}

impl std::fmt::Debug for HeaderDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderDecompressor")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl Default for HeaderDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDecompressor {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    /// Inflate one compressed header block and parse it
    pub fn decompress(&mut self, input: &[u8]) -> ProtoResult<HeaderBlock> {
        let mut out = Vec::with_capacity(input.len() * 4 + 64);
        let start_in = self.inner.total_in();

        loop {
            let consumed = (self.inner.total_in() - start_in) as usize;
            let produced = out.len();

            match self
                .inner
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            {
                Ok(_) => {}
                Err(e) if e.needs_dictionary().is_some() => {
                    self.inner
                        .set_dictionary(dictionary())
                        .map_err(|e| ProtoError::Compression(e.to_string()))?;
                    continue;
                }
                Err(e) => return Err(ProtoError::Compression(e.to_string())),
            }

            let now_consumed = (self.inner.total_in() - start_in) as usize;
            if out.len() > MAX_HEADER_BLOCK_SIZE {
                return Err(ProtoError::HeaderBlockTooLarge(out.len()));
            }
            if now_consumed == input.len() && out.len() < out.capacity() {
                break;
            }
            if now_consumed == consumed && out.len() == produced && out.len() < out.capacity() {
                return Err(ProtoError::Compression(
                    "header block ended mid-stream".to_string(),
                ));
            }
            out.reserve(out.capacity().max(64));
        }

        HeaderBlock::from_bytes(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_layout() {
        let dict = dictionary();
        assert_eq!(&dict[..4], &[0, 0, 0, 7]);
        assert_eq!(&dict[4..11], b"options");
        assert!(dict.ends_with(b"enq=0."));
        // "origin" is the last length-prefixed word, the tail follows directly
        let origin = dict
            .windows(10)
            .position(|w| w == b"\0\0\0\x06origin")
            .unwrap();
        assert_eq!(&dict[origin + 10..origin + 16], b"100101");
    }

    #[test]
    fn test_header_block_insert_replaces() {
        let mut block = HeaderBlock::new();
        block.insert("streamType", "error");
        block.insert("streamtype", "data");

        assert_eq!(block.len(), 1);
        assert_eq!(block.get("StreamType"), Some("data"));
        assert_eq!(block.iter().next(), Some(("streamtype", "data")));
    }

    #[test]
    fn test_header_block_rejects_truncation() {
        let block = HeaderBlock::new().with("port", "8080");
        let raw = block.to_bytes();

        assert!(HeaderBlock::from_bytes(&raw[..raw.len() - 1]).is_err());
        assert!(HeaderBlock::from_bytes(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_shared_context_across_blocks() {
        let mut compressor = HeaderCompressor::new().unwrap();
        let mut decompressor = HeaderDecompressor::new();

        let error = HeaderBlock::new()
            .with("streamtype", "error")
            .with("port", "8080")
            .with("requestid", "0");
        let data = HeaderBlock::new()
            .with("streamtype", "data")
            .with("port", "8080")
            .with("requestid", "0");

        let first = compressor.compress(&error).unwrap();
        let second = compressor.compress(&data).unwrap();

        // Blocks must be inflated in order with the same context
        assert_eq!(decompressor.decompress(&first).unwrap(), error);
        assert_eq!(decompressor.decompress(&second).unwrap(), data);
    }

    #[test]
    fn test_empty_block() {
        let mut compressor = HeaderCompressor::new().unwrap();
        let mut decompressor = HeaderDecompressor::new();

        let compressed = compressor.compress(&HeaderBlock::new()).unwrap();
        assert!(decompressor.decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_context_cannot_read_later_block() {
        let mut compressor = HeaderCompressor::new().unwrap();
        let _ = compressor
            .compress(&HeaderBlock::new().with("port", "1"))
            .unwrap();
        let second = compressor
            .compress(&HeaderBlock::new().with("port", "2"))
            .unwrap();

        // A second block has no zlib header, so a new context rejects it
        assert!(HeaderDecompressor::new().decompress(&second).is_err());
    }
}
