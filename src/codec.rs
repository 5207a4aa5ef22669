//! Wire codec for page server messages
//!
//! Five request kinds and five response kinds, each a 1-byte tag followed by
//! a fixed-layout body. All integers are network order. Page payloads are
//! exactly [`BLCKSZ`] bytes; error payloads are null-terminated UTF-8.
//!
//! An LSN of zero on a request is the wire sentinel for "serve the freshest
//! version the server has"; it is only ever produced by the WAL-sender
//! branch of the request-LSN selection.
//!
//! Decoding is strict: an unknown tag, a tag from the wrong direction, a
//! truncated body, or trailing bytes is a [`PageStoreError::Protocol`]
//! error, which is fatal to the backend.

use std::fmt;

use crate::constants::BLCKSZ;
use crate::error::{PageStoreError, Result};
use crate::lsn::Lsn;
use crate::page::PageBuf;
use crate::prefetch::pool::PagePool;
use crate::tag::{ForkNumber, RelTag};

/// Wire tags for client-to-server messages.
const TAG_EXISTS_REQUEST: u8 = 0;
const TAG_NBLOCKS_REQUEST: u8 = 1;
const TAG_GETPAGE_REQUEST: u8 = 2;
const TAG_DBSIZE_REQUEST: u8 = 3;
/// Reserved for a future request kind; never emitted or accepted.
const TAG_RESERVED_REQUEST: u8 = 4;

/// Wire tags for server-to-client messages.
const TAG_EXISTS_RESPONSE: u8 = 100;
const TAG_NBLOCKS_RESPONSE: u8 = 101;
const TAG_GETPAGE_RESPONSE: u8 = 102;
const TAG_ERROR_RESPONSE: u8 = 103;
const TAG_DBSIZE_RESPONSE: u8 = 104;

/// A request to the page server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageServerRequest {
    /// Does this relation fork exist?
    Exists {
        /// Serve the freshest version at or after `lsn`
        latest: bool,
        /// The WAL position the answer must reflect
        lsn: Lsn,
        /// Relation identity
        rel: RelTag,
        /// Fork within the relation
        fork: ForkNumber,
    },
    /// How many blocks does this relation fork have?
    Nblocks {
        /// Serve the freshest version at or after `lsn`
        latest: bool,
        /// The WAL position the answer must reflect
        lsn: Lsn,
        /// Relation identity
        rel: RelTag,
        /// Fork within the relation
        fork: ForkNumber,
    },
    /// Total size of a database in bytes
    DbSize {
        /// Serve the freshest version at or after `lsn`
        latest: bool,
        /// The WAL position the answer must reflect
        lsn: Lsn,
        /// Database oid
        db_node: u32,
    },
    /// Fetch one page
    GetPage {
        /// Serve the freshest version at or after `lsn`
        latest: bool,
        /// The WAL position the answer must reflect
        lsn: Lsn,
        /// Relation identity
        rel: RelTag,
        /// Fork within the relation
        fork: ForkNumber,
        /// Block number within the fork
        block: u32,
    },
}

/// A response from the page server.
#[derive(Clone, PartialEq, Eq)]
pub enum PageServerResponse {
    /// Answer to [`PageServerRequest::Exists`]
    Exists {
        /// Whether the relation fork exists
        exists: bool,
    },
    /// Answer to [`PageServerRequest::Nblocks`]
    Nblocks {
        /// Number of blocks in the fork
        n_blocks: u32,
    },
    /// Answer to [`PageServerRequest::GetPage`]
    GetPage {
        /// The page image, exactly `BLCKSZ` bytes
        page: Box<PageBuf>,
    },
    /// Answer to [`PageServerRequest::DbSize`]
    DbSize {
        /// Database size in bytes
        db_size: i64,
    },
    /// The server could not answer the request
    Error {
        /// The server's error message
        message: String,
    },
}

impl PageServerRequest {
    /// The request's wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            PageServerRequest::Exists { .. } => TAG_EXISTS_REQUEST,
            PageServerRequest::Nblocks { .. } => TAG_NBLOCKS_REQUEST,
            PageServerRequest::DbSize { .. } => TAG_DBSIZE_REQUEST,
            PageServerRequest::GetPage { .. } => TAG_GETPAGE_REQUEST,
        }
    }

    /// Encode the request into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(self.tag());
        match *self {
            PageServerRequest::Exists {
                latest,
                lsn,
                rel,
                fork,
            }
            | PageServerRequest::Nblocks {
                latest,
                lsn,
                rel,
                fork,
            } => {
                buf.push(latest as u8);
                buf.extend_from_slice(&lsn.0.to_be_bytes());
                put_rel(&mut buf, rel);
                buf.push(fork.as_u8());
            }
            PageServerRequest::DbSize {
                latest,
                lsn,
                db_node,
            } => {
                buf.push(latest as u8);
                buf.extend_from_slice(&lsn.0.to_be_bytes());
                buf.extend_from_slice(&db_node.to_be_bytes());
            }
            PageServerRequest::GetPage {
                latest,
                lsn,
                rel,
                fork,
                block,
            } => {
                buf.push(latest as u8);
                buf.extend_from_slice(&lsn.0.to_be_bytes());
                put_rel(&mut buf, rel);
                buf.push(fork.as_u8());
                buf.extend_from_slice(&block.to_be_bytes());
            }
        }
        buf
    }

    /// Decode a request from its wire form.
    ///
    /// This is the server-side direction; the client never decodes requests.
    /// Response tags and unknown tags are protocol errors, as are trailing
    /// bytes.
    pub fn decode(buf: &[u8]) -> Result<PageServerRequest> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let req = match tag {
            TAG_EXISTS_REQUEST => {
                let latest = r.u8()? != 0;
                let lsn = Lsn(r.u64()?);
                let rel = get_rel(&mut r)?;
                let fork = get_fork(&mut r)?;
                PageServerRequest::Exists {
                    latest,
                    lsn,
                    rel,
                    fork,
                }
            }
            TAG_NBLOCKS_REQUEST => {
                let latest = r.u8()? != 0;
                let lsn = Lsn(r.u64()?);
                let rel = get_rel(&mut r)?;
                let fork = get_fork(&mut r)?;
                PageServerRequest::Nblocks {
                    latest,
                    lsn,
                    rel,
                    fork,
                }
            }
            TAG_DBSIZE_REQUEST => {
                let latest = r.u8()? != 0;
                let lsn = Lsn(r.u64()?);
                let db_node = r.u32()?;
                PageServerRequest::DbSize {
                    latest,
                    lsn,
                    db_node,
                }
            }
            TAG_GETPAGE_REQUEST => {
                let latest = r.u8()? != 0;
                let lsn = Lsn(r.u64()?);
                let rel = get_rel(&mut r)?;
                let fork = get_fork(&mut r)?;
                let block = r.u32()?;
                PageServerRequest::GetPage {
                    latest,
                    lsn,
                    rel,
                    fork,
                    block,
                }
            }
            TAG_EXISTS_RESPONSE..=TAG_DBSIZE_RESPONSE => {
                return Err(PageStoreError::protocol(format!(
                    "refusing to decode response tag 0x{tag:02x} as a request"
                )));
            }
            other => {
                return Err(PageStoreError::protocol(format!(
                    "unexpected message tag 0x{other:02x}"
                )));
            }
        };
        r.finish()?;
        Ok(req)
    }
}

impl PageServerResponse {
    /// The response's wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            PageServerResponse::Exists { .. } => TAG_EXISTS_RESPONSE,
            PageServerResponse::Nblocks { .. } => TAG_NBLOCKS_RESPONSE,
            PageServerResponse::GetPage { .. } => TAG_GETPAGE_RESPONSE,
            PageServerResponse::DbSize { .. } => TAG_DBSIZE_RESPONSE,
            PageServerResponse::Error { .. } => TAG_ERROR_RESPONSE,
        }
    }

    /// Encode the response into its wire form. This is the server-side
    /// direction, used by in-process mock servers and round-trip tests.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.push(self.tag());
        match self {
            PageServerResponse::Exists { exists } => buf.push(*exists as u8),
            PageServerResponse::Nblocks { n_blocks } => {
                buf.extend_from_slice(&n_blocks.to_be_bytes())
            }
            PageServerResponse::GetPage { page } => buf.extend_from_slice(&page[..]),
            PageServerResponse::DbSize { db_size } => {
                buf.extend_from_slice(&db_size.to_be_bytes())
            }
            PageServerResponse::Error { message } => {
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
        }
        buf
    }

    /// Decode a response from its wire form.
    ///
    /// Page payloads are taken from `pool` so that buffered prefetch
    /// responses recycle a bounded set of page buffers. Request tags,
    /// unknown tags, truncated bodies and trailing bytes are protocol
    /// errors.
    pub fn decode(buf: &[u8], pool: &mut PagePool) -> Result<PageServerResponse> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let resp = match tag {
            TAG_EXISTS_RESPONSE => PageServerResponse::Exists {
                exists: r.u8()? != 0,
            },
            TAG_NBLOCKS_RESPONSE => PageServerResponse::Nblocks {
                n_blocks: r.u32()?,
            },
            TAG_GETPAGE_RESPONSE => {
                let bytes = r.bytes(BLCKSZ)?;
                let mut page = pool.acquire();
                page.copy_from_slice(bytes);
                PageServerResponse::GetPage { page }
            }
            TAG_DBSIZE_RESPONSE => PageServerResponse::DbSize {
                db_size: r.i64()?,
            },
            TAG_ERROR_RESPONSE => PageServerResponse::Error {
                message: r.cstring()?,
            },
            TAG_EXISTS_REQUEST..=TAG_RESERVED_REQUEST => {
                return Err(PageStoreError::protocol(format!(
                    "refusing to decode request tag 0x{tag:02x} as a response"
                )));
            }
            other => {
                return Err(PageStoreError::protocol(format!(
                    "unexpected message tag 0x{other:02x}"
                )));
            }
        };
        r.finish()?;
        Ok(resp)
    }
}

fn put_rel(buf: &mut Vec<u8>, rel: RelTag) {
    buf.extend_from_slice(&rel.spc_node.to_be_bytes());
    buf.extend_from_slice(&rel.db_node.to_be_bytes());
    buf.extend_from_slice(&rel.rel_node.to_be_bytes());
}

fn get_rel(r: &mut Reader<'_>) -> Result<RelTag> {
    Ok(RelTag {
        spc_node: r.u32()?,
        db_node: r.u32()?,
        rel_node: r.u32()?,
    })
}

fn get_fork(r: &mut Reader<'_>) -> Result<ForkNumber> {
    let raw = r.u8()?;
    ForkNumber::from_u8(raw)
        .ok_or_else(|| PageStoreError::protocol(format!("invalid fork number {raw}")))
}

/// Cursor over a received message body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(PageStoreError::protocol(format!(
                "message truncated: wanted {n} bytes, {} left",
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PageStoreError::protocol("unterminated string in message"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| PageStoreError::protocol("invalid UTF-8 in message string"))?
            .to_owned();
        self.pos += nul + 1;
        Ok(s)
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(PageStoreError::protocol(format!(
                "{} trailing bytes after message body",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PageServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageServerRequest::Exists {
                latest,
                lsn,
                rel,
                fork,
            } => write!(
                f,
                r#"{{"type": "ExistsRequest", "rnode": "{rel}", "forknum": {fork}, "lsn": "{lsn}", "latest": {}}}"#,
                *latest as u8
            ),
            PageServerRequest::Nblocks {
                latest,
                lsn,
                rel,
                fork,
            } => write!(
                f,
                r#"{{"type": "NblocksRequest", "rnode": "{rel}", "forknum": {fork}, "lsn": "{lsn}", "latest": {}}}"#,
                *latest as u8
            ),
            PageServerRequest::DbSize {
                latest,
                lsn,
                db_node,
            } => write!(
                f,
                r#"{{"type": "DbSizeRequest", "dbnode": "{db_node}", "lsn": "{lsn}", "latest": {}}}"#,
                *latest as u8
            ),
            PageServerRequest::GetPage {
                latest,
                lsn,
                rel,
                fork,
                block,
            } => write!(
                f,
                r#"{{"type": "GetPageRequest", "rnode": "{rel}", "forknum": {fork}, "blkno": {block}, "lsn": "{lsn}", "latest": {}}}"#,
                *latest as u8
            ),
        }
    }
}

impl fmt::Display for PageServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageServerResponse::Exists { exists } => {
                write!(f, r#"{{"type": "ExistsResponse", "exists": {}}}"#, *exists as u8)
            }
            PageServerResponse::Nblocks { n_blocks } => {
                write!(f, r#"{{"type": "NblocksResponse", "n_blocks": {n_blocks}}}"#)
            }
            PageServerResponse::GetPage { .. } => {
                write!(f, r#"{{"type": "GetPageResponse", "page": "..."}}"#)
            }
            PageServerResponse::DbSize { db_size } => {
                write!(f, r#"{{"type": "DbSizeResponse", "db_size": {db_size}}}"#)
            }
            PageServerResponse::Error { message } => {
                write!(f, r#"{{"type": "ErrorResponse", "message": "{message}"}}"#)
            }
        }
    }
}

impl fmt::Debug for PageServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The Display form already summarizes page payloads.
        fmt::Display::fmt(self, f)
    }
}
