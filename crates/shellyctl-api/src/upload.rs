// Chunked script upload.
//
// Script text goes to the device in fixed-size chunks of characters via
// `script.putcode`. The first write replaces the stored code, every later
// write appends. A device may consume only part of what it was offered
// and report the consumed count in `len`; the unconsumed tail of that
// write is offered again (appending) until the device has taken all of
// it, and only then does the upload advance to the next chunk.

use tracing::{debug, trace};

use crate::error::Error;
use crate::rpc::{RpcCall, ScriptApi};

/// Characters per `script.putcode` chunk.
pub const UPLOAD_CHUNK_SIZE: usize = 1024;

/// What an upload took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Total `script.putcode` calls issued.
    pub writes: usize,
    /// Writes that resent an unconsumed tail.
    pub retries: usize,
}

/// Upload `code` as the full text of script `id`.
///
/// Any failed write aborts the upload and leaves the device with whatever
/// it had accepted so far. A reply reporting zero characters consumed for
/// a non-empty write is a protocol error.
pub async fn upload_code<C: RpcCall>(
    client: &C,
    id: u32,
    code: &str,
    chunk_size: usize,
) -> Result<UploadReport, Error> {
    if chunk_size == 0 {
        return Err(Error::Protocol("upload chunk size must be positive".into()));
    }

    let mut report = UploadReport::default();

    if code.is_empty() {
        client.put_code(id, "", false).await?;
        report.writes = 1;
        return Ok(report);
    }

    for chunk in char_chunks(code, chunk_size) {
        // Byte offset into `chunk` of the first character not yet consumed.
        let mut cursor = 0;
        while cursor < chunk.len() {
            let offered = &chunk[cursor..];
            let offered_chars = offered.chars().count();
            let append = report.writes > 0;

            let reply = client.put_code(id, offered, append).await?;
            if cursor > 0 {
                report.retries += 1;
            }
            report.writes += 1;

            let consumed = reply.len.map_or(offered_chars, |n| n.min(offered_chars));
            if consumed == 0 {
                return Err(Error::Protocol(format!(
                    "script {id} accepted none of {offered_chars} characters"
                )));
            }
            if consumed < offered_chars {
                trace!(id, consumed, offered = offered_chars, "partial write, resending tail");
            }
            cursor += byte_offset(offered, consumed);
        }
    }

    debug!(id, writes = report.writes, retries = report.retries, "upload complete");
    Ok(report)
}

/// Split `text` into consecutive slices of at most `size` characters.
fn char_chunks(text: &str, size: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let (head, tail) = rest.split_at(byte_offset(rest, size));
        rest = tail;
        Some(head)
    })
}

/// Byte index of the `chars`-th character of `text` (or its length).
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}
