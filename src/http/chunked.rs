//! Chunked transfer-coding step functions.
//!
//! Each step looks at the front of a connection's buffered input and either
//! asks for more bytes or reports how many bytes it consumed. Nothing is
//! consumed on [`Step::NeedMore`], so a step can simply be retried once the
//! next read has been appended.
//!
//! ```text
//! chunk     = chunk-size [ ";" ext ] CRLF chunk-data CRLF
//! last      = 1*"0" [ ";" ext ] CRLF
//! trailer   = *( field-line CRLF )
//! body      = *chunk last trailer CRLF
//! ```

use crate::{errors::ErrorKind, http::types::trim_ows};
use memchr::memmem;

/// Outcome of one decoding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    /// The buffer does not hold a complete unit yet.
    NeedMore,
    /// `consumed` bytes were used from the front of the buffer.
    Done { consumed: usize, value: T },
}

/// Reads one chunk-size line.
///
/// The value is the chunk size; `0` marks the terminal chunk. Extensions
/// after `;` are ignored. A line longer than `max_line` without a line
/// terminator is rejected instead of waiting forever.
pub fn chunk_size(buf: &[u8], max_line: usize) -> Result<Step<usize>, ErrorKind> {
    let Some(end) = memmem::find(buf, b"\r\n") else {
        return match buf.len() > max_line {
            true => Err(ErrorKind::InvalidChunk),
            false => Ok(Step::NeedMore),
        };
    };

    let line = &buf[..end];
    let digits = match line.iter().position(|&b| b == b';') {
        Some(semicolon) => &line[..semicolon],
        None => line,
    };
    let digits = trim_ows(digits);

    if digits.is_empty() {
        return Err(ErrorKind::InvalidChunk);
    }

    let mut size: usize = 0;
    for &byte in digits {
        let nibble = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return Err(ErrorKind::InvalidChunk),
        };

        size = size
            .checked_mul(16)
            .and_then(|size| size.checked_add(nibble as usize))
            .ok_or(ErrorKind::InvalidChunk)?;
    }

    Ok(Step::Done {
        consumed: end + 2,
        value: size,
    })
}

/// Copies chunk payload into `body`.
///
/// Payload bytes are taken as soon as they are available, up to
/// `remaining`; the value is how many payload bytes were copied. Once the
/// payload is complete the step also requires and consumes the trailing
/// CRLF, so `consumed` may exceed the value by two.
pub fn chunk_data(
    buf: &[u8],
    remaining: usize,
    body: &mut Vec<u8>,
) -> Result<Step<usize>, ErrorKind> {
    if remaining > 0 {
        let take = remaining.min(buf.len());
        if take == 0 {
            return Ok(Step::NeedMore);
        }

        body.extend_from_slice(&buf[..take]);
        return Ok(Step::Done {
            consumed: take,
            value: take,
        });
    }

    match buf {
        [b'\r', b'\n', ..] => Ok(Step::Done {
            consumed: 2,
            value: 0,
        }),
        [] | [b'\r'] => Ok(Step::NeedMore),
        _ => Err(ErrorKind::InvalidChunk),
    }
}

/// Consumes one trailer line.
///
/// The value is `true` on the blank line that ends the chunked body.
/// Trailer fields are discarded.
pub fn trailer(buf: &[u8], max_line: usize) -> Result<Step<bool>, ErrorKind> {
    let Some(end) = memmem::find(buf, b"\r\n") else {
        return match buf.len() > max_line {
            true => Err(ErrorKind::InvalidChunk),
            false => Ok(Step::NeedMore),
        };
    };

    if end > 0 && !buf[..end].contains(&b':') {
        return Err(ErrorKind::InvalidChunk);
    }

    Ok(Step::Done {
        consumed: end + 2,
        value: end == 0,
    })
}
