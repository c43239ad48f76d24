//! Line framing over async byte streams.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtoError;

/// Maximum length of one command line, terminator included.
pub const MAX_LINE_LEN: usize = 256;

/// Reads one `\n`-terminated ASCII line, without the terminator.
///
/// Returns `Ok(None)` on a clean EOF before any byte was read. A line cut
/// short by EOF is [`ProtoError::MissingTerminator`], never a partial command.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProtoError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(if buf.len() > MAX_LINE_LEN {
            ProtoError::LineTooLong { max: MAX_LINE_LEN }
        } else {
            ProtoError::MissingTerminator
        });
    }
    if buf.len() > MAX_LINE_LEN {
        return Err(ProtoError::LineTooLong { max: MAX_LINE_LEN });
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if !buf.is_ascii() {
        return Err(ProtoError::NotAscii);
    }
    // ASCII is valid UTF-8.
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Writes `line` followed by `\n` and flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    if line.len() + 1 > MAX_LINE_LEN {
        return Err(ProtoError::LineTooLong { max: MAX_LINE_LEN });
    }
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
