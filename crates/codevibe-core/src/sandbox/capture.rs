//! Capped capture of the child's output streams.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK: usize = 8 * 1024;

/// Bytes read from one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedStream {
    /// At most the configured cap.
    pub bytes: Vec<u8>,
    /// Everything the process wrote, kept or not.
    pub total_bytes: u64,
    pub truncated: bool,
}

impl CapturedStream {
    /// Lossy UTF-8 view of the kept bytes.
    ///
    /// When the cap split a multibyte character, the partial tail is
    /// dropped rather than replaced, so the text never outgrows the cap.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.complete_prefix()).into_owned()
    }

    fn complete_prefix(&self) -> &[u8] {
        let bytes = &self.bytes;
        if !self.truncated {
            return bytes;
        }
        // A UTF-8 sequence is at most 4 bytes, so a cut sequence starts in
        // the last 3. Earlier invalid bytes are the program's own.
        let start = bytes.len().saturating_sub(3);
        for lead in (start..bytes.len()).rev() {
            if bytes[lead] & 0xc0 != 0x80 {
                return match std::str::from_utf8(&bytes[lead..]) {
                    Err(err) if err.error_len().is_none() => &bytes[..lead],
                    _ => bytes,
                };
            }
        }
        bytes
    }
}

/// Read `reader` to EOF, keeping the first `cap` bytes.
///
/// Reading continues past the cap so the writer never blocks on a full
/// pipe; the excess is counted and discarded.
pub async fn capture<R>(mut reader: R, cap: usize) -> CapturedStream
where
    R: AsyncRead + Unpin,
{
    let mut out = CapturedStream {
        bytes: Vec::with_capacity(cap.min(64 * 1024)),
        ..CapturedStream::default()
    };
    let mut buf = vec![0u8; CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(event = "sandbox.capture_error", error = %err);
                break;
            }
        };
        out.total_bytes += n as u64;
        let room = cap.saturating_sub(out.bytes.len());
        if room > 0 {
            out.bytes.extend_from_slice(&buf[..n.min(room)]);
        }
        if n > room {
            out.truncated = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_under_cap_is_kept_whole() {
        let out = capture(&b"hello\n"[..], 1024).await;
        assert_eq!(out.bytes, b"hello\n");
        assert_eq!(out.total_bytes, 6);
        assert!(!out.truncated);
        assert_eq!(out.text(), "hello\n");
    }

    #[tokio::test]
    async fn test_exact_cap_is_not_truncated() {
        let out = capture(&b"abcd"[..], 4).await;
        assert_eq!(out.bytes, b"abcd");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_over_cap_keeps_prefix_and_drains_rest() {
        let data = vec![b'x'; 100_000];
        let out = capture(&data[..], 1000).await;
        assert_eq!(out.bytes.len(), 1000);
        assert_eq!(out.total_bytes, 100_000);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_zero_cap_keeps_nothing() {
        let out = capture(&b"data"[..], 0).await;
        assert!(out.bytes.is_empty());
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_cut_multibyte_char_is_dropped() {
        let data = "\u{e9}".repeat(100_000);
        let out = capture(data.as_bytes(), 1001).await;
        assert!(out.truncated);
        assert_eq!(out.bytes.len(), 1001);
        let text = out.text();
        assert_eq!(text, "\u{e9}".repeat(500));
        assert!(text.len() <= 1001);

        let data = "a\u{1f600}".repeat(10);
        let out = capture(data.as_bytes(), 3).await;
        assert_eq!(out.text(), "a");
    }

    #[tokio::test]
    async fn test_untruncated_partial_tail_is_replaced() {
        let out = capture(&[0x61, 0xc3][..], 16).await;
        assert_eq!(out.text(), "a\u{fffd}");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let out = capture(&[0x66, 0x6f, 0xff, 0x6f][..], 16).await;
        assert_eq!(out.text(), "fo\u{fffd}o");
    }
}
