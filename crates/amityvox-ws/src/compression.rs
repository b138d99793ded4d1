//! `zlib-stream` transport compression for the gateway socket: a single
//! continuous deflate stream spanning every `DISPATCH` payload sent on a
//! connection (as opposed to per-message compression), so each frame after
//! the first benefits from the dictionary built by prior frames. Mirrors the
//! `compress=zlib-stream` gateway transport option clients opt into at
//! connect time.

use std::sync::Mutex;

use flate2::{Compress, Compression, FlushCompress, Status};

/// Per-connection compressor. `None` when the session didn't request
/// `zlib-stream`, in which case `compress` always returns `None` and the
/// caller sends the frame as plain text.
pub struct WsCompressor {
    inner: Option<Mutex<Compress>>,
}

impl WsCompressor {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: enabled.then(|| Mutex::new(Compress::new(Compression::default(), true))),
        }
    }

    /// Compresses `payload` against the connection's running deflate stream
    /// with a `Flush::Sync` boundary, so the decoder can decompress each
    /// message as soon as it arrives without waiting for the stream to
    /// close. Returns `None` if this connection didn't negotiate
    /// compression.
    pub fn compress(&self, payload: &str) -> Option<Result<Vec<u8>, CompressionError>> {
        let lock = self.inner.as_ref()?;
        let mut compress = lock.lock().unwrap();
        let mut out = Vec::with_capacity(payload.len());
        let result = compress.compress_vec(
            payload.as_bytes(),
            &mut out,
            FlushCompress::Sync,
        );
        Some(match result {
            Ok(Status::Ok) | Ok(Status::StreamEnd) | Ok(Status::BufError) => Ok(out),
            Err(e) => Err(CompressionError(e.to_string())),
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("zlib-stream compression failed: {0}")]
pub struct CompressionError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    fn decompress_all(chunks: &[Vec<u8>]) -> String {
        let mut decompress = Decompress::new(true);
        let mut out = Vec::new();
        for chunk in chunks {
            let mut buf = vec![0u8; 4096];
            let before_out = decompress.total_out();
            decompress
                .decompress(chunk, &mut buf, FlushDecompress::Sync)
                .unwrap();
            let produced = (decompress.total_out() - before_out) as usize;
            out.extend_from_slice(&buf[..produced]);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn disabled_compressor_returns_none() {
        let compressor = WsCompressor::new(false);
        assert!(compressor.compress("hello").is_none());
    }

    #[test]
    fn stream_round_trips_across_multiple_messages() {
        let compressor = WsCompressor::new(true);
        let first = compressor.compress("{\"op\":10}").unwrap().unwrap();
        let second = compressor.compress("{\"op\":11}").unwrap().unwrap();
        assert_eq!(decompress_all(&[first, second]), "{\"op\":10}{\"op\":11}");
    }
}
