use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Gzip raw HTML for the storage column.
pub fn compress_html(raw: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    encoder.finish()
}

pub fn decompress_html(compressed: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let raw = b"<html><body>hello</body></html>".repeat(100);
        let compressed = compress_html(&raw).unwrap();
        assert!(compressed.len() < raw.len());
        assert_eq!(decompress_html(&compressed).unwrap(), raw);
    }
}
