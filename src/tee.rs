//! Byte-stream tee with a gzip-compressed log sink.
//!
//! Exporter runs capture their output into the staging directory while
//! still streaming it onward. The log side is gzip-compressed on the fly;
//! process logs compress an order of magnitude and nobody reads most of
//! them.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use flate2::write::GzEncoder;

use crate::error::Result;

pub struct TeeWriter<W: Write> {
    primary: W,
    log: GzEncoder<File>,
}

impl<W: Write> TeeWriter<W> {
    /// Tee `primary` into a gzip log at `log_path`.
    pub fn new(primary: W, log_path: &Path) -> Result<TeeWriter<W>> {
        let file = File::create(log_path)?;
        Ok(TeeWriter {
            primary,
            log: GzEncoder::new(file, flate2::Compression::default()),
        })
    }

    /// Close the log side, returning the primary sink.
    pub fn finish(self) -> Result<W> {
        self.log.finish()?;
        Ok(self.primary)
    }
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // keep the two sides byte-identical: whatever the primary accepted
        // is what the log records
        let n = self.primary.write(buf)?;
        self.log.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.log.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn both_sides_receive_the_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.log.gz");

        let mut primary = Vec::new();
        {
            let mut tee = TeeWriter::new(&mut primary, &log_path).unwrap();
            tee.write_all(b"first line\n").unwrap();
            tee.write_all(b"second line\n").unwrap();
            tee.finish().unwrap();
        }

        assert_eq!(primary, b"first line\nsecond line\n");

        let mut decoded = String::new();
        GzDecoder::new(File::open(&log_path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "first line\nsecond line\n");
    }
}
