//! VCDIFF (RFC 3284) delta decoder for the xdelta3 subset emitted by the
//! Galaxy patch service.
//!
//! Supported: the default instruction code table, source-segment windows,
//! per-window adler32 verification. Secondary compressors, application
//! defined code tables, target-addressed segments and overlapping COPY
//! instructions are rejected with a structural error; the upstream encoder
//! never emits them.

pub mod code_table;
pub mod decoder;
pub mod error;

pub use error::{Error, Result};

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor};
use std::path::Path;
use tracing::debug;

/// Apply a delta file to `source`, producing `output`.
///
/// Returns the number of bytes written.
pub fn apply(source: &Path, patch: &Path, output: &Path) -> Result<u64> {
    debug!(
        "applying patch {} to {} -> {}",
        patch.display(),
        source.display(),
        output.display()
    );
    let mut source = BufReader::new(File::open(source)?);
    let mut patch = BufReader::new(File::open(patch)?);
    let mut output = BufWriter::new(File::create(output)?);
    let written = decoder::decode(&mut source, &mut patch, &mut output)?;
    use std::io::Write as _;
    output.flush()?;
    Ok(written)
}

/// Apply an in-memory delta to an in-memory source
pub fn apply_to_vec(source: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    let mut source = Cursor::new(source);
    let mut patch = Cursor::new(patch);
    let mut output = Vec::new();
    decoder::decode(&mut source, &mut patch, &mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::adler32;
    use pretty_assertions::assert_eq;

    /// Encode a base-128 big-endian integer
    fn varint(mut value: u64) -> Vec<u8> {
        let mut bytes = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            bytes.push((value & 0x7f) as u8 | 0x80);
            value >>= 7;
        }
        bytes.reverse();
        bytes
    }

    struct WindowSpec<'a> {
        source_segment: Option<(u64, u64)>,
        target_len: u64,
        data: &'a [u8],
        inst: &'a [u8],
        addr: &'a [u8],
        adler: Option<u32>,
    }

    fn build_patch(windows: &[WindowSpec]) -> Vec<u8> {
        let mut patch = vec![0xD6, 0xC3, 0xC4, 0x00, 0x00];
        for w in windows {
            let mut indicator = 0u8;
            if w.source_segment.is_some() {
                indicator |= 1;
            }
            if w.adler.is_some() {
                indicator |= 4;
            }
            patch.push(indicator);
            if let Some((len, pos)) = w.source_segment {
                patch.extend(varint(len));
                patch.extend(varint(pos));
            }
            // Delta encoding length (decoder derives everything from the
            // section lengths, a nominal value suffices)
            patch.extend(varint(
                (w.data.len() + w.inst.len() + w.addr.len()) as u64 + 8,
            ));
            patch.extend(varint(w.target_len));
            patch.push(0); // delta indicator
            patch.extend(varint(w.data.len() as u64));
            patch.extend(varint(w.inst.len() as u64));
            patch.extend(varint(w.addr.len() as u64));
            if let Some(sum) = w.adler {
                patch.extend(sum.to_be_bytes());
            }
            patch.extend_from_slice(w.data);
            patch.extend_from_slice(w.inst);
            patch.extend_from_slice(w.addr);
        }
        patch
    }

    #[test]
    fn test_add_instruction() {
        // ADD with embedded size 11 is table entry 12
        let patch = build_patch(&[WindowSpec {
            source_segment: None,
            target_len: 11,
            data: b"hello world",
            inst: &[12],
            addr: &[],
            adler: Some(adler32(b"hello world")),
        }]);
        let output = apply_to_vec(b"", &patch).unwrap();
        assert_eq!(output, b"hello world");
    }

    #[test]
    fn test_run_instruction() {
        // RUN is entry 0; its size follows in the instruction section
        let mut inst = vec![0u8];
        inst.extend(varint(5));
        let patch = build_patch(&[WindowSpec {
            source_segment: None,
            target_len: 5,
            data: &[0x41],
            inst: &inst,
            addr: &[],
            adler: Some(adler32(b"AAAAA")),
        }]);
        let output = apply_to_vec(b"", &patch).unwrap();
        assert_eq!(output, b"AAAAA");
    }

    #[test]
    fn test_copy_from_source() {
        // COPY mode 0 with embedded size 4 is table entry 20
        let patch = build_patch(&[WindowSpec {
            source_segment: Some((6, 0)),
            target_len: 4,
            data: &[],
            inst: &[20],
            addr: &varint(1),
            adler: Some(adler32(b"bcde")),
        }]);
        let output = apply_to_vec(b"abcdef", &patch).unwrap();
        assert_eq!(output, b"bcde");
    }

    #[test]
    fn test_copy_then_add_window() {
        // COPY mode 0 size 4 from offset 0 (entry 20), then ADD size 3
        // (entry 4)
        let patch = build_patch(&[WindowSpec {
            source_segment: Some((4, 2)),
            target_len: 7,
            data: b"xyz",
            inst: &[20, 4],
            addr: &varint(0),
            adler: Some(adler32(b"cdefxyz")),
        }]);
        let output = apply_to_vec(b"abcdefgh", &patch).unwrap();
        assert_eq!(output, b"cdefxyz");
    }

    #[test]
    fn test_multiple_windows_concatenate() {
        let w1 = WindowSpec {
            source_segment: None,
            target_len: 3,
            data: b"foo",
            inst: &[4],
            addr: &[],
            adler: None,
        };
        let w2 = WindowSpec {
            source_segment: None,
            target_len: 3,
            data: b"bar",
            inst: &[4],
            addr: &[],
            adler: None,
        };
        let patch = build_patch(&[w1, w2]);
        let output = apply_to_vec(b"", &patch).unwrap();
        assert_eq!(output, b"foobar");
    }

    #[test]
    fn test_overlapping_copy_rejected() {
        let patch = build_patch(&[WindowSpec {
            source_segment: Some((2, 0)),
            target_len: 4,
            data: &[],
            inst: &[20],
            addr: &varint(2),
            adler: None,
        }]);
        let err = apply_to_vec(b"ab", &patch).unwrap_err();
        assert!(matches!(err, Error::OverlappingCopy { address: 2, .. }));
    }

    #[test]
    fn test_adler_mismatch_rejected() {
        let patch = build_patch(&[WindowSpec {
            source_segment: None,
            target_len: 3,
            data: b"foo",
            inst: &[4],
            addr: &[],
            adler: Some(0xDEAD_BEEF),
        }]);
        let err = apply_to_vec(b"", &patch).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { window: 0, .. }));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let err = apply_to_vec(b"", &[0x50, 0x4B, 0x03, 0x04, 0x00]).unwrap_err();
        assert!(matches!(err, Error::BadMagic { .. }));
    }

    #[test]
    fn test_custom_code_table_rejected() {
        let err = apply_to_vec(b"", &[0xD6, 0xC3, 0xC4, 0x00, 0x02]).unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                feature: "application-defined code table"
            }
        ));
    }

    #[test]
    fn test_secondary_compressor_rejected() {
        let err = apply_to_vec(b"", &[0xD6, 0xC3, 0xC4, 0x00, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                feature: "secondary compressor"
            }
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("old.bin");
        let patch_path = dir.path().join("delta.xdelta");
        let output_path = dir.path().join("new.bin");

        std::fs::write(&source_path, b"abcdef").unwrap();
        let patch = build_patch(&[WindowSpec {
            source_segment: Some((6, 0)),
            target_len: 4,
            data: &[],
            inst: &[20],
            addr: &varint(1),
            adler: Some(adler32(b"bcde")),
        }]);
        std::fs::write(&patch_path, patch).unwrap();

        let written = apply(&source_path, &patch_path, &output_path).unwrap();
        assert_eq!(written, 4);
        assert_eq!(std::fs::read(&output_path).unwrap(), b"bcde");
    }
}
