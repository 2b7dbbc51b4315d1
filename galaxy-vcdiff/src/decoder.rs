//! Window-by-window VCDIFF decoding

use crate::code_table::{AddressCache, CODE_TABLE, Kind, NEAR_MODES};
use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use tracing::{debug, trace};

/// Window indicator bit: a source segment is used
const VCD_SOURCE: u8 = 1 << 0;
/// Window indicator bit: a target segment is used (not emitted by xdelta3)
const VCD_TARGET: u8 = 1 << 1;
/// Window indicator bit: an adler32 of the window follows the lengths
const VCD_ADLER32: u8 = 1 << 2;

/// Read a base-128 big-endian integer (continuation bit in the high position)
pub(crate) fn read_varint<R: Read>(reader: &mut R, section: &'static str) -> Result<u64> {
    let mut result: u64 = 0;
    for _ in 0..10 {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        result = (result << 7) | u64::from(byte[0] & 0x7f);
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(Error::VarintOverflow { section })
}

/// Rolling adler32 as used by zlib (mod 65521)
pub(crate) fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    // Largest n such that 255*n*(n+1)/2 + (n+1)*(MOD-1) fits in u32
    const NMAX: usize = 5552;

    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Decode every window of `patch` against `source`, writing to `output`.
///
/// Returns the number of target bytes written.
pub fn decode<S, P, O>(source: &mut S, patch: &mut P, output: &mut O) -> Result<u64>
where
    S: Read + Seek,
    P: Read,
    O: Write,
{
    read_header(patch)?;

    let mut window_index = 0usize;
    let mut total_written = 0u64;

    loop {
        let mut indicator = [0u8; 1];
        match patch.read_exact(&mut indicator) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let window = decode_window(source, patch, indicator[0], window_index)?;
        output.write_all(&window)?;
        total_written += window.len() as u64;
        window_index += 1;
    }

    debug!("decoded {} windows, {} bytes", window_index, total_written);
    Ok(total_written)
}

/// Validate the stream header and skip the application header if present
fn read_header<P: Read>(patch: &mut P) -> Result<()> {
    let mut magic = [0u8; 4];
    patch.read_exact(&mut magic)?;
    if magic != [0xD6, 0xC3, 0xC4, 0x00] {
        return Err(Error::BadMagic { magic });
    }

    let mut indicator = [0u8; 1];
    patch.read_exact(&mut indicator)?;
    if indicator[0] & (1 << 0) != 0 {
        return Err(Error::Unsupported {
            feature: "secondary compressor",
        });
    }
    if indicator[0] & (1 << 1) != 0 {
        return Err(Error::Unsupported {
            feature: "application-defined code table",
        });
    }
    if indicator[0] & (1 << 2) != 0 {
        let size = read_varint(patch, "header")?;
        let mut skipped = vec![0u8; size as usize];
        patch.read_exact(&mut skipped)?;
        trace!("skipped {}-byte application header", size);
    }
    Ok(())
}

/// Decode one window into a freshly allocated buffer
fn decode_window<S, P>(
    source: &mut S,
    patch: &mut P,
    win_indicator: u8,
    window_index: usize,
) -> Result<Vec<u8>>
where
    S: Read + Seek,
    P: Read,
{
    if win_indicator & VCD_TARGET != 0 {
        return Err(Error::Unsupported {
            feature: "target-addressed source segment",
        });
    }

    let (segment_len, segment_pos) = if win_indicator & VCD_SOURCE != 0 {
        (
            read_varint(patch, "window")?,
            read_varint(patch, "window")?,
        )
    } else {
        (0, 0)
    };

    let _delta_encoding_len = read_varint(patch, "window")?;
    let target_len = read_varint(patch, "window")?;

    let mut delta_indicator = [0u8; 1];
    patch.read_exact(&mut delta_indicator)?;
    if delta_indicator[0] != 0 {
        return Err(Error::Unsupported {
            feature: "compressed delta sections",
        });
    }

    let data_len = read_varint(patch, "window")? as usize;
    let inst_len = read_varint(patch, "window")? as usize;
    let addr_len = read_varint(patch, "window")? as usize;

    let expected_adler = if win_indicator & VCD_ADLER32 != 0 {
        Some(patch.read_u32::<BigEndian>()?)
    } else {
        None
    };

    let mut data_sec = vec![0u8; data_len];
    patch.read_exact(&mut data_sec)?;
    let mut inst_sec = vec![0u8; inst_len];
    patch.read_exact(&mut inst_sec)?;
    let mut addr_sec = vec![0u8; addr_len];
    patch.read_exact(&mut addr_sec)?;

    trace!(
        "window {}: target {} bytes, source segment {}+{}",
        window_index, target_len, segment_pos, segment_len
    );

    let mut target = Vec::with_capacity(target_len as usize);
    let mut data = Cursor::new(data_sec);
    let mut inst = Cursor::new(inst_sec);
    let mut addr = Cursor::new(addr_sec);
    let mut cache = AddressCache::new();

    while inst.position() < inst.get_ref().len() as u64 {
        let mut opcode = [0u8; 1];
        inst.read_exact(&mut opcode)?;
        let entry = CODE_TABLE[opcode[0] as usize];

        for (kind, embedded_size) in [(entry.kind1, entry.size1), (entry.kind2, entry.size2)] {
            if kind == Kind::Noop {
                continue;
            }
            let size = if embedded_size != 0 {
                u64::from(embedded_size)
            } else {
                read_varint(&mut inst, "instruction")?
            };
            execute_half(
                kind,
                size,
                source,
                &mut data,
                &mut addr,
                &mut cache,
                &mut target,
                segment_len,
                segment_pos,
                window_index,
            )?;
        }
    }

    if target.len() as u64 != target_len {
        return Err(Error::corrupt(format!(
            "window {} produced {} bytes, header said {}",
            window_index,
            target.len(),
            target_len
        )));
    }

    if let Some(expected) = expected_adler {
        let actual = adler32(&target);
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                window: window_index,
                expected,
                actual,
            });
        }
    }

    Ok(target)
}

/// Decode the address and payload of one half-instruction and append its
/// output to the window buffer
#[allow(clippy::too_many_arguments)]
fn execute_half<S: Read + Seek>(
    kind: Kind,
    size: u64,
    source: &mut S,
    data: &mut Cursor<Vec<u8>>,
    addr: &mut Cursor<Vec<u8>>,
    cache: &mut AddressCache,
    target: &mut Vec<u8>,
    segment_len: u64,
    segment_pos: u64,
    window_index: usize,
) -> Result<()> {
    match kind {
        Kind::Noop => {}
        Kind::Add => {
            let start = target.len();
            target.resize(start + size as usize, 0);
            data.read_exact(&mut target[start..])?;
        }
        Kind::Run => {
            let mut byte = [0u8; 1];
            data.read_exact(&mut byte)?;
            target.resize(target.len() + size as usize, byte[0]);
        }
        Kind::Copy(mode) => {
            // Addresses live in the combined source-then-target space; "here"
            // is the current write position within that space.
            let here = segment_len + target.len() as u64;
            let same_start = 2 + NEAR_MODES;
            let address = if mode < same_start {
                let value = read_varint(addr, "address")?;
                match mode {
                    0 => value,
                    1 => here
                        .checked_sub(value)
                        .ok_or_else(|| Error::corrupt("HERE address before window start"))?,
                    near => value + cache.near((near - 2) as usize),
                }
            } else {
                let mut low = [0u8; 1];
                addr.read_exact(&mut low)?;
                cache.same(((mode - same_start) as usize) * 256 + low[0] as usize)
            };
            cache.update(address);

            if address >= segment_len {
                return Err(Error::OverlappingCopy {
                    window: window_index,
                    address,
                    segment_len,
                });
            }

            source.seek(SeekFrom::Start(segment_pos + address))?;
            let start = target.len();
            target.resize(start + size as usize, 0);
            source.read_exact(&mut target[start..])?;
        }
    }
    Ok(())
}
