//! Chunked reader for Linux native installers
//!
//! Products without Linux depots ship a zip64 archive concatenated after a
//! self-extracting shell header. The reader probes for the first local-file
//! header to locate the archive's byte origin, reads the end-of-central
//! directory (following the zip64 locator when its fields are saturated) and
//! then fetches the central directory with HTTP Range requests. Entries are
//! converted into the engine's file model; the downloader later fetches each
//! entry's byte span and the writer inflates deflate-stored entries.

use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use galaxy_cdn::CdnClient;
use galaxy_manifest::{DepotLink, LinuxFile};
use std::io::Cursor;
use tracing::{debug, warn};

const LOCAL_FILE_HEADER: &[u8; 4] = b"PK\x03\x04";
const CENTRAL_DIRECTORY: &[u8; 4] = b"PK\x01\x02";
const END_OF_CENTRAL_DIRECTORY: &[u8; 4] = b"PK\x05\x06";
const ZIP64_END_OF_CD_LOCATOR: &[u8; 4] = b"PK\x06\x07";

/// Window probed for the first local-file header after the script stub
const PROBE_OFFSET: u64 = 512 * 1024;
const PROBE_SIZE: u64 = 512 * 1024;

/// Unix file-type bits live in the high half of the external attributes
const S_IFLNK: u32 = 0o120_000;

/// A remote installer archive reduced to the engine's file model
#[derive(Debug)]
pub struct InstallerArchive {
    pub product_id: String,
    pub url: String,
    pub file_size: u64,
    /// Byte offset of the archive proper within the installer blob
    pub archive_start: u64,
    pub files: Vec<LinuxFile>,
    pub links: Vec<DepotLink>,
}

impl InstallerArchive {
    /// Probe and index a remote installer
    pub async fn open(client: &CdnClient, product_id: &str, url: &str) -> Result<Self> {
        // Locate the archive origin behind the self-extracting header.
        let (probe, total) = fetch_range(client, url, PROBE_OFFSET, PROBE_SIZE).await?;
        let file_size = total.ok_or_else(|| {
            Error::structural("installer endpoint did not report a Content-Range size")
        })?;
        let archive_start = find(&probe, LOCAL_FILE_HEADER)
            .map(|idx| PROBE_OFFSET + idx as u64)
            .ok_or_else(|| Error::structural("no local file header near the probe window"))?;

        // End of central directory lives in the last bytes of the blob.
        let tail_start = file_size.saturating_sub(100);
        let (tail, _) = fetch_range(client, url, tail_start, file_size - tail_start).await?;
        let eocd_at = find(&tail, END_OF_CENTRAL_DIRECTORY)
            .ok_or_else(|| Error::structural("end of central directory not found"))?;
        let eocd = EndOfCentralDir::parse(&tail[eocd_at..])?;

        let (cd_offset, cd_size, cd_records) = if eocd.central_directory_offset == 0xFFFF_FFFF {
            let locator_at = find(&tail, ZIP64_END_OF_CD_LOCATOR)
                .ok_or_else(|| Error::structural("zip64 locator missing for saturated EOCD"))?;
            let locator = Zip64Locator::parse(&tail[locator_at..])?;
            let (z64, _) =
                fetch_range(client, url, archive_start + locator.eocd_offset, 200).await?;
            let z64 = Zip64EndOfCentralDir::parse(&z64)?;
            (z64.central_directory_offset, z64.size_of_central_directory, z64.total_entries)
        } else {
            (
                u64::from(eocd.central_directory_offset),
                u64::from(eocd.size_of_central_directory),
                u64::from(eocd.records),
            )
        };

        let (cd_data, _) = fetch_range(client, url, archive_start + cd_offset, cd_size).await?;
        let entries = parse_central_directory(&cd_data, cd_records)?;
        debug!(
            "installer for {}: {} central directory entries, archive at +{}",
            product_id,
            entries.len(),
            archive_start
        );

        let mut archive = Self {
            product_id: product_id.to_string(),
            url: url.to_string(),
            file_size,
            archive_start,
            files: Vec::new(),
            links: Vec::new(),
        };
        archive.convert_entries(client, entries).await?;
        Ok(archive)
    }

    /// Turn central-directory entries into engine files and symlinks.
    ///
    /// Only the game payload under `data/noarch` is materialised; directory
    /// entries become implicit through their children.
    async fn convert_entries(
        &mut self,
        client: &CdnClient,
        entries: Vec<CentralDirectoryEntry>,
    ) -> Result<()> {
        for entry in entries {
            if !entry.file_name.starts_with("data/noarch") || entry.file_name.ends_with('/') {
                continue;
            }
            let path = entry
                .file_name
                .strip_prefix("data/noarch/")
                .unwrap_or(&entry.file_name)
                .to_string();
            if path.is_empty() {
                continue;
            }

            let mode = entry.external_attrs >> 16;
            if mode & S_IFLNK == S_IFLNK {
                // The entry data is the link target itself.
                let target = self.read_link_target(client, &entry).await?;
                self.links.push(DepotLink { path, target });
                continue;
            }

            if entry.compression_method != 0 && entry.compression_method != 8 {
                warn!(
                    "skipping {} with unsupported compression method {}",
                    entry.file_name, entry.compression_method
                );
                continue;
            }

            self.files.push(LinuxFile {
                product_id: self.product_id.clone(),
                path,
                compressed: entry.compression_method == 8,
                offset: self.archive_start + entry.local_header_offset,
                compressed_size: entry.compressed_size,
                size: entry.uncompressed_size,
                crc32: entry.crc32,
                executable: mode & 0o111 != 0,
            });
        }
        Ok(())
    }

    async fn read_link_target(
        &self,
        client: &CdnClient,
        entry: &CentralDirectoryEntry,
    ) -> Result<String> {
        // Resolve the local header to find the entry data, then read it.
        let header_at = self.archive_start + entry.local_header_offset;
        let (header, _) = fetch_range(client, &self.url, header_at, 30).await?;
        let data_offset = header_at + local_header_size(&header)?;
        let (data, _) = fetch_range(client, &self.url, data_offset, entry.compressed_size).await?;
        let bytes = if entry.compression_method == 8 {
            use std::io::Read;
            let mut inflated = Vec::new();
            flate2::read::DeflateDecoder::new(data.as_slice()).read_to_end(&mut inflated)?;
            inflated
        } else {
            data
        };
        String::from_utf8(bytes)
            .map_err(|_| Error::structural("symlink target is not valid UTF-8"))
    }
}

/// Fetch a byte range, returning the body and the blob's total size when the
/// server reports a Content-Range
async fn fetch_range(
    client: &CdnClient,
    url: &str,
    offset: u64,
    size: u64,
) -> Result<(Vec<u8>, Option<u64>)> {
    let response = client.get_range(url, offset, size).await?;
    let total = response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|v| v.parse::<u64>().ok());
    Ok((response.bytes().await.map_err(galaxy_cdn::Error::from)?.to_vec(), total))
}

fn find(haystack: &[u8], needle: &[u8; 4]) -> Option<usize> {
    haystack.windows(4).position(|window| window == needle)
}

/// Bytes occupied by a local file header (fixed part + name + extra)
pub(crate) fn local_header_size(header: &[u8]) -> Result<u64> {
    if header.len() < 30 || &header[0..4] != LOCAL_FILE_HEADER {
        return Err(Error::structural("bad local file header"));
    }
    let mut cursor = Cursor::new(&header[26..30]);
    let name_len = cursor.read_u16::<LittleEndian>()?;
    let extra_len = cursor.read_u16::<LittleEndian>()?;
    Ok(30 + u64::from(name_len) + u64::from(extra_len))
}

#[derive(Debug)]
pub(crate) struct CentralDirectoryEntry {
    pub file_name: String,
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub external_attrs: u32,
    pub local_header_offset: u64,
}

/// Parse `records` central-directory entries from a contiguous buffer
pub(crate) fn parse_central_directory(
    data: &[u8],
    records: u64,
) -> Result<Vec<CentralDirectoryEntry>> {
    let mut entries = Vec::new();
    let mut at = 0usize;
    for _ in 0..records {
        if at + 46 > data.len() || &data[at..at + 4] != CENTRAL_DIRECTORY {
            return Err(Error::structural("truncated central directory"));
        }
        let mut cursor = Cursor::new(&data[at + 10..at + 46]);
        let compression_method = cursor.read_u16::<LittleEndian>()?;
        let _mod_time = cursor.read_u16::<LittleEndian>()?;
        let _mod_date = cursor.read_u16::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let mut compressed_size = u64::from(cursor.read_u32::<LittleEndian>()?);
        let mut uncompressed_size = u64::from(cursor.read_u32::<LittleEndian>()?);
        let name_len = cursor.read_u16::<LittleEndian>()? as usize;
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
        let comment_len = cursor.read_u16::<LittleEndian>()? as usize;
        let _disk_start = cursor.read_u16::<LittleEndian>()?;
        let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
        let external_attrs = cursor.read_u32::<LittleEndian>()?;
        let mut local_header_offset = u64::from(cursor.read_u32::<LittleEndian>()?);

        let name_start = at + 46;
        let name_end = name_start + name_len;
        if name_end > data.len() {
            return Err(Error::structural("truncated central directory name"));
        }
        let file_name = String::from_utf8_lossy(&data[name_start..name_end]).into_owned();

        // Saturated 32-bit fields defer to the zip64 extra field.
        let extra = &data[name_end..(name_end + extra_len).min(data.len())];
        if compressed_size == 0xFFFF_FFFF
            || uncompressed_size == 0xFFFF_FFFF
            || local_header_offset == 0xFFFF_FFFF
        {
            let mut extra_at = 0usize;
            while extra_at + 4 <= extra.len() {
                let mut field = Cursor::new(&extra[extra_at..extra_at + 4]);
                let id = field.read_u16::<LittleEndian>()?;
                let len = field.read_u16::<LittleEndian>()? as usize;
                let body = &extra[extra_at + 4..(extra_at + 4 + len).min(extra.len())];
                if id == 0x0001 {
                    let mut values = Cursor::new(body);
                    if uncompressed_size == 0xFFFF_FFFF {
                        uncompressed_size = values.read_u64::<LittleEndian>()?;
                    }
                    if compressed_size == 0xFFFF_FFFF {
                        compressed_size = values.read_u64::<LittleEndian>()?;
                    }
                    if local_header_offset == 0xFFFF_FFFF {
                        local_header_offset = values.read_u64::<LittleEndian>()?;
                    }
                }
                extra_at += 4 + len;
            }
        }

        entries.push(CentralDirectoryEntry {
            file_name,
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
            external_attrs,
            local_header_offset,
        });
        at = name_end + extra_len + comment_len;
    }
    Ok(entries)
}

#[derive(Debug)]
struct EndOfCentralDir {
    records: u16,
    size_of_central_directory: u32,
    central_directory_offset: u32,
}

impl EndOfCentralDir {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 22 {
            return Err(Error::structural("truncated end of central directory"));
        }
        let mut cursor = Cursor::new(&data[8..20]);
        let records = cursor.read_u16::<LittleEndian>()?;
        let _records_total = cursor.read_u16::<LittleEndian>()?;
        let size_of_central_directory = cursor.read_u32::<LittleEndian>()?;
        let central_directory_offset = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            records,
            size_of_central_directory,
            central_directory_offset,
        })
    }
}

#[derive(Debug)]
struct Zip64Locator {
    eocd_offset: u64,
}

impl Zip64Locator {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(Error::structural("truncated zip64 locator"));
        }
        let mut cursor = Cursor::new(&data[8..16]);
        Ok(Self {
            eocd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug)]
struct Zip64EndOfCentralDir {
    total_entries: u64,
    size_of_central_directory: u64,
    central_directory_offset: u64,
}

impl Zip64EndOfCentralDir {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 56 {
            return Err(Error::structural("truncated zip64 end of central directory"));
        }
        let mut cursor = Cursor::new(&data[32..56]);
        let total_entries = cursor.read_u64::<LittleEndian>()?;
        let size_of_central_directory = cursor.read_u64::<LittleEndian>()?;
        let central_directory_offset = cursor.read_u64::<LittleEndian>()?;
        Ok(Self {
            total_entries,
            size_of_central_directory,
            central_directory_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cd_entry(name: &str, method: u16, sizes: (u32, u32), attrs: u32, offset: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(CENTRAL_DIRECTORY);
        bytes.extend_from_slice(&[20, 3]); // version made by (unix)
        bytes.extend_from_slice(&[20, 0]); // version needed
        bytes.extend_from_slice(&[0, 0]); // flags
        bytes.extend_from_slice(&method.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]); // mod time/date
        bytes.extend_from_slice(&0xAABBCCDDu32.to_le_bytes()); // crc
        bytes.extend_from_slice(&sizes.0.to_le_bytes());
        bytes.extend_from_slice(&sizes.1.to_le_bytes());
        bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&[0, 0]); // extra len
        bytes.extend_from_slice(&[0, 0]); // comment len
        bytes.extend_from_slice(&[0, 0]); // disk start
        bytes.extend_from_slice(&[0, 0]); // internal attrs
        bytes.extend_from_slice(&attrs.to_le_bytes());
        bytes.extend_from_slice(&offset.to_le_bytes());
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    #[test]
    fn test_parse_central_directory() {
        let mut data = cd_entry("data/noarch/game/bin", 8, (100, 400), 0o100755 << 16, 1234);
        data.extend(cd_entry("data/noarch/docs/", 0, (0, 0), 0o040755 << 16, 2000));

        let entries = parse_central_directory(&data, 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file_name, "data/noarch/game/bin");
        assert_eq!(entries[0].compression_method, 8);
        assert_eq!(entries[0].compressed_size, 100);
        assert_eq!(entries[0].uncompressed_size, 400);
        assert_eq!(entries[0].crc32, 0xAABBCCDD);
        assert_eq!(entries[0].local_header_offset, 1234);
    }

    #[test]
    fn test_truncated_directory_rejected() {
        let data = cd_entry("data/noarch/file", 0, (1, 1), 0, 0);
        assert!(parse_central_directory(&data[..20], 1).is_err());
    }

    #[test]
    fn test_local_header_size() {
        let mut header = Vec::new();
        header.extend_from_slice(LOCAL_FILE_HEADER);
        header.extend_from_slice(&[0u8; 22]);
        header.extend_from_slice(&7u16.to_le_bytes()); // name length
        header.extend_from_slice(&4u16.to_le_bytes()); // extra length
        assert_eq!(local_header_size(&header).unwrap(), 30 + 7 + 4);
    }

    #[test]
    fn test_eocd_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(END_OF_CENTRAL_DIRECTORY);
        data.extend_from_slice(&[0, 0, 0, 0]); // disk numbers
        data.extend_from_slice(&3u16.to_le_bytes()); // records this disk
        data.extend_from_slice(&3u16.to_le_bytes()); // records total
        data.extend_from_slice(&146u32.to_le_bytes()); // cd size
        data.extend_from_slice(&4096u32.to_le_bytes()); // cd offset
        data.extend_from_slice(&[0, 0]); // comment len

        let eocd = EndOfCentralDir::parse(&data).unwrap();
        assert_eq!(eocd.records, 3);
        assert_eq!(eocd.size_of_central_directory, 146);
        assert_eq!(eocd.central_directory_offset, 4096);
    }
}
