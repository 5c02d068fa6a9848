//! Parser for the fixed-field privileged listing.
//!
//! Every object is one record of three NUL-terminated chunks, as produced by `find -printf`
//! with [`LISTING_FORMAT`]:
//!
//! 1. a head of tab-separated metadata: `type  mode  owner  group  size  mtime`
//! 2. the path
//! 3. the link target (empty unless the object is a symlink)
//!
//! Names may hold any byte but NUL, so tabs and newlines in paths stay part of the path and
//! can never start a new record.

use tracing::warn;

use crate::common::{FileMetadata, FileType, PERMISSION_MASK};

/// `find -printf` format producing one listing record per object.
pub const LISTING_FORMAT: &str = "%y\\t%m\\t%u\\t%g\\t%s\\t%T@\\0%P\\0%l\\0";

const HEAD_FIELDS: usize = 6;
const RECORD_CHUNKS: usize = 3;

/// Parse one record. Extra trailing head fields are ignored and a missing link target is
/// tolerated; anything else that does not fit yields `None`.
pub fn parse_listing_record(head: &str, path: &[u8], link_target: Option<&[u8]>) -> Option<FileMetadata> {
    let fields: Vec<&str> = head.split('\t').collect();
    if fields.len() < HEAD_FIELDS {
        return None;
    }

    let mut type_chars = fields[0].chars();
    let file_type = FileType::from_type_char(type_chars.next()?)?;
    if type_chars.next().is_some() {
        return None;
    }
    let mode = u32::from_str_radix(fields[1], 8).ok()? & PERMISSION_MASK;
    let size = fields[4].parse::<u64>().ok()?;
    // `%T@` carries a fractional part; second resolution is all we keep.
    let mod_time = fields[5].split('.').next()?.parse::<i64>().ok()?;
    if path.is_empty() {
        return None;
    }
    let link_target = match (file_type, link_target) {
        (FileType::Symlink, Some(t)) if !t.is_empty() => Some(String::from_utf8_lossy(t).into_owned()),
        _ => None,
    };

    Some(FileMetadata {
        path: String::from_utf8_lossy(path).into_owned(),
        file_type,
        mode,
        owner: fields[2].to_owned(),
        group: fields[3].to_owned(),
        size: if file_type == FileType::RegularFile { size } else { 0 },
        mod_time,
        link_target,
    })
}

/// Parse a whole listing from raw command output, skipping (and logging) records that do not
/// parse. A record cut short at the end of the output keeps its head and path if present.
pub fn parse_listing(output: &[u8]) -> Vec<FileMetadata> {
    let body = output.strip_suffix(b"\0").unwrap_or(output);
    if body.is_empty() {
        return Vec::new();
    }
    let chunks: Vec<&[u8]> = body.split(|b| *b == 0).collect();

    let mut entries = Vec::with_capacity(chunks.len() / RECORD_CHUNKS);
    for record in chunks.chunks(RECORD_CHUNKS) {
        let head = String::from_utf8_lossy(record[0]);
        let parsed = match record.get(1) {
            Some(path) => parse_listing_record(&head, path, record.get(2).copied()),
            None => None,
        };
        match parsed {
            Some(meta) => entries.push(meta),
            None => warn!(head = %head, "skipping malformed listing record"),
        }
    }
    entries
}
