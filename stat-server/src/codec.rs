//! Fixed-size binary encoding of [`UsageDatagram`].
//!
//! All integers are big-endian. Text fields are UTF-8, padded with NUL bytes up
//! to their fixed width; a value that fills its field completely carries no
//! terminator. The trailing checksum is the XXH3-64 hash of every byte that
//! precedes it.
//!
//! ```text
//! offset  width  field
//!      0     32  site
//!     32     64  module name
//!     96     32  module version
//!    128     64  module arch
//!    192     32  module mode
//!    224     32  user
//!    256     64  hostname
//!    320      4  requested cpus      (u32)
//!    324      4  host cpus           (u32)
//!    328      4  requested gpus      (u32)
//!    332      4  host gpus           (u32)
//!    336      4  nodes               (u32)
//!    340      4  flags               (u32)
//!    344      8  timestamp, seconds  (i64)
//!    352      8  checksum            (u64)
//! ```

use crate::datagram::{ModuleCoordinate, UsageDatagram};
use bytes::{Buf, BufMut};
use chrono::DateTime;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Size of everything covered by the checksum.
pub const PAYLOAD_SIZE: usize = TEXT_SIZE + 6 * 4 + 8;

/// Exact size of a valid datagram.
pub const WIRE_SIZE: usize = PAYLOAD_SIZE + 8;

const TEXT_SIZE: usize = 32 + 64 + 32 + 64 + 32 + 32 + 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextField {
    Site,
    ModuleName,
    ModuleVersion,
    ModuleArch,
    ModuleMode,
    User,
    HostName,
}

impl TextField {
    /// Wire order of the text fields.
    pub const ALL: [TextField; 7] = [
        TextField::Site,
        TextField::ModuleName,
        TextField::ModuleVersion,
        TextField::ModuleArch,
        TextField::ModuleMode,
        TextField::User,
        TextField::HostName,
    ];

    pub const fn width(self) -> usize {
        match self {
            TextField::Site => 32,
            TextField::ModuleName => 64,
            TextField::ModuleVersion => 32,
            TextField::ModuleArch => 64,
            TextField::ModuleMode => 32,
            TextField::User => 32,
            TextField::HostName => 64,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            TextField::Site => "site",
            TextField::ModuleName => "module name",
            TextField::ModuleVersion => "module version",
            TextField::ModuleArch => "module arch",
            TextField::ModuleMode => "module mode",
            TextField::User => "user",
            TextField::HostName => "hostname",
        }
    }
}

impl fmt::Display for TextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("datagram has {actual} bytes, expected {expected}")]
    WrongSize { expected: usize, actual: usize },

    #[error("checksum mismatch: datagram carries {carried:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { carried: u64, computed: u64 },

    #[error("{0} is not valid UTF-8")]
    InvalidText(TextField),

    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EncodeError {
    #[error("{field} is {len} bytes long, at most {max} fit")]
    FieldTooLong {
        field: TextField,
        len: usize,
        max: usize,
    },

    #[error("{0} contains a NUL byte")]
    EmbeddedNul(TextField),
}

/// Validates and decodes one received datagram.
pub fn decode(bytes: &[u8]) -> Result<UsageDatagram, DecodeError> {
    if bytes.len() != WIRE_SIZE {
        return Err(DecodeError::WrongSize {
            expected: WIRE_SIZE,
            actual: bytes.len(),
        });
    }

    let (mut payload, mut trailer) = bytes.split_at(PAYLOAD_SIZE);
    let carried = trailer.get_u64();
    let computed = xxh3_64(payload);
    if carried != computed {
        return Err(DecodeError::ChecksumMismatch { carried, computed });
    }

    let site = get_text(&mut payload, TextField::Site)?;
    let name = get_text(&mut payload, TextField::ModuleName)?;
    let version = get_text(&mut payload, TextField::ModuleVersion)?;
    let arch = get_text(&mut payload, TextField::ModuleArch)?;
    let mode = get_text(&mut payload, TextField::ModuleMode)?;
    let user = get_text(&mut payload, TextField::User)?;
    let hostname = get_text(&mut payload, TextField::HostName)?;

    let ncpus = payload.get_u32();
    let host_cpus = payload.get_u32();
    let ngpus = payload.get_u32();
    let host_gpus = payload.get_u32();
    let nodes = payload.get_u32();
    let flags = payload.get_u32();

    let seconds = payload.get_i64();
    let timestamp =
        DateTime::from_timestamp(seconds, 0).ok_or(DecodeError::InvalidTimestamp(seconds))?;

    Ok(UsageDatagram {
        site,
        module: ModuleCoordinate {
            name,
            version,
            arch,
            mode,
        },
        user,
        hostname,
        ncpus,
        host_cpus,
        ngpus,
        host_gpus,
        nodes,
        flags,
        timestamp,
    })
}

/// Encodes a datagram and seals it with its checksum.
pub fn encode(datagram: &UsageDatagram) -> Result<[u8; WIRE_SIZE], EncodeError> {
    let mut out = [0u8; WIRE_SIZE];

    let mut buf = &mut out[..PAYLOAD_SIZE];
    for (field, value) in TextField::ALL.into_iter().zip(datagram.dimensions()) {
        put_text(&mut buf, field, value)?;
    }
    buf.put_u32(datagram.ncpus);
    buf.put_u32(datagram.host_cpus);
    buf.put_u32(datagram.ngpus);
    buf.put_u32(datagram.host_gpus);
    buf.put_u32(datagram.nodes);
    buf.put_u32(datagram.flags);
    buf.put_i64(datagram.timestamp.timestamp());

    seal(&mut out);
    Ok(out)
}

/// Recomputes the checksum over the payload and stores it in the trailer.
pub(crate) fn seal(out: &mut [u8; WIRE_SIZE]) {
    let checksum = xxh3_64(&out[..PAYLOAD_SIZE]);
    (&mut out[PAYLOAD_SIZE..]).put_u64(checksum);
}

fn get_text(buf: &mut &[u8], field: TextField) -> Result<String, DecodeError> {
    let width = field.width();
    let raw = &buf[..width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let text = std::str::from_utf8(&raw[..end]).map_err(|_| DecodeError::InvalidText(field))?;
    let text = text.to_string();
    buf.advance(width);
    Ok(text)
}

fn put_text(buf: &mut &mut [u8], field: TextField, value: &str) -> Result<(), EncodeError> {
    let width = field.width();
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(EncodeError::FieldTooLong {
            field,
            len: bytes.len(),
            max: width,
        });
    }
    if bytes.contains(&0) {
        return Err(EncodeError::EmbeddedNul(field));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}
