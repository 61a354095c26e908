// Macro-space file format: header and descriptor codecs.
//
// Layout: [32-byte version string][u32 signature][u32 count], then `count`
// fixed 272-byte descriptors, then `count` raw image blobs in descriptor
// order. Descriptors and images are two independently scannable regions
// linked only by ordinal position, so a selective load can seek past any
// image it does not want.
use std::io::{Read, Seek, SeekFrom, Write};

use crate::core::error::{Error, ErrorKind};
use crate::core::name::MAX_MACRO_NAME;

pub const VERSION_TEXT: &str = "crossbar macro space v1.00";
pub const VERSION_FIELD_LEN: usize = 32;
pub const SIGNATURE: u32 = 0xC0B5_ACE1;
pub const SPACE_HEADER_LEN: usize = VERSION_FIELD_LEN + 8;
pub const DESCRIPTOR_LEN: usize = 8 + 256 + 4 + 4;
pub const MAX_IMAGE_LEN: usize = 64 * 1024 * 1024;

fn version_field() -> [u8; VERSION_FIELD_LEN] {
    let mut field = [0u8; VERSION_FIELD_LEN];
    field[..VERSION_TEXT.len()].copy_from_slice(VERSION_TEXT.as_bytes());
    field
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpaceHeader {
    pub count: u32,
}

impl SpaceHeader {
    pub fn encode(&self) -> [u8; SPACE_HEADER_LEN] {
        let mut buf = [0u8; SPACE_HEADER_LEN];
        buf[..VERSION_FIELD_LEN].copy_from_slice(&version_field());
        buf[VERSION_FIELD_LEN..VERSION_FIELD_LEN + 4].copy_from_slice(&SIGNATURE.to_le_bytes());
        buf[VERSION_FIELD_LEN + 4..].copy_from_slice(&self.count.to_le_bytes());
        buf
    }

    /// The version string and signature word are compared verbatim before
    /// any record is read; a single differing byte aborts the whole load.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < SPACE_HEADER_LEN {
            return Err(Error::new(ErrorKind::Protocol).with_message("macro space header too small"));
        }
        if buf[..VERSION_FIELD_LEN] != version_field() {
            return Err(
                Error::new(ErrorKind::Protocol).with_message("macro space version mismatch")
            );
        }
        let signature = read_u32(buf, VERSION_FIELD_LEN);
        if signature != SIGNATURE {
            return Err(
                Error::new(ErrorKind::Protocol).with_message("macro space signature mismatch")
            );
        }
        let count = read_u32(buf, VERSION_FIELD_LEN + 4);
        Ok(Self { count })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut buf = [0u8; SPACE_HEADER_LEN];
        read_exact(reader, &mut buf, "macro space header")?;
        Self::decode(&buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        write_all(writer, &self.encode(), "macro space header")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub image_len: u32,
    pub order: u32,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, image_len: u32, order: u32) -> Self {
        Self {
            name: name.into(),
            image_len,
            order,
        }
    }

    pub fn encode(&self) -> Result<[u8; DESCRIPTOR_LEN], Error> {
        if self.name.is_empty() || self.name.len() > MAX_MACRO_NAME {
            return Err(Error::new(ErrorKind::BadArgument)
                .with_message(format!("macro name must be 1..={MAX_MACRO_NAME} bytes")));
        }
        if self.image_len as usize > MAX_IMAGE_LEN {
            return Err(Error::new(ErrorKind::BadArgument).with_message("image exceeds max size"));
        }
        let mut buf = [0u8; DESCRIPTOR_LEN];
        // First 8 bytes stay zero: reserved pointer-sized padding kept for
        // file-level compatibility.
        buf[8..8 + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[264..268].copy_from_slice(&self.image_len.to_le_bytes());
        buf[268..272].copy_from_slice(&self.order.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(Error::new(ErrorKind::Protocol).with_message("descriptor too small"));
        }
        let name_field = &buf[8..264];
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(256);
        if name_len == 0 || name_len > MAX_MACRO_NAME {
            return Err(Error::new(ErrorKind::Protocol).with_message("invalid descriptor name"));
        }
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| Error::new(ErrorKind::Protocol).with_message("descriptor name not UTF-8"))?
            .to_string();
        let image_len = read_u32(buf, 264);
        if image_len as usize > MAX_IMAGE_LEN {
            return Err(Error::new(ErrorKind::Protocol).with_message("descriptor image too large"));
        }
        let order = read_u32(buf, 268);
        Ok(Self {
            name,
            image_len,
            order,
        })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        read_exact(reader, &mut buf, "macro descriptor")?;
        Self::decode(&buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        write_all(writer, &self.encode()?, "macro descriptor")
    }
}

/// Advance past one image blob without deserializing it.
pub fn skip_image<S: Seek>(seeker: &mut S, image_len: u32) -> Result<(), Error> {
    seeker
        .seek(SeekFrom::Current(i64::from(image_len)))
        .map(|_| ())
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to skip image")
                .with_source(err)
        })
}

pub fn read_image<R: Read>(reader: &mut R, image_len: u32) -> Result<Vec<u8>, Error> {
    let mut image = vec![0u8; image_len as usize];
    read_exact(reader, &mut image, "macro image")?;
    Ok(image)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), Error> {
    reader.read_exact(buf).map_err(|err| {
        let kind = if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ErrorKind::Protocol
        } else {
            ErrorKind::Io
        };
        Error::new(kind)
            .with_message(format!("failed to read {what}"))
            .with_source(err)
    })
}

fn write_all<W: Write>(writer: &mut W, buf: &[u8], what: &str) -> Result<(), Error> {
    writer.write_all(buf).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to write {what}"))
            .with_source(err)
    })
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::{
        DESCRIPTOR_LEN, Descriptor, SPACE_HEADER_LEN, SpaceHeader, read_image, skip_image,
    };
    use crate::core::error::ErrorKind;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let header = SpaceHeader { count: 12 };
        let decoded = SpaceHeader::decode(&header.encode()).expect("decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn one_byte_version_corruption_is_fatal() {
        let mut buf = SpaceHeader { count: 1 }.encode();
        buf[3] ^= 0x01;
        let err = SpaceHeader::decode(&buf).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn signature_corruption_is_fatal() {
        let mut buf = SpaceHeader { count: 1 }.encode();
        buf[super::VERSION_FIELD_LEN] ^= 0xFF;
        let err = SpaceHeader::decode(&buf).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn descriptor_round_trip_preserves_padding() {
        let descriptor = Descriptor::new("Startup", 128, 3);
        let buf = descriptor.encode().expect("encode");
        assert_eq!(buf.len(), DESCRIPTOR_LEN);
        assert_eq!(&buf[..8], &[0u8; 8]);
        let decoded = Descriptor::decode(&buf).expect("decode");
        assert_eq!(descriptor, decoded);
    }

    #[test]
    fn descriptor_rejects_oversized_name() {
        let err = Descriptor::new("n".repeat(256), 0, 0)
            .encode()
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::BadArgument);
    }

    #[test]
    fn regions_are_independently_scannable() {
        // Two descriptors, then two images back to back; a reader that skips
        // the first image must land exactly on the second.
        let mut buf = Vec::new();
        SpaceHeader { count: 2 }.write_to(&mut buf).expect("header");
        Descriptor::new("first", 5, 0).write_to(&mut buf).expect("desc");
        Descriptor::new("second", 6, 1).write_to(&mut buf).expect("desc");
        buf.extend_from_slice(b"AAAAA");
        buf.extend_from_slice(b"BBBBBB");

        let mut cursor = Cursor::new(buf);
        let header = SpaceHeader::read_from(&mut cursor).expect("header");
        assert_eq!(header.count, 2);
        let first = Descriptor::read_from(&mut cursor).expect("first");
        let second = Descriptor::read_from(&mut cursor).expect("second");
        assert_eq!(cursor.position() as usize, SPACE_HEADER_LEN + 2 * DESCRIPTOR_LEN);

        skip_image(&mut cursor, first.image_len).expect("skip");
        let image = read_image(&mut cursor, second.image_len).expect("read");
        assert_eq!(image, b"BBBBBB");
    }
}
