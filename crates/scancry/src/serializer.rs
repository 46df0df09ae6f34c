//! Binary storage of pointer scan results.
//!
//! ```text
//! header       "SC" 0x13 0x37, version: u8, scan kind: u8
//! sub header   pathnames count, pathnames offset, chains count, chains offset (u32 LE)
//! pathnames    NUL-terminated strings, followed by an extra NUL
//! chains       pathname index (u32 LE), then every offset (u32 LE) followed
//!              by 0x00, or 0xFF after the last one
//! end          0xBB
//! ```
//!
//! Offsets in the sub header are absolute positions in the file.

use crate::{chain::ChainData, error::Error, MemoryMap, Options};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use log::{info, warn};
use std::{
    convert::TryFrom,
    fs,
    io::{self, Read as _, Write as _},
};

pub const MAGIC: [u8; 4] = *b"SC\x13\x37";
pub const VERSION: u8 = 1;

const HEADER_SIZE: usize = 6;
const POINTER_SCAN_HEADER_SIZE: usize = 16;

const NEXT_OFFSET: u8 = 0x00;
const LAST_OFFSET: u8 = 0xFF;
const END_OF_FILE: u8 = 0xBB;

/// The kind of scan stored in a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    PointerScan,
}

impl ScanKind {
    fn tag(self) -> u8 {
        match self {
            ScanKind::PointerScan => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, Error> {
        match tag {
            1 => Ok(ScanKind::PointerScan),
            other => Err(Error::UnsupportedScanKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: ScanKind,
}

/// Section layout of a pointer scan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerScanHeader {
    pub pathnames_count: u32,
    pub pathnames_offset: u32,
    pub chains_count: u32,
    pub chains_offset: u32,
}

/// The kind specific header following [Header].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubHeader {
    PointerScan(PointerScanHeader),
}

/// Save chains to the configured output path.
pub fn save(data: &ChainData, options: &Options) -> Result<(), Error> {
    let path = options.output_path()?;

    let mut out = io::BufWriter::new(fs::File::create(path)?);
    write(data, &mut out)?;
    out.flush()?;

    info!("saved {} chains to {}", data.len(), path.display());
    Ok(())
}

/// Load chains from the configured input path.
///
/// Unless `shallow`, every chain is resolved against the memory map in
/// `options`, and chains whose object is not mapped are dropped. A shallow
/// load leaves every chain unresolved.
pub fn load(options: &Options, shallow: bool) -> Result<ChainData, Error> {
    let path = options.input_path()?;

    let map = if shallow {
        None
    } else {
        Some(&**options.map()?)
    };

    let bytes = fs::read(path)?;
    let data = read(&bytes, map)?;

    info!("loaded {} chains from {}", data.len(), path.display());
    Ok(data)
}

/// Read only the headers of the configured input file.
pub fn read_headers(options: &Options) -> Result<(Header, SubHeader), Error> {
    let path = options.input_path()?;

    let mut bytes = Vec::with_capacity(HEADER_SIZE + POINTER_SCAN_HEADER_SIZE);
    fs::File::open(path)?
        .take((HEADER_SIZE + POINTER_SCAN_HEADER_SIZE) as u64)
        .read_to_end(&mut bytes)?;

    parse_headers(&bytes)
}

/// Encode chains.
pub fn write<W>(data: &ChainData, out: &mut W) -> Result<(), Error>
where
    W: io::Write,
{
    let mut pathnames_size = 1usize;

    for pathname in data.pathnames() {
        if pathname.is_empty() || pathname.as_bytes().contains(&0) {
            return Err(Error::Corrupt("pathname cannot be stored"));
        }

        pathnames_size += pathname.len() + 1;
    }

    for (n, chain) in data.chains().iter().enumerate() {
        if chain.offsets.is_empty() {
            return Err(Error::EmptyChain(n));
        }

        if let Some(offset) = chain.offsets.iter().find(|o| **o > u64::from(u32::MAX)) {
            return Err(Error::OffsetOverflow(*offset));
        }
    }

    let pathnames_offset = HEADER_SIZE + POINTER_SCAN_HEADER_SIZE;
    let chains_offset = pathnames_offset + pathnames_size;

    out.write_all(&MAGIC)?;
    out.write_u8(VERSION)?;
    out.write_u8(ScanKind::PointerScan.tag())?;

    out.write_u32::<LittleEndian>(to_u32(data.pathnames().len())?)?;
    out.write_u32::<LittleEndian>(to_u32(pathnames_offset)?)?;
    out.write_u32::<LittleEndian>(to_u32(data.len())?)?;
    out.write_u32::<LittleEndian>(to_u32(chains_offset)?)?;

    for pathname in data.pathnames() {
        out.write_all(pathname.as_bytes())?;
        out.write_u8(0)?;
    }

    out.write_u8(0)?;

    for chain in data.chains() {
        out.write_u32::<LittleEndian>(to_u32(chain.pathname)?)?;

        let last = chain.offsets.len() - 1;

        for (n, offset) in chain.offsets.iter().enumerate() {
            out.write_u32::<LittleEndian>(*offset as u32)?;
            out.write_u8(if n == last { LAST_OFFSET } else { NEXT_OFFSET })?;
        }
    }

    out.write_u8(END_OF_FILE)?;
    Ok(())
}

fn to_u32(value: usize) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| Error::OffsetOverflow(value as u64))
}

/// Parse the headers at the start of `bytes`.
pub fn parse_headers(bytes: &[u8]) -> Result<(Header, SubHeader), Error> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Corrupt("truncated header"));
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);

    if magic != MAGIC {
        return Err(Error::BadMagic(magic));
    }

    if bytes[4] != VERSION {
        return Err(Error::UnsupportedVersion(bytes[4]));
    }

    let header = Header {
        version: bytes[4],
        kind: ScanKind::from_tag(bytes[5])?,
    };

    let mut sub = io::Cursor::new(&bytes[HEADER_SIZE..]);

    let sub = match header.kind {
        ScanKind::PointerScan => SubHeader::PointerScan(PointerScanHeader {
            pathnames_count: sub.read_u32::<LittleEndian>().map_err(truncated)?,
            pathnames_offset: sub.read_u32::<LittleEndian>().map_err(truncated)?,
            chains_count: sub.read_u32::<LittleEndian>().map_err(truncated)?,
            chains_offset: sub.read_u32::<LittleEndian>().map_err(truncated)?,
        }),
    };

    Ok((header, sub))
}

fn truncated(_: io::Error) -> Error {
    Error::Corrupt("unexpected end of file")
}

/// Decode chains, resolving objects against `map` if one is provided.
pub fn read(bytes: &[u8], map: Option<&MemoryMap>) -> Result<ChainData, Error> {
    let (_, sub) = parse_headers(bytes)?;

    match sub {
        SubHeader::PointerScan(header) => read_pointer_scan(bytes, &header, map),
    }
}

fn read_pointer_scan(
    bytes: &[u8],
    header: &PointerScanHeader,
    map: Option<&MemoryMap>,
) -> Result<ChainData, Error> {
    let pathnames_offset = header.pathnames_offset as usize;
    let chains_offset = header.chains_offset as usize;

    let mut rest = bytes
        .get(pathnames_offset..)
        .ok_or(Error::Corrupt("pathnames offset out of bounds"))?;

    let mut pathnames = Vec::new();

    for _ in 0..header.pathnames_count {
        let end = memchr::memchr(0, rest).ok_or(Error::Corrupt("unterminated pathname"))?;

        if end == 0 {
            return Err(Error::Corrupt("pathname table ended early"));
        }

        let pathname = std::str::from_utf8(&rest[..end])
            .map_err(|_| Error::Corrupt("pathname is not valid utf-8"))?;

        pathnames.push(pathname);
        rest = &rest[end + 1..];
    }

    match rest.first() {
        Some(0) => (),
        _ => return Err(Error::Corrupt("pathname table is not terminated")),
    }

    if bytes.len() - rest.len() + 1 != chains_offset {
        return Err(Error::Corrupt("chains offset does not follow pathname table"));
    }

    let mut data = ChainData::new();

    // NB: keep the table as stored, even if chains referring to it are dropped.
    for pathname in &pathnames {
        data.intern(pathname);
    }

    let mut input = io::Cursor::new(&bytes[chains_offset..]);
    let mut dropped = 0usize;

    for _ in 0..header.chains_count {
        let index = input.read_u32::<LittleEndian>().map_err(truncated)? as usize;

        let pathname = pathnames
            .get(index)
            .ok_or(Error::Corrupt("pathname index out of bounds"))?;

        let mut offsets = Vec::new();

        loop {
            offsets.push(u64::from(input.read_u32::<LittleEndian>().map_err(truncated)?));

            match input.read_u8().map_err(truncated)? {
                NEXT_OFFSET => continue,
                LAST_OFFSET => break,
                _ => return Err(Error::Corrupt("bad offset delimiter")),
            }
        }

        match map {
            Some(map) => match map.find_object(pathname) {
                Some(object) => data.push(pathname, Some(object.id), offsets),
                None => dropped += 1,
            },
            None => data.push(pathname, None, offsets),
        }
    }

    if input.read_u8().map_err(truncated)? != END_OF_FILE {
        return Err(Error::Corrupt("missing end of file marker"));
    }

    if dropped > 0 {
        warn!("dropped {} chains with unmapped objects", dropped);
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::{load, parse_headers, read, read_headers, save, write, ScanKind, SubHeader};
    use crate::{error::Error, testing::Fixture, Address, ChainData, MemoryMap, ObjectId, Options};

    fn sample() -> ChainData {
        let mut data = ChainData::new();
        data.push("unit_target", Some(ObjectId(1)), vec![0xb0, 0x0]);
        data.push("game", Some(ObjectId(0)), vec![0x100, 0x10]);
        data.push("unit_target", Some(ObjectId(1)), vec![0x200, 0x8, 0x10]);
        data
    }

    fn encode(data: &ChainData) -> Vec<u8> {
        let mut out = Vec::new();
        write(data, &mut out).unwrap();
        out
    }

    #[test]
    fn test_layout() {
        let mut data = ChainData::new();
        data.push("ab", None, vec![0xb0, 0x1]);
        let bytes = encode(&data);

        let expected = [
            b'S', b'C', 0x13, 0x37, 1, 1, // header
            1, 0, 0, 0, 22, 0, 0, 0, // pathnames
            1, 0, 0, 0, 26, 0, 0, 0, // chains
            b'a', b'b', 0, 0, // pathname table
            0, 0, 0, 0, // pathname index
            0xb0, 0, 0, 0, 0x00, // first offset
            0x01, 0, 0, 0, 0xff, // last offset
            0xbb,
        ];

        assert_eq!(&expected[..], &bytes[..]);
    }

    #[test]
    fn test_save_and_load() {
        let fixture = Fixture::game();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chains.scan");

        let mut options = Options::new();
        options.set_map(fixture.map.clone());
        options.set_output_path(Some(path.clone()));
        options.set_input_path(Some(path));

        let data = sample();
        save(&data, &options).unwrap();
        assert_eq!(data, load(&options, false).unwrap());

        let (header, sub) = read_headers(&options).unwrap();
        assert_eq!(ScanKind::PointerScan, header.kind);
        assert_eq!(1, header.version);

        let SubHeader::PointerScan(sub) = sub;
        assert_eq!(2, sub.pathnames_count);
        assert_eq!(22, sub.pathnames_offset);
        assert_eq!(3, sub.chains_count);
        assert_eq!(22 + 12 + 5 + 1, sub.chains_offset);
    }

    #[test]
    fn test_shallow_load_keeps_every_chain() {
        let bytes = encode(&sample());
        let data = read(&bytes, None).unwrap();

        assert_eq!(3, data.len());
        assert!(data.chains().iter().all(|c| c.object.is_none()));
        assert_eq!(vec![0x200, 0x8, 0x10], data.chains()[2].offsets);
    }

    #[test]
    fn test_unmapped_objects_are_dropped() {
        let bytes = encode(&sample());
        let map = MemoryMap::builder()
            .region(
                crate::AddressRange::new(Address::new(0x1000), Address::new(0x2000)).unwrap(),
                crate::Access::READ,
                Some("game"),
            )
            .build()
            .unwrap();

        let data = read(&bytes, Some(&map)).unwrap();
        assert_eq!(1, data.len());
        assert_eq!(Some("game"), data.pathname(&data.chains()[0]));
        assert_eq!(Some(ObjectId(0)), data.chains()[0].object);
        assert_eq!(2, data.pathnames().len());
    }

    #[test]
    fn test_bad_headers() {
        let mut bytes = encode(&sample());

        bytes[0] = b'X';
        assert!(matches!(parse_headers(&bytes), Err(Error::BadMagic(..))));

        bytes[0] = b'S';
        bytes[4] = 2;
        assert!(matches!(
            parse_headers(&bytes),
            Err(Error::UnsupportedVersion(2))
        ));

        bytes[4] = 1;
        bytes[5] = 7;
        assert!(matches!(
            parse_headers(&bytes),
            Err(Error::UnsupportedScanKind(7))
        ));

        assert!(matches!(parse_headers(&bytes[..3]), Err(Error::Corrupt(..))));
        assert!(matches!(parse_headers(&[b'S', b'C', 0x13, 0x37, 1, 1, 0]), Err(Error::Corrupt(..))));
    }

    #[test]
    fn test_corrupt_body() {
        let bytes = encode(&sample());

        let mut truncated = bytes.clone();
        truncated.pop();
        assert!(matches!(read(&truncated, None), Err(Error::Corrupt(..))));

        let mut bad_end = bytes.clone();
        *bad_end.last_mut().unwrap() = 0;
        assert!(matches!(read(&bad_end, None), Err(Error::Corrupt(..))));

        // first delimiter of the first chain.
        let mut bad_delimiter = bytes;
        bad_delimiter[40 + 4 + 4] = 0x7f;
        assert!(matches!(read(&bad_delimiter, None), Err(Error::Corrupt(..))));
    }

    #[test]
    fn test_unstorable_chains() {
        let mut empty = ChainData::new();
        empty.push("a", None, vec![]);
        assert!(matches!(write(&empty, &mut Vec::new()), Err(Error::EmptyChain(0))));

        let mut wide = ChainData::new();
        wide.push("a", None, vec![0x1_0000_0000]);
        assert!(matches!(
            write(&wide, &mut Vec::new()),
            Err(Error::OffsetOverflow(0x1_0000_0000))
        ));
    }

    #[test]
    fn test_missing_paths() {
        let options = Options::new();
        assert!(matches!(save(&sample(), &options), Err(Error::MissingOption("output_path"))));
        assert!(matches!(load(&options, true), Err(Error::MissingOption("input_path"))));
    }
}
