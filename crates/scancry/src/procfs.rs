//! Memory access for live Linux processes through `/proc/<pid>`.

use crate::{error::Error, Access, Address, AddressRange, MemoryMap, MemoryReader};
use anyhow::Context as _;
use std::{fs, path::PathBuf};

impl MemoryMap {
    /// Read the memory map of the process with the given pid.
    pub fn from_pid(pid: u32) -> Result<MemoryMap, Error> {
        let path = PathBuf::from(format!("/proc/{}/maps", pid));
        let input = fs::read_to_string(path)?;
        Self::parse_maps(&input)
    }

    /// Parse a memory map in the format of `/proc/<pid>/maps`.
    pub fn parse_maps(input: &str) -> Result<MemoryMap, Error> {
        let mut builder = MemoryMap::builder();

        for (n, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let mut rest = line;

            let range = field(&mut rest).ok_or_else(|| bad_line(n, "missing range"))?;
            let perms = field(&mut rest).ok_or_else(|| bad_line(n, "missing permissions"))?;

            // offset, device and inode are not needed.
            for _ in 0..3 {
                field(&mut rest).ok_or_else(|| bad_line(n, "truncated line"))?;
            }

            let pathname = rest.trim();

            let mut it = range.splitn(2, '-');
            let start = it.next().ok_or_else(|| bad_line(n, "bad range"))?;
            let end = it.next().ok_or_else(|| bad_line(n, "bad range"))?;

            let range = AddressRange::new(start.parse()?, end.parse()?)?;
            builder.push(range, parse_access(perms), Some(pathname));
        }

        builder.build()
    }
}

fn bad_line(n: usize, reason: &str) -> Error {
    Error::invalid_option("memory map", format!("line {}: {}", n + 1, reason))
}

/// Split off the next whitespace-delimited field.
fn field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let s = rest.trim_start();

    if s.is_empty() {
        return None;
    }

    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    let (field, tail) = s.split_at(end);
    *rest = tail;
    Some(field)
}

fn parse_access(perms: &str) -> Access {
    let mut access = Access::NONE;

    for c in perms.chars() {
        access = access
            | match c {
                'r' => Access::READ,
                'w' => Access::WRITE,
                'x' => Access::EXEC,
                's' => Access::SHARED,
                _ => Access::NONE,
            };
    }

    access
}

/// A read session backed by `/proc/<pid>/mem`.
///
/// Reads are positioned, so a session never carries a cursor between reads.
#[cfg(unix)]
#[derive(Debug)]
pub struct ProcMemory {
    pid: u32,
    file: fs::File,
}

#[cfg(unix)]
impl ProcMemory {
    /// Open a read session for the given process.
    pub fn open(pid: u32) -> Result<ProcMemory, Error> {
        let file = fs::File::open(format!("/proc/{}/mem", pid))?;
        Ok(ProcMemory { pid, file })
    }

    /// Open `count` independent sessions, defaulting to one per cpu.
    pub fn open_sessions(pid: u32, count: Option<usize>) -> Result<Vec<ProcMemory>, Error> {
        let count = count.unwrap_or_else(num_cpus::get).max(1);
        (0..count).map(|_| Self::open(pid)).collect()
    }

    /// The pid this session reads from.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[cfg(unix)]
impl MemoryReader for ProcMemory {
    fn read_memory(&self, address: Address, buf: &mut [u8]) -> anyhow::Result<usize> {
        use std::os::unix::fs::FileExt as _;

        let mut read = 0;

        while read < buf.len() {
            let offset = address.into_inner() + read as u64;

            let n = self
                .file
                .read_at(&mut buf[read..], offset)
                .with_context(|| format!("failed to read /proc/{}/mem at {}", self.pid, address))?;

            if n == 0 {
                break;
            }

            read += n;
        }

        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Access, Address, MemoryMap};

    const MAPS: &str = "\
55d0c8a00000-55d0c8a02000 r--p 00000000 08:01 1311     /usr/bin/game
55d0c8a02000-55d0c8a06000 r-xp 00002000 08:01 1311     /usr/bin/game
55d0c9000000-55d0c9021000 rw-p 00000000 00:00 0        [heap]
7f0000000000-7f0000001000 rw-s 00000000 00:05 77       /dev/shm/with space
7ffd1000000-7ffd1001000 rw-p 00000000 00:00 0
";

    #[test]
    fn test_parse_maps() {
        let map = MemoryMap::parse_maps(MAPS).unwrap();

        assert_eq!(5, map.regions().len());
        assert_eq!(3, map.objects().len());

        let game = map.find_object("/usr/bin/game").unwrap();
        assert_eq!(2, game.regions.len());
        assert_eq!(Address::new(0x55d0c8a00000), game.base);

        let exec = map.region(game.regions[1]).unwrap();
        assert_eq!(Access::READ | Access::EXEC, exec.access);

        assert!(map.find_object("/dev/shm/with space").is_some());

        let anonymous = map.find_region(Address::new(0x7ffd1000010)).unwrap();
        assert!(anonymous.object.is_none());
    }

    #[test]
    fn test_parse_maps_rejects_garbage() {
        assert!(MemoryMap::parse_maps("nonsense").is_err());
        assert!(MemoryMap::parse_maps("1000-zz r--p 0 0 0").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_self() {
        use super::ProcMemory;
        use crate::MemoryReader as _;

        let value = Box::new(0x1122_3344_5566_7788u64);
        let address = Address::new(&*value as *const u64 as u64);

        let session = ProcMemory::open(std::process::id()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(8, session.read_memory(address, &mut buf).unwrap());
        assert_eq!(*value, u64::from_ne_bytes(buf));
    }
}
