//! The superblock: one per file, identifying format version, file origin,
//! and the two monotonic counters (`generation`, `ring_counter`) that
//! everything else in the engine is built around (§3, §6).

use crate::error::{Result, RingStoreError};

/// Fixed ASCII tag identifying a valid ringstore file. Any file whose
/// superblock does not begin with this tag is rejected outright (§6).
pub const MAGIC: &str = "RINGSTORE1";

const FIELD_COUNT: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct Superblock {
    pub version: u32,
    pub created: u64,
    pub os_name: String,
    pub os_release: String,
    pub os_version: String,
    pub hostname: String,
    pub domainname: String,
    pub machine: String,
    pub timezone_offset_secs: i32,
    /// Bumped on any change to the ring directory (create/destroy/rename/
    /// resize). Invalidates other processes' cached ring directory views.
    pub generation: u64,
    /// Monotonically increasing; never reused. Allocates ring ids.
    pub ring_counter: u64,
}

impl Superblock {
    /// A freshly created superblock for the current host, generation 0.
    pub fn new_for_host() -> Self {
        Self {
            version: 1,
            created: now_secs(),
            os_name: std::env::consts::OS.to_string(),
            os_release: String::new(),
            os_version: String::new(),
            hostname: hostname(),
            domainname: String::new(),
            machine: std::env::consts::ARCH.to_string(),
            timezone_offset_secs: 0,
            generation: 0,
            ring_counter: 0,
        }
    }

    /// Allocates the next ring id, bumping the counter. Ids are never
    /// reused (§3 invariant 3).
    pub fn allocate_ring_id(&mut self) -> u64 {
        let id = self.ring_counter;
        self.ring_counter += 1;
        id
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    /// Serializes to the reserved `superblock` key's value: ASCII,
    /// pipe-separated, per §6.
    pub fn serialize(&self) -> String {
        format!(
            "{magic}|{version}|{created}|{os_name}|{os_release}|{os_version}|{hostname}|{domain}|{machine}|{tz}|{generation}|{ring_counter}\0",
            magic = MAGIC,
            version = self.version,
            created = self.created,
            os_name = self.os_name,
            os_release = self.os_release,
            os_version = self.os_version,
            hostname = self.hostname,
            domain = self.domainname,
            machine = self.machine,
            tz = self.timezone_offset_secs,
            generation = self.generation,
            ring_counter = self.ring_counter,
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim_end_matches('\0');
        let fields: Vec<&str> = trimmed.split('|').collect();
        if fields.len() != FIELD_COUNT || fields[0] != MAGIC {
            return Err(RingStoreError::WrongFormat(
                "superblock magic mismatch".into(),
            ));
        }
        let parse_u64 = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| RingStoreError::WrongFormat("superblock field not numeric".into()))
        };
        Ok(Self {
            version: fields[1]
                .parse()
                .map_err(|_| RingStoreError::WrongFormat("superblock version".into()))?,
            created: parse_u64(fields[2])?,
            os_name: fields[3].to_string(),
            os_release: fields[4].to_string(),
            os_version: fields[5].to_string(),
            hostname: fields[6].to_string(),
            domainname: fields[7].to_string(),
            machine: fields[8].to_string(),
            timezone_offset_secs: fields[9]
                .parse()
                .map_err(|_| RingStoreError::WrongFormat("superblock timezone".into()))?,
            generation: parse_u64(fields[10])?,
            ring_counter: parse_u64(fields[11])?,
        })
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = vec![0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            buf.truncate(len);
            return String::from_utf8_lossy(&buf).into_owned();
        }
        "unknown".to_string()
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut sb = Superblock::new_for_host();
        sb.generation = 3;
        sb.ring_counter = 7;
        let text = sb.serialize();
        let parsed = Superblock::parse(&text).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = Superblock::parse("NOTRINGSTORE|1|0|x|x|x|x|x|x|0|0|0\0").unwrap_err();
        assert!(matches!(err, RingStoreError::WrongFormat(_)));
    }

    #[test]
    fn allocate_ring_id_never_reuses() {
        let mut sb = Superblock::new_for_host();
        assert_eq!(sb.allocate_ring_id(), 0);
        assert_eq!(sb.allocate_ring_id(), 1);
        assert_eq!(sb.ring_counter, 2);
    }
}
