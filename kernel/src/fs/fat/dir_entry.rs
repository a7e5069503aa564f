//! FAT directory entries: the 32-byte short-name entry and the long file
//! name extension entry.

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Attribute bits of a short-name directory entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FatAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

/// Attribute value marking a long-file-name entry.
pub const LONG_NAME_ATTR: u8 = 0x0F;

/// The 32-byte short-name directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileEntry {
    pub short_name: [u8; 11],
    pub attributes: u8,
    pub nt_reserved: u8,
    pub creation_time_millis: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access_date: u16,
    pub first_cluster_high: u16,
    pub last_modification_time: u16,
    pub last_modification_date: u16,
    pub first_cluster_low: u16,
    pub file_size: u32,
}

impl FileEntry {
    /// First byte of an entry that is unused with no used entries after it.
    pub const MARK_EMPTY_END: u8 = 0x00;
    /// First byte of an unused entry in the middle of a directory.
    pub const MARK_EMPTY_MIDDLE: u8 = 0xE5;
    const PAD: u8 = 0x20;

    pub fn from_bytes(raw: &[u8]) -> Self {
        let u16_at = |off: usize| u16::from_le_bytes([raw[off], raw[off + 1]]);
        let mut short_name = [0u8; 11];
        short_name.copy_from_slice(&raw[0..11]);
        Self {
            short_name,
            attributes: raw[11],
            nt_reserved: raw[12],
            creation_time_millis: raw[13],
            creation_time: u16_at(14),
            creation_date: u16_at(16),
            last_access_date: u16_at(18),
            first_cluster_high: u16_at(20),
            last_modification_time: u16_at(22),
            last_modification_date: u16_at(24),
            first_cluster_low: u16_at(26),
            file_size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    pub fn write_bytes(&self, raw: &mut [u8]) {
        raw[0..11].copy_from_slice(&self.short_name);
        raw[11] = self.attributes;
        raw[12] = self.nt_reserved;
        raw[13] = self.creation_time_millis;
        raw[14..16].copy_from_slice(&self.creation_time.to_le_bytes());
        raw[16..18].copy_from_slice(&self.creation_date.to_le_bytes());
        raw[18..20].copy_from_slice(&self.last_access_date.to_le_bytes());
        raw[20..22].copy_from_slice(&self.first_cluster_high.to_le_bytes());
        raw[22..24].copy_from_slice(&self.last_modification_time.to_le_bytes());
        raw[24..26].copy_from_slice(&self.last_modification_date.to_le_bytes());
        raw[26..28].copy_from_slice(&self.first_cluster_low.to_le_bytes());
        raw[28..32].copy_from_slice(&self.file_size.to_le_bytes());
    }

    pub fn is_empty_end(&self) -> bool {
        self.short_name[0] == Self::MARK_EMPTY_END
    }

    pub fn is_empty_middle(&self) -> bool {
        self.short_name[0] == Self::MARK_EMPTY_MIDDLE
    }

    pub fn is_long_name(&self) -> bool {
        self.attributes & LONG_NAME_ATTR == LONG_NAME_ATTR
    }

    pub fn has_attribute(&self, attr: FatAttributes) -> bool {
        self.attributes & attr.bits() != 0
    }

    /// First cluster of the entry's content.
    pub fn cluster(&self) -> u32 {
        (self.first_cluster_high as u32) << 16 | self.first_cluster_low as u32
    }

    pub fn set_cluster(&mut self, cluster: u32) {
        self.first_cluster_low = (cluster & 0xFFFF) as u16;
        self.first_cluster_high = ((cluster >> 16) & 0xFFFF) as u16;
    }

    /// The dot-separated `NAME.EXT` form, trimmed of padding.
    pub fn make_short_name(&self) -> String {
        let main: Vec<u8> = self.short_name[..8]
            .iter()
            .copied()
            .take_while(|&b| b != Self::PAD)
            .collect();
        let ext: Vec<u8> = self.short_name[8..]
            .iter()
            .copied()
            .take_while(|&b| b != Self::PAD)
            .collect();
        let mut name = String::new();
        for b in main {
            name.push(b as char);
        }
        if !ext.is_empty() {
            name.push('.');
            for b in ext {
                name.push(b as char);
            }
        }
        name
    }

    /// The specification's rotate-and-add checksum over the 11 name bytes,
    /// stored in every LFN entry of the run.
    pub fn short_name_checksum(&self) -> u8 {
        let mut sum: u8 = 0;
        for &b in &self.short_name {
            sum = (sum >> 1).wrapping_add((sum & 1) << 7).wrapping_add(b);
        }
        sum
    }
}

/// The 32-byte long-file-name entry: 13 UTF-16 code units per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfnEntry {
    pub order: u8,
    pub name1: [u16; 5],
    pub attributes: u8,
    pub entry_type: u8,
    pub checksum: u8,
    pub name2: [u16; 6],
    pub reserved: u16,
    pub name3: [u16; 2],
}

impl LfnEntry {
    /// Order flag of the final (highest-order) entry of a run.
    pub const LAST_ENTRY: u8 = 0x40;
    pub const ORDER_MASK: u8 = 0x3F;
    /// Characters carried per entry.
    pub const CHARS_PER_ENTRY: usize = 13;
    /// Maximum long file name length.
    pub const MAX_NAME_LENGTH: usize = 255;

    pub fn from_bytes(raw: &[u8]) -> Self {
        let u16_at = |off: usize| u16::from_le_bytes([raw[off], raw[off + 1]]);
        let mut name1 = [0u16; 5];
        for (i, unit) in name1.iter_mut().enumerate() {
            *unit = u16_at(1 + i * 2);
        }
        let mut name2 = [0u16; 6];
        for (i, unit) in name2.iter_mut().enumerate() {
            *unit = u16_at(14 + i * 2);
        }
        let mut name3 = [0u16; 2];
        for (i, unit) in name3.iter_mut().enumerate() {
            *unit = u16_at(28 + i * 2);
        }
        Self {
            order: raw[0],
            name1,
            attributes: raw[11],
            entry_type: raw[12],
            checksum: raw[13],
            name2,
            reserved: u16_at(26),
            name3,
        }
    }

    pub fn write_bytes(&self, raw: &mut [u8]) {
        raw[0] = self.order;
        for (i, unit) in self.name1.iter().enumerate() {
            raw[1 + i * 2..3 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw[11] = self.attributes;
        raw[12] = self.entry_type;
        raw[13] = self.checksum;
        for (i, unit) in self.name2.iter().enumerate() {
            raw[14 + i * 2..16 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw[26..28].copy_from_slice(&self.reserved.to_le_bytes());
        for (i, unit) in self.name3.iter().enumerate() {
            raw[28 + i * 2..30 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    /// Decode this entry's 13 characters. Only the low byte of each code
    /// unit is kept (the kernel is ASCII only); the `0x0000` terminator and
    /// `0xFFFF` padding end the fragment.
    pub fn decode_fragment(&self) -> String {
        let mut fragment = String::new();
        let units = self
            .name1
            .iter()
            .chain(self.name2.iter())
            .chain(self.name3.iter());
        for &unit in units {
            if unit == 0x0000 || unit == 0xFFFF {
                break;
            }
            fragment.push((unit & 0xFF) as u8 as char);
        }
        fragment
    }

    /// Build the LFN run for `name`, highest order first, as it is laid out
    /// on disk in front of the short entry.
    pub fn encode_name(name: &str, checksum: u8) -> Vec<LfnEntry> {
        let bytes = name.as_bytes();
        let count = crate::util::div_round_up(bytes.len() as u64, Self::CHARS_PER_ENTRY as u64) as usize;
        let mut run = Vec::with_capacity(count);
        for index in (0..count).rev() {
            let chunk_start = index * Self::CHARS_PER_ENTRY;
            let chunk = &bytes[chunk_start..core::cmp::min(chunk_start + Self::CHARS_PER_ENTRY, bytes.len())];
            let mut units = [0xFFFFu16; 13];
            for (i, &b) in chunk.iter().enumerate() {
                units[i] = b as u16;
            }
            if chunk.len() < Self::CHARS_PER_ENTRY {
                units[chunk.len()] = 0x0000;
            }
            let mut order = (index + 1) as u8;
            if index == count - 1 {
                order |= Self::LAST_ENTRY;
            }
            let mut name1 = [0u16; 5];
            name1.copy_from_slice(&units[0..5]);
            let mut name2 = [0u16; 6];
            name2.copy_from_slice(&units[5..11]);
            let mut name3 = [0u16; 2];
            name3.copy_from_slice(&units[11..13]);
            run.push(LfnEntry {
                order,
                name1,
                attributes: LONG_NAME_ATTR,
                entry_type: 0,
                checksum,
                name2,
                reserved: 0,
                name3,
            });
        }
        run
    }
}

/// Location of a directory entry on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileEntryLocation {
    /// Cluster holding the entry (or a root-region chunk on FAT12/16).
    pub cluster: u32,
    /// Index of the entry within the cluster.
    pub entry_index: u16,
}

/// A directory entry together with its on-disk location and resolved name,
/// enabling in-place updates.
#[derive(Debug, Clone, Default)]
pub struct LocationAwareFileEntry {
    /// Resolved file name (long name when present, short name otherwise).
    pub file_name: String,
    pub file: FileEntry,
    pub location: FileEntryLocation,
    /// Location of the first LFN entry of the run, when one exists.
    pub first_lfn: Option<FileEntryLocation>,
}

/// Characters a long file name may contain, besides letters and digits.
const LFN_SPECIAL: &[u8] = b"$%'-_@~`!(){}^#&.+,;=[] ";

/// Whether `name` is a legal long file name.
pub fn is_valid_long_name(name: &str) -> bool {
    if name.is_empty() || name.len() > LfnEntry::MAX_NAME_LENGTH {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b > 127 || LFN_SPECIAL.contains(&b))
}

/// Derive a short name for `name`: uppercased 8.3 with a `~N` numeric tail.
pub fn derive_short_name(name: &str, tail: u8) -> [u8; 11] {
    let mut short = [FileEntry::PAD; 11];
    let (main, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos + 1..]),
        _ => (name, ""),
    };

    let sanitize = |c: u8| -> Option<u8> {
        if c.is_ascii_alphanumeric() {
            Some(c.to_ascii_uppercase())
        } else if c == b' ' || c == b'.' {
            None
        } else {
            Some(b'_')
        }
    };

    let mut main_len = 0;
    for b in main.bytes() {
        if main_len >= 6 {
            break;
        }
        if let Some(c) = sanitize(b) {
            short[main_len] = c;
            main_len += 1;
        }
    }
    if main_len == 0 {
        short[0] = b'_';
        main_len = 1;
    }
    short[main_len] = b'~';
    short[main_len + 1] = b'0' + (tail % 10);

    let mut ext_len = 0;
    for b in ext.bytes() {
        if ext_len >= 3 {
            break;
        }
        if let Some(c) = sanitize(b) {
            short[8 + ext_len] = c;
            ext_len += 1;
        }
    }
    short
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_file_entry_round_trip() {
        let mut entry = FileEntry::default();
        entry.short_name.copy_from_slice(b"HELLO   TXT");
        entry.attributes = FatAttributes::ARCHIVE.bits();
        entry.set_cluster(0x0012_0034);
        entry.file_size = 4096;

        let mut raw = [0u8; 32];
        entry.write_bytes(&mut raw);
        let back = FileEntry::from_bytes(&raw);
        assert_eq!(back, entry);
        assert_eq!(back.cluster(), 0x0012_0034);
        assert_eq!(back.make_short_name(), "HELLO.TXT");
    }

    #[test]
    fn test_short_name_without_extension() {
        let mut entry = FileEntry::default();
        entry.short_name.copy_from_slice(b"KERNEL     ");
        assert_eq!(entry.make_short_name(), "KERNEL");
    }

    #[test]
    fn test_empty_markers() {
        let mut entry = FileEntry::default();
        assert!(entry.is_empty_end());
        entry.short_name[0] = 0xE5;
        assert!(entry.is_empty_middle());
        entry.short_name[0] = b'A';
        assert!(!entry.is_empty_end() && !entry.is_empty_middle());
    }

    #[test]
    fn test_checksum_is_stable() {
        let mut entry = FileEntry::default();
        entry.short_name.copy_from_slice(b"FILENAMEEXT");
        let sum = entry.short_name_checksum();
        assert_eq!(sum, entry.short_name_checksum());
        entry.short_name[0] = b'G';
        assert_ne!(sum, entry.short_name_checksum());
    }

    #[test]
    fn test_lfn_encode_decode_round_trip() {
        // 18 characters: two LFN entries.
        let name = "long file name.txt";
        let run = LfnEntry::encode_name(name, 0x42);
        assert_eq!(run.len(), 2);
        assert_eq!(run[0].order, LfnEntry::LAST_ENTRY | 2);
        assert_eq!(run[1].order, 1);
        assert!(run.iter().all(|e| e.checksum == 0x42));
        assert!(run.iter().all(|e| e.attributes == LONG_NAME_ATTR));

        // Decode in on-disk order: highest order first means the name is
        // assembled back to front.
        let mut decoded = String::new();
        for entry in run.iter().rev() {
            decoded.push_str(&entry.decode_fragment());
        }
        assert_eq!(decoded, name);
    }

    #[test]
    fn test_lfn_serialization() {
        let run = LfnEntry::encode_name("abc", 7);
        let mut raw = [0u8; 32];
        run[0].write_bytes(&mut raw);
        let back = LfnEntry::from_bytes(&raw);
        assert_eq!(back, run[0]);
        assert_eq!(back.decode_fragment(), "abc".to_string());
    }

    #[test]
    fn test_valid_long_names() {
        assert!(is_valid_long_name("long file name.txt"));
        assert!(is_valid_long_name("notes-2.1_(draft)"));
        assert!(!is_valid_long_name(""));
        assert!(!is_valid_long_name("bad/slash"));
        assert!(!is_valid_long_name("bad\"quote"));
    }

    #[test]
    fn test_derive_short_name() {
        let short = derive_short_name("long file name.txt", 1);
        assert_eq!(&short[..8], b"LONGFI~1");
        assert_eq!(&short[8..], b"TXT");

        let short = derive_short_name("a.c", 2);
        assert_eq!(&short[..8], b"A~2     ");
        assert_eq!(&short[8..], b"C  ");
    }
}
