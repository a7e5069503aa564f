//! GUID Partition Table parsing.
//!
//! The primary GPT header sits at LBA 1; partition entries follow at the
//! LBA the header names. Disks without a valid header are treated as one
//! whole-disk partition by the caller.

use super::{BlockError, Partition};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// "EFI PART"
const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Sanity cap on partition entries (the usual on-disk array size).
const MAX_ENTRIES: u32 = 128;

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Read the GPT of `device`. Returns `Ok(None)` when no valid header is
/// present.
pub fn read_partition_table(
    device: u16,
    sector_size: usize,
) -> Result<Option<Vec<Partition>>, BlockError> {
    let mut header = vec![0u8; sector_size];
    super::read(device, &mut header, 1)?;

    if header[0..8] != GPT_SIGNATURE {
        return Ok(None);
    }

    let entry_array_lba = read_u64(&header, 72);
    let entry_count = read_u32(&header, 80).min(MAX_ENTRIES);
    let entry_size = read_u32(&header, 84) as usize;
    if entry_size < 128 || entry_count == 0 {
        return Ok(None);
    }

    let array_bytes = entry_count as usize * entry_size;
    let sectors = crate::util::div_round_up(array_bytes as u64, sector_size as u64);
    let mut array = vec![0u8; sectors as usize * sector_size];
    super::read(device, &mut array, entry_array_lba)?;

    let mut partitions = Vec::new();
    for i in 0..entry_count as usize {
        let entry = &array[i * entry_size..(i + 1) * entry_size];
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&entry[0..16]);
        if type_guid == [0u8; 16] {
            continue;
        }
        let start_lba = read_u64(entry, 32);
        let end_lba = read_u64(entry, 40);
        partitions.push(Partition {
            name: decode_name(&entry[56..]),
            start_lba,
            end_lba,
            type_guid,
        });
    }
    Ok(Some(partitions))
}

/// Decode the UTF-16LE partition name, keeping the low byte of each code
/// unit (the kernel is ASCII only).
fn decode_name(bytes: &[u8]) -> String {
    let mut name = String::new();
    for pair in bytes.chunks_exact(2).take(36) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        name.push((unit & 0xFF) as u8 as char);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ram_disk::RamDisk;
    use crate::block::{register_device, unregister_device, write};
    use alloc::boxed::Box;
    use alloc::string::ToString;

    fn encode_name(name: &str, out: &mut [u8]) {
        for (i, b) in name.bytes().enumerate() {
            out[i * 2] = b;
            out[i * 2 + 1] = 0;
        }
    }

    fn build_gpt_disk() -> u16 {
        let disk = RamDisk::new(512, 64);
        let dev = register_device("gpt0".to_string(), Box::new(disk)).unwrap();

        let mut header = [0u8; 512];
        header[0..8].copy_from_slice(b"EFI PART");
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entries at LBA 2
        header[80..84].copy_from_slice(&2u32.to_le_bytes()); // two entries
        header[84..88].copy_from_slice(&128u32.to_le_bytes());
        write(dev, &header, 1).unwrap();

        let mut entries = [0u8; 512];
        // Entry 0: "boot", sectors 16..31.
        entries[0..16].copy_from_slice(&[0xAA; 16]);
        entries[32..40].copy_from_slice(&16u64.to_le_bytes());
        entries[40..48].copy_from_slice(&31u64.to_le_bytes());
        encode_name("boot", &mut entries[56..128]);
        // Entry 1: unused (zero type GUID).
        write(dev, &entries, 2).unwrap();
        dev
    }

    #[test]
    fn test_parse_gpt() {
        let dev = build_gpt_disk();
        let parts = read_partition_table(dev, 512).unwrap().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "boot");
        assert_eq!(parts[0].start_lba, 16);
        assert_eq!(parts[0].end_lba, 31);
        assert_eq!(parts[0].type_guid, [0xAA; 16]);
        unregister_device(dev);
    }

    #[test]
    fn test_missing_signature() {
        let disk = RamDisk::new(512, 8);
        let dev = register_device("nogpt".to_string(), Box::new(disk)).unwrap();
        assert_eq!(read_partition_table(dev, 512).unwrap(), None);
        unregister_device(dev);
    }
}
