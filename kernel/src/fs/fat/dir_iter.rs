//! Directory iteration over FAT cluster chains.
//!
//! The iterator walks a directory's cluster chain entry by entry and
//! assembles long-file-name runs into resolved names. It is finite and
//! forward-only; restarting means constructing a new iterator.

use super::dir_entry::{FileEntry, FileEntryLocation, LfnEntry, LocationAwareFileEntry};
use super::volume::Volume;
use crate::fs::fat::bpb::DIR_ENTRY_SIZE;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// What the iterator yields.
///
/// - `ListDirectory`: used entries only, with LFN runs resolved; stops at
///   the first end marker.
/// - `ListAll`: every slot including holes, to the end of the chain.
/// - `Atomic`: every raw 32-byte slot without LFN grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryIterationMode {
    ListDirectory,
    ListAll,
    Atomic,
}

/// Iterator lifecycle. All states except `Iterating` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Iterating,
    EndOfDirectory,
    CorruptLfnEntry,
    DeviceError,
}

/// Outcome of a path navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationStatus {
    Found,
    NotFound,
    /// An intermediate path component is not a directory.
    BadPath,
    DevError,
}

pub struct NavigationResult {
    pub status: NavigationStatus,
    pub entry: LocationAwareFileEntry,
}

pub struct FatDirectoryIterator {
    volume: Volume,
    mode: DirectoryIterationMode,
    state: IteratorState,
    current_cluster: u32,
    cluster_buf: Vec<u8>,
    entries_per_cluster: isize,
    entry_index: isize,
    current: LocationAwareFileEntry,
}

impl FatDirectoryIterator {
    /// Start iterating the directory whose chain begins at `start_cluster`.
    pub fn new(volume: Volume, start_cluster: u32, mode: DirectoryIterationMode) -> Self {
        let cluster_size = volume.cluster_size() as usize;
        let mut it = Self {
            volume,
            mode,
            state: IteratorState::Iterating,
            current_cluster: start_cluster,
            cluster_buf: vec![0u8; cluster_size],
            entries_per_cluster: (cluster_size / DIR_ENTRY_SIZE) as isize,
            entry_index: -1,
            current: LocationAwareFileEntry::default(),
        };
        if it.volume.data_cluster_read(start_cluster, &mut it.cluster_buf).is_err() {
            it.state = IteratorState::DeviceError;
            return it;
        }
        it.step();
        it
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    pub fn has_next(&self) -> bool {
        self.state == IteratorState::Iterating
    }

    pub fn current(&self) -> &LocationAwareFileEntry {
        &self.current
    }

    /// Cluster the iterator is currently positioned on.
    pub fn current_cluster(&self) -> u32 {
        self.current_cluster
    }

    fn raw_entry(&self) -> FileEntry {
        let offset = self.entry_index as usize * DIR_ENTRY_SIZE;
        FileEntry::from_bytes(&self.cluster_buf[offset..offset + DIR_ENTRY_SIZE])
    }

    fn raw_lfn(&self) -> LfnEntry {
        let offset = self.entry_index as usize * DIR_ENTRY_SIZE;
        LfnEntry::from_bytes(&self.cluster_buf[offset..offset + DIR_ENTRY_SIZE])
    }

    fn location(&self) -> FileEntryLocation {
        FileEntryLocation {
            cluster: self.current_cluster,
            entry_index: self.entry_index as u16,
        }
    }

    /// Move to the next 32-byte slot, crossing into the next cluster of the
    /// chain when the current one is exhausted. Returns false when a
    /// terminal state was entered.
    fn advance_slot(&mut self) -> bool {
        if self.entry_index >= self.entries_per_cluster - 1 {
            let next = match self.volume.fat_read(self.current_cluster) {
                Ok(next) => next,
                Err(_) => {
                    self.state = IteratorState::DeviceError;
                    return false;
                }
            };
            if self.volume.is_chain_end(next) {
                self.state = IteratorState::EndOfDirectory;
                return false;
            }
            if self.volume.data_cluster_read(next, &mut self.cluster_buf).is_err() {
                self.state = IteratorState::DeviceError;
                return false;
            }
            self.current_cluster = next;
            self.entry_index = 0;
        } else {
            self.entry_index += 1;
        }
        true
    }

    /// Advance to the next yieldable entry according to the mode.
    pub fn step(&mut self) {
        if self.state != IteratorState::Iterating {
            return;
        }
        if !self.advance_slot() {
            return;
        }

        match self.mode {
            DirectoryIterationMode::Atomic => {
                self.current = LocationAwareFileEntry {
                    file_name: String::new(),
                    file: self.raw_entry(),
                    location: self.location(),
                    first_lfn: None,
                };
            }
            DirectoryIterationMode::ListAll => {
                let entry = self.raw_entry();
                if !entry.is_empty_end() && !entry.is_empty_middle() {
                    self.parse_used_entry();
                } else {
                    self.current = LocationAwareFileEntry {
                        file_name: String::new(),
                        file: entry,
                        location: self.location(),
                        first_lfn: None,
                    };
                }
            }
            DirectoryIterationMode::ListDirectory => {
                loop {
                    let entry = self.raw_entry();
                    if entry.is_empty_end() {
                        self.state = IteratorState::EndOfDirectory;
                        return;
                    }
                    if entry.is_empty_middle() {
                        if !self.advance_slot() {
                            return;
                        }
                        continue;
                    }
                    break;
                }
                self.parse_used_entry();
            }
        }
    }

    /// Parse the used entry under the cursor: either a bare short-name
    /// entry, or an LFN run followed by its short-name entry.
    ///
    /// A run is corrupt when it does not open with the last-entry flag or
    /// its order values do not decrement monotonically to 1.
    fn parse_used_entry(&mut self) {
        let entry = self.raw_entry();
        if !entry.is_long_name() {
            self.current = LocationAwareFileEntry {
                file_name: entry.make_short_name(),
                file: entry,
                location: self.location(),
                first_lfn: None,
            };
            return;
        }

        let first = self.raw_lfn();
        if first.order & LfnEntry::LAST_ENTRY == 0 {
            self.state = IteratorState::CorruptLfnEntry;
            return;
        }
        let first_lfn = self.location();
        let count = first.order & LfnEntry::ORDER_MASK;
        if count == 0 {
            self.state = IteratorState::CorruptLfnEntry;
            return;
        }

        let mut name = String::new();
        let mut remaining = count;
        loop {
            let lfn = self.raw_lfn();
            if lfn.order & LfnEntry::ORDER_MASK != remaining {
                self.state = IteratorState::CorruptLfnEntry;
                return;
            }
            // Entries appear highest-order first: each fragment precedes
            // what has been collected so far.
            let mut fragment = lfn.decode_fragment();
            fragment.push_str(&name);
            name = fragment;
            remaining -= 1;
            if !self.advance_slot() {
                return;
            }
            if remaining == 0 {
                break;
            }
        }

        let short = self.raw_entry();
        self.current = LocationAwareFileEntry {
            file_name: name,
            file: short,
            location: self.location(),
            first_lfn: Some(first_lfn),
        };
    }

    /// Walk `components` from the directory at `start_cluster` down to the
    /// named entry.
    pub fn navigate_to(
        volume: Volume,
        start_cluster: u32,
        components: &[&str],
    ) -> NavigationResult {
        let mut cluster = start_cluster;
        for (depth, component) in components.iter().enumerate() {
            let last = depth == components.len() - 1;
            let mut it =
                FatDirectoryIterator::new(volume, cluster, DirectoryIterationMode::ListDirectory);
            let mut found = None;
            while it.has_next() {
                if it.current().file_name == *component {
                    found = Some(it.current().clone());
                    break;
                }
                it.step();
            }
            match found {
                Some(entry) => {
                    if last {
                        return NavigationResult {
                            status: NavigationStatus::Found,
                            entry,
                        };
                    }
                    if !entry.file.has_attribute(super::dir_entry::FatAttributes::DIRECTORY) {
                        return NavigationResult {
                            status: NavigationStatus::BadPath,
                            entry: LocationAwareFileEntry::default(),
                        };
                    }
                    cluster = entry.file.cluster();
                }
                None => {
                    let status = if it.state() == IteratorState::EndOfDirectory {
                        NavigationStatus::NotFound
                    } else {
                        NavigationStatus::DevError
                    };
                    return NavigationResult {
                        status,
                        entry: LocationAwareFileEntry::default(),
                    };
                }
            }
        }
        NavigationResult {
            status: NavigationStatus::BadPath,
            entry: LocationAwareFileEntry::default(),
        }
    }
}

impl Iterator for FatDirectoryIterator {
    type Item = LocationAwareFileEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        let item = self.current.clone();
        self.step();
        Some(item)
    }
}
