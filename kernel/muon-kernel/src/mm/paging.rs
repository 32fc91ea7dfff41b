//! Model page table.
//!
//! A two-level structure mirroring the directory/table split of the real
//! MMU: the top level holds one node per 4 MiB region, and each node
//! (itself backed by an arena frame, like the hardware's page-table pages)
//! holds the entries for the pages in its region. Backing the nodes with
//! real frames is what lets `map_page` genuinely fail when memory runs
//! out, which the fault path must handle.

use alloc::collections::BTreeMap;
use core::fmt;

use bitflags::bitflags;
use muon_core::addr::VirtAddr;

use crate::mm::{FrameArena, FrameIndex, PAGE_SIZE};

/// Pages covered by one second-level node (4 MiB per node).
const NODE_ENTRIES: usize = 1024;

bitflags! {
    /// Access flags on a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The entry refers to a backed frame.
        const PRESENT = 1 << 0;
        /// The page may be written.
        const WRITABLE = 1 << 1;
        /// The page is reachable from user mode.
        const USER = 1 << 2;

        /// The flag set installed by lazy allocation.
        const USER_RW = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
    }
}

/// Why a mapping could not be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame was available for a backing page-table node.
    NodeExhausted,
    /// The page already has a mapping; installing over it would corrupt
    /// the existing frame reference.
    AlreadyMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeExhausted => write!(f, "no frame for a page-table node"),
            Self::AlreadyMapped => write!(f, "page is already mapped"),
        }
    }
}

#[derive(Debug)]
struct Entry {
    frame: FrameIndex,
    flags: PageFlags,
}

#[derive(Debug)]
struct TableNode {
    /// Arena frame backing this node's storage.
    frame: FrameIndex,
    entries: BTreeMap<usize, Entry>,
}

/// Per-process mapping from virtual pages to arena frames.
#[derive(Debug)]
pub struct PageTable {
    nodes: BTreeMap<usize, TableNode>,
}

impl PageTable {
    /// Creates an empty page table.
    pub const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Installs a mapping from the page containing `va` to `frame`.
    ///
    /// `va` must be page-aligned. Allocates a backing node frame from
    /// `arena` if this is the first mapping in the node's region; on
    /// [`MapError`] no state is changed and the caller keeps ownership of
    /// `frame`.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        frame: FrameIndex,
        flags: PageFlags,
        arena: &FrameArena,
    ) -> Result<(), MapError> {
        debug_assert_eq!(va.offset_in(PAGE_SIZE), 0, "mapping an unaligned address");

        let page = va.as_usize() / PAGE_SIZE;
        let node_idx = page / NODE_ENTRIES;
        let slot = page % NODE_ENTRIES;

        if !self.nodes.contains_key(&node_idx) {
            let Some(node_frame) = arena.allocate() else {
                return Err(MapError::NodeExhausted);
            };
            self.nodes.insert(
                node_idx,
                TableNode {
                    frame: node_frame,
                    entries: BTreeMap::new(),
                },
            );
        }

        let node = self.nodes.get_mut(&node_idx).expect("node just ensured");
        if node.entries.contains_key(&slot) {
            return Err(MapError::AlreadyMapped);
        }
        node.entries.insert(
            slot,
            Entry {
                frame,
                flags: flags | PageFlags::PRESENT,
            },
        );
        Ok(())
    }

    /// Looks up the mapping covering `va` (any address within the page).
    pub fn translate(&self, va: VirtAddr) -> Option<(FrameIndex, PageFlags)> {
        let page = va.as_usize() / PAGE_SIZE;
        let node = self.nodes.get(&(page / NODE_ENTRIES))?;
        let entry = node.entries.get(&(page % NODE_ENTRIES))?;
        Some((entry.frame, entry.flags))
    }

    /// Returns the number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.nodes.values().map(|node| node.entries.len()).sum()
    }

    /// Tears the table down, returning every page frame and node frame to
    /// the arena. Called when a terminated process is reaped.
    pub fn unmap_all(&mut self, arena: &FrameArena) {
        for (_, node) in core::mem::take(&mut self.nodes) {
            for entry in node.entries.values() {
                arena.free(entry.frame);
            }
            arena.free(node.frame);
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
