//! Default VCDIFF instruction code table
//!
//! Every instruction byte indexes a 256-entry table of one or two
//! half-instructions with optionally embedded sizes (RFC 3284 §5.6). Only
//! the default table is supported; patches declaring a custom table are
//! rejected before this module is consulted.

use std::sync::LazyLock;

/// Number of ADD entries with embedded sizes
const ADD_SIZES: u8 = 17;
/// Number of COPY entries with embedded sizes, per mode
const CPY_SIZES: u8 = 15;
/// Number of near-cache COPY modes
pub const NEAR_MODES: u8 = 4;
/// Number of same-cache COPY modes
pub const SAME_MODES: u8 = 3;

/// Half-instruction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Noop,
    Add,
    Run,
    /// COPY with its addressing mode (0 = self, 1 = here, 2.. = caches)
    Copy(u8),
}

/// One code-table row: up to two half-instructions
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub kind1: Kind,
    pub size1: u8,
    pub kind2: Kind,
    pub size2: u8,
}

const EMPTY: Entry = Entry {
    kind1: Kind::Noop,
    size1: 0,
    kind2: Kind::Noop,
    size2: 0,
};

/// The default code table, built once on first use
pub static CODE_TABLE: LazyLock<[Entry; 256]> = LazyLock::new(build_default_table);

fn build_default_table() -> [Entry; 256] {
    let mut table = [EMPTY; 256];
    let cpy_modes = 2 + NEAR_MODES + SAME_MODES;
    let mut i = 0usize;

    // RUN and size-in-stream ADD
    table[i].kind1 = Kind::Run;
    i += 1;
    table[i].kind1 = Kind::Add;
    i += 1;

    // ADD with embedded sizes 1..=17
    for size in 1..=ADD_SIZES {
        table[i].kind1 = Kind::Add;
        table[i].size1 = size;
        i += 1;
    }

    // COPY per mode: size-in-stream, then embedded sizes 4..=18
    for mode in 0..cpy_modes {
        table[i].kind1 = Kind::Copy(mode);
        i += 1;
        for size in 4..4 + CPY_SIZES {
            table[i].kind1 = Kind::Copy(mode);
            table[i].size1 = size;
            i += 1;
        }
    }

    // Fused ADD+COPY rows
    for mode in 0..cpy_modes {
        let is_near = mode < 2 + NEAR_MODES;
        let copy_max = if is_near { 6 } else { 4 };
        for add_size in 1..=4u8 {
            for copy_size in 4..=copy_max {
                table[i].kind1 = Kind::Add;
                table[i].size1 = add_size;
                table[i].kind2 = Kind::Copy(mode);
                table[i].size2 = copy_size;
                i += 1;
            }
        }
    }

    // Fused COPY+ADD rows (a single size pairing per mode)
    for mode in 0..cpy_modes {
        table[i].kind1 = Kind::Copy(mode);
        table[i].size1 = 4;
        table[i].kind2 = Kind::Add;
        table[i].size2 = 1;
        i += 1;
    }

    debug_assert_eq!(i, 256);
    table
}

/// Rolling caches for COPY addresses (RFC 3284 §5.1)
#[derive(Debug)]
pub struct AddressCache {
    near: [u64; NEAR_MODES as usize],
    same: [u64; SAME_MODES as usize * 256],
    next_slot: usize,
}

impl AddressCache {
    /// Fresh caches; reset at every window boundary
    pub fn new() -> Self {
        Self {
            near: [0; NEAR_MODES as usize],
            same: [0; SAME_MODES as usize * 256],
            next_slot: 0,
        }
    }

    /// Near-cache entry for near mode index `slot`
    pub fn near(&self, slot: usize) -> u64 {
        self.near[slot]
    }

    /// Same-cache entry for `(same_mode, low byte)`
    pub fn same(&self, index: usize) -> u64 {
        self.same[index]
    }

    /// Record a decoded address in both caches
    pub fn update(&mut self, addr: u64) {
        self.near[self.next_slot] = addr;
        self.next_slot = (self.next_slot + 1) % self.near.len();
        self.same[(addr % (SAME_MODES as u64 * 256)) as usize] = addr;
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}
