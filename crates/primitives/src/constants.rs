//! Consensus-level constants shared by the checksum engine and its
//! consumers.

use crate::buf::Buf32;

/// Checksum seed used when no predecessor checksum exists (genesis).
pub const ZERO_CHECKSUM: Buf32 = Buf32::new([0; 32]);

/// Canonical commitment of an empty contract-storage trie. IBD processes
/// pre-OP_NET blocks only, which carry no contract state.
///
/// This is the SHA-256 of the empty byte string.
pub const EMPTY_STORAGE_ROOT: Buf32 = Buf32::new([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
    0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
    0xb8, 0x55,
]);

/// Synthetic address owning the receipt-tree marker entries written during
/// IBD. Never a real contract address.
pub const RECEIPT_MARKER_ADDRESS: Buf32 = Buf32::new([0xbc; 32]);

/// Highest storage key, holds the previous block checksum in the IBD
/// receipt tree.
pub const RECEIPT_MAX_KEY: Buf32 = Buf32::new([0xff; 32]);

/// `RECEIPT_MAX_KEY - 1`, holds the receipt-tree version marker.
pub const RECEIPT_MAX_KEY_MINUS_ONE: Buf32 = Buf32::new([
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xfe,
]);

/// Receipt-tree version marker value. The byte value is load-bearing:
/// changing it changes every IBD receipt root.
pub const RECEIPT_VERSION_MARKER: u8 = 0x01;

/// Number of consecutive blocks finalized together as one epoch.
pub const DEFAULT_BLOCKS_PER_EPOCH: u64 = 5;

/// Minimum number of distinct trusted witness identities for a block to be
/// considered witness-complete.
pub const DEFAULT_MIN_WITNESSES: usize = 3;
