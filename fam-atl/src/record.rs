//! On-disk layout for the atomic-write queue, grounded on the `qData`/
//! `atomicMsg` structures in `atomic_queue.cpp`. Every record here is
//! `repr(C)` and persisted byte-for-byte via `mmap`, so field order and
//! width matter and must not be changed without a migration plan.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        const WRITE           = 0b0000_0000_0001;
        const READ            = 0b0000_0000_0010;
        const SCATTER_STRIDE  = 0b0000_0000_0100;
        const SCATTER_INDEX   = 0b0000_0000_1000;
        const GATHER_STRIDE   = 0b0000_0001_0000;
        const GATHER_INDEX    = 0b0000_0010_0000;
        const WRITE_IN_PROGRESS = 0b0000_0100_0000;
        const WRITE_COMPLETED   = 0b0000_1000_0000;
        const BUFFER_ALLOCATED  = 0b0001_0000_0000;
        const CONTAIN_DATA      = 0b0010_0000_0000;
    }
}

/// A destination data item: the `Fam_Global_Descriptor` equivalent —
/// which region, and the per-region byte offset the write targets.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalDescriptor {
    pub region_id: u64,
    pub offset: u64,
}

/// One queued request. Kept deliberately flat (no `Vec`/`String`) so it
/// can be memcpy'd into the mmap-backed ring exactly like the source's
/// `atomicMsg`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicMsg {
    pub flag: u32,
    pub client_node_id: u64,
    pub dst: GlobalDescriptor,
    /// Offset within the destination data item (added to `dst.offset`).
    pub offset: u64,
    pub size: u64,
    /// Offset of the staged source buffer inside the ATL's own region,
    /// valid only when `CONTAIN_DATA`/`BUFFER_ALLOCATED` is set.
    pub offset_buffer: u64,
    /// Offset of the comma-separated index-list buffer, valid only for
    /// `SCATTER_INDEX`/`GATHER_INDEX`.
    pub offset_index: u64,
    pub n_elements: u64,
    pub element_size: u64,
    pub first_element: u64,
    pub stride: u64,
}

impl AtomicMsg {
    pub const EMPTY: AtomicMsg = AtomicMsg {
        flag: 0,
        client_node_id: 0,
        dst: GlobalDescriptor { region_id: 0, offset: 0 },
        offset: 0,
        size: 0,
        offset_buffer: 0,
        offset_index: 0,
        n_elements: 0,
        element_size: 0,
        first_element: 0,
        stride: 0,
    };

    pub fn flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flag)
    }

    pub fn set_flags(&mut self, flags: MsgFlags) {
        self.flag = flags.bits();
    }
}

/// The ring's header: front/rear indices, current size, and capacity —
/// the exact fields of `qData` minus the array offset, which this
/// implementation keeps as a separate in-memory `Vec` rather than a
/// second mmap region (see `queue::AtomicQueue`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueHeader {
    pub front: u64,
    pub rear: u64,
    pub size: u64,
    pub capacity: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_msg_has_no_flags_set() {
        assert!(AtomicMsg::EMPTY.flags().is_empty());
    }

    #[test]
    fn flags_round_trip() {
        let mut msg = AtomicMsg::EMPTY;
        msg.set_flags(MsgFlags::WRITE | MsgFlags::WRITE_IN_PROGRESS);
        assert!(msg.flags().contains(MsgFlags::WRITE));
        assert!(msg.flags().contains(MsgFlags::WRITE_IN_PROGRESS));
        assert!(!msg.flags().contains(MsgFlags::READ));
    }
}
