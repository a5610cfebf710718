//! Strided and indexed scatter/gather addressing (spec.md §4.2). A
//! scatter/gather request describes a set of fixed-size elements in a
//! local buffer and their corresponding offsets in a (possibly striped)
//! remote data item; this module turns that description into the
//! per-server list of single-element RDMA ops an `Endpoint` can issue.

use fam_common::error::{FamError, FamResult};
use fam_common::model::interleave_map;

/// One element's destination after interleave resolution: which server,
/// what local offset on that server, and which local-buffer byte range
/// it corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementTarget {
    pub server_index: usize,
    pub remote_offset: u64,
    pub local_offset: u64,
    pub element_size: u64,
}

/// `nelements` elements of `element_size` bytes each, starting at
/// `first_element_offset` and spaced `stride` bytes apart in the data
/// item's logical address space.
pub fn strided_targets(
    interleave_size: u64,
    num_servers: usize,
    first_element_offset: u64,
    stride: u64,
    element_size: u64,
    nelements: u64,
) -> FamResult<Vec<ElementTarget>> {
    if element_size == 0 {
        return Err(FamError::OutOfRange);
    }
    if stride < element_size && nelements > 1 {
        return Err(FamError::OutOfRange);
    }
    let mut targets = Vec::with_capacity(nelements as usize);
    for i in 0..nelements {
        let logical_offset = first_element_offset + i * stride;
        let (server_index, remote_offset) = interleave_map(interleave_size, num_servers, logical_offset);
        targets.push(ElementTarget {
            server_index,
            remote_offset,
            local_offset: i * element_size,
            element_size,
        });
    }
    Ok(targets)
}

/// Elements at arbitrary, explicitly-listed logical offsets, each of the
/// same `element_size`.
pub fn indexed_targets(
    interleave_size: u64,
    num_servers: usize,
    offsets: &[u64],
    element_size: u64,
) -> FamResult<Vec<ElementTarget>> {
    if element_size == 0 {
        return Err(FamError::OutOfRange);
    }
    let mut targets = Vec::with_capacity(offsets.len());
    for (i, &logical_offset) in offsets.iter().enumerate() {
        let (server_index, remote_offset) = interleave_map(interleave_size, num_servers, logical_offset);
        targets.push(ElementTarget {
            server_index,
            remote_offset,
            local_offset: i as u64 * element_size,
            element_size,
        });
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_targets_split_across_servers_round_robin() {
        let targets = strided_targets(16, 3, 0, 16, 8, 6).unwrap();
        let servers: Vec<usize> = targets.iter().map(|t| t.server_index).collect();
        assert_eq!(servers, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn strided_targets_rejects_overlapping_stride() {
        let result = strided_targets(0, 1, 0, 4, 8, 3);
        assert!(result.is_err());
    }

    #[test]
    fn indexed_targets_preserve_request_order_in_local_buffer() {
        let offsets = vec![100, 4, 52];
        let targets = indexed_targets(0, 1, &offsets, 16).unwrap();
        assert_eq!(targets[0].local_offset, 0);
        assert_eq!(targets[1].local_offset, 16);
        assert_eq!(targets[2].local_offset, 32);
        assert_eq!(targets[1].remote_offset, 4);
    }

    #[test]
    fn zero_element_size_is_rejected() {
        assert!(strided_targets(0, 1, 0, 8, 0, 1).is_err());
        assert!(indexed_targets(0, 1, &[0], 0).is_err());
    }
}
