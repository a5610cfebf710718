//! The `memserverinfo` flat wire format (spec.md §6): a sequence of
//! `u64 node_id | usize addr_size | byte[addr_size] fabric_address`
//! records, native-endian, consumed until the declared byte count is
//! exhausted. Interop is in-cluster only (spec.md §9 open question 3).

use crate::error::{FamError, FamResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemserverInfoEntry {
    pub node_id: u64,
    pub fabric_address: Vec<u8>,
}

pub fn encode(entries: &[MemserverInfoEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        buf.extend_from_slice(&entry.node_id.to_ne_bytes());
        buf.extend_from_slice(&(entry.fabric_address.len() as u64).to_ne_bytes());
        buf.extend_from_slice(&entry.fabric_address);
    }
    buf
}

pub fn decode(mut bytes: &[u8]) -> FamResult<Vec<MemserverInfoEntry>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 16 {
            return Err(FamError::Rpc("truncated memserverinfo stream".into()));
        }
        let node_id = u64::from_ne_bytes(bytes[0..8].try_into().unwrap());
        let addr_size = u64::from_ne_bytes(bytes[8..16].try_into().unwrap()) as usize;
        bytes = &bytes[16..];
        if bytes.len() < addr_size {
            return Err(FamError::Rpc("truncated memserverinfo address".into()));
        }
        let fabric_address = bytes[..addr_size].to_vec();
        bytes = &bytes[addr_size..];
        entries.push(MemserverInfoEntry {
            node_id,
            fabric_address,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_multiple_entries() {
        let entries = vec![
            MemserverInfoEntry {
                node_id: 0,
                fabric_address: vec![1, 2, 3],
            },
            MemserverInfoEntry {
                node_id: 1,
                fabric_address: vec![],
            },
            MemserverInfoEntry {
                node_id: 2,
                fabric_address: vec![9; 32],
            },
        ];
        let encoded = encode(&entries);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn rejects_truncated_stream() {
        let entries = vec![MemserverInfoEntry {
            node_id: 0,
            fabric_address: vec![1, 2, 3, 4],
        }];
        let encoded = encode(&entries);
        assert!(decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
