use infermesh::core::distribution::transfer::{bitset_from_indexes, indexes_from_bitset};
use infermesh::core::transport::framing::{ProtocolId, from_wire, to_wire};

#[derive(bincode::Encode, bincode::Decode, Debug, PartialEq)]
struct Sample {
    id: u64,
    name: String,
    payload: Vec<u8>,
}

#[tokio::test]
async fn test_wire_round_trip() {
    let sample = Sample {
        id: 42,
        name: "chunk".to_string(),
        payload: vec![1, 2, 3],
    };
    let bytes = to_wire(&sample).unwrap();
    let decoded: Sample = from_wire(&bytes).unwrap();
    assert_eq!(decoded, sample);
}

#[tokio::test]
async fn test_trailing_bytes_are_rejected() {
    let sample = Sample {
        id: 1,
        name: String::new(),
        payload: Vec::new(),
    };
    let mut bytes = to_wire(&sample).unwrap();
    bytes.push(0xAB);
    assert!(from_wire::<Sample>(&bytes).is_err());
}

#[tokio::test]
async fn test_truncated_record_is_rejected() {
    let sample = Sample {
        id: 1,
        name: "x".to_string(),
        payload: vec![0; 16],
    };
    let bytes = to_wire(&sample).unwrap();
    assert!(from_wire::<Sample>(&bytes[..bytes.len() - 1]).is_err());
}

#[tokio::test]
async fn test_protocol_ids_round_trip() {
    for protocol in [
        ProtocolId::Raft,
        ProtocolId::StateGossip,
        ProtocolId::ChunkTransfer,
        ProtocolId::SchedulerProxy,
        ProtocolId::Health,
    ] {
        assert_eq!(ProtocolId::from_u8(protocol as u8), Some(protocol));
    }
    assert_eq!(ProtocolId::from_u8(0), None);
    assert_eq!(ProtocolId::from_u8(99), None);
}

#[tokio::test]
async fn test_bitset_round_trip() {
    let wanted = vec![0, 3, 8, 15, 16];
    let bits = bitset_from_indexes(17, &wanted);
    assert_eq!(bits.len(), 3);
    assert_eq!(indexes_from_bitset(&bits, 17), wanted);
}

#[tokio::test]
async fn test_bitset_ignores_out_of_range_indexes() {
    let bits = bitset_from_indexes(8, &[2, 100]);
    assert_eq!(indexes_from_bitset(&bits, 8), vec![2]);
}

#[tokio::test]
async fn test_empty_bitset() {
    let bits = bitset_from_indexes(10, &[]);
    assert!(indexes_from_bitset(&bits, 10).is_empty());
}
