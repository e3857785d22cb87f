//! Block framing and XOR fragment arithmetic
//!
//! A block payload is framed with a length-and-flags header, zero padded so
//! the frame splits into equal data segments, and each parity segment is the
//! XOR of its group's data segments. Segment length stays a multiple of 4
//! bytes to keep the on-disk format word aligned.

use bytes::Bytes;

use crate::ecc::EccMap;
use crate::error::{Error, Result};

/// 8 bytes payload length (u64 BE) + 1 flags byte.
pub const FRAME_HEADER_LEN: usize = 9;

/// Flags bit 0: this is the final block of the stream.
pub const FLAG_LAST_BLOCK: u8 = 0x01;

const WORD: usize = 4;

/// All fragments of one freshly encoded block.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub data: Vec<Bytes>,
    pub parity: Vec<Bytes>,
    pub seg_length: usize,
}

/// Result of decoding one block back into its payload.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub payload: Bytes,
    pub last_block: bool,
}

/// Fragments recovered in place by [`rebuild_block`].
#[derive(Debug, Clone, Default)]
pub struct RebuildOutcome {
    pub rebuilt_data: Vec<usize>,
    pub rebuilt_parity: Vec<usize>,
}

impl RebuildOutcome {
    pub fn made_progress(&self) -> bool {
        !self.rebuilt_data.is_empty() || !self.rebuilt_parity.is_empty()
    }
}

/// Frame `payload` and split it into N data + N parity fragments.
pub fn encode_block(map: &EccMap, payload: &[u8], last_block: bool) -> Result<EncodedBlock> {
    let data_segments = map.data_segments();
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    framed.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    framed.push(if last_block { FLAG_LAST_BLOCK } else { 0 });
    framed.extend_from_slice(payload);

    let step = data_segments * WORD;
    let padded = (framed.len() + step - 1) / step * step;
    framed.resize(padded, 0);
    let seg_length = framed.len() / data_segments;

    let data: Vec<Bytes> = framed
        .chunks(seg_length)
        .map(Bytes::copy_from_slice)
        .collect();
    let mut parity = Vec::with_capacity(map.parity_segments());
    for parity_num in 0..map.parity_segments() {
        let mut buf = vec![0u8; seg_length];
        for &member in map.parity_group(parity_num) {
            xor_into(&mut buf, &data[member]);
        }
        parity.push(Bytes::from(buf));
    }

    Ok(EncodedBlock {
        data,
        parity,
        seg_length,
    })
}

/// Recover every reachable missing fragment in place.
///
/// Runs the data pass to a fixed point, then a single parity pass, exactly
/// mirroring the presence math in [`EccMap::fixable`]. Returns which slots
/// were filled; an empty outcome is not an error.
pub fn rebuild_block(
    map: &EccMap,
    data: &mut [Option<Bytes>],
    parity: &mut [Option<Bytes>],
) -> Result<RebuildOutcome> {
    let seg_length = check_geometry(map, data, parity)?;
    let mut outcome = RebuildOutcome::default();

    let mut made_progress = true;
    while made_progress {
        made_progress = false;
        for seg in 0..map.data_segments() {
            if data[seg].is_some() {
                continue;
            }
            let have_data: Vec<bool> = data.iter().map(Option::is_some).collect();
            let have_parity: Vec<bool> = parity.iter().map(Option::is_some).collect();
            let Some((parity_num, members)) = map.data_fix_path(&have_data, &have_parity, seg)
            else {
                continue;
            };
            let Some(parity_buf) = parity[parity_num].as_ref() else {
                continue;
            };
            let mut buf = parity_buf.to_vec();
            let mut complete = true;
            for &member in members {
                if member == seg {
                    continue;
                }
                match data[member].as_ref() {
                    Some(segment) => xor_into(&mut buf, segment),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }
            data[seg] = Some(Bytes::from(buf));
            outcome.rebuilt_data.push(seg);
            made_progress = true;
        }
    }

    for parity_num in 0..map.parity_segments() {
        if parity[parity_num].is_some() {
            continue;
        }
        let members = map.parity_group(parity_num);
        if members.iter().any(|&member| data[member].is_none()) {
            continue;
        }
        let mut buf = vec![0u8; seg_length];
        for &member in members {
            if let Some(segment) = data[member].as_ref() {
                xor_into(&mut buf, segment);
            }
        }
        parity[parity_num] = Some(Bytes::from(buf));
        outcome.rebuilt_parity.push(parity_num);
    }

    Ok(outcome)
}

/// Reconstruct the block payload from whatever fragments are on hand.
///
/// Missing data segments are rebuilt first; if any remain missing the block
/// is unrecoverable and the caller should go collect more fragments.
pub fn decode_block(
    map: &EccMap,
    data: &mut [Option<Bytes>],
    parity: &mut [Option<Bytes>],
) -> Result<DecodedBlock> {
    rebuild_block(map, data, parity)?;

    let available = data.iter().filter(|segment| segment.is_some()).count();
    if available < map.data_segments() {
        return Err(Error::BlockUnrecoverable {
            available,
            required: map.data_segments(),
        });
    }

    let mut framed = Vec::new();
    for segment in data.iter().flatten() {
        framed.extend_from_slice(segment);
    }
    if framed.len() < FRAME_HEADER_LEN {
        return Err(Error::FrameTruncated {
            got: framed.len(),
            need: FRAME_HEADER_LEN,
        });
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&framed[..8]);
    let payload_len = u64::from_be_bytes(len_bytes) as usize;
    let flags = framed[8];
    if flags & !FLAG_LAST_BLOCK != 0 {
        return Err(Error::FrameCorrupt(format!("unknown flags 0x{:02x}", flags)));
    }
    if payload_len > framed.len() - FRAME_HEADER_LEN {
        return Err(Error::FrameCorrupt(format!(
            "payload length {} exceeds {} framed bytes",
            payload_len,
            framed.len() - FRAME_HEADER_LEN
        )));
    }

    Ok(DecodedBlock {
        payload: Bytes::copy_from_slice(
            &framed[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload_len],
        ),
        last_block: flags & FLAG_LAST_BLOCK != 0,
    })
}

fn check_geometry(
    map: &EccMap,
    data: &[Option<Bytes>],
    parity: &[Option<Bytes>],
) -> Result<usize> {
    if data.len() != map.data_segments() || parity.len() != map.parity_segments() {
        return Err(Error::Internal(format!(
            "fragment vectors {}+{} do not match map {}",
            data.len(),
            parity.len(),
            map
        )));
    }
    let mut expected: Option<usize> = None;
    for (slot, fragment) in data.iter().enumerate() {
        if let Some(segment) = fragment {
            match expected {
                None => expected = Some(segment.len()),
                Some(len) if len != segment.len() => {
                    return Err(Error::FragmentLengthMismatch {
                        slot,
                        got: segment.len(),
                        expected: len,
                    })
                }
                Some(_) => {}
            }
        }
    }
    for (slot, fragment) in parity.iter().enumerate() {
        if let Some(segment) = fragment {
            match expected {
                None => expected = Some(segment.len()),
                Some(len) if len != segment.len() => {
                    return Err(Error::FragmentLengthMismatch {
                        slot,
                        got: segment.len(),
                        expected: len,
                    })
                }
                Some(_) => {}
            }
        }
    }
    expected.ok_or(Error::BlockUnrecoverable {
        available: 0,
        required: map.data_needed(),
    })
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn presence(fragments: &[Option<Bytes>]) -> Vec<bool> {
        fragments.iter().map(Option::is_some).collect()
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    fn to_options(fragments: &[Bytes]) -> Vec<Option<Bytes>> {
        fragments.iter().cloned().map(Some).collect()
    }

    #[test]
    fn test_encode_shapes() {
        let map = EccMap::new(4).unwrap();
        let block = encode_block(&map, &random_payload(100), false).unwrap();
        assert_eq!(block.data.len(), 4);
        assert_eq!(block.parity.len(), 4);
        assert_eq!(block.seg_length % 4, 0);
        for fragment in block.data.iter().chain(block.parity.iter()) {
            assert_eq!(fragment.len(), block.seg_length);
        }
    }

    #[test]
    fn test_round_trip_all_present() {
        let map = EccMap::new(2).unwrap();
        let payload = random_payload(333);
        let block = encode_block(&map, &payload, true).unwrap();
        let mut data = to_options(&block.data);
        let mut parity = to_options(&block.parity);
        let decoded = decode_block(&map, &mut data, &mut parity).unwrap();
        assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        assert!(decoded.last_block);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let map = EccMap::new(4).unwrap();
        let block = encode_block(&map, &[], false).unwrap();
        let mut data = to_options(&block.data);
        let mut parity = to_options(&block.parity);
        let decoded = decode_block(&map, &mut data, &mut parity).unwrap();
        assert!(decoded.payload.is_empty());
        assert!(!decoded.last_block);
    }

    #[test]
    fn test_round_trip_with_supplier_loss() {
        // Losing the first correctable_errors suppliers entirely must still
        // round-trip for every supported map.
        for n in crate::ecc::SUPPORTED_SUPPLIER_COUNTS {
            let map = EccMap::new(n).unwrap();
            let payload = random_payload(1024 + n);
            let block = encode_block(&map, &payload, false).unwrap();
            let mut data = to_options(&block.data);
            let mut parity = to_options(&block.parity);
            for slot in 0..map.correctable_errors() {
                data[slot] = None;
                parity[slot] = None;
            }
            assert!(map.fixable(&presence(&data), &presence(&parity)));
            let decoded = decode_block(&map, &mut data, &mut parity).unwrap();
            assert_eq!(
                decoded.payload.as_ref(),
                payload.as_slice(),
                "round trip failed for {} suppliers",
                n
            );
        }
    }

    #[test]
    fn test_rebuild_restores_exact_fragments() {
        let map = EccMap::new(4).unwrap();
        let block = encode_block(&map, &random_payload(500), false).unwrap();
        let mut data = to_options(&block.data);
        let mut parity = to_options(&block.parity);
        data[1] = None;
        parity[3] = None;

        let outcome = rebuild_block(&map, &mut data, &mut parity).unwrap();
        assert_eq!(outcome.rebuilt_data, vec![1]);
        assert_eq!(outcome.rebuilt_parity, vec![3]);
        assert_eq!(data[1].as_ref().unwrap(), &block.data[1]);
        assert_eq!(parity[3].as_ref().unwrap(), &block.parity[3]);
    }

    #[test]
    fn test_rebuild_reports_no_progress_when_complete() {
        let map = EccMap::new(2).unwrap();
        let block = encode_block(&map, b"abc", false).unwrap();
        let mut data = to_options(&block.data);
        let mut parity = to_options(&block.parity);
        let outcome = rebuild_block(&map, &mut data, &mut parity).unwrap();
        assert!(!outcome.made_progress());
    }

    #[test]
    fn test_decode_unrecoverable() {
        let map = EccMap::new(2).unwrap();
        let block = encode_block(&map, b"hello", false).unwrap();
        // Parity 0 covers only data 1, so data 0 stays lost.
        let mut data = vec![None, None];
        let mut parity = vec![Some(block.parity[0].clone()), None];
        let err = decode_block(&map, &mut data, &mut parity).unwrap_err();
        assert!(matches!(err, Error::BlockUnrecoverable { .. }));
    }

    #[test]
    fn test_decode_rejects_corrupt_header() {
        let map = EccMap::new(2).unwrap();
        let block = encode_block(&map, b"hi", false).unwrap();
        let mut first = block.data[0].to_vec();
        first[..8].copy_from_slice(&u64::MAX.to_be_bytes());
        let mut data = vec![Some(Bytes::from(first)), Some(block.data[1].clone())];
        let mut parity = vec![None, None];
        let err = decode_block(&map, &mut data, &mut parity).unwrap_err();
        assert!(matches!(err, Error::FrameCorrupt(_)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let map = EccMap::new(2).unwrap();
        let block = encode_block(&map, b"some payload", false).unwrap();
        let truncated = Bytes::copy_from_slice(&block.data[1][..block.seg_length - 4]);
        let mut data = vec![Some(block.data[0].clone()), Some(truncated)];
        let mut parity = to_options(&block.parity);
        let err = decode_block(&map, &mut data, &mut parity).unwrap_err();
        assert!(matches!(err, Error::FragmentLengthMismatch { .. }));
    }

    #[test]
    fn test_no_fragments_at_all() {
        let map = EccMap::new(4).unwrap();
        let mut data = vec![None; 4];
        let mut parity = vec![None; 4];
        let err = decode_block(&map, &mut data, &mut parity).unwrap_err();
        assert!(matches!(err, Error::BlockUnrecoverable { .. }));
    }
}
