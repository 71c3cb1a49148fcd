use std::io::{Read, Seek, SeekFrom, Write};
use std::panic;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use sha2::{Digest, Sha256};

use crate::delta::wire::{read_header, Op, Record, RecordReader, CHECKSUM_LEN};
use crate::error::{io_error, Error, Result};

/// capacity of the queue between the decoder thread and the applier
pub const OP_QUEUE_DEPTH: usize = 2;

/// summary of a successful patch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub bytes_written: u64,
    pub copy_ops: u64,
    pub data_ops: u64,
    /// checksum carried by the delta, if any
    pub checksum: Option<[u8; CHECKSUM_LEN]>,
}

/// reconstruct `target` from `basis` and the encoded `delta`.
///
/// the header is read on the calling thread. the remaining records are
/// decoded on a second thread and handed over through a bounded queue, while
/// the calling thread applies them in order. the checksum record travels on
/// its own single-slot channel so it is still observed after the operation
/// queue has closed.
///
/// with `verify` set, a sha256 of everything written must match the delta's
/// checksum record; a delta without one fails with `MissingChecksum`.
pub fn apply<B, D, W>(basis: &mut B, mut delta: D, target: &mut W, verify: bool) -> Result<PatchStats>
where
    B: Read + Seek,
    D: Read + Send,
    W: Write,
{
    let block_size = read_header(&mut delta)?;
    tracing::debug!(block_size, verify, "applying delta");

    let (op_tx, op_rx) = channel::bounded::<Op>(OP_QUEUE_DEPTH);
    let (sum_tx, sum_rx) = channel::bounded::<[u8; CHECKSUM_LEN]>(1);
    let mut stats = PatchStats::default();
    let hasher = verify.then(Sha256::new);

    let (applied, decoded) = thread::scope(|s| {
        let decoder = s.spawn(move || decode(delta, op_tx, sum_tx));
        // op_rx is consumed here; dropping it unblocks a decoder stuck on a full queue
        let applied = apply_ops(basis, target, block_size, op_rx, hasher, &mut stats);
        let decoded = match decoder.join() {
            Ok(res) => res,
            Err(payload) => panic::resume_unwind(payload),
        };
        (applied, decoded)
    });

    let hasher = applied?;
    decoded?;
    target.flush().map_err(|e| io_error("<target>", e))?;

    // the decoder has finished, so the slot either holds the checksum or is closed
    stats.checksum = sum_rx.try_recv().ok();

    if let Some(hasher) = hasher {
        let expected = stats.checksum.ok_or(Error::MissingChecksum)?;
        let actual: [u8; CHECKSUM_LEN] = hasher.finalize().into();
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        tracing::debug!(checksum = %hex::encode(actual), "target checksum verified");
    }

    Ok(stats)
}

/// decoder thread body. returns early without error if the applier hung up.
fn decode<D: Read>(delta: D, ops: Sender<Op>, sums: Sender<[u8; CHECKSUM_LEN]>) -> Result<()> {
    let mut reader = RecordReader::new(delta);
    while let Some(record) = reader.next_record()? {
        match record {
            Record::Op(op) => {
                if ops.send(op).is_err() {
                    return Ok(());
                }
            }
            Record::Checksum(sum) => {
                // capacity 1 and sent at most once, never blocks
                let _ = sums.send(sum);
            }
        }
    }
    Ok(())
}

fn apply_ops<B, W>(
    basis: &mut B,
    target: &mut W,
    block_size: u32,
    ops: Receiver<Op>,
    mut hasher: Option<Sha256>,
    stats: &mut PatchStats,
) -> Result<Option<Sha256>>
where
    B: Read + Seek,
    W: Write,
{
    let mut buf = vec![0u8; block_size as usize];

    for op in ops.iter() {
        match op {
            Op::Block(index) => {
                copy_block(basis, target, &mut buf, index, &mut hasher, stats)?;
            }
            Op::BlockRange { first, last } => {
                for index in first..=last {
                    copy_block(basis, target, &mut buf, index, &mut hasher, stats)?;
                }
            }
            Op::Data(data) => {
                emit(target, &data, &mut hasher, stats)?;
                stats.data_ops += 1;
            }
        }
    }

    Ok(hasher)
}

fn copy_block<B, W>(
    basis: &mut B,
    target: &mut W,
    buf: &mut [u8],
    index: u64,
    hasher: &mut Option<Sha256>,
    stats: &mut PatchStats,
) -> Result<()>
where
    B: Read + Seek,
    W: Write,
{
    let offset = index
        .checked_mul(buf.len() as u64)
        .ok_or_else(|| Error::CorruptDelta(format!("block index {} overflows", index)))?;
    basis
        .seek(SeekFrom::Start(offset))
        .map_err(|e| io_error("<basis>", e))?;

    let n = read_full(basis, buf)?;
    if n == 0 {
        return Err(Error::CorruptDelta(format!(
            "block {} lies beyond the end of the basis",
            index
        )));
    }

    emit(target, &buf[..n], hasher, stats)?;
    stats.copy_ops += 1;
    Ok(())
}

/// read until `buf` is full or the basis ends
fn read_full<B: Read>(basis: &mut B, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match basis.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_error("<basis>", e)),
        }
    }
    Ok(filled)
}

fn emit<W: Write>(
    target: &mut W,
    data: &[u8],
    hasher: &mut Option<Sha256>,
    stats: &mut PatchStats,
) -> Result<()> {
    target.write_all(data).map_err(|e| io_error("<target>", e))?;
    if let Some(h) = hasher.as_mut() {
        h.update(data);
    }
    stats.bytes_written += data.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::StopSignal;
    use crate::delta::wire::DeltaWriter;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn sha256(data: &[u8]) -> [u8; CHECKSUM_LEN] {
        Sha256::digest(data).into()
    }

    fn run(basis: &[u8], delta: Vec<u8>, verify: bool) -> Result<(Vec<u8>, PatchStats)> {
        let mut basis = Cursor::new(basis.to_vec());
        let mut out = Vec::new();
        let stats = apply(&mut basis, Cursor::new(delta), &mut out, verify)?;
        Ok((out, stats))
    }

    #[test]
    fn test_copies_whole_basis_with_checksum() {
        let basis = b"AAAABBBBCCCC";
        let delta = DeltaWriter::new(12).block(0).checksum(&sha256(basis)).finish();

        let (out, stats) = run(basis, delta, true).unwrap();
        assert_eq!(out, basis);
        assert_eq!(stats.bytes_written, 12);
        assert_eq!(stats.copy_ops, 1);
        assert_eq!(stats.checksum, Some(sha256(basis)));
    }

    #[test]
    fn test_checksum_of_other_value_mismatches() {
        let basis = b"AAAABBBBCCCC";
        let delta = DeltaWriter::new(12)
            .block(0)
            .checksum(&sha256(b"AAAABBBBCCCD"))
            .finish();

        assert!(matches!(
            run(basis, delta, true),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_mixes_copies_and_inserts() {
        let basis = b"AAAABBBBCCCCDD";
        let expected = b"CCCCxyzAAAABBBBDDtail";
        let delta = DeltaWriter::new(4)
            .block(2)
            .data(b"xyz")
            .block_range(0, 1)
            .block(3)
            .data(b"tail")
            .checksum(&sha256(expected))
            .finish();

        let (out, stats) = run(basis, delta, true).unwrap();
        assert_eq!(out, expected);
        assert_eq!(stats.copy_ops, 4);
        assert_eq!(stats.data_ops, 2);
    }

    #[test]
    fn test_missing_checksum_only_matters_when_verifying() {
        let basis = b"AAAABBBB";
        let delta = DeltaWriter::new(4).block_range(0, 1).finish();

        assert!(matches!(
            run(basis, delta.clone(), true),
            Err(Error::MissingChecksum)
        ));
        let (out, stats) = run(basis, delta, false).unwrap();
        assert_eq!(out, basis);
        assert_eq!(stats.checksum, None);
    }

    #[test]
    fn test_wrong_checksum_ignored_without_verify() {
        let basis = b"AAAA";
        let delta = DeltaWriter::new(4).block(0).checksum(&[0u8; 32]).finish();
        let (out, _) = run(basis, delta, false).unwrap();
        assert_eq!(out, basis);
    }

    #[test]
    fn test_decode_error_after_last_op_is_reported() {
        let basis = b"AAAA";
        let delta = DeltaWriter::new(4).block(0).raw(&[0xee]).finish();
        assert!(matches!(run(basis, delta, false), Err(Error::CorruptDelta(_))));
    }

    #[test]
    fn test_truncated_header_is_unexpected_eof() {
        assert!(matches!(
            run(b"AAAA", vec![0x72, 0x73], true),
            Err(Error::UnexpectedEof)
        ));
    }

    #[test]
    fn test_block_past_end_of_basis_is_corrupt() {
        let delta = DeltaWriter::new(4).block(5).finish();
        assert!(matches!(run(b"AAAA", delta, false), Err(Error::CorruptDelta(_))));
    }

    #[test]
    fn test_last_block_may_be_short() {
        let basis = b"AAAABB";
        let delta = DeltaWriter::new(4)
            .block_range(0, 1)
            .checksum(&sha256(basis))
            .finish();
        let (out, _) = run(basis, delta, true).unwrap();
        assert_eq!(out, basis);
    }

    #[test]
    fn test_long_op_stream_applies_in_order() {
        // many more ops than the queue holds
        let basis: Vec<u8> = (0..=255u8).collect();
        let mut expected = Vec::new();
        let mut writer = DeltaWriter::new(16);
        for i in (0..16u64).rev() {
            writer = writer.block(i).data(&[i as u8]);
            expected.extend_from_slice(&basis[(i as usize) * 16..(i as usize + 1) * 16]);
            expected.push(i as u8);
        }
        let delta = writer.checksum(&sha256(&expected)).finish();

        let (out, stats) = run(&basis, delta, true).unwrap();
        assert_eq!(out, expected);
        assert_eq!(stats.copy_ops, 16);
        assert_eq!(stats.data_ops, 16);
    }

    #[test]
    fn test_cancelled_target_interrupts_patch() {
        let basis = vec![1u8; 64];
        let mut writer = DeltaWriter::new(4);
        for i in 0..16 {
            writer = writer.block(i);
        }
        let delta = writer.finish();

        let stop = StopSignal::new();
        stop.raise();
        let mut basis = Cursor::new(basis);
        let mut target = stop.writer(Vec::new());
        let res = apply(&mut basis, Cursor::new(delta), &mut target, false);

        assert!(matches!(res, Err(Error::Interrupted)));
        assert!(target.into_inner().is_empty());
    }

    #[test]
    fn test_cancelled_delta_interrupts_patch() {
        let delta = DeltaWriter::new(4).block(0).block(0).finish();
        let stop = StopSignal::new();

        // header is read before the signal fires
        let mut reader = stop.reader(Cursor::new(delta));
        let mut header = [0u8; 8];
        reader.read_exact(&mut header).unwrap();
        stop.raise();

        let mut prefixed = Cursor::new(header.to_vec()).chain(reader);
        let mut basis = Cursor::new(b"AAAA".to_vec());
        let mut out = Vec::new();
        let res = apply(&mut basis, &mut prefixed, &mut out, false);
        assert!(matches!(res, Err(Error::Interrupted)));
        assert!(out.is_empty());
    }

    proptest! {
        #[test]
        fn test_any_valid_delta_reconstructs_target(
            basis in proptest::collection::vec(any::<u8>(), 1..256),
            block_size in 1u32..32,
            ops in proptest::collection::vec(
                (0u8..3, any::<u64>(), any::<u64>(), proptest::collection::vec(any::<u8>(), 1..64)),
                0..40,
            ),
        ) {
            let bs = block_size as usize;
            let blocks = basis.len().div_ceil(bs) as u64;
            let block = |i: u64| {
                let start = i as usize * bs;
                &basis[start..(start + bs).min(basis.len())]
            };

            let mut writer = DeltaWriter::new(block_size);
            let mut expected = Vec::new();
            for (kind, a, b, data) in ops {
                match kind {
                    0 => {
                        let index = a % blocks;
                        writer = writer.block(index);
                        expected.extend_from_slice(block(index));
                    }
                    1 => {
                        let first = a % blocks;
                        let last = first + b % (blocks - first);
                        writer = writer.block_range(first, last);
                        for index in first..=last {
                            expected.extend_from_slice(block(index));
                        }
                    }
                    _ => {
                        writer = writer.data(&data);
                        expected.extend_from_slice(&data);
                    }
                }
            }
            let delta = writer.checksum(&sha256(&expected)).finish();

            let (out, stats) = run(&basis, delta, true).unwrap();
            prop_assert_eq!(stats.bytes_written, expected.len() as u64);
            prop_assert_eq!(out, expected);
        }
    }
}
