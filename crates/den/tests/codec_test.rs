//! Property-based tests for chunk compression.
//!
//! A chunk accepts measurements until one of its codecs cannot fit the next
//! step. Everything it accepted must decode back exactly.

use alopex_den::chunk::Chunk;
use alopex_den::meas::Measurement;
use proptest::prelude::*;

/// Increasing timestamps with deltas bounded to one second.
fn timestamp_strategy() -> impl Strategy<Value = Vec<u64>> {
    (
        0u64..1_000_000_000_000u64,
        prop::collection::vec(1u64..1_000, 1..200),
    )
        .prop_map(|(base, deltas)| {
            let mut timestamps = vec![base];
            let mut current = base;
            for delta in deltas {
                current += delta;
                timestamps.push(current);
            }
            timestamps
        })
}

/// Regular intervals with slowly varying values and occasional flag changes.
fn typical_series_strategy() -> impl Strategy<Value = Vec<Measurement>> {
    (1u64..1000, 2..300usize).prop_flat_map(|(interval, count)| {
        (
            prop::collection::vec(-1000.0f64..1000.0, count),
            prop::collection::vec(0u32..3, count),
        )
            .prop_map(move |(values, flags)| {
                values
                    .into_iter()
                    .zip(flags)
                    .enumerate()
                    .map(|(i, (v, f))| {
                        Measurement::with_flag(7, 1_000_000 + i as u64 * interval, v, f, 1)
                    })
                    .collect()
            })
    })
}

/// Appends until the chunk refuses, returning the accepted prefix.
fn fill(chunk: &mut Chunk, values: &[Measurement]) -> usize {
    let mut accepted = 1;
    for m in &values[1..] {
        if !chunk.append(m) {
            break;
        }
        accepted += 1;
    }
    accepted
}

proptest! {
    #[test]
    fn test_timestamp_roundtrip_proptest(timestamps in timestamp_strategy()) {
        let values: Vec<Measurement> = timestamps
            .iter()
            .map(|&t| Measurement::new(1, t, 1.0))
            .collect();
        let mut chunk = Chunk::create(values[0], 4096);
        let accepted = fill(&mut chunk, &values);

        let decoded = chunk.to_vec();
        prop_assert_eq!(decoded.len(), accepted);
        for (original, decoded) in values.iter().zip(decoded.iter()) {
            prop_assert_eq!(original.time, decoded.time, "Timestamp mismatch");
        }
    }

    #[test]
    fn test_typical_series_roundtrip(values in typical_series_strategy()) {
        let mut chunk = Chunk::create(values[0], 1024);
        let accepted = fill(&mut chunk, &values);
        chunk.close();

        prop_assert!(chunk.verify_checksum());
        prop_assert_eq!(chunk.header().count as usize, accepted);
        prop_assert_eq!(&chunk.to_vec()[..], &values[..accepted]);
        if accepted < values.len() {
            prop_assert!(chunk.is_full());
        }
    }

    #[test]
    fn test_refused_append_writes_nothing(values in typical_series_strategy()) {
        let mut chunk = Chunk::create(values[0], 64);
        let accepted = fill(&mut chunk, &values);
        let used = chunk.header().used_bytes;
        if accepted < values.len() {
            prop_assert!(!chunk.append(&values[accepted]));
            prop_assert_eq!(chunk.header().used_bytes, used);
            prop_assert_eq!(chunk.to_vec().len(), accepted);
        }
    }

    #[test]
    fn test_identical_values_compress_well(value in -1000.0f64..1000.0, count in 10usize..100) {
        let values: Vec<Measurement> = (0..count as u64)
            .map(|i| Measurement::new(2, 1000 + i * 1000, value))
            .collect();
        let mut chunk = Chunk::create(values[0], 1024);
        prop_assert_eq!(fill(&mut chunk, &values), count);

        // Constant step, value, flag and source cost about four bits per measurement.
        let used = chunk.header().used_bytes as usize;
        prop_assert!(used <= count.div_ceil(2) + 16, "used {} bytes for {} values", used, count);
    }
}

#[test]
fn test_other_series_is_refused() {
    let mut chunk = Chunk::create(Measurement::new(1, 10, 1.0), 256);
    assert!(!chunk.append(&Measurement::new(2, 11, 1.0)));
    assert!(chunk.append(&Measurement::new(1, 11, 1.0)));
    assert_eq!(chunk.header().count, 2);
}
