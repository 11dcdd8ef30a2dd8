//! End-to-end passes of the consumer over replayed captures.

mod common;

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use common::{probe, Collected};
use dtconsume::action::ActionKind;
use dtconsume::quantize::{LQuantizeArg, QUANTIZE_NBUCKETS, QUANTIZE_ZEROBUCKET};
use dtconsume::replay::{EngineCall, KernelSymbol};
use dtconsume::{
    AggVarId, BucketRange, Capture, Config, Consumer, DecodedValue, Engine, HistogramBucket,
    RecordBuffer, ReplayEngine,
};
use tempfile::TempDir;

fn bucket(min: i64, max: i64, count: i64) -> HistogramBucket {
    HistogramBucket {
        range: BucketRange::new(min, max),
        count,
    }
}

#[test]
fn test_count_aggregation_is_delivered_and_removed() {
    let mut engine = ReplayEngine::default();
    engine.push_aggregation(
        RecordBuffer::for_aggregation(AggVarId(1))
            .string("a", 16)
            .int(ActionKind::DifExpr, 1, 8)
            .words(ActionKind::Count, &[5])
            .into_aggregation("calls"),
    );

    let mut sink = Collected::default();
    let delivered = Consumer::new()
        .aggregate_walk(&mut engine, &mut sink)
        .unwrap();

    assert_eq!(delivered, 1);
    assert_eq!(
        sink.aggregates,
        vec![(
            AggVarId(1),
            vec![DecodedValue::from("a"), DecodedValue::Integer(1)],
            DecodedValue::Integer(5)
        )]
    );
    assert_eq!(engine.stored_aggregations().count(), 0);
}

#[test]
fn test_histograms_share_ranges_across_tuples() {
    let mut counts = vec![0i64; QUANTIZE_NBUCKETS];
    counts[QUANTIZE_ZEROBUCKET] = 3;
    counts[QUANTIZE_ZEROBUCKET + 2] = 2;

    let mut engine = ReplayEngine::default();
    for key in ["read", "write"] {
        engine.push_aggregation(
            RecordBuffer::for_aggregation(AggVarId(2))
                .string(key, 32)
                .words(ActionKind::Quantize, &counts)
                .into_aggregation("latency"),
        );
    }
    let arg = LQuantizeArg::new(0, 10, 3);
    engine.push_aggregation(
        RecordBuffer::for_aggregation(AggVarId(3))
            .words(
                ActionKind::LQuantize,
                &[arg.raw() as i64, 1, 0, 4, 0, 6],
            )
            .into_aggregation("sizes"),
    );

    let mut sink = Collected::default();
    let mut consumer = Consumer::new();
    assert_eq!(consumer.aggregate_walk(&mut engine, &mut sink).unwrap(), 3);

    let expected = vec![bucket(0, 0, 3), bucket(2, 3, 2)];
    assert_eq!(sink.aggregates[0].2.as_histogram().unwrap(), expected.as_slice());
    assert_eq!(sink.aggregates[1].2.as_histogram().unwrap(), expected.as_slice());
    assert_eq!(sink.aggregates[1].1, vec![DecodedValue::from("write")]);
    assert_eq!(
        sink.aggregates[2].2.as_histogram().unwrap(),
        &[
            bucket(i64::MIN, -1, 1),
            bucket(10, 19, 4),
            bucket(30, i64::MAX, 6)
        ]
    );
}

#[test]
fn test_consume_routes_values_and_printf() {
    let capture = Capture {
        kernel_symbols: vec![KernelSymbol {
            addr: 0xffff_0000,
            size: 0x100,
            name: "vmlinux`ksys_read".to_string(),
        }],
        probes: vec![RecordBuffer::new()
            .int(ActionKind::DifExpr, -7, 4)
            .kernel_addr(ActionKind::Sym, 0xffff_0008)
            .kernel_addr(ActionKind::Mod, 0xffff_0008)
            .printf()
            .into_probe(probe("syscall", "read", "entry"), vec!["fd=3\n".to_string()])],
        ..Capture::default()
    };
    let mut engine = ReplayEngine::from_capture(capture);

    let mut sink = Collected::default();
    Consumer::new().consume(&mut engine, &mut sink).unwrap();

    let values: Vec<_> = sink.events.iter().map(|(_, v)| v.clone()).collect();
    assert_eq!(
        values,
        vec![
            DecodedValue::Integer(-7),
            DecodedValue::from("vmlinux`ksys_read"),
            DecodedValue::from("vmlinux"),
        ]
    );
    assert_eq!(sink.printfs.len(), 1);
    assert_eq!(sink.printfs[0].0.to_string(), "syscall::read:entry");
    assert_eq!(sink.printfs[0].1, "fd=3\n");
}

#[test]
fn test_unsupported_record_stops_the_pass() {
    let mut engine = ReplayEngine::default();
    engine.push_probe(
        RecordBuffer::new()
            .int(ActionKind::DifExpr, 1, 8)
            .kernel_addr(ActionKind::Stack, 0)
            .into_probe(probe("syscall", "read", "entry"), vec![]),
    );
    engine.push_probe(
        RecordBuffer::new()
            .int(ActionKind::DifExpr, 2, 8)
            .into_probe(probe("syscall", "write", "entry"), vec![]),
    );

    let mut sink = Collected::default();
    let err = Consumer::new()
        .consume(&mut engine, &mut sink)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "unsupported action stack() in record for syscall::read:entry"
    );
    assert_eq!(sink.events.len(), 1);
    assert_eq!(engine.pending_probes(), 1);
}

#[test]
fn test_walk_errors_leave_the_store_alone() {
    let mut engine = ReplayEngine::default();
    for key in 0..2 {
        engine.push_aggregation(
            RecordBuffer::for_aggregation(AggVarId(4))
                .int(ActionKind::DifExpr, key, 8)
                .kernel_addr(ActionKind::Stack, 0)
                .words(ActionKind::Count, &[1])
                .into_aggregation("stacks"),
        );
    }

    let mut sink = Collected::default();
    let mut consumer = Consumer::new();
    let err = consumer
        .aggregate_walk(&mut engine, &mut sink)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "unsupported action stack() as key #2 in aggregation \"stacks\""
    );
    assert!(sink.aggregates.is_empty());
    assert_eq!(engine.stored_aggregations().count(), 2);

    engine.inject_failure(EngineCall::Snapshot, "snapshot buffer gone.\n");
    let err = consumer
        .aggregate_walk(&mut engine, &mut sink)
        .unwrap_err();
    assert_eq!(err.to_string(), "couldn't snap aggregate: snapshot buffer gone.");

    consumer.aggregate_clear(&mut engine).unwrap();
    assert_eq!(engine.stored_aggregations().count(), 0);
}

#[test]
fn test_run_capture_file() {
    let capture = Capture {
        probes: vec![RecordBuffer::new()
            .int(ActionKind::DifExpr, 42, 8)
            .into_probe(probe("profile", "", "tick-1s"), vec![])],
        aggregations: vec![RecordBuffer::for_aggregation(AggVarId(1))
            .words(ActionKind::Avg, &[4, 10])
            .into_aggregation("mean")],
        ..Capture::default()
    };

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("capture.json");
    std::fs::write(&path, serde_json::to_string_pretty(&capture).unwrap()).unwrap();

    let mut engine = ReplayEngine::load(&path).unwrap();
    let config = Config {
        interval: Duration::from_millis(1),
        ..Config::default()
    };
    let mut sink = Collected::default();
    let passes = Consumer::new()
        .run(&mut engine, &mut sink, &config, &AtomicBool::new(false))
        .unwrap();

    // The second pass sees the engine exited.
    assert_eq!(passes, 2);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0].1, DecodedValue::Integer(42));
    assert_eq!(
        sink.aggregates,
        vec![(AggVarId(1), vec![], DecodedValue::Average(2.5))]
    );
}

#[test]
fn test_run_stops_after_final_pass() {
    let mut engine = ReplayEngine::default();
    engine.push_probe(
        RecordBuffer::new()
            .int(ActionKind::DifExpr, 1, 8)
            .into_probe(probe("profile", "", "tick-1s"), vec![]),
    );
    engine.push_aggregation(
        RecordBuffer::for_aggregation(AggVarId(1))
            .words(ActionKind::Sum, &[9])
            .into_aggregation("total"),
    );

    let config = Config {
        interval: Duration::from_secs(60),
        clear: true,
        ..Config::default()
    };
    let mut sink = Collected::default();
    let passes = Consumer::new()
        .run(&mut engine, &mut sink, &config, &AtomicBool::new(true))
        .unwrap();

    assert_eq!(passes, 1);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.aggregates.len(), 1);
    assert_eq!(engine.status().unwrap(), dtconsume::EngineStatus::Exited);
}

#[test]
fn test_missing_capture_file() {
    let dir = TempDir::new().unwrap();
    let err = ReplayEngine::load(&dir.path().join("nope.json"))
        .err()
        .unwrap();
    assert!(err.to_string().starts_with("Failed to read capture"));
}
