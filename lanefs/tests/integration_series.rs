//! Integration tests for time-series writes, merges and interchange formats.

use lanefs::interval::{Interval, IntervalSet, TaggedInterval};
use lanefs::merge::{MergePlan, WriteChunk};
use lanefs::series::SeriesCarrier;
use lanefs::{
    DataType, FsId, PlacementConfig, SeriesData, SeriesRange, StoreConfig, TimeSeries, TransactionalBackend,
};
use tempfile::tempdir;

fn id(s: &str) -> FsId {
    FsId::parse(s).unwrap()
}

fn points(positions: &[i64]) -> Vec<Interval> {
    positions.iter().map(|p| Interval::new(*p, *p)).collect()
}

fn tagged(positions: &[i64], tag: u64) -> Vec<TaggedInterval> {
    positions.iter().map(|p| TaggedInterval::new(*p, *p, tag)).collect()
}

#[test]
fn test_merge_leaves_untouched_existing_alone() {
    let existing = IntervalSet::from_intervals([Interval::new(0, 4), Interval::new(8, 10)]);
    let plan = MergePlan::new(points(&[4, 6, 8]), tagged(&[4, 6, 8], 1), existing);
    let chunks: Vec<WriteChunk> = plan.chunks().collect();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].valid, points(&[4, 6, 8]));
    assert_eq!(chunks[0].originators, tagged(&[4, 6, 8], 1));
}

#[test]
fn test_merge_carves_around_existing() {
    let existing = IntervalSet::from_intervals([Interval::new(0, 4), Interval::new(5, 7), Interval::new(7, 10)]);
    let plan = MergePlan::new(points(&[4, 6, 8]), tagged(&[4, 6, 8], 1), existing);
    let chunks: Vec<WriteChunk> = plan.chunks().collect();
    assert_eq!(chunks.len(), 3);
    for (chunk, position) in chunks.iter().zip([4, 6, 8]) {
        assert_eq!(chunk.valid, points(&[position]));
        assert_eq!(chunk.originators, tagged(&[position], 1));
    }
}

#[test]
fn test_stored_series_matches_carved_merge() {
    let dir = tempdir().unwrap();
    let backend = TransactionalBackend::open(dir.path()).unwrap();
    let flux = id("/pa/target/7/flux");

    let txn = backend.begin("h").unwrap();
    let base = TimeSeries::from_gaps(
        flux.clone(),
        0,
        SeriesData::Double((0..11).map(f64::from).collect()),
        &[],
        9,
    )
    .unwrap();
    backend.write_time_series(txn, &base, false).unwrap();
    backend.commit_local(txn).unwrap();

    let txn = backend.begin("h").unwrap();
    let update = TimeSeries::new(
        flux.clone(),
        4,
        SeriesData::Double(vec![40.0, f64::NAN, 60.0, f64::NAN, 80.0]),
        points(&[4, 6, 8]),
        tagged(&[4, 6, 8], 1),
    )
    .unwrap();
    backend.write_time_series(txn, &update, false).unwrap();
    backend.commit_local(txn).unwrap();

    let txn = backend.begin("h").unwrap();
    let read = backend
        .read_time_series(txn, &[flux.clone()], SeriesRange::new(0, 10, DataType::Double))
        .unwrap()
        .remove(0);
    assert_eq!(
        read.data().as_doubles().unwrap(),
        &[0.0, 1.0, 2.0, 3.0, 40.0, 5.0, 60.0, 7.0, 80.0, 9.0, 10.0]
    );
    assert_eq!(read.valid().as_slice(), &[Interval::new(0, 10)]);
    assert_eq!(read.unique_originators().into_iter().collect::<Vec<_>>(), vec![1, 9]);

    let meta = backend.series_metadata(txn, &[flux.clone()]).unwrap().remove(0).unwrap();
    assert_eq!(meta.originators.len(), 7);
    backend.rollback(txn).unwrap();
}

#[test]
fn test_delete_interval_leaves_gap() {
    let dir = tempdir().unwrap();
    let backend = TransactionalBackend::open(dir.path()).unwrap();
    let flux = id("/pa/target/8/flux");

    let txn = backend.begin("h").unwrap();
    let series = TimeSeries::from_gaps(flux.clone(), 100, SeriesData::Int((1..=10).collect()), &[], 2).unwrap();
    backend.write_time_series(txn, &series, false).unwrap();
    backend.commit_local(txn).unwrap();

    let txn = backend.begin("h").unwrap();
    backend.delete_interval(txn, &flux, 103, 105).unwrap();
    backend.commit_local(txn).unwrap();

    let txn = backend.begin("h").unwrap();
    let read = backend
        .read_time_series(txn, &[flux.clone()], SeriesRange::new(100, 109, DataType::Int).with_fill(-9.0))
        .unwrap()
        .remove(0);
    assert_eq!(read.data().as_ints().unwrap(), &[1, 2, 3, -9, -9, -9, 7, 8, 9, 10]);
    assert_eq!(read.gap_indices(), vec![3, 4, 5]);
    backend.rollback(txn).unwrap();
}

#[test]
fn test_long_write_spans_lane_blocks() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        lanes_per_file: 3,
        lane_block_size: 256,
        ..StoreConfig::default()
    };
    let backend =
        TransactionalBackend::open_with(dir.path(), config, PlacementConfig::single_root(dir.path())).unwrap();
    let ids: Vec<FsId> = (0..5).map(|i| id(&format!("/pa/block/{i}"))).collect();

    let txn = backend.begin("h").unwrap();
    for (n, target) in ids.iter().enumerate() {
        let values: Vec<i32> = (0..1000).map(|v| v * 10 + i32::try_from(n).unwrap()).collect();
        let series = TimeSeries::from_gaps(target.clone(), 50, SeriesData::Int(values), &[], 1).unwrap();
        backend.write_time_series(txn, &series, false).unwrap();
    }
    backend.commit_local(txn).unwrap();
    assert_eq!(backend.container_files().unwrap().len(), 4);

    let txn = backend.begin("h").unwrap();
    let read = backend
        .read_time_series(txn, &ids, SeriesRange::new(50, 1049, DataType::Int))
        .unwrap();
    for (n, series) in read.iter().enumerate() {
        let expected: Vec<i32> = (0..1000).map(|v| v * 10 + i32::try_from(n).unwrap()).collect();
        assert_eq!(series.data().as_ints().unwrap(), expected.as_slice());
    }
    backend.rollback(txn).unwrap();
}

#[test]
fn test_read_series_forwards_through_carrier() {
    let dir = tempdir().unwrap();
    let backend = TransactionalBackend::open(dir.path()).unwrap();
    let flux = id("/pa/target/3/flux");

    let txn = backend.begin("h").unwrap();
    let series = TimeSeries::from_gaps(
        flux.clone(),
        0,
        SeriesData::Float(vec![1.5, 0.0, 3.5]),
        &[false, true, false],
        4,
    )
    .unwrap();
    backend.write_time_series(txn, &series, false).unwrap();
    let read = backend
        .read_time_series(txn, &[flux.clone()], SeriesRange::new(0, 2, DataType::Float))
        .unwrap()
        .remove(0);
    backend.rollback(txn).unwrap();
    assert_eq!(read, series);

    let mut wire = Vec::new();
    read.transfer_to(&mut wire).unwrap();
    let carrier = SeriesCarrier::read_from(&mut wire.as_slice()).unwrap();
    assert_eq!(carrier.id(), &flux);
    assert_eq!(carrier.payload_len(), 12);

    let mut forwarded = Vec::new();
    carrier.write_to(&mut forwarded).unwrap();
    assert_eq!(forwarded, wire);

    let text = read.to_pipe_string();
    assert_eq!(TimeSeries::from_pipe_string(&text).unwrap(), read);
    assert!(text.starts_with("/pa/target/3/flux|float|true|0|2|3|"));
}
