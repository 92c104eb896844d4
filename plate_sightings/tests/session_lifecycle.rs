mod common;

use std::fs;

use opencv::core::{Scalar, CV_8U};
use opencv::prelude::Mat;

use common::{car, Harness};
use plate_sightings::alpr::aggregator::ReadTier;
use plate_sightings::alpr::index::PlateIndex;
use plate_sightings::alpr::recovery::recover_leftovers;
use plate_sightings::alpr::registry::VehicleState;
use plate_sightings::types::BoundingBox;

#[test]
fn departed_target_is_finalized_once() {
    let mut harness = Harness::new();

    for frame in 10..=15 {
        let reading = (frame == 12).then_some(("ABC123", 90));
        let report = harness.frame(frame, &[(1, car())], reading);
        assert_eq!(report.active_ids, vec![1]);
        if frame < 12 {
            assert!(report.target_ids.is_empty());
        } else {
            assert_eq!(report.target_ids, vec![1]);
            assert_eq!(report.consensus[0].1.text, "ABC123");
        }
    }
    assert_eq!(harness.transient_dirs().len(), 1);

    let report = harness.frame(16, &[], None);
    assert!(report.active_ids.is_empty());
    assert_eq!(report.finalized.len(), 1);
    let record = &report.finalized[0];
    assert_eq!(record.plate, "ABC123");

    let index = PlateIndex::in_output_dir(&harness.output()).unwrap();
    assert_eq!(index.read("ABC123").unwrap(), vec![record.clone()]);
    assert_eq!(index.read_all().unwrap().len(), 1);

    for path in [
        &record.video_path,
        &record.vehicle_still_path,
        &record.plate_still_path,
    ] {
        let path = path.as_ref().expect("artifact recorded");
        assert!(harness.output().join(path).is_file(), "{path} missing");
    }
    assert!(record.video_path.as_deref().unwrap().ends_with("video.avi"));
    assert!(harness.transient_dirs().is_empty());

    // nothing left to finalize
    assert!(harness.frame(17, &[], None).finalized.is_empty());
    assert!(harness.session.finish().is_empty());
    assert_eq!(index.read("ABC123").unwrap().len(), 1);
}

#[test]
fn reused_track_id_is_an_unrelated_vehicle() {
    let mut harness = Harness::new();

    harness.frame(1, &[(7, car())], Some(("AAA111", 95)));
    harness.frame(2, &[(7, car())], Some(("AAA111", 95)));
    let first = harness.frame(3, &[], None).finalized;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].plate, "AAA111");

    let report = harness.frame(4, &[(7, car())], None);
    assert!(report.target_ids.is_empty());
    assert_eq!(
        harness.session.registry().get(7).unwrap().state(),
        VehicleState::New
    );

    let report = harness.frame(5, &[(7, car())], Some(("BBB222", 80)));
    assert_eq!(report.target_ids, vec![7]);
    assert_eq!(report.consensus.len(), 1);
    assert_eq!(report.consensus[0].1.text, "BBB222");
    assert_eq!(report.consensus[0].1.votes, 1);
    let second = harness.session.registry().get(7).unwrap();
    assert_eq!(second.events().len(), 1);
    assert_eq!(second.first_frame(), 4);

    let second = harness.frame(6, &[], None).finalized;
    assert_eq!(second[0].plate, "BBB222");
    assert_ne!(first[0].record_id, second[0].record_id);

    let index = PlateIndex::in_output_dir(&harness.output()).unwrap();
    assert_eq!(index.read("AAA111").unwrap().len(), 1);
    assert_eq!(index.read("BBB222").unwrap().len(), 1);
}

#[test]
fn stream_end_finalizes_targets_still_in_view() {
    let mut harness = Harness::new();

    let van = BoundingBox::new(420, 50, 620, 250);
    harness.frame(1, &[(3, car()), (4, van)], None);
    let report = harness.frame(2, &[(3, car()), (4, van)], Some(("XYZ789", 70)));
    assert_eq!(report.target_ids, vec![3, 4]);
    let report = harness.frame(3, &[(3, car())], None);
    assert_eq!(report.finalized.len(), 1);

    let records = harness.session.finish();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].plate, "XYZ789");
    assert!(harness.session.registry().is_empty());
    assert!(harness.transient_dirs().is_empty());

    let index = PlateIndex::in_output_dir(&harness.output()).unwrap();
    assert_eq!(index.read("XYZ789").unwrap().len(), 2);
}

#[test]
fn stream_end_can_discard_targets() {
    let mut harness = Harness::with_config(|config| config.finalize_on_stream_end = false);

    harness.frame(1, &[(3, car())], Some(("XYZ789", 70)));
    harness.frame(2, &[(3, car())], None);

    assert!(harness.session.finish().is_empty());
    assert!(harness.transient_dirs().is_empty());
    let index = PlateIndex::in_output_dir(&harness.output()).unwrap();
    assert!(index.read_all().unwrap().is_empty());
}

#[test]
fn vehicle_without_qualifying_read_leaves_no_trace() {
    let mut harness = Harness::new();

    let report = harness.frame(1, &[(2, car())], Some(("QWE987", 30)));
    assert_eq!(report.reads.len(), 1);
    assert_eq!(report.reads[0].tier, ReadTier::LowConfidence);
    assert!(report.consensus.is_empty());

    let report = harness.frame(2, &[(2, car())], Some(("QW", 99)));
    assert_eq!(report.reads[0].tier, ReadTier::Partial);

    let report = harness.frame(3, &[(2, car())], None);
    assert_eq!(report.reads[0].tier, ReadTier::Unknown);
    assert!(report.target_ids.is_empty());

    let report = harness.frame(4, &[], None);
    assert!(report.finalized.is_empty());
    assert!(harness.transient_dirs().is_empty());
    let index = PlateIndex::in_output_dir(&harness.output()).unwrap();
    assert!(index.read_all().unwrap().is_empty());
}

#[test]
fn lost_frames_still_commit_the_record() {
    let mut harness = Harness::new();

    harness.frame(1, &[(5, car())], Some(("LMN456", 88)));
    harness.frame(2, &[(5, car())], Some(("LMN456", 88)));
    let vehicle_dir = harness.transient_dirs().pop().unwrap();
    fs::remove_dir_all(vehicle_dir.join("frames")).unwrap();

    let report = harness.frame(3, &[], None);
    assert_eq!(report.finalized.len(), 1);
    let record = &report.finalized[0];
    assert_eq!(record.plate, "LMN456");
    assert!(record.video_path.is_none());
    assert!(record.vehicle_still_path.is_none());
    assert!(record.plate_still_path.is_none());
    assert!(!vehicle_dir.exists());
    assert!(harness.record_dirs().is_empty());
}

#[test]
fn corrupt_index_keeps_transient_evidence() {
    let mut harness = Harness::new();

    harness.frame(1, &[(6, car())], Some(("JKL321", 77)));
    let index_path = harness.session.index().path().to_path_buf();
    fs::write(&index_path, "not json").unwrap();

    let report = harness.frame(2, &[], None);
    assert!(report.finalized.is_empty());
    assert_eq!(fs::read_to_string(&index_path).unwrap(), "not json");

    let kept = harness.transient_dirs();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].join("frames").join("1.jpg").is_file());
    assert!(kept[0].join("plates.jsonl").is_file());
    assert!(harness.record_dirs().is_empty());
}

#[test]
fn kept_vehicle_is_recovered_once_the_index_is_repaired() {
    let mut harness = Harness::new();

    harness.frame(1, &[(6, car())], Some(("JKL321", 77)));
    harness.frame(2, &[(6, car())], Some(("JKL321", 81)));
    let index_path = harness.session.index().path().to_path_buf();
    fs::write(&index_path, "not json").unwrap();
    assert!(harness.frame(3, &[], None).finalized.is_empty());
    assert!(recover_leftovers(&harness.output(), &harness.config.video, 10.0).is_err());

    fs::write(&index_path, "{}").unwrap();
    let recovered = recover_leftovers(&harness.output(), &harness.config.video, 10.0).unwrap();
    assert_eq!(recovered.len(), 1);
    let record = recovered[0].outcome.as_ref().unwrap();
    assert_eq!(record.plate, "JKL321");
    assert!(record.video_path.is_some());
    assert!(record.plate_still_path.is_some());

    assert!(harness.transient_dirs().is_empty());
    assert_eq!(harness.record_dirs().len(), 1);
    let index = PlateIndex::open(&index_path).unwrap();
    assert_eq!(index.read("JKL321").unwrap(), vec![record.clone()]);

    // a second pass finds nothing left to do
    assert!(recover_leftovers(&harness.output(), &harness.config.video, 10.0)
        .unwrap()
        .is_empty());
    assert_eq!(harness.record_dirs().len(), 1);
}

#[test]
fn annotation_failure_keeps_the_frame_report() {
    let mut harness = Harness::new();

    harness.frame(1, &[(1, car())], Some(("ABC123", 90)));
    harness.frame(2, &[(1, car())], Some(("ABC123", 90)));

    // drawing rejects images with more than four channels
    let five_channels = CV_8U + (4 << 3);
    let image =
        Mat::new_rows_cols_with_default(480, 640, five_channels, Scalar::all(80.0)).unwrap();
    let report = harness.frame_with(3, image, &[(2, car())], None);

    assert_eq!(report.finalized.len(), 1);
    assert_eq!(report.finalized[0].plate, "ABC123");
    assert_eq!(report.active_ids, vec![2]);
    let index = PlateIndex::in_output_dir(&harness.output()).unwrap();
    assert_eq!(index.read("ABC123").unwrap().len(), 1);
}

#[test]
fn checkpoints_mirror_the_history() {
    let mut harness = Harness::new();

    harness.frame(1, &[(8, car())], None);
    harness.frame(2, &[(8, car())], Some(("RST654", 60)));
    harness.frame(3, &[(8, car())], Some(("RST654", 40)));

    let dir = harness.transient_dirs().pop().unwrap();
    let events = fs::read_to_string(dir.join("plates.jsonl")).unwrap();
    assert_eq!(events.lines().count(), 1);
    assert_eq!(
        fs::read_to_string(dir.join("vehicle_track.jsonl"))
            .unwrap()
            .lines()
            .count(),
        2
    );
    let mut frames: Vec<String> = fs::read_dir(dir.join("frames"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    frames.sort();
    assert_eq!(frames, vec!["2.jpg".to_string(), "3.jpg".to_string()]);
}
