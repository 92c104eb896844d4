use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref FRAMES_PROCESSED: IntCounter = register_int_counter!(
        "plate_sightings_frames_processed_total",
        "Frames that went through tracking and aggregation"
    )
    .expect("frames counter registers once");
    pub static ref PLATE_READS: IntCounterVec = register_int_counter_vec!(
        "plate_sightings_plate_reads_total",
        "Recognized plate strings by quality tier",
        &["tier"]
    )
    .expect("reads counter registers once");
    pub static ref VEHICLES_PROMOTED: IntCounter = register_int_counter!(
        "plate_sightings_vehicles_promoted_total",
        "Vehicles promoted to target"
    )
    .expect("promotion counter registers once");
    pub static ref VEHICLES_FINALIZED: IntCounter = register_int_counter!(
        "plate_sightings_vehicles_finalized_total",
        "Permanent records committed"
    )
    .expect("finalized counter registers once");
    pub static ref FINALIZE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "plate_sightings_finalize_failures_total",
        "Aborted finalizations by error kind",
        &["kind"]
    )
    .expect("failure counter registers once");
    pub static ref ACTIVE_VEHICLES: IntGauge = register_int_gauge!(
        "plate_sightings_active_vehicles",
        "Vehicles currently tracked"
    )
    .expect("active gauge registers once");
    pub static ref FINALIZE_SECONDS: Histogram = register_histogram!(
        "plate_sightings_finalize_seconds",
        "Time spent rendering and committing one vehicle"
    )
    .expect("finalize histogram registers once");
}

/// Text exposition of every registered metric.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!("cannot encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
