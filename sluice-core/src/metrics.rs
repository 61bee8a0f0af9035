use std::sync::OnceLock;

use metrics::{Label, counter, describe_counter, describe_gauge, gauge};

static METRICS_INIT: OnceLock<bool> = OnceLock::new();

/// Lazily describes all the metrics used in this module once
pub fn lazy_init() {
    METRICS_INIT.get_or_init(|| {
        describe_counter!("sluice.ingest.records", "records read from a source");
        describe_counter!(
            "sluice.ingest.invalid_records",
            "records that could not be parsed with the input format"
        );
        describe_counter!(
            "sluice.ingest.batches_committed",
            "batches whose checkpoint was committed"
        );
        describe_counter!("sluice.ingest.pipeline_restarts", "pipeline restarts");
        describe_gauge!(
            "sluice.allocator.capacity_shortfall",
            "pipelines that could not be placed for lack of capacity"
        );
        true
    });
}

fn source_labels(source_id: &str) -> Vec<Label> {
    vec![Label::new("source_id", source_id.to_string())]
}

/// Emits the outcome of a committed batch
pub fn emit_batch(source_id: &str, num_records: u64, num_invalid: u64) {
    lazy_init();
    let labels = source_labels(source_id);
    counter!("sluice.ingest.records", labels.iter()).increment(num_records);
    counter!("sluice.ingest.invalid_records", labels.iter()).increment(num_invalid);
    counter!("sluice.ingest.batches_committed", labels.iter()).increment(1);
}

pub fn emit_pipeline_restart(source_id: &str) {
    lazy_init();
    counter!("sluice.ingest.pipeline_restarts", source_labels(source_id).iter()).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub fn emit_capacity_shortfall(source_id: &str, missing: usize) {
    lazy_init();
    gauge!("sluice.allocator.capacity_shortfall", source_labels(source_id).iter())
        .set(missing as f64);
}
