//! Scenario-based tests for cryoflow protocols

mod downsample_run;
mod gather_completeness;
mod graph_shape;
mod launch;
mod picking_run;
mod rerun;
mod resolution_run;
