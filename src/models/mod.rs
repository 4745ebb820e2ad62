//! Data models for test discovery and execution
//!
//! This module contains the data structures shared by the engine, the
//! workers and the output layer.

mod test_result;
mod workload;

pub use test_result::{
    Attachment, AttachmentSet, InvokedDataCollector, RunStats, TestCase, TestOutcome, TestResult,
};
pub use workload::{
    distinct, DiscoveryCriteria, ProviderDescriptor, RunCriteria, RunTarget, Workload,
};
