/// Generic metric, timer and keyed-data accumulator
pub mod data_collector;

pub use data_collector::{CollectedData, DataCollector, MetricSummary};
