use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NavigationState {
    InProgress,
    Complete,
}

/// One memory snapshot. Timestamps are milliseconds since the sampler started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp_ms: i64,
    #[serde(rename = "jsHeapSizeMB")]
    pub js_heap_size_mb: f64,
    #[serde(rename = "totalHeapSizeMB")]
    pub total_heap_size_mb: f64,
    #[serde(rename = "heapLimitMB")]
    pub heap_limit_mb: f64,
    #[serde(rename = "processMemoryMB")]
    pub process_memory_mb: f64,
    pub dom_nodes: u64,
    pub resource_count: u64,
    pub navigation_state: NavigationState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedSample {
    #[serde(flatten)]
    pub sample: Sample,
    /// Heap growth in MB per millisecond relative to the previous sample.
    pub memory_rate: f64,
    pub percentage_of_limit: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementSeries {
    samples: Vec<Sample>,
}

impl MeasurementSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Sorts by timestamp and computes growth rate and share of the heap
    /// limit for each sample.
    pub fn derive(mut self) -> Vec<DerivedSample> {
        self.samples.sort_by_key(|sample| sample.timestamp_ms);

        let mut derived = Vec::with_capacity(self.samples.len());
        let mut previous: Option<&Sample> = None;
        for sample in &self.samples {
            let memory_rate = match previous {
                Some(prev) if sample.timestamp_ms != prev.timestamp_ms => {
                    let delta_heap = sample.js_heap_size_mb - prev.js_heap_size_mb;
                    let delta_ms = (sample.timestamp_ms - prev.timestamp_ms) as f64;
                    round_to(delta_heap / delta_ms, 2)
                }
                _ => 0.0,
            };
            let percentage_of_limit = if sample.heap_limit_mb > 0.0 {
                (sample.js_heap_size_mb / sample.heap_limit_mb * 100.0).round()
            } else {
                0.0
            };
            derived.push(DerivedSample {
                sample: sample.clone(),
                memory_rate,
                percentage_of_limit,
            });
            previous = Some(sample);
        }
        derived
    }
}

impl FromIterator<Sample> for MeasurementSeries {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let rounded = (value * factor).round() / factor;
    // Avoid serializing "-0.0" for tiny negative rates.
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timestamp_ms: i64, heap: f64) -> Sample {
        Sample {
            timestamp_ms,
            js_heap_size_mb: heap,
            total_heap_size_mb: heap + 4.0,
            heap_limit_mb: 4096.0,
            process_memory_mb: 60.0,
            dom_nodes: 10,
            resource_count: 2,
            navigation_state: NavigationState::InProgress,
        }
    }

    #[test]
    fn derive_sorts_and_zeroes_first_rate() {
        let series: MeasurementSeries =
            vec![sample(300, 30.0), sample(100, 10.0), sample(200, 12.0)]
                .into_iter()
                .collect();
        let derived = series.derive();
        let stamps: Vec<i64> = derived.iter().map(|d| d.sample.timestamp_ms).collect();
        assert_eq!(stamps, vec![100, 200, 300]);
        assert_eq!(derived[0].memory_rate, 0.0);
        assert_eq!(derived[1].memory_rate, 0.02);
        assert_eq!(derived[2].memory_rate, 0.18);
    }

    #[test]
    fn equal_timestamps_do_not_divide_by_zero() {
        let series: MeasurementSeries = vec![sample(100, 10.0), sample(100, 20.0)]
            .into_iter()
            .collect();
        let derived = series.derive();
        assert!(derived.iter().all(|d| d.memory_rate == 0.0));
    }

    #[test]
    fn percentage_of_limit_is_rounded() {
        let mut s = sample(0, 1024.0);
        s.heap_limit_mb = 3000.0;
        let derived = MeasurementSeries::from_iter([s]).derive();
        assert_eq!(derived[0].percentage_of_limit, 34.0);

        let mut unknown = sample(0, 10.0);
        unknown.heap_limit_mb = 0.0;
        let derived = MeasurementSeries::from_iter([unknown]).derive();
        assert_eq!(derived[0].percentage_of_limit, 0.0);
    }

    #[test]
    fn serializes_reference_field_names() {
        let value = serde_json::to_value(&MeasurementSeries::from_iter([sample(5, 1.0)]).derive()[0])
            .unwrap();
        assert_eq!(value["jsHeapSizeMB"], 1.0);
        assert_eq!(value["navigationState"], "in-progress");
        assert_eq!(value["memoryRate"], 0.0);
        assert!(value.get("sample").is_none());
    }
}
