// Non-blocking multi-connection I/O multiplexing library.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Registry of named sensors and gauges.
//!
//! A [`Sensor`] accumulates a set of statistics over the values recorded into
//! it and may forward every recording to parent sensors. A gauge is a plain
//! callback evaluated when the registry is read. All recording paths are
//! best-effort: a poisoned lock drops the sample instead of panicking.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

/// Fully-qualified name of a single reported metric.
///
/// Equality and hashing ignore the description: two metrics with the same
/// name, group and tags are the same metric.
#[derive(Clone, Debug)]
pub struct MetricName {
    name: String,
    group: String,
    description: String,
    tags: Vec<(String, String)>,
}

impl MetricName {
    pub fn new(
        name: impl ToString,
        group: impl ToString,
        description: impl ToString,
        tags: Vec<(String, String)>,
    ) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            description: description.to_string(),
            tags,
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn group(&self) -> &str { &self.group }

    pub fn description(&self) -> &str { &self.description }

    pub fn tags(&self) -> &[(String, String)] { &self.tags }
}

impl PartialEq for MetricName {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.group == other.group && self.tags == other.tags
    }
}

impl Eq for MetricName {}

impl Hash for MetricName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.group.hash(state);
        self.tags.hash(state);
    }
}

impl Display for MetricName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)?;
        for (key, value) in &self.tags {
            write!(f, ",{key}={value}")?;
        }
        Ok(())
    }
}

/// Statistic kinds a sensor can accumulate.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Stat {
    /// Running total of the recorded values.
    Total,
    /// Number of recordings.
    Count,
    /// Recorded value sum per second of elapsed recording window.
    Rate,
    /// Recordings per second of elapsed recording window.
    CountRate,
    /// Fraction of elapsed wall time covered by the recorded values, the
    /// values being nanosecond durations.
    NanoRatio,
    /// Arithmetic mean of the recorded values.
    Avg,
    /// Largest recorded value.
    Max,
}

struct StatState {
    stat: Stat,
    sum: f64,
    count: u64,
    max: f64,
    first_ms: u64,
    last_ms: u64,
}

impl StatState {
    fn new(stat: Stat) -> Self {
        Self {
            stat,
            sum: 0.0,
            count: 0,
            max: f64::NEG_INFINITY,
            first_ms: 0,
            last_ms: 0,
        }
    }

    fn record(&mut self, value: f64, now_ms: u64) {
        if self.count == 0 {
            self.first_ms = now_ms;
        }
        self.last_ms = now_ms;
        self.sum += value;
        self.count += 1;
        if value > self.max {
            self.max = value;
        }
    }

    fn value(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        // A single sample still reports over a minimal 1ms window
        let elapsed_ms = (self.last_ms - self.first_ms).max(1) as f64;
        match self.stat {
            Stat::Total => self.sum,
            Stat::Count => self.count as f64,
            Stat::Rate => self.sum / (elapsed_ms / 1_000.0),
            Stat::CountRate => self.count as f64 / (elapsed_ms / 1_000.0),
            Stat::NanoRatio => self.sum / (elapsed_ms * 1_000_000.0),
            Stat::Avg => self.sum / self.count as f64,
            Stat::Max => self.max,
        }
    }
}

/// A named recording point publishing one or more statistics.
pub struct Sensor {
    name: String,
    parents: Vec<Arc<Sensor>>,
    stats: Mutex<Vec<(MetricName, StatState)>>,
}

impl Sensor {
    fn new(name: &str, parents: Vec<Arc<Sensor>>) -> Self {
        Self {
            name: name.to_string(),
            parents,
            stats: Mutex::new(vec![]),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Attaches a statistic published under the given metric name.
    pub fn add(&self, metric: MetricName, stat: Stat) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        if stats.iter().any(|(name, _)| *name == metric) {
            return;
        }
        stats.push((metric, StatState::new(stat)));
    }

    /// Records a value into every statistic of this sensor and of all its
    /// parents.
    pub fn record(&self, value: f64, now_ms: u64) {
        if let Ok(mut stats) = self.stats.lock() {
            for (_, stat) in stats.iter_mut() {
                stat.record(value, now_ms);
            }
        }
        for parent in &self.parents {
            parent.record(value, now_ms);
        }
    }

    fn snapshot(&self, into: &mut Vec<(MetricName, f64)>) {
        let Ok(stats) = self.stats.lock() else {
            return;
        };
        for (metric, stat) in stats.iter() {
            into.push((metric.clone(), stat.value()));
        }
    }
}

type Gauge = Box<dyn Fn() -> f64 + Send + Sync>;

/// Registry of sensors and gauges.
///
/// Shared behind an [`Arc`] between the component recording metrics and
/// whatever reads them out.
pub struct Metrics {
    sensors: Mutex<HashMap<String, Arc<Sensor>>>,
    gauges: Mutex<Vec<(MetricName, Gauge)>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sensors: Mutex::new(empty!()),
            gauges: Mutex::new(vec![]),
        }
    }

    /// Returns the sensor registered under `name`, creating it with the given
    /// parents when absent. Parents of an existing sensor are left unchanged.
    pub fn sensor(&self, name: &str, parents: &[Arc<Sensor>]) -> Arc<Sensor> {
        let mut sensors = match self.sensors.lock() {
            Ok(sensors) => sensors,
            Err(poisoned) => poisoned.into_inner(),
        };
        sensors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Sensor::new(name, parents.to_vec())))
            .clone()
    }

    pub fn get_sensor(&self, name: &str) -> Option<Arc<Sensor>> {
        self.sensors.lock().ok()?.get(name).cloned()
    }

    pub fn remove_sensor(&self, name: &str) {
        if let Ok(mut sensors) = self.sensors.lock() {
            sensors.remove(name);
        }
    }

    /// Registers a gauge evaluated on every registry read. Re-registration
    /// under the same metric name replaces the callback.
    pub fn add_gauge(&self, metric: MetricName, read: impl Fn() -> f64 + Send + Sync + 'static) {
        let Ok(mut gauges) = self.gauges.lock() else {
            return;
        };
        gauges.retain(|(name, _)| *name != metric);
        gauges.push((metric, Box::new(read)));
    }

    pub fn remove_gauge(&self, metric: &MetricName) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.retain(|(name, _)| name != metric);
        }
    }

    /// Current value of every registered metric.
    pub fn snapshot(&self) -> Vec<(MetricName, f64)> {
        let mut values = vec![];
        if let Ok(sensors) = self.sensors.lock() {
            for sensor in sensors.values() {
                sensor.snapshot(&mut values);
            }
        }
        if let Ok(gauges) = self.gauges.lock() {
            for (metric, gauge) in gauges.iter() {
                values.push((metric.clone(), gauge()));
            }
        }
        values
    }

    /// Looks up the current value of the first metric with the given name,
    /// disregarding group and tags.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.snapshot()
            .into_iter()
            .find(|(metric, _)| metric.name() == name)
            .map(|(_, value)| value)
    }
}

impl Default for Metrics {
    fn default() -> Self { Metrics::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str) -> MetricName { MetricName::new(name, "test-metrics", "", vec![]) }

    #[test]
    fn sensor_accumulates_stats() {
        let metrics = Metrics::new();
        let sensor = metrics.sensor("requests", &[]);
        sensor.add(metric("request-size-avg"), Stat::Avg);
        sensor.add(metric("request-size-max"), Stat::Max);
        sensor.add(metric("request-total"), Stat::Total);
        sensor.add(metric("request-count"), Stat::Count);

        sensor.record(10.0, 0);
        sensor.record(30.0, 5);

        assert_eq!(metrics.value("request-size-avg"), Some(20.0));
        assert_eq!(metrics.value("request-size-max"), Some(30.0));
        assert_eq!(metrics.value("request-total"), Some(40.0));
        assert_eq!(metrics.value("request-count"), Some(2.0));
    }

    #[test]
    fn rates_report_over_elapsed_window() {
        let metrics = Metrics::new();
        let sensor = metrics.sensor("bytes", &[]);
        sensor.add(metric("byte-rate"), Stat::Rate);
        sensor.add(metric("record-rate"), Stat::CountRate);

        sensor.record(500.0, 0);
        sensor.record(500.0, 2_000);

        assert_eq!(metrics.value("byte-rate"), Some(500.0));
        assert_eq!(metrics.value("record-rate"), Some(1.0));
    }

    #[test]
    fn records_propagate_to_parents() {
        let metrics = Metrics::new();
        let parent = metrics.sensor("io", &[]);
        parent.add(metric("io-count"), Stat::Count);
        let child = metrics.sensor("io-read", &[parent]);
        child.add(metric("read-count"), Stat::Count);

        child.record(1.0, 0);
        child.record(1.0, 1);

        assert_eq!(metrics.value("read-count"), Some(2.0));
        assert_eq!(metrics.value("io-count"), Some(2.0));
    }

    #[test]
    fn sensor_registration_is_idempotent() {
        let metrics = Metrics::new();
        let first = metrics.sensor("dup", &[]);
        first.add(metric("dup-count"), Stat::Count);
        let second = metrics.sensor("dup", &[]);
        second.add(metric("dup-count"), Stat::Count);
        second.record(1.0, 0);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(metrics.value("dup-count"), Some(1.0));
    }

    #[test]
    fn gauges_and_removal() {
        let metrics = Metrics::new();
        metrics.add_gauge(metric("connection-count"), || 3.0);
        assert_eq!(metrics.value("connection-count"), Some(3.0));

        metrics.remove_gauge(&metric("connection-count"));
        assert_eq!(metrics.value("connection-count"), None);

        let sensor = metrics.sensor("gone", &[]);
        sensor.add(metric("gone-count"), Stat::Count);
        metrics.remove_sensor("gone");
        assert_eq!(metrics.value("gone-count"), None);
        assert!(metrics.get_sensor("gone").is_none());
    }
}
