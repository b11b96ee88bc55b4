// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Events that can be summed, e.g. commands received.
    Countable,
    /// Elapsed seconds of something, e.g. command handling latency.
    Duration,
}

/// One named series. Lifetime aggregates survive interval resets.
#[derive(Debug, Clone)]
pub struct PerformanceMetric {
    name: String,
    kind: MetricKind,
    first_value_set: bool,
    current: f64,
    min: f64,
    max: f64,
    total_count: u64,
    interval_sum: f64,
    interval_count: u64,
    interval_start: Instant,
}

impl PerformanceMetric {
    fn new(name: &str, kind: MetricKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            first_value_set: false,
            current: 0.0,
            min: 0.0,
            max: 0.0,
            total_count: 0,
            interval_sum: 0.0,
            interval_count: 0,
            interval_start: Instant::now(),
        }
    }

    fn record(&mut self, value: f64) {
        self.current = value;
        self.total_count += 1;
        self.interval_sum += value;
        self.interval_count += 1;
        if !self.first_value_set {
            self.first_value_set = true;
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }

    fn reset_interval(&mut self) {
        self.interval_sum = 0.0;
        self.interval_count = 0;
        self.interval_start = Instant::now();
    }

    fn interval_duration(&self) -> Duration {
        self.interval_start.elapsed()
    }

    fn interval_average(&self) -> f64 {
        if self.interval_count == 0 {
            0.0
        } else {
            self.interval_sum / self.interval_count as f64
        }
    }

    fn interval_rate(&self) -> f64 {
        let secs = self.interval_duration().as_secs_f64();
        if secs > 0.0 {
            self.interval_sum / secs
        } else {
            0.0
        }
    }

    fn render(&self) -> String {
        match self.kind {
            MetricKind::Countable => format!(
                "[cnt] Interval item count:{} Reported values avg:{} \
                 Reported values as value/sec:{:.1} intervalDuration(s):{:.0} sum:{}. \
                 Total count:{} Session min value:{:.1} Session max value:{:.1}",
                self.interval_count,
                self.interval_average(),
                self.interval_rate(),
                self.interval_duration().as_secs_f64(),
                self.interval_sum,
                self.total_count,
                self.min,
                self.max,
            ),
            MetricKind::Duration => format!(
                "[dur] Interval item count:{} Reported values interval avg(ms):{:.3} \
                 intervalDuration(s):{:.1}. Session min value(ms):{:.3} \
                 Session max value(ms):{:.3}",
                self.interval_count,
                self.interval_average() * 1000.0,
                self.interval_duration().as_secs_f64(),
                self.min * 1000.0,
                self.max * 1000.0,
            ),
        }
    }

    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            current: self.current,
            min: self.min,
            max: self.max,
            total_count: self.total_count,
            interval_sum: self.interval_sum,
            interval_count: self.interval_count,
            interval_seconds: self.interval_duration().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub total_count: u64,
    pub interval_sum: f64,
    pub interval_count: u64,
    pub interval_seconds: f64,
}

/// Process-wide named counters and duration trackers.
pub struct PerformanceCounters {
    start: Instant,
    metrics: Mutex<BTreeMap<String, PerformanceMetric>>,
}

impl Default for PerformanceCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceCounters {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            metrics: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record one observation; the metric is created on first use with `kind`.
    pub fn record(&self, name: &str, value: f64, kind: MetricKind) {
        let mut metrics = self.lock();
        metrics
            .entry(name.to_string())
            .or_insert_with(|| PerformanceMetric::new(name, kind))
            .record(value);
    }

    pub fn increment(&self, name: &str) {
        self.record(name, 1.0, MetricKind::Countable);
    }

    pub fn record_duration(&self, name: &str, elapsed: Duration) {
        self.record(name, elapsed.as_secs_f64(), MetricKind::Duration);
    }

    /// HTML page listing every metric sorted by name.
    pub fn report(&self) -> String {
        let metrics = self.lock();
        let mut body = String::from("<body>");
        body.push_str("<h1>Backend client HTTP API info</h1>");
        body.push_str(&format!(
            "<p>This api reports HTTP API performance stats between API calls. \
             Generated {} after {:.0}s uptime.</p>",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.start.elapsed().as_secs_f64(),
        ));
        if !metrics.is_empty() {
            body.push_str("<table border=\"0\" cellspacing=\"4\"><tbody>");
            for (name, metric) in metrics.iter() {
                body.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td></tr>",
                    name,
                    metric.render()
                ));
            }
            body.push_str("</tbody></table>");
        }
        body.push_str("</body>");
        body
    }

    /// Zero interval aggregates; lifetime totals, min and max are kept.
    pub fn reset_intervals(&self) {
        for metric in self.lock().values_mut() {
            metric.reset_interval();
        }
    }

    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        self.lock().values().map(|m| m.snapshot()).collect()
    }

    pub fn get(&self, name: &str) -> Option<MetricSnapshot> {
        self.lock().get(name).map(|m| m.snapshot())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PerformanceMetric>> {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
