//! Replication metrics in Prometheus text exposition format.

use std::fmt::Write;

use crate::publisher::PublisherStats;
use crate::replicator::ReplicationState;

/// Prometheus metric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Point-in-time value.
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// One labelled sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name, e.g. `tessera_applied_generation`.
    pub name: &'static str,
    /// Help text.
    pub help: &'static str,
    /// Counter or gauge.
    pub kind: MetricKind,
    /// Label pairs.
    pub labels: Vec<(&'static str, String)>,
    /// Sample value.
    pub value: u64,
}

impl Metric {
    /// A counter sample.
    pub fn counter(
        name: &'static str,
        help: &'static str,
        labels: Vec<(&'static str, String)>,
        value: u64,
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Counter,
            labels,
            value,
        }
    }

    /// A gauge sample.
    pub fn gauge(
        name: &'static str,
        help: &'static str,
        labels: Vec<(&'static str, String)>,
        value: u64,
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Gauge,
            labels,
            value,
        }
    }

    /// The sample line, e.g. `tessera_publish_total{directory="Animal.0"} 3`.
    pub fn sample(&self) -> String {
        if self.labels.is_empty() {
            return format!("{} {}", self.name, self.value);
        }
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        format!("{}{{{}}} {}", self.name, labels.join(","), self.value)
    }

    /// The sample with its HELP and TYPE header.
    pub fn format(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} {}\n{}\n",
            self.name,
            self.help,
            self.name,
            self.kind.as_str(),
            self.sample()
        )
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Metrics of one replicated directory.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryMetrics {
    /// A master directory.
    Master {
        /// Directory name.
        directory: String,
        /// Publisher counters.
        stats: PublisherStats,
    },
    /// A slave directory.
    Slave {
        /// Directory name.
        directory: String,
        /// Replication bookkeeping.
        state: ReplicationState,
    },
}

impl DirectoryMetrics {
    /// Samples for this directory.
    pub fn to_metrics(&self) -> Vec<Metric> {
        match self {
            DirectoryMetrics::Master { directory, stats } => {
                let labels = vec![("directory", directory.clone()), ("role", "master".into())];
                vec![
                    Metric::gauge(
                        "tessera_published_generation",
                        "Generation the publish marker points at",
                        labels.clone(),
                        stats.generation.as_u64(),
                    ),
                    Metric::counter(
                        "tessera_publish_total",
                        "Generations published since startup",
                        labels.clone(),
                        stats.publish_count,
                    ),
                    Metric::counter(
                        "tessera_publish_failures_total",
                        "Publishes abandoned since startup",
                        labels,
                        stats.failure_count,
                    ),
                ]
            }
            DirectoryMetrics::Slave { directory, state } => {
                let labels = vec![("directory", directory.clone()), ("role", "slave".into())];
                vec![
                    Metric::gauge(
                        "tessera_applied_generation",
                        "Generation served to readers",
                        labels.clone(),
                        state.last_applied_generation.as_u64(),
                    ),
                    Metric::gauge(
                        "tessera_replication_failures_consecutive",
                        "Failed replication ticks since the last success",
                        labels.clone(),
                        u64::from(state.consecutive_failure_count),
                    ),
                    Metric::counter(
                        "tessera_replication_failures_total",
                        "Failed replication ticks since startup",
                        labels,
                        state.total_failures,
                    ),
                ]
            }
        }
    }
}

/// Renders every directory, grouping samples of one metric under a single header.
pub fn format_prometheus(directories: &[DirectoryMetrics]) -> String {
    let mut groups: Vec<(Metric, Vec<String>)> = Vec::new();
    for metric in directories.iter().flat_map(|d| d.to_metrics()) {
        let sample = metric.sample();
        match groups.iter_mut().find(|(m, _)| m.name == metric.name) {
            Some((_, samples)) => samples.push(sample),
            None => groups.push((metric, vec![sample])),
        }
    }

    let mut out = String::new();
    for (metric, samples) in groups {
        let _ = writeln!(out, "# HELP {} {}", metric.name, metric.help);
        let _ = writeln!(out, "# TYPE {} {}", metric.name, metric.kind.as_str());
        for sample in samples {
            let _ = writeln!(out, "{}", sample);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_store::Generation;

    #[test]
    fn test_metric_format() {
        let m = Metric::counter(
            "tessera_publish_total",
            "Generations published since startup",
            vec![("directory", "Animal.0".to_string())],
            3,
        );
        assert_eq!(
            m.format(),
            "# HELP tessera_publish_total Generations published since startup\n\
             # TYPE tessera_publish_total counter\n\
             tessera_publish_total{directory=\"Animal.0\"} 3\n"
        );
    }

    #[test]
    fn test_unlabelled_sample() {
        let m = Metric::gauge("tessera_up", "Up", Vec::new(), 1);
        assert_eq!(m.sample(), "tessera_up 1");
    }

    #[test]
    fn test_label_escaping() {
        let m = Metric::gauge("x", "x", vec![("directory", "a\"b".to_string())], 0);
        assert_eq!(m.sample(), "x{directory=\"a\\\"b\"} 0");
    }

    #[test]
    fn test_format_groups_by_metric() {
        let slave = |name: &str, applied: u64, failures: u32| DirectoryMetrics::Slave {
            directory: name.to_string(),
            state: ReplicationState {
                last_applied_generation: Generation::new(applied),
                consecutive_failure_count: failures,
                total_failures: u64::from(failures),
                ..ReplicationState::default()
            },
        };
        let text = format_prometheus(&[
            slave("Animal.0", 4, 0),
            slave("Animal.1", 3, 2),
            DirectoryMetrics::Master {
                directory: "Furniture".to_string(),
                stats: PublisherStats {
                    generation: Generation::new(9),
                    publish_count: 9,
                    ..PublisherStats::default()
                },
            },
        ]);

        assert_eq!(text.matches("# TYPE tessera_applied_generation gauge").count(), 1);
        assert!(text.contains("tessera_applied_generation{directory=\"Animal.0\",role=\"slave\"} 4"));
        assert!(text.contains(
            "tessera_replication_failures_consecutive{directory=\"Animal.1\",role=\"slave\"} 2"
        ));
        assert!(text.contains("tessera_published_generation{directory=\"Furniture\",role=\"master\"} 9"));
    }
}
