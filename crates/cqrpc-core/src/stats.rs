//! Statistics sink
//!
//! Components expose counters by writing them into a [`MetricsWriter`];
//! the embedder decides the format. [`PrometheusWriter`] renders the
//! exposition text format.
//!
//! ```text
//! Scheduler::write(&mut w) ──► w.counter("cqrpc_queue_dispatched_total", [("queue","0")], 812)
//! RpcPool::write(&mut w)   ──► w.gauge("cqrpc_pool_calls", [("pool","server")], 3)
//!                                        │
//!                                        ▼
//!                          PrometheusWriter::finish() -> String
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;

pub trait MetricsWriter {
    fn counter(&mut self, name: &str, labels: &[(&str, &str)], value: u64);

    fn gauge(&mut self, name: &str, labels: &[(&str, &str)], value: i64);
}

/// Anything that can report metrics.
pub trait Statistics {
    fn write(&self, writer: &mut dyn MetricsWriter);
}

/// Prometheus/OpenMetrics exposition text.
#[derive(Default)]
pub struct PrometheusWriter {
    out: String,
    typed: BTreeSet<String>,
}

impl PrometheusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn sample(&mut self, kind: &str, name: &str, labels: &[(&str, &str)], value: &dyn std::fmt::Display) {
        if self.typed.insert(name.to_string()) {
            let _ = writeln!(self.out, "# TYPE {} {}", name, kind);
        }
        self.out.push_str(name);
        if !labels.is_empty() {
            self.out.push('{');
            for (i, (k, v)) in labels.iter().enumerate() {
                if i > 0 {
                    self.out.push(',');
                }
                let _ = write!(self.out, "{}=\"{}\"", k, v.replace('"', "\\\""));
            }
            self.out.push('}');
        }
        let _ = writeln!(self.out, " {}", value);
    }
}

impl MetricsWriter for PrometheusWriter {
    fn counter(&mut self, name: &str, labels: &[(&str, &str)], value: u64) {
        self.sample("counter", name, labels, &value);
    }

    fn gauge(&mut self, name: &str, labels: &[(&str, &str)], value: i64) {
        self.sample("gauge", name, labels, &value);
    }
}

/// Render one source as exposition text.
pub fn render_prometheus(source: &dyn Statistics) -> String {
    let mut w = PrometheusWriter::new();
    source.write(&mut w);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl Statistics for Fixed {
        fn write(&self, w: &mut dyn MetricsWriter) {
            w.counter("cqrpc_calls_total", &[("side", "server")], 3);
            w.counter("cqrpc_calls_total", &[("side", "client")], 2);
            w.gauge("cqrpc_pool_members", &[], -1);
        }
    }

    #[test]
    fn test_prometheus_text() {
        let text = render_prometheus(&Fixed);
        assert_eq!(
            text,
            "# TYPE cqrpc_calls_total counter\n\
             cqrpc_calls_total{side=\"server\"} 3\n\
             cqrpc_calls_total{side=\"client\"} 2\n\
             # TYPE cqrpc_pool_members gauge\n\
             cqrpc_pool_members -1\n"
        );
    }
}
