//! Dry-run target: records planned changes, mutates nothing.
//!
//! Tasks never see this target; the delta runner routes every would-be
//! render here as an `(actual, expected, changes)` triple. `finish` prints
//! the report, grouped into created (no actual) and changed (actual
//! present) sections with per-field before/after values.

use std::io::Write;

use serde_json::Value;

use crate::diff::Changes;
use crate::error::Result;
use crate::task::{Task, TaskMap};
use crate::walk::as_string;

struct Record {
    key: String,
    kind: &'static str,
    actual: Option<Value>,
    expected: Value,
    changes: Changes,
}

pub struct DryRunTarget {
    records: Vec<Record>,
    out: Box<dyn Write>,
}

impl DryRunTarget {
    pub fn new(out: Box<dyn Write>) -> Self {
        DryRunTarget {
            records: Vec::new(),
            out,
        }
    }

    /// Capture one planned change.
    pub fn render(
        &mut self,
        key: &str,
        actual: Option<&Task>,
        expected: &Task,
        changes: &Changes,
    ) -> Result<()> {
        let actual_tree = match actual {
            Some(a) => Some(a.to_tree()?),
            None => None,
        };
        self.records.push(Record {
            key: key.to_string(),
            kind: expected.kind(),
            actual: actual_tree,
            expected: expected.to_tree()?,
            changes: changes.clone(),
        });
        Ok(())
    }

    /// Number of captured changes (used by tests and the CLI summary).
    pub fn change_count(&self) -> usize {
        self.records.len()
    }

    /// Print the report.
    pub fn finish(&mut self, _tasks: &TaskMap) -> Result<()> {
        let mut report = String::new();

        if !self.records.is_empty() {
            report.push_str("Created resources:\n");
            for r in self.records.iter().filter(|r| r.actual.is_none()) {
                report.push_str(&format!("  {}\t{}\n", r.kind, r.key));
            }

            report.push_str("Changed resources:\n");
            for r in &self.records {
                let Some(actual) = &r.actual else {
                    continue;
                };
                report.push_str(&format!("  {}\t{}\n", r.kind, r.key));
                for field in r.changes.field_names() {
                    let before = actual.get(field).unwrap_or(&Value::Null);
                    let after = r.expected.get(field).unwrap_or(&Value::Null);
                    report.push_str(&format!(
                        "    {} {} -> {}\n",
                        field,
                        as_string(before),
                        as_string(after)
                    ));
                }
                report.push('\n');
            }
        }

        self.out.write_all(report.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::vpc::Vpc;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn vpc(cidr: &str) -> Task {
        Task::Vpc(Vpc {
            name: Some("main".to_string()),
            cidr: Some(cidr.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn created_and_changed_sections() {
        let buf = Buffer::default();
        let mut target = DryRunTarget::new(Box::new(buf.clone()));

        let expected = vpc("172.20.0.0/16");
        let changes = expected.build_changes(None).unwrap();
        target.render("vpc/main", None, &expected, &changes).unwrap();

        let actual = vpc("10.0.0.0/8");
        let drifted = vpc("172.20.0.0/16");
        let changes = drifted.build_changes(Some(&actual)).unwrap();
        target
            .render("vpc/other", Some(&actual), &drifted, &changes)
            .unwrap();

        target.finish(&TaskMap::default()).unwrap();
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();

        assert!(out.contains("Created resources:"));
        assert!(out.contains("vpc\tvpc/main"));
        assert!(out.contains("Changed resources:"));
        assert!(out.contains("cidr 10.0.0.0/8 -> 172.20.0.0/16"));
    }

    #[test]
    fn empty_run_prints_nothing() {
        let buf = Buffer::default();
        let mut target = DryRunTarget::new(Box::new(buf.clone()));
        target.finish(&TaskMap::default()).unwrap();
        assert!(buf.0.lock().unwrap().is_empty());
    }
}
