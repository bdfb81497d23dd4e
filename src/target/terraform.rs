//! Infrastructure-as-code emission target.
//!
//! Renders accumulate as `(type, name, body)` records and `finish` writes
//! a single JSON document grouping resources by type. Cross-references
//! between emitted resources use [`TfLiteral`] property interpolations
//! rather than resolved cloud ids, so the document stands on its own.

use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::task::TaskMap;

/// A literal value in an emitted document: either a raw string or a
/// `${type.name.attr}` interpolation referencing a sibling resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TfLiteral(String);

impl TfLiteral {
    /// Reference an attribute of an emitted resource.
    pub fn property(rtype: &str, name: &str, attr: &str) -> Self {
        TfLiteral(format!("${{{rtype}.{name}.{attr}}}"))
    }

    /// A plain string value.
    pub fn from_string(value: &str) -> Self {
        TfLiteral(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct TfResource {
    rtype: String,
    name: String,
    body: Value,
}

pub struct TerraformTarget {
    provider: String,
    region: String,
    resources: Vec<TfResource>,
    out: Box<dyn Write>,
}

impl TerraformTarget {
    pub fn new(provider: &str, region: &str, out: Box<dyn Write>) -> Self {
        TerraformTarget {
            provider: provider.to_string(),
            region: region.to_string(),
            resources: Vec::new(),
            out,
        }
    }

    /// Record an emitted resource. Duplicate `(type, name)` pairs are
    /// rejected; the document has one definition per resource.
    pub fn render_resource(&mut self, rtype: &str, name: &str, body: Value) -> Result<()> {
        if self
            .resources
            .iter()
            .any(|r| r.rtype == rtype && r.name == name)
        {
            return Err(Error::other(format!(
                "duplicate terraform resource {rtype}.{name}"
            )));
        }
        debug!(rtype, name, "emitting terraform resource");
        self.resources.push(TfResource {
            rtype: rtype.to_string(),
            name: name.to_string(),
            body,
        });
        Ok(())
    }

    /// Compose the document and write it out.
    pub fn finish(&mut self, _tasks: &TaskMap) -> Result<()> {
        let mut by_type: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for r in &self.resources {
            by_type
                .entry(r.rtype.clone())
                .or_default()
                .insert(r.name.clone(), r.body.clone());
        }

        let doc = json!({
            "provider": { &self.provider: { "region": self.region } },
            "resource": by_type,
        });

        let rendered = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::other(format!("error rendering terraform document: {e}")))?;
        self.out.write_all(rendered.as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn property_literal_is_an_interpolation() {
        let lit = TfLiteral::property("aws_vpc", "main", "id");
        assert_eq!(lit.as_str(), "${aws_vpc.main.id}");
    }

    #[test]
    fn finish_groups_resources_by_type() {
        let buf = Buffer::default();
        let mut target = TerraformTarget::new("aws", "us-east-1", Box::new(buf.clone()));
        target
            .render_resource("aws_vpc", "main", json!({"cidr_block": "172.20.0.0/16"}))
            .unwrap();
        target
            .render_resource(
                "aws_subnet",
                "us-east-1a",
                json!({"vpc_id": TfLiteral::property("aws_vpc", "main", "id")}),
            )
            .unwrap();
        target.finish(&TaskMap::default()).unwrap();

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let doc: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            doc["resource"]["aws_vpc"]["main"]["cidr_block"],
            json!("172.20.0.0/16")
        );
        assert_eq!(
            doc["resource"]["aws_subnet"]["us-east-1a"]["vpc_id"],
            json!("${aws_vpc.main.id}")
        );
        assert_eq!(doc["provider"]["aws"]["region"], json!("us-east-1"));
    }

    #[test]
    fn duplicate_resources_are_rejected() {
        let buf = Buffer::default();
        let mut target = TerraformTarget::new("aws", "us-east-1", Box::new(buf));
        target.render_resource("aws_vpc", "main", json!({})).unwrap();
        assert!(target.render_resource("aws_vpc", "main", json!({})).is_err());
    }
}
