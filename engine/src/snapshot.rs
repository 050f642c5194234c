//! Persisted document snapshots.
//!
//! A snapshot is the document's operation log. Loading it into an empty
//! document reproduces the saved state, including ops still waiting for a
//! missing dependency.

use crate::doc::{Doc, Op, Update};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Applied operations, in application order
    pub ops: Vec<Op>,
}

impl DocSnapshot {
    pub fn from_doc(doc: &Doc) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            ops: doc.encode_state().ops,
        }
    }

    pub fn into_update(self) -> Update {
        Update { ops: self.ops }
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_value(value).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    fn check_version(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{ContainerId, DocValue};
    use serde_json::json;

    fn sample_doc() -> Doc {
        let mut doc = Doc::new("node-1");
        let mut out = Update::default();
        let cart = doc
            .set(&mut out, &ContainerId::Root, "cart", Some(DocValue::Map { tag: None }))
            .unwrap();
        doc.set(
            &mut out,
            &ContainerId::Item(cart),
            "total",
            Some(DocValue::scalar(json!(10))),
        )
        .unwrap();
        doc
    }

    #[test]
    fn snapshot_restores_document() {
        let doc = sample_doc();
        let snapshot = DocSnapshot::from_doc(&doc);
        assert_eq!(snapshot.op_count(), 2);

        let json = snapshot.to_json().unwrap();
        let restored = DocSnapshot::from_json(&json).unwrap();
        let mut copy = Doc::new("node-2");
        copy.apply(&restored.into_update());

        assert_eq!(copy.to_plain(&ContainerId::Root), json!({"cart": {"total": 10}}));
    }

    #[test]
    fn wire_format_is_camel_case() {
        let value = DocSnapshot::from_doc(&sample_doc()).to_value().unwrap();
        assert_eq!(value["formatVersion"], json!(SNAPSHOT_FORMAT_VERSION));
        assert_eq!(value["ops"][0]["op"], json!("set"));
        assert_eq!(value["ops"][0]["id"]["nodeId"], json!("node-1"));
    }

    #[test]
    fn reject_future_format_version() {
        let value = json!({"formatVersion": 999, "ops": []});
        let result = DocSnapshot::from_value(value);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }

    #[test]
    fn reject_malformed_snapshot() {
        let result = DocSnapshot::from_json(r#"{"ops": 3}"#);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }
}
