use std::collections::BTreeMap;

use serde::Serialize;

/// A flat mapping of label name to label value.
pub type LabelSet = BTreeMap<String, String>;

/// A set of targets sharing a common label set, published under `source`.
///
/// Consumers treat every group as a full replacement of whatever was published
/// before under the same source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TargetGroup {
    pub source: String,

    /// Labels applied to every target of the group.
    pub labels: LabelSet,

    pub targets: Vec<LabelSet>,
}

impl TargetGroup {
    /// A group with no targets, telling the consumer that everything previously
    /// published under `source` is gone.
    pub fn tombstone(source: impl Into<String>) -> Self {
        TargetGroup {
            source: source.into(),
            labels: LabelSet::new(),
            targets: vec![],
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.targets.is_empty() && self.labels.is_empty()
    }
}
