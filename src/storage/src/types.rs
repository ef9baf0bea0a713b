use serde::{Deserialize, Serialize};

/// A single mutation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOp::Put { key: key.into(), value: value.into() }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOp::Delete { key: key.into() }
    }

    /// The key this op touches
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } => key,
            BatchOp::Delete { key } => key,
        }
    }
}

/// Options for an ordered range scan.
///
/// Mirrors the classic leveldb read-stream options: `gte`/`lte` are the
/// inclusive bounds (`start`/`end` are accepted as aliases when
/// deserializing), `gt`/`lt` the exclusive ones. When both an inclusive and
/// an exclusive bound are given on the same side, the exclusive one wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RangeOptions {
    #[serde(default, alias = "start", skip_serializing_if = "Option::is_none")]
    pub gte: Option<Vec<u8>>,
    #[serde(default, alias = "end", skip_serializing_if = "Option::is_none")]
    pub lte: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Vec<u8>>,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default = "default_true")]
    pub keys: bool,
    #[serde(default = "default_true")]
    pub values: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RangeOptions {
    fn default() -> Self {
        RangeOptions {
            gte: None,
            lte: None,
            gt: None,
            lt: None,
            reverse: false,
            limit: None,
            keys: true,
            values: true,
        }
    }
}

impl RangeOptions {
    /// Every key starting with `prefix`
    pub fn prefix(prefix: &[u8]) -> Self {
        let mut opts = RangeOptions {
            gte: Some(prefix.to_vec()),
            ..Default::default()
        };
        opts.lt = prefix_upper_bound(prefix);
        opts
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.values = false;
        self
    }

    /// Check whether `key` lies inside the configured bounds.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_lower = match (&self.gt, &self.gte) {
            (Some(gt), _) => key > gt.as_slice(),
            (None, Some(gte)) => key >= gte.as_slice(),
            (None, None) => true,
        };
        let below_upper = match (&self.lt, &self.lte) {
            (Some(lt), _) => key < lt.as_slice(),
            (None, Some(lte)) => key <= lte.as_slice(),
            (None, None) => true,
        };
        above_lower && below_upper
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when the prefix is all `0xff`.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

/// One row emitted by a range scan. Fields are `None` when masked out by
/// the `keys` / `values` options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_upper_bound(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_upper_bound(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_exclusive_bound_wins() {
        let opts = RangeOptions {
            gte: Some(b"b".to_vec()),
            gt: Some(b"b".to_vec()),
            ..Default::default()
        };
        assert!(!opts.contains(b"b"));
        assert!(opts.contains(b"c"));
    }
}
