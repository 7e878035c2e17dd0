//! Atomic write batches.

use serde::{Deserialize, Serialize};

use crate::kv::Namespace;

/// One operation inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// Target namespace.
        ns: Namespace,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes (TTL suffix included once the batch is committed in
        /// TTL mode).
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Target namespace.
        ns: Namespace,
        /// Key bytes.
        key: Vec<u8>,
    },
}

/// An ordered set of operations committed atomically: after
/// [`crate::kv::KvStore::write_batch`] returns, either every op is durable
/// or none is.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, ns: Namespace, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            ns,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Appends a delete.
    pub fn delete(&mut self, ns: Namespace, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { ns, key: key.into() });
    }

    /// Number of operations in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
