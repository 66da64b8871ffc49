use serde_json::Value;

/// Owner of the external research-tree document.
///
/// The session forwards every tree document that rides along with a patch.
/// What the document means is up to the store.
pub trait SnapshotStore: Send {
    fn apply_snapshot(&mut self, data: Value);

    fn read_snapshot(&self) -> Option<&Value>;
}

/// Keeps the latest document in memory.
#[derive(Debug, Default)]
pub struct TreeSnapshot {
    current: Option<Value>,
}

impl TreeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for TreeSnapshot {
    fn apply_snapshot(&mut self, data: Value) {
        self.current = Some(data);
    }

    fn read_snapshot(&self) -> Option<&Value> {
        self.current.as_ref()
    }
}
