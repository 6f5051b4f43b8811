//! Subtree views over a configuration document.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use vmgrid_core::{GridError, GridResult};

use crate::document::ConfigDocument;
use crate::error::{StateError, StateResult};

/// One key path inside a [`ConfigDocument`].
///
/// `update` runs under the parent's atomic replace. Intermediate objects
/// are created on demand, and leaving the subtree as `null` removes the key.
#[derive(Debug, Clone)]
pub struct SubtreeView {
    doc: ConfigDocument,
    path: Vec<String>,
}

impl SubtreeView {
    pub(crate) fn new(doc: ConfigDocument, path: Vec<String>) -> Self {
        Self { doc, path }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// A copy of the subtree, or `null` when it does not exist.
    pub fn get(&self) -> StateResult<Value> {
        let doc = self.doc.get()?;
        Ok(self
            .path
            .iter()
            .try_fold(&doc, |node, key| node.get(key))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Decode the subtree, `None` when it does not exist.
    pub fn get_typed<T: DeserializeOwned>(&self) -> StateResult<Option<T>> {
        match self.get()? {
            Value::Null => Ok(None),
            v => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| StateError::Deserialize(e.to_string())),
        }
    }

    /// Apply `f` to the subtree and commit the whole document.
    pub fn update<F>(&self, reason: &str, f: F) -> StateResult<Value>
    where
        F: FnOnce(&mut Value) -> GridResult<()>,
    {
        let path = self.path.clone();
        self.doc.update(reason, move |root| {
            let Some((leaf, parents)) = path.split_last() else {
                return f(root);
            };
            let mut node = root;
            for key in parents {
                let map = as_object(node, key)?;
                node = map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            let map = as_object(node, leaf)?;
            let mut subtree = map.remove(leaf).unwrap_or(Value::Null);
            f(&mut subtree)?;
            if !subtree.is_null() {
                map.insert(leaf.clone(), subtree);
            }
            Ok(())
        })
    }
}

fn as_object<'a>(node: &'a mut Value, key: &str) -> GridResult<&'a mut Map<String, Value>> {
    if node.is_null() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut()
        .ok_or_else(|| GridError::bug(format!("cannot descend into non-object at '{key}'")))
}
