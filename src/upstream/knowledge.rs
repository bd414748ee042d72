//! Per-group knowledge documents read from a directory of `.txt` files.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::GroupConfig;

/// Loads and memoises the documents of each group.  The cache key is the
/// group id; documents are read once per process.
#[derive(Default)]
pub struct KnowledgeBase {
    cache: DashMap<String, Arc<Vec<String>>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents for `group_id`, or an empty list when the group does not use
    /// a knowledge base.
    pub async fn documents(&self, group_id: &str, config: &GroupConfig) -> Arc<Vec<String>> {
        if !config.use_knowledge_base {
            return Arc::new(Vec::new());
        }
        if let Some(existing) = self.cache.get(group_id) {
            return existing.clone();
        }
        let docs = match config.knowledge_base_dir.as_deref() {
            Some(dir) => Arc::new(read_documents(dir).await),
            None => {
                tracing::warn!(group_id = %group_id, "knowledge base enabled without knowledge_base_dir");
                Arc::new(Vec::new())
            }
        };
        self.cache.insert(group_id.to_string(), docs.clone());
        docs
    }
}

async fn read_documents(dir: &Path) -> Vec<String> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "knowledge base directory unreadable");
            return Vec::new();
        }
    };
    let mut files = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("txt") {
                    files.push(path);
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "stopped listing knowledge base");
                break;
            }
        }
    }
    files.sort();

    let mut docs = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => docs.push(format!("[文档: {name}]\n{content}")),
            Err(err) => {
                tracing::error!(file = %path.display(), error = %err, "failed to read knowledge base file")
            }
        }
    }
    docs
}
