//! Opaque query routing hints round-tripped between the server and the client.

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub(crate) struct QueryContextEntry {
    pub(crate) id: i64,
    pub(crate) timestamp: i64,
    pub(crate) priority: i64,
    #[serde(default)]
    pub(crate) context: Option<String>,
}

/// `queryContext` as found in query responses.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct QueryContextPayload {
    #[serde(default)]
    pub(crate) entries: Vec<QueryContextEntry>,
}

/// `queryContextDTO` as sent with query requests.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub(crate) struct QueryContextDto {
    pub(crate) entries: Vec<QueryContextDtoEntry>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct QueryContextDtoEntry {
    pub(crate) id: i64,
    pub(crate) timestamp: i64,
    pub(crate) priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) context: Option<ContextData>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub(crate) struct ContextData {
    #[serde(rename = "base64Data", skip_serializing_if = "Option::is_none")]
    pub(crate) base64_data: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct QueryContextCache {
    entries: Vec<QueryContextEntry>,
}

impl QueryContextCache {
    /// Merges server updates, keeping at most `capacity` entries ordered by priority.
    ///
    /// An empty update clears the cache.
    pub(crate) fn add(&mut self, updates: &[QueryContextEntry], capacity: usize) {
        if updates.is_empty() {
            self.entries.clear();
            return;
        }
        for update in updates {
            debug!(id = update.id, priority = update.priority, "adding query context");
            if let Some(existing) = self.entries.iter_mut().find(|e| e.id == update.id) {
                let newer = update.timestamp > existing.timestamp;
                let reprioritized =
                    update.timestamp == existing.timestamp && update.priority != existing.priority;
                if newer || reprioritized {
                    *existing = update.clone();
                }
                continue;
            }
            if let Some(existing) = self
                .entries
                .iter_mut()
                .find(|e| e.priority == update.priority)
            {
                *existing = update.clone();
                continue;
            }
            self.entries.push(update.clone());
        }
        self.entries.sort_by_key(|e| e.priority);
        self.entries.truncate(capacity);
    }

    pub(crate) fn snapshot(&self) -> QueryContextDto {
        QueryContextDto {
            entries: self
                .entries
                .iter()
                .map(|e| QueryContextDtoEntry {
                    id: e.id,
                    timestamp: e.timestamp,
                    priority: e.priority,
                    context: e.context.as_ref().map(|c| ContextData {
                        base64_data: Some(c.clone()),
                    }),
                })
                .collect(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
