use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;

use crate::{
    changelog::{ChangelogRecord, ChangelogWriter},
    error::DurabilityError,
    model::TransformedStation,
};

/// Keyed, last-write-wins view of transformed stations.
///
/// Every `put` is appended to the changelog before it becomes visible, and
/// both happen under one table-wide lock so the changelog order is the
/// order writes were applied in.
pub struct MaterializedTable<C> {
    name: String,
    changelog: C,
    entries: Mutex<HashMap<i64, TransformedStation>>,
}

impl<C> std::fmt::Debug for MaterializedTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedTable")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<C: ChangelogWriter> MaterializedTable<C> {
    /// An empty table. Call [`MaterializedTable::rebuild_from_changelog`] to recover state.
    pub fn new(name: impl Into<String>, changelog: C) -> Self {
        Self {
            name: name.into(),
            changelog,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn changelog(&self) -> &C { &self.changelog }

    pub async fn get(&self, key: i64) -> Option<TransformedStation> { self.entries.lock().await.get(&key).cloned() }

    /// Durably record and apply a write. On error the table is unchanged.
    pub async fn put(&self, key: i64, value: TransformedStation) -> Result<(), DurabilityError> {
        let mut entries = self.entries.lock().await;

        let record = ChangelogRecord { key, value };
        self.changelog.append(&record).await?;
        entries.insert(key, record.value);
        Ok(())
    }

    /// Replace the in-memory state with a replay of the whole changelog.
    /// Returns the number of changelog entries applied.
    pub async fn rebuild_from_changelog(&self) -> Result<usize, DurabilityError> {
        let mut entries = self.entries.lock().await;

        let records = self.changelog.replay().await?;
        let applied = records.len();

        let mut rebuilt = HashMap::with_capacity(applied);
        for record in records {
            rebuilt.insert(record.key, record.value);
        }
        *entries = rebuilt;

        tracing::info!(
            table = %self.name,
            applied,
            keys = entries.len(),
            "Table rebuilt from changelog"
        );
        Ok(applied)
    }

    pub async fn len(&self) -> usize { self.entries.lock().await.len() }

    pub async fn is_empty(&self) -> bool { self.entries.lock().await.is_empty() }

    /// Ordered copy of the current state.
    pub async fn snapshot(&self) -> BTreeMap<i64, TransformedStation> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(key, value)| (*key, value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{changelog::MemoryChangelog, model::Line};

    fn value(station_name: &str, line: Line) -> TransformedStation {
        TransformedStation {
            station_id: 40380,
            station_name: station_name.to_string(),
            order: 1,
            line,
        }
    }

    #[tokio::test]
    async fn later_write_wins() {
        let table = MaterializedTable::new("converted_stations", MemoryChangelog::default());

        table.put(40010, value("Austin", Line::Blue)).await.unwrap();
        table.put(40010, value("Austin", Line::Green)).await.unwrap();

        assert_eq!(table.get(40010).await, Some(value("Austin", Line::Green)));
        assert_eq!(table.len().await, 1);
        assert_eq!(table.changelog().entries().len(), 2);
    }

    #[tokio::test]
    async fn failed_append_leaves_table_untouched() {
        let changelog = MemoryChangelog::default();
        let table = MaterializedTable::new("converted_stations", changelog.clone());
        table.put(1, value("Clark/Lake", Line::Red)).await.unwrap();

        changelog.fail_appends(true);
        let err = table.put(1, value("Clark/Lake", Line::Blue)).await.unwrap_err();

        assert!(matches!(err, DurabilityError::Append { key: 1, .. }));
        assert_eq!(table.get(1).await, Some(value("Clark/Lake", Line::Red)));
    }

    #[tokio::test]
    async fn rebuild_replaces_local_state() {
        let changelog = MemoryChangelog::default();
        let live = MaterializedTable::new("converted_stations", changelog.clone());
        live.put(1, value("Clark/Lake", Line::Red)).await.unwrap();
        live.put(2, value("Belmont", Line::Red)).await.unwrap();
        live.put(1, value("Clark/Lake", Line::Blue)).await.unwrap();

        let restarted = MaterializedTable::new("converted_stations", changelog);
        assert!(restarted.is_empty().await);

        assert_eq!(restarted.rebuild_from_changelog().await.unwrap(), 3);
        assert_eq!(restarted.snapshot().await, live.snapshot().await);
    }
}
