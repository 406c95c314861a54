//! Station transformer feeding the materialized table.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    changelog::ChangelogWriter,
    error::StreamError,
    model::{Station, TransformedStation},
    offsets::OffsetSink,
    source::SourceRecord,
    table::MaterializedTable,
};

/// Counters reported when a transformer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub applied: u64,
    pub rejected: u64,
}

/// Applies stations to the table one at a time, in arrival order.
pub struct StreamTransformer<C> {
    table: Arc<MaterializedTable<C>>,
    worker: usize,
}

impl<C: ChangelogWriter> StreamTransformer<C> {
    pub fn new(table: Arc<MaterializedTable<C>>, worker: usize) -> Self { Self { table, worker } }

    pub fn table(&self) -> &Arc<MaterializedTable<C>> { &self.table }

    /// Transform one station and write it to the table.
    /// Only returns `Ok` once the changelog append succeeded.
    pub async fn process(&self, station: &Station) -> Result<TransformedStation, StreamError> {
        let transformed = TransformedStation::from_station(station)?;

        if let Err(e) = station.strict_line() {
            tracing::warn!(
                error = %e,
                stop_id = station.stop_id,
                line = %transformed.line,
                "Several line flags set, using precedence"
            );
        }

        self.table.put(station.stop_id, transformed.clone()).await?;
        Ok(transformed)
    }

    /// Consume source records until the channel closes.
    ///
    /// Each record is acknowledged on `offsets` once its write is durable.
    /// Malformed stations are logged, acknowledged and skipped. A durability
    /// failure stops the worker without acknowledging the failed record.
    pub async fn run<O: OffsetSink>(
        self,
        mut rx: mpsc::Receiver<SourceRecord>,
        offsets: O,
    ) -> Result<TransformStats, StreamError> {
        tracing::info!(
            worker = self.worker,
            table = %self.table.name(),
            "Stream transformer started, waiting for stations..."
        );

        let mut stats = TransformStats::default();

        while let Some(SourceRecord {
            partition,
            offset,
            station,
        }) = rx.recv().await
        {
            match self.process(&station).await {
                Ok(transformed) => {
                    stats.applied += 1;
                    tracing::debug!(
                        worker = self.worker,
                        stop_id = station.stop_id,
                        station_id = transformed.station_id,
                        line = %transformed.line,
                        "Station applied"
                    );
                },
                Err(StreamError::Malformed(e)) => {
                    stats.rejected += 1;
                    tracing::warn!(
                        error = %e,
                        worker = self.worker,
                        stop_id = station.stop_id,
                        station_name = %station.station_name,
                        "Rejecting malformed station"
                    );
                },
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        worker = self.worker,
                        stop_id = station.stop_id,
                        partition,
                        offset,
                        "Changelog append failed, stopping transformer"
                    );
                    return Err(e);
                },
            }

            if let Err(e) = offsets.ack(partition, offset) {
                tracing::warn!(
                    error = %e,
                    worker = self.worker,
                    partition,
                    offset,
                    "Failed to store source offset, record may be redelivered"
                );
            }
        }

        tracing::warn!(
            worker = self.worker,
            applied = stats.applied,
            rejected = stats.rejected,
            "Stream transformer channel closed, shutting down"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        changelog::MemoryChangelog, error::DurabilityError, model::Line, offsets::MemoryOffsets,
    };

    fn station(stop_id: i64, blue: bool, green: bool, red: bool) -> Station {
        Station {
            stop_id,
            direction_id: "N".to_string(),
            stop_name: "Belmont (Kimball-Linden-bound)".to_string(),
            station_name: "Belmont".to_string(),
            station_descriptive_name: "Belmont (Red, Brown & Purple lines)".to_string(),
            station_id: 41320,
            order: 12,
            red,
            blue,
            green,
        }
    }

    fn at(offset: i64, station: Station) -> SourceRecord {
        SourceRecord {
            partition: 0,
            offset,
            station,
        }
    }

    fn transformer() -> StreamTransformer<MemoryChangelog> {
        let table = MaterializedTable::new("converted_stations", MemoryChangelog::default());
        StreamTransformer::new(Arc::new(table), 0)
    }

    #[tokio::test]
    async fn each_flag_maps_to_its_line() {
        let transformer = transformer();

        for (stop_id, flags, line) in [
            (1, (true, false, false), Line::Blue),
            (2, (false, true, false), Line::Green),
            (3, (false, false, true), Line::Red),
        ] {
            let (blue, green, red) = flags;
            let transformed = transformer
                .process(&station(stop_id, blue, green, red))
                .await
                .unwrap();
            assert_eq!(transformed.line, line);
            assert_eq!(transformer.table().get(stop_id).await.unwrap().line, line);
        }
    }

    #[tokio::test]
    async fn run_skips_malformed_and_keeps_going() {
        let transformer = transformer();
        let table = Arc::clone(transformer.table());
        let offsets = MemoryOffsets::default();
        let (tx, rx) = mpsc::channel(8);

        tx.send(at(10, station(1, false, false, true))).await.unwrap();
        tx.send(at(11, station(2, false, false, false))).await.unwrap();
        tx.send(at(12, station(3, false, true, false))).await.unwrap();
        drop(tx);

        let stats = transformer.run(rx, offsets.clone()).await.unwrap();

        assert_eq!(stats, TransformStats { applied: 2, rejected: 1 });
        assert!(table.get(2).await.is_none());
        assert_eq!(table.len().await, 2);
        assert_eq!(offsets.acked(), vec![(0, 10), (0, 11), (0, 12)]);
    }

    #[tokio::test]
    async fn run_stops_on_durability_failure() {
        let changelog = MemoryChangelog::default();
        let table = Arc::new(MaterializedTable::new("converted_stations", changelog.clone()));
        let transformer = StreamTransformer::new(Arc::clone(&table), 0);
        let (tx, rx) = mpsc::channel(8);

        changelog.fail_appends(true);
        tx.send(at(0, station(1, true, false, false))).await.unwrap();
        tx.send(at(1, station(2, true, false, false))).await.unwrap();

        let err = transformer.run(rx, MemoryOffsets::default()).await.unwrap_err();

        assert!(matches!(err, StreamError::Durability(DurabilityError::Append { key: 1, .. })));
        assert!(table.is_empty().await);
        assert!(changelog.entries().is_empty());
    }

    #[tokio::test]
    async fn failed_append_is_never_acknowledged() {
        let changelog = MemoryChangelog::default();
        let table = Arc::new(MaterializedTable::new("converted_stations", changelog.clone()));
        let offsets = MemoryOffsets::default();

        let (tx, rx) = mpsc::channel(8);
        tx.send(at(0, station(1, false, false, true))).await.unwrap();
        drop(tx);
        StreamTransformer::new(Arc::clone(&table), 0)
            .run(rx, offsets.clone())
            .await
            .unwrap();
        assert_eq!(offsets.acked(), vec![(0, 0)]);

        changelog.fail_appends(true);
        let (tx, rx) = mpsc::channel(8);
        tx.send(at(1, station(2, false, false, true))).await.unwrap();
        tx.send(at(2, station(3, false, false, true))).await.unwrap();
        drop(tx);

        let err = StreamTransformer::new(Arc::clone(&table), 0)
            .run(rx, offsets.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Durability(_)));
        // A restart resumes at offset 1, so stop 2 is read again.
        assert_eq!(offsets.acked(), vec![(0, 0)]);
        assert!(table.get(2).await.is_none());
    }
}
