pub mod changelog;
pub mod config;
pub mod error;
pub mod model;
pub mod offsets;
pub mod source;
pub mod table;
pub mod transformer;

// Re-export main types
pub use changelog::{ChangelogRecord, ChangelogWriter, KafkaChangelog, MemoryChangelog};
pub use config::StreamConfig;
pub use error::{DurabilityError, MalformedRecordError, StreamError};
pub use model::{Line, Station, StationKey, TransformedStation, STATION_KEY_SCHEMA, STATION_VALUE_SCHEMA};
pub use offsets::{KafkaOffsets, MemoryOffsets, OffsetSink};
pub use source::{decode_station, route, SourceRecord, StationSource};
pub use table::MaterializedTable;
pub use transformer::{StreamTransformer, TransformStats};
