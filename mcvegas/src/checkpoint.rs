//! Snapshots of a run that allow resuming it exactly.
//!
//! A checkpoint holds the results of all iterations so far, the adaptive state of the mapping
//! and the random number generator. It is written as a self-describing JSON document with a
//! format tag and a version number.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::ChannelSummary;
use crate::error::{Error, Result};
use crate::mapping::MappingState;
use crate::result::{Cumulative, Statistics};
use crate::stream::StreamState;

/// Format tag of checkpoint documents.
pub const FORMAT: &str = "mcvegas-checkpoint";

/// Latest checkpoint version; older versions remain readable.
pub const VERSION: u32 = 1;

#[derive(Deserialize)]
struct Header {
    format: String,
    version: u32,
}

/// The complete state of an integration between two iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    format: String,
    version: u32,
    results: Vec<Statistics>,
    /// Channel usage of every iteration; left out when no iteration used channels.
    #[serde(default, skip_serializing_if = "without_channels")]
    channels: Vec<Option<ChannelSummary>>,
    state: MappingState,
    stream: StreamState,
}

impl Checkpoint {
    pub(crate) fn new(results: Vec<Statistics>, state: MappingState, stream: StreamState) -> Self {
        Checkpoint {
            format: FORMAT.to_owned(),
            version: VERSION,
            results,
            channels: Vec::new(),
            state,
            stream,
        }
    }

    pub(crate) fn with_channels(mut self, channels: Vec<Option<ChannelSummary>>) -> Self {
        self.channels = if without_channels(&channels) {
            Vec::new()
        } else {
            channels
        };
        self
    }

    /// The results of every iteration, in order.
    pub fn results(&self) -> &[Statistics] {
        &self.results
    }

    pub fn iterations(&self) -> usize {
        self.results.len()
    }

    /// How iteration `index` used the channels, if it was recorded.
    pub fn channel_summary(&self, index: usize) -> Option<&ChannelSummary> {
        self.channels.get(index).and_then(Option::as_ref)
    }

    pub fn state(&self) -> &MappingState {
        &self.state
    }

    pub fn stream(&self) -> &StreamState {
        &self.stream
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// All iterations combined.
    pub fn cumulative(&self) -> Cumulative {
        Cumulative::from_results(&self.results)
    }

    /// Checks every invariant of the stored state.
    pub fn validate(&self) -> Result<()> {
        if self.format != FORMAT {
            return Err(Error::corrupt(format!("unknown format `{}`", self.format)));
        }
        if self.version > VERSION {
            return Err(Error::corrupt(format!(
                "version {} is newer than the supported version {VERSION}",
                self.version
            )));
        }
        if let Some(index) = self.results.iter().position(|r| !r.is_consistent()) {
            return Err(Error::corrupt(format!(
                "inconsistent statistics in iteration {index}"
            )));
        }
        if !self.channels.is_empty() && self.channels.len() != self.results.len() {
            return Err(Error::corrupt(format!(
                "{} channel summaries stored for {} iterations",
                self.channels.len(),
                self.results.len()
            )));
        }
        for (index, summary) in self.channels.iter().enumerate() {
            if let Some(summary) = summary {
                summary
                    .validate()
                    .map_err(|err| Error::corrupt(format!("iteration {index}: {err}")))?;
            }
        }
        if self.stream.workers == 0 {
            return Err(Error::corrupt("the run had no workers"));
        }
        self.state
            .validate()
            .map_err(|err| Error::corrupt(err.to_string()))
    }

    /// Writes the checkpoint to `writer`.
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        serde_json::to_writer_pretty(&mut writer, self).map_err(std::io::Error::from)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads and validates a checkpoint; every malformed input is reported as
    /// [`Error::CorruptCheckpoint`].
    pub fn read<R: Read>(reader: R) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_reader(reader).map_err(|err| Error::corrupt(err.to_string()))?;

        let header: Header = serde_json::from_value(value.clone())
            .map_err(|err| Error::corrupt(format!("missing header: {err}")))?;
        if header.format != FORMAT {
            return Err(Error::corrupt(format!("unknown format `{}`", header.format)));
        }
        if header.version > VERSION {
            return Err(Error::corrupt(format!(
                "version {} is newer than the supported version {VERSION}",
                header.version
            )));
        }

        let checkpoint: Checkpoint =
            serde_json::from_value(value).map_err(|err| Error::corrupt(err.to_string()))?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::read(BufReader::new(file))
    }

    /// Writes the checkpoint to `path`, replacing an existing file only once the new one is
    /// complete.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let temporary = temporary_path(path);

        let written = File::create(&temporary)
            .map_err(Error::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                self.write(&mut writer)?;
                writer.get_ref().sync_all()?;
                Ok(())
            })
            .and_then(|()| fs::rename(&temporary, path).map_err(Error::from));

        if let Err(err) = written {
            warn!(path = %path.display(), %err, "failed to replace the checkpoint");
            // the temporary file may not exist
            let _ = fs::remove_file(&temporary);
            return Err(err);
        }

        debug!(path = %path.display(), iterations = self.iterations(), "checkpoint written");
        Ok(())
    }
}

fn without_channels(channels: &[Option<ChannelSummary>]) -> bool {
    channels.iter().all(Option::is_none)
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VegasConfig;
    use crate::grid::Grid;
    use crate::stream::SeedScheme;

    fn checkpoint() -> Checkpoint {
        let mut first = Statistics::default();
        for value in [1.0, 0.0, 2.0, f64::NAN] {
            first.add(value);
        }
        let grid = Grid::from_edges(vec![0.0, 0.3, 1.0]).unwrap();
        Checkpoint::new(
            vec![first, first],
            MappingState::Vegas {
                dimensions: 2,
                config: VegasConfig::new(2, 1.5),
                grids: vec![grid.clone(), grid],
            },
            StreamState::new(3, SeedScheme::Independent),
        )
    }

    fn to_json(checkpoint: &Checkpoint) -> serde_json::Value {
        let mut buffer = Vec::new();
        checkpoint.write(&mut buffer).unwrap();
        serde_json::from_slice(&buffer).unwrap()
    }

    fn read_value(value: &serde_json::Value) -> Result<Checkpoint> {
        Checkpoint::read(value.to_string().as_bytes())
    }

    #[test]
    fn test_write_read() {
        let checkpoint = checkpoint();
        let mut buffer = Vec::new();
        checkpoint.write(&mut buffer).unwrap();

        let back = Checkpoint::read(buffer.as_slice()).unwrap();
        assert_eq!(back.results(), checkpoint.results());
        assert_eq!(back.state(), checkpoint.state());
        assert!(back.stream().matches(&checkpoint.stream().rng));
        assert_eq!(back.iterations(), 2);
        assert_eq!(back.version(), VERSION);
    }

    #[test]
    fn test_document_layout() {
        let json = to_json(&checkpoint());
        assert_eq!(json["format"], FORMAT);
        assert_eq!(json["version"], 1);
        assert_eq!(json["state"]["kind"], "vegas");
        assert_eq!(json["state"]["config"]["bins"], 2);
        assert_eq!(json["results"][0]["calls"], 4);
        assert_eq!(json["stream"]["scheme"], "independent");
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        let mut buffer = Vec::new();
        checkpoint().write(&mut buffer).unwrap();
        for len in [0, 1, buffer.len() / 2, buffer.len() - 2] {
            let err = Checkpoint::read(&buffer[..len]).unwrap_err();
            assert!(matches!(err, Error::CorruptCheckpoint(_)), "{err}");
        }
    }

    #[test]
    fn test_rejects_foreign_or_newer_documents() {
        let mut json = to_json(&checkpoint());
        json["format"] = "something-else".into();
        assert!(matches!(read_value(&json), Err(Error::CorruptCheckpoint(_))));

        let mut json = to_json(&checkpoint());
        json["version"] = 2.into();
        let err = read_value(&json).unwrap_err();
        assert!(err.to_string().contains("version 2"), "{err}");

        let mut json = to_json(&checkpoint());
        json["version"] = 0.into();
        assert!(read_value(&json).is_ok());
    }

    #[test]
    fn test_rejects_broken_invariants() {
        let mut json = to_json(&checkpoint());
        json["state"]["grids"][0] = serde_json::json!([0.0, 0.7, 0.4, 1.0]);
        assert!(matches!(read_value(&json), Err(Error::CorruptCheckpoint(_))));

        let mut json = to_json(&checkpoint());
        json["state"]["grids"][1] = serde_json::json!([0.0, 0.2, 0.4, 1.0]);
        assert!(matches!(read_value(&json), Err(Error::CorruptCheckpoint(_))));

        let mut json = to_json(&checkpoint());
        json["results"][1]["non_zero_calls"] = 100.into();
        assert!(matches!(read_value(&json), Err(Error::CorruptCheckpoint(_))));

        let mut json = to_json(&checkpoint());
        json["state"]["kind"] = "hypercube".into();
        assert!(matches!(read_value(&json), Err(Error::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_channel_summaries() {
        let summary = ChannelSummary {
            weights: vec![0.25, 0.75],
            calls: vec![1, 3],
            statistics: vec![0.5, 0.1],
        };
        let checkpoint = checkpoint().with_channels(vec![None, Some(summary.clone())]);
        let json = to_json(&checkpoint);
        assert!(json["channels"][0].is_null());
        assert_eq!(json["channels"][1]["calls"], serde_json::json!([1, 3]));

        let back = read_value(&json).unwrap();
        assert_eq!(back.channel_summary(0), None);
        assert_eq!(back.channel_summary(1), Some(&summary));

        let mut json = to_json(&checkpoint);
        json["channels"].as_array_mut().unwrap().pop();
        assert!(matches!(read_value(&json), Err(Error::CorruptCheckpoint(_))));

        let mut json = to_json(&checkpoint);
        json["channels"][1]["weights"] = serde_json::json!([0.25]);
        assert!(matches!(read_value(&json), Err(Error::CorruptCheckpoint(_))));

        // runs without channels do not store any
        let plain = to_json(&self::checkpoint().with_channels(vec![None, None]));
        assert!(plain.get("channels").is_none());
    }

    #[test]
    fn test_write_file_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, "old contents").unwrap();

        let checkpoint = checkpoint();
        checkpoint.write_file(&path).unwrap();

        let back = Checkpoint::read_file(&path).unwrap();
        assert_eq!(back.results(), checkpoint.results());
        assert!(!temporary_path(&path).exists());

        let missing = dir.path().join("missing").join("run.json");
        assert!(matches!(checkpoint.write_file(&missing), Err(Error::Io(_))));
    }
}
