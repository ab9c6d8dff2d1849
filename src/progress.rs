// src/progress.rs

//! Progress reporting for long-running image and migration work.
//!
//! Progress is surfaced as operation metadata: a handler receives
//! (percent-or-bytes, speed) pairs and folds them into the operation's
//! metadata map, which API clients poll. The values are cosmetic; nothing
//! throttles on them.

use serde_json::{json, Map, Value};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

/// Handler invoked with (value, speed) as bytes flow
///
/// When the total length is known, `value` is a percentage (0-100);
/// otherwise it is the raw byte count.
pub type ProgressHandler = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// Tracks throughput on a single stream
pub struct ProgressTracker {
    /// Total expected bytes, 0 when unknown
    pub length: i64,
    pub handler: ProgressHandler,
}

impl ProgressTracker {
    pub fn new(length: i64, handler: ProgressHandler) -> Self {
        Self { length, handler }
    }

    /// A tracker that drops all updates
    pub fn silent() -> Self {
        Self {
            length: 0,
            handler: Arc::new(|_, _| {}),
        }
    }
}

/// Writer adapter reporting progress as bytes pass through
pub struct ProgressWriter<W: Write> {
    inner: W,
    tracker: ProgressTracker,
    written: i64,
    started: Instant,
    last_percent: i64,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(inner: W, tracker: ProgressTracker) -> Self {
        Self {
            inner,
            tracker,
            written: 0,
            started: Instant::now(),
            last_percent: -1,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn report(&mut self) {
        let elapsed = self.started.elapsed().as_secs() as i64;
        let speed = if elapsed > 0 {
            self.written / elapsed
        } else {
            self.written
        };

        if self.tracker.length > 0 {
            let percent = (self.written * 100) / self.tracker.length;
            if percent != self.last_percent {
                self.last_percent = percent;
                (self.tracker.handler)(percent, speed);
            }
        } else {
            (self.tracker.handler)(self.written, speed);
        }
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as i64;
        self.report();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Fold a progress sample into an operation metadata map
///
/// The stored shape is stable API:
/// `{"<key>": {"description": ..., "progress": {"percent", "processed", "speed"}}}`
pub fn set_progress_metadata(
    metadata: &mut Map<String, Value>,
    key: &str,
    description: &str,
    percent: i64,
    processed: i64,
    speed: i64,
) {
    metadata.insert(
        key.to_string(),
        json!({
            "description": description,
            "progress": {
                "percent": percent,
                "processed": processed,
                "speed": speed,
            },
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_writer_percent() {
        let samples: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Vec::new();

        let samples_clone = samples.clone();
        let tracker = ProgressTracker::new(
            100,
            Arc::new(move |value, speed| {
                samples_clone.lock().unwrap().push((value, speed));
            }),
        );

        let mut writer = ProgressWriter::new(sink, tracker);
        writer.write_all(&[0u8; 50]).unwrap();
        writer.write_all(&[0u8; 50]).unwrap();

        let samples = samples.lock().unwrap();
        assert_eq!(samples.first().unwrap().0, 50);
        assert_eq!(samples.last().unwrap().0, 100);
    }

    #[test]
    fn test_progress_writer_unknown_length_reports_bytes() {
        let samples: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));

        let samples_clone = samples.clone();
        let tracker = ProgressTracker::new(
            0,
            Arc::new(move |value, speed| {
                samples_clone.lock().unwrap().push((value, speed));
            }),
        );

        let mut writer = ProgressWriter::new(Vec::new(), tracker);
        writer.write_all(&[0u8; 10]).unwrap();

        assert_eq!(samples.lock().unwrap().last().unwrap().0, 10);
    }

    #[test]
    fn test_set_progress_metadata_shape() {
        let mut metadata = Map::new();
        set_progress_metadata(&mut metadata, "image_pack", "Image pack", 40, 4096, 1024);

        let entry = metadata.get("image_pack").unwrap();
        assert_eq!(entry["description"], "Image pack");
        assert_eq!(entry["progress"]["percent"], 40);
        assert_eq!(entry["progress"]["processed"], 4096);
    }
}
