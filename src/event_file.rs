//! Event input.
//!
//! Events reach the calibration already decoded and quality-cut. The
//! [`EventSource`] trait is the seam to whatever produced them; the built-in
//! [`CsvEventSource`] reads one CSV file per run with a header row naming the
//! [`Event`] fields:
//!
//! ```text
//! x_fp,xp_fp,y_fp,yp_fp,theta,delta,x_ver,y_ver
//! 12.1,0.031,-3.4,0.008,11.0,0.4,0.02,-0.01
//! ```
//!
//! Lines starting with `#` are skipped and fields may be padded with spaces.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::config::RunConfig;
use crate::error::{OpticsError, Result};
use crate::event::Event;

/// Supplies the events of one run.
pub trait EventSource {
    fn read_events(&self, run: &RunConfig) -> Result<Vec<Event>>;
}

/// Reads each run's `event_file` as CSV.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvEventSource;

impl CsvEventSource {
    /// Parse events from any CSV reader.
    pub fn read_from<R: Read>(reader: R) -> Result<Vec<Event>> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);
        let mut events = Vec::new();
        for record in rdr.deserialize() {
            events.push(record?);
        }
        Ok(events)
    }

    pub fn read_path<P: AsRef<Path>>(path: P) -> Result<Vec<Event>> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| OpticsError::io(path, e))?;
        let events = Self::read_from(file)?;
        debug!("Read {} events from {}", events.len(), path.display());
        Ok(events)
    }
}

impl EventSource for CsvEventSource {
    fn read_events(&self, run: &RunConfig) -> Result<Vec<Event>> {
        Self::read_path(&run.event_file)
    }
}

/// Write events as CSV with a header row.
pub fn write_events<P: AsRef<Path>>(path: P, events: &[Event]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| OpticsError::io(path, e))?;
    let mut wtr = csv::Writer::from_writer(file);
    for event in events {
        wtr.serialize(event)?;
    }
    wtr.flush().map_err(|e| OpticsError::io(path, e))
}
