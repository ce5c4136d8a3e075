//! CSV adapter: a row-mapped reader/writer pair for sensor-style event
//! streams. Grounded line-for-line in `antevents/adapters/csv.py`.
//!
//! Feature-gated (`csv-adapter`) and built on `csv`/`serde`/`time`, not on
//! the generic-row-mapping machinery the original's `adapters.generic`
//! module would suggest — that layer has no other caller in this crate, so
//! it isn't reproduced; see DESIGN.md.

use crate::error::{FatalError, Result};
use crate::publisher::Publisher;
use crate::sources::DirectSource;
use crate::subscriber::Subscriber;
use crate::topic::DEFAULT_TOPIC;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use time::{Date, OffsetDateTime};

impl From<::csv::Error> for FatalError {
    fn from(err: ::csv::Error) -> Self {
        FatalError::Other(Box::new(err))
    }
}

/// A sensor reading: an id, a Unix timestamp in seconds, and a value. Only
/// the CSV adapter and demo binaries know about this type — the core
/// dataflow graph stays generic over `Event: Send + 'static`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SensorEvent {
    pub sensor_id: String,
    pub ts: f64,
    pub val: f64,
}

/// The mapping between an event record and a spreadsheet row.
pub trait EventRowMapping<E> {
    fn header_row(&self) -> Vec<String>;
    fn event_to_row(&self, event: &E) -> Vec<String>;
    fn row_to_event(&self, row: &[String]) -> Result<E>;
}

/// The mapping used for [`SensorEvent`]: the timestamp is written twice, as
/// the raw Unix seconds and as an ISO-8601 datetime for human readability.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorEventMapping;

impl EventRowMapping<SensorEvent> for SensorEventMapping {
    fn header_row(&self) -> Vec<String> {
        vec!["timestamp", "datetime", "sensor_id", "value"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn event_to_row(&self, event: &SensorEvent) -> Vec<String> {
        let datetime = OffsetDateTime::from_unix_timestamp(event.ts as i64)
            .map(|dt| dt.to_string())
            .unwrap_or_else(|_| "invalid-timestamp".to_string());
        vec![
            event.ts.to_string(),
            datetime,
            event.sensor_id.clone(),
            event.val.to_string(),
        ]
    }

    fn row_to_event(&self, row: &[String]) -> Result<SensorEvent> {
        let parse_f64 = |field: &str| -> Result<f64> {
            field
                .parse::<f64>()
                .map_err(|e| FatalError::Other(Box::new(e)))
        };
        if row.len() < 4 {
            return Err(FatalError::Other(Box::new(std::io::Error::other(format!(
                "csv row has {} fields, expected at least 4",
                row.len()
            )))));
        }
        Ok(SensorEvent {
            ts: parse_f64(&row[0])?,
            sensor_id: row[2].clone(),
            val: parse_f64(&row[3])?,
        })
    }
}

/// Writes an event stream to a single CSV file: header row on open,
/// flush-per-row, file closed on any terminal event.
pub struct CsvWriter<E, M> {
    writer: ::csv::Writer<File>,
    mapper: M,
    _marker: std::marker::PhantomData<E>,
}

impl<E, M> CsvWriter<E, M>
where
    M: EventRowMapping<E>,
{
    pub fn new(path: impl AsRef<Path>, mapper: M) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = ::csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(mapper.header_row())?;
        writer.flush()?;
        Ok(CsvWriter {
            writer,
            mapper,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<E, M> Subscriber<E> for CsvWriter<E, M>
where
    E: Send + 'static,
    M: EventRowMapping<E> + Send + 'static,
{
    fn on_next(&mut self, _sub_topic: &str, event: E) -> Result<()> {
        self.writer.write_record(self.mapper.event_to_row(&event))?;
        self.writer.flush()?;
        Ok(())
    }
}

fn default_date_of(ts: f64) -> Date {
    OffsetDateTime::from_unix_timestamp(ts as i64)
        .map(|dt| dt.date())
        .unwrap_or(Date::MIN)
}

/// Writes an event stream to CSV files that roll over at a day boundary:
/// `<base_name>-YYYY-MM-DD.csv`. Appending to an existing file skips the
/// header row; a brand new file gets one.
pub struct RollingCsvWriter<E, M> {
    directory: PathBuf,
    base_name: String,
    mapper: M,
    date_of: Box<dyn Fn(&E) -> Date + Send>,
    current_file_date: Option<Date>,
    writer: Option<::csv::Writer<File>>,
}

impl<E, M> RollingCsvWriter<E, M>
where
    M: EventRowMapping<E>,
{
    pub fn new(
        directory: impl Into<PathBuf>,
        base_name: impl Into<String>,
        mapper: M,
        date_of: impl Fn(&E) -> Date + Send + 'static,
    ) -> Self {
        RollingCsvWriter {
            directory: directory.into(),
            base_name: base_name.into(),
            mapper,
            date_of: Box::new(date_of),
            current_file_date: None,
            writer: None,
        }
    }

    fn start_file(&mut self, date: Date) -> Result<()> {
        let filename = self.directory.join(format!(
            "{}-{:04}-{:02}-{:02}.csv",
            self.base_name,
            date.year(),
            u8::from(date.month()),
            date.day()
        ));
        let already_exists = filename.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(already_exists)
            .write(!already_exists)
            .open(&filename)?;
        let mut writer = ::csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !already_exists {
            writer.write_record(self.mapper.header_row())?;
        }
        writer.flush()?;
        self.writer = Some(writer);
        self.current_file_date = Some(date);
        Ok(())
    }
}

/// Builds a [`RollingCsvWriter`] for [`SensorEvent`]s using the default
/// mapping and a day boundary derived from `ts`.
pub fn rolling_sensor_event_writer(
    directory: impl Into<PathBuf>,
    base_name: impl Into<String>,
) -> RollingCsvWriter<SensorEvent, SensorEventMapping> {
    RollingCsvWriter::new(directory, base_name, SensorEventMapping, |event: &SensorEvent| {
        default_date_of(event.ts)
    })
}

impl<E, M> Subscriber<E> for RollingCsvWriter<E, M>
where
    E: Send + 'static,
    M: EventRowMapping<E> + Send + 'static,
{
    fn on_next(&mut self, _sub_topic: &str, event: E) -> Result<()> {
        let date = (self.date_of)(&event);
        if self.current_file_date != Some(date) {
            self.start_file(date)?;
        }
        let writer = self.writer.as_mut().expect("start_file always sets writer");
        writer.write_record(self.mapper.event_to_row(&event))?;
        writer.flush()?;
        Ok(())
    }
}

/// Reads events from a CSV file a row at a time, mapping each row through
/// `M`. `has_header_row` swallows (and does not dispatch) the first row;
/// a malformed header row is a fatal error, matching the original.
pub struct CsvReader<E, M> {
    records: ::csv::StringRecordsIntoIter<File>,
    mapper: M,
    publisher: Publisher<E>,
}

impl<E, M> CsvReader<E, M>
where
    E: Send + Clone + 'static,
    M: EventRowMapping<E>,
{
    pub fn new(path: impl AsRef<Path>, mapper: M, has_header_row: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = ::csv::ReaderBuilder::new().has_headers(false).from_reader(file);
        let mut records = reader.into_records();
        if has_header_row {
            match records.next() {
                Some(Ok(_)) => {}
                _ => {
                    return Err(FatalError::Other(Box::new(std::io::Error::other(format!(
                        "problem reading header row of csv file {}",
                        path.display()
                    )))));
                }
            }
        }
        Ok(CsvReader {
            records,
            mapper,
            publisher: Publisher::new(&[DEFAULT_TOPIC]),
        })
    }

    pub fn publisher(&self) -> Publisher<E> {
        self.publisher.clone()
    }
}

impl<E, M> DirectSource for CsvReader<E, M>
where
    E: Send + Clone + 'static,
    M: EventRowMapping<E>,
{
    fn observe(&mut self) -> Result<bool> {
        match self.records.next() {
            Some(Ok(record)) => {
                let row: Vec<String> = record.iter().map(String::from).collect();
                let event = self.mapper.row_to_event(&row)?;
                self.publisher.dispatch_next(DEFAULT_TOPIC, event)?;
                Ok(true)
            }
            Some(Err(err)) => Err(FatalError::from(err)),
            None => {
                self.publisher.dispatch_completed(DEFAULT_TOPIC)?;
                Ok(false)
            }
        }
    }
}
