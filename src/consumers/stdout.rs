//! Line-per-event text consumer

use crate::error::{DataHubError, Result};
use crate::source::{ChannelHeader, Listener, SourceInfo};
use crate::types::{RecordTime, Value};
use parking_lot::Mutex;
use std::io::{Stdout, Write};

/// Writes every event as one line of text.
///
/// ```text
/// start archive_0[sf-databuffer]
/// header S10-BPM:X f64 []
/// S10-BPM:X 2024-02-15T12:41:00.000000Z 10 1.5
/// completed S10-BPM:X
/// stop archive_0
/// ```
pub struct StdoutWriter<W: Write + Send = Stdout> {
    writer: Mutex<W>,
}

impl StdoutWriter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> StdoutWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn line(&self, text: std::fmt::Arguments<'_>) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_fmt(text)?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write + Send> Listener for StdoutWriter<W> {
    fn on_start(&self, source: &SourceInfo) -> Result<()> {
        self.line(format_args!("start {}", source.description))
    }

    fn on_channel_header(&self, _source: &SourceInfo, header: &ChannelHeader) -> Result<()> {
        match &header.compression {
            Some(codec) => self.line(format_args!(
                "header {} {} {:?} {}",
                header.name, header.dtype, header.shape, codec
            )),
            None => self.line(format_args!(
                "header {} {} {:?}",
                header.name, header.dtype, header.shape
            )),
        }
    }

    fn on_channel_record(
        &self,
        _source: &SourceInfo,
        name: &str,
        timestamp: &RecordTime,
        id: Option<i64>,
        value: &Value,
    ) -> Result<()> {
        match id {
            Some(id) => self.line(format_args!("{} {} {} {}", name, timestamp, id, value)),
            None => self.line(format_args!("{} {} - {}", name, timestamp, value)),
        }
    }

    fn on_channel_completed(&self, _source: &SourceInfo, name: &str) -> Result<()> {
        self.line(format_args!("completed {}", name))
    }

    fn on_stop(&self, source: &SourceInfo, error: Option<&DataHubError>) -> Result<()> {
        match error {
            Some(e) => self.line(format_args!("stop {} ({})", source.id, e)),
            None => self.line(format_args!("stop {}", source.id)),
        }
    }

    fn close(&self) {
        let _ = self.writer.lock().flush();
    }
}
