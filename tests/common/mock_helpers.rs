//! Mock collaborators and recording listeners

use datahub_rs::error::{DataHubError, Result};
use datahub_rs::source::{CatalogEntry, ChannelHeader, Listener, SourceInfo};
use datahub_rs::sources::{ArchiveRequest, BusClient, BusEntry, FrameStreamProvider};
use datahub_rs::types::{RecordTime, Value};
use mockall::mock;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

mock! {
    pub Bus {}

    impl BusClient for Bus {
        fn subscribe(&mut self, channels: &[String]) -> Result<()>;
        fn read(&mut self, max: usize, block: Duration) -> Result<Option<Vec<BusEntry>>>;
        fn unsubscribe(&mut self) -> Result<()>;
        fn search(&mut self, pattern: &str) -> Result<Vec<CatalogEntry>>;
        fn describe(&self) -> String;
    }
}

mock! {
    pub Provider {}

    impl FrameStreamProvider for Provider {
        fn open(&self, request: &ArchiveRequest) -> Result<Box<dyn Read + Send>>;
        fn search(&self, pattern: &str, backend: &str) -> Result<Vec<CatalogEntry>>;
        fn describe(&self) -> String;
    }
}

/// Listener recording every callback as a compact string
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    headers: Mutex<Vec<ChannelHeader>>,
    stops: Mutex<Vec<Option<String>>>,
    closed: Mutex<bool>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn headers(&self) -> Vec<ChannelHeader> {
        self.headers.lock().unwrap().clone()
    }

    /// Error text of every `on_stop`, None for clean stops
    pub fn stops(&self) -> Vec<Option<String>> {
        self.stops.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Listener for RecordingListener {
    fn on_start(&self, source: &SourceInfo) -> Result<()> {
        self.push(format!("start:{}", source.id));
        Ok(())
    }

    fn on_channel_header(&self, _source: &SourceInfo, header: &ChannelHeader) -> Result<()> {
        self.push(format!("header:{}", header.name));
        self.headers.lock().unwrap().push(header.clone());
        Ok(())
    }

    fn on_channel_record(
        &self,
        _source: &SourceInfo,
        name: &str,
        _timestamp: &RecordTime,
        id: Option<i64>,
        value: &Value,
    ) -> Result<()> {
        match id {
            Some(id) => self.push(format!("record:{}:{}:{}", name, id, value)),
            None => self.push(format!("record:{}:-:{}", name, value)),
        }
        Ok(())
    }

    fn on_channel_completed(&self, _source: &SourceInfo, name: &str) -> Result<()> {
        self.push(format!("completed:{}", name));
        Ok(())
    }

    fn on_stop(&self, source: &SourceInfo, error: Option<&DataHubError>) -> Result<()> {
        self.push(format!("stop:{}", source.id));
        self.stops.lock().unwrap().push(error.map(|e| e.to_string()));
        Ok(())
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

/// A stream reader over owned bytes
pub fn reader(bytes: Vec<u8>) -> Box<dyn Read + Send> {
    Box::new(std::io::Cursor::new(bytes))
}
