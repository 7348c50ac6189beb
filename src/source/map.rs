//! Source registry
//!
//! Deduplicates sources by path: however many consumers ask for the same
//! input, there is at most one producer reading it. Reader attachment is
//! done under the map lock, so there is no window in which a consumer can be
//! handed a source whose idle-close has already removed it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::filter::FrameFilter;
use crate::server::Config;
use crate::source::reader::SourceReader;
use crate::source::source::Source;

/// Registry of live sources, keyed by path
pub struct SourceMap {
    sources: Mutex<HashMap<String, Arc<Source>>>,
}

impl SourceMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sources: Mutex::new(HashMap::new()),
        })
    }

    /// Return a reader for `path`, creating and starting the source if this
    /// is its first consumer.
    pub fn new_reader(self: &Arc<Self>, path: &str, config: &Config) -> Result<SourceReader> {
        let filter = config.filter_kind()?.build(config.frame_bytes);
        Ok(self.reader_with_filter(path, config, filter))
    }

    /// Same as [`new_reader`](Self::new_reader) with an explicit filter
    /// instance, the seam tests use to inject scripted filters.
    pub(crate) fn reader_with_filter(
        self: &Arc<Self>,
        path: &str,
        config: &Config,
        filter: Box<dyn FrameFilter>,
    ) -> SourceReader {
        let mut sources = self.sources.lock().unwrap();
        let source = match sources.get(path) {
            Some(source) => Arc::clone(source),
            None => {
                let source = Source::new(path, config, Arc::downgrade(self));
                sources.insert(path.to_string(), Arc::clone(&source));
                source.spawn_producer(filter);
                source
            }
        };
        source.new_reader()
    }

    /// Remove `source` if it has no readers left; called on behalf of an
    /// idle-closing source. Returns whether the caller should finish the
    /// close.
    pub(crate) fn remove_if_idle(&self, source: &Source) -> bool {
        let mut sources = self.sources.lock().unwrap();
        if source.active_readers() == 0 {
            sources.remove(source.path());
            true
        } else {
            false
        }
    }

    /// Number of live sources
    pub fn count(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    /// Close every source, disconnecting all of their readers. Idempotent.
    pub fn close_all(&self) {
        let sources: Vec<Arc<Source>> = self.sources.lock().unwrap().values().cloned().collect();
        for source in sources {
            source.close();
        }
    }
}
