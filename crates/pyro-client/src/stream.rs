//! Client side of remote item streams.
//!
//! When a remote method returns an iterator the daemon keeps it and hands
//! out a stream id. [`ItemStream`] fetches one item per round trip through
//! the daemon's `get_next_stream_item` and tells the daemon to drop the
//! cursor once it is exhausted, closed or dropped.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pyro_common::{PyroError, Result};
use serde_json::{json, Map, Value};

use crate::proxy::ProxyInner;

/// An iterator over the items of a remote stream.
///
/// Items are fetched on the proxy's connection, so the stream follows the
/// proxy's ownership rules.
pub struct ItemStream {
    proxy: Arc<Mutex<ProxyInner>>,
    id: String,
    /// Proxy sequence number after the last request made for this stream
    last_seq: u16,
    done: bool,
    closed: bool,
}

impl ItemStream {
    pub(crate) fn new(proxy: Arc<Mutex<ProxyInner>>, id: String, last_seq: u16) -> Self {
        Self {
            proxy,
            id,
            last_seq,
            done: false,
            closed: false,
        }
    }

    /// Stream id assigned by the daemon.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tells the daemon to discard the stream. Further calls to `next`
    /// return `None`.
    pub fn close(&mut self) {
        self.done = true;
        if self.closed {
            return;
        }
        self.closed = true;

        let mut proxy = self.proxy.lock();
        if !proxy.is_connected() {
            // Nothing to close on; the daemon releases it when the linger ends.
            return;
        }
        if proxy.seq == self.last_seq {
            if let Err(e) = proxy.call_daemon("close_stream", &[json!(self.id)], true) {
                tracing::debug!(stream = %self.id, error = %e, "Failed to close item stream");
            }
            return;
        }

        // The proxy has been used for other calls since; close through a
        // separate connection so its sequence numbers stay untouched.
        let daemon = proxy.daemon_proxy();
        drop(proxy);
        let outcome = daemon.and_then(|daemon| {
            let result = daemon.call("close_stream", vec![json!(self.id)], Map::new());
            daemon.release();
            result
        });
        if let Err(e) = outcome {
            tracing::debug!(stream = %self.id, error = %e, "Failed to close item stream");
        }
    }

    fn fetch(&mut self) -> Result<Option<Value>> {
        let mut proxy = self.proxy.lock();
        proxy.check_owner()?;
        let result = proxy.call_daemon("get_next_stream_item", &[json!(self.id)], false);
        self.last_seq = proxy.seq;
        drop(proxy);
        match result {
            Ok(item) => Ok(Some(item)),
            Err(PyroError::Remote(e)) if e.is_stop_iteration() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Iterator for ItemStream {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fetch() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for ItemStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ItemStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}
