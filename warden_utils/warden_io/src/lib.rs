//! Background readers for process and console output.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::sleep;
use std::time::Duration;

pub mod thread;

/// Handle to an output stream drained by a background thread into a
/// shared buffer.
#[derive(Debug)]
pub struct BackgroundIoHandle {
    buf: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
}

impl BackgroundIoHandle {
    fn new(buf: Arc<Mutex<Vec<u8>>>, finished: Arc<AtomicBool>) -> Self {
        Self { buf, finished }
    }

    /// Take everything buffered so far.
    pub fn current_data(&self) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap();
        buf.split_off(0)
    }

    pub fn clear_current(&self) {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
    }

    /// True once the underlying stream hit EOF or an error.
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Wait for the stream to end and return whatever is left.
    pub fn wait_finish(self) -> Vec<u8> {
        while !self.finished() {
            sleep(Duration::from_millis(10));
        }
        self.current_data()
    }
}

impl Clone for BackgroundIoHandle {
    fn clone(&self) -> Self {
        BackgroundIoHandle {
            buf: Arc::clone(&self.buf),
            finished: Arc::clone(&self.finished),
        }
    }
}
