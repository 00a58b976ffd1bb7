use crate::BackgroundIoHandle;
use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
};

const CHUNK_SIZE: usize = 8 << 10;

/// Drain `src` into a shared buffer from a background thread. With
/// `echo` set, every chunk is also copied to stdout (debug runs).
pub fn read_background<T: Read + Send + 'static>(mut src: T, echo: bool) -> BackgroundIoHandle {
    let buf = Arc::new(Mutex::new(Vec::with_capacity(CHUNK_SIZE)));
    let finished = Arc::new(AtomicBool::new(false));
    let shared_buf = Arc::clone(&buf);
    let finished1 = Arc::clone(&finished);

    std::thread::spawn(move || {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = match src.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if echo {
                let stdout = std::io::stdout();
                let mut stdout = stdout.lock();
                let _ = stdout.write_all(&chunk[..n]);
                let _ = stdout.flush();
            }
            let mut buf = shared_buf.lock().unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        finished1.store(true, Ordering::Relaxed);
    });

    BackgroundIoHandle::new(buf, finished)
}

/// Forward `src` chunk-wise into `tx` from a background thread. Stops on
/// EOF, read error, or a closed receiver.
pub fn stream_to<T: Read + Send + 'static>(mut src: T, tx: Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = match src.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if tx.send(chunk[..n].to_vec()).is_err() {
                break;
            }
        }
    });
}
