//! Pseudoterminal allocation and the blocking-to-async bridge.
//!
//! `portable_pty`'s master half is a synchronous `Read`/`Write`; we bridge it
//! onto Tokio by running the blocking read loop on its own OS thread and
//! funneling chunks through an `mpsc` channel, the same shape used to bridge
//! a PTY into an async event loop in `examples/other_examples`'s bubblewrap
//! sandbox service.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child as PtyChild, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::error::ProcessError;

pub struct PtyHandle {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    reader_rx: Mutex<Option<mpsc::Receiver<Option<Vec<u8>>>>>,
    child: Arc<Mutex<Box<dyn PtyChild + Send + Sync>>>,
}

impl PtyHandle {
    /// Allocates a pty pair sized `rows x cols`, spawns `argv` attached to
    /// the slave, and starts the reader-bridge thread on the master.
    pub fn spawn(argv: &[String], rows: u16, cols: u16) -> Result<Self, ProcessError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Io(std::io::Error::other(e.to_string())))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProcessError::Io(std::io::Error::other(e.to_string())))?;
        // Drop our copy of the slave so the master sees EOF once the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::Io(std::io::Error::other(e.to_string())))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::Io(std::io::Error::other(e.to_string())))?;

        let (tx, rx) = mpsc::channel(64);
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => {
                        let _ = tx.blocking_send(None);
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(Some(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            master: Arc::new(Mutex::new(pair.master)),
            reader_rx: Mutex::new(Some(rx)),
            child: Arc::new(Mutex::new(child)),
        })
    }

    pub fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        let mut w = self.writer.lock().unwrap();
        w.write_all(data)?;
        w.flush()?;
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Io(std::io::Error::other(e.to_string())))
    }

    pub fn take_reader(&self) -> Option<mpsc::Receiver<Option<Vec<u8>>>> {
        self.reader_rx.lock().unwrap().take()
    }

    /// Replaces the writer with a no-op sink, so subsequent `write` calls
    /// become silent no-ops rather than writing to a stale fd.
    pub fn close_writer(&self) {
        *self.writer.lock().unwrap() = Box::new(std::io::sink());
    }

    pub fn child(&self) -> Arc<Mutex<Box<dyn PtyChild + Send + Sync>>> {
        self.child.clone()
    }
}
