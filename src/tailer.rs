//! Log tailer
//!
//! Follows a growing access log by byte offset and hands whole lines to the
//! parse pipeline over a bounded channel. Log rotation is detected by inode
//! change or length regression, after which the new file is read from offset
//! zero. The tailer never gives up on the file: missing paths and read errors
//! are retried forever at the poll interval.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::sleep;

pub struct LogTailer {
    path: PathBuf,
    poll: Duration,
    start_at_end: bool,
}

impl LogTailer {
    /// A fresh tailer starts at end-of-file: replaying an old log would stamp
    /// long-gone connections as live.
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            path: path.into(),
            poll,
            start_at_end: true,
        }
    }

    /// Follow the file until the receiving side goes away.
    pub async fn run(mut self, tx: mpsc::Sender<String>) {
        let mut carry = String::new();

        'open: loop {
            let file = loop {
                match File::open(&self.path).await {
                    Ok(f) => break f,
                    Err(_) => {
                        // A file that shows up later is new; read all of it.
                        if self.start_at_end {
                            tracing::warn!(
                                "[tailer] [waiting] path={}",
                                self.path.display()
                            );
                            self.start_at_end = false;
                        }
                        if tx.is_closed() {
                            return;
                        }
                        sleep(self.poll).await;
                    }
                }
            };

            let meta = match file.metadata().await {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!("[tailer] [stat_failed] err={}", err);
                    sleep(self.poll).await;
                    continue 'open;
                }
            };
            let inode = meta.ino();
            let mut pos = if std::mem::take(&mut self.start_at_end) {
                meta.len()
            } else {
                0
            };
            carry.clear();

            let mut reader = BufReader::new(file);
            if pos > 0 && reader.seek(SeekFrom::Start(pos)).await.is_err() {
                sleep(self.poll).await;
                continue 'open;
            }
            tracing::info!(
                "[tailer] [following] path={} offset={}",
                self.path.display(),
                pos
            );

            let mut line = String::new();
            loop {
                line.clear();
                let n = match reader.read_line(&mut line).await {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::warn!("[tailer] [read_failed] err={}", err);
                        sleep(self.poll).await;
                        continue 'open;
                    }
                };

                if n == 0 {
                    // At EOF. Wait, then check whether the file was rotated or
                    // truncated out from under us.
                    sleep(self.poll).await;
                    if tx.is_closed() {
                        return;
                    }
                    match tokio::fs::metadata(&self.path).await {
                        Ok(m) if m.ino() != inode || m.len() < pos => {
                            tracing::info!(
                                "[tailer] [rotated] path={}",
                                self.path.display()
                            );
                            continue 'open;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            tracing::info!(
                                "[tailer] [vanished] path={}",
                                self.path.display()
                            );
                            continue 'open;
                        }
                    }
                    continue;
                }

                pos += n as u64;
                carry.push_str(&line);
                // A line without a newline is a partial write; keep it until
                // the writer finishes it.
                if carry.ends_with('\n') {
                    let out = carry.trim_end().to_string();
                    carry.clear();
                    if !out.is_empty() && tx.send(out).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
