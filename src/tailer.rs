//! Diagnostic tailing of node log files.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

const SCAN_INTERVAL: Duration = Duration::from_millis(250);

/// Follows the `node*.log` files under a cluster working directory and
/// echoes appended lines to stdout, each prefixed with its file name. New
/// files are picked up as nodes come online.
#[derive(Debug)]
pub struct LogTailer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogTailer {
    pub fn spawn(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = std::thread::spawn(move || tail_loop(&dir, &flag));

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the tailer thread to finish its current scan and exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop the tailer and wait for its thread to exit.
    pub fn join(mut self) {
        self.stop();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("log tailer thread panicked");
            }
        }
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.stop();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn tail_loop(dir: &Path, stop: &AtomicBool) {
    let mut offsets: HashMap<PathBuf, u64> = HashMap::new();

    while !stop.load(Ordering::Relaxed) {
        for (path, name) in node_logs(dir) {
            let offset = offsets.entry(path.clone()).or_insert(0);

            if let Err(err) = drain_appended(&path, &name, offset) {
                warn!(path = %path.display(), %err, "failed to tail log file");
            }
        }

        std::thread::sleep(SCAN_INTERVAL);
    }
}

fn node_logs(dir: &Path) -> Vec<(PathBuf, String)> {
    let mut found = Vec::new();

    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if name.starts_with("node") && name.ends_with(".log") {
            found.push((entry.path(), name.to_string()));
        }
    }

    found.sort();
    found
}

fn drain_appended(path: &Path, name: &str, offset: &mut u64) -> std::io::Result<()> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    // the supervisor truncates logs when a node restarts
    if len < *offset {
        *offset = 0;
    }

    if len == *offset {
        return Ok(());
    }

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(*offset))?;

    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;

        if read == 0 {
            break;
        }

        // leave partial trailing lines for the next scan
        if !line.ends_with('\n') {
            break;
        }

        *offset += read as u64;
        print!("{name}: {line}");
    }

    Ok(())
}
