use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use file_rotate::{
    compression::Compression,
    suffix::{AppendCount, FileLimit},
    ContentLimit, FileRotate,
};

use crate::config::LoggingSettings;

/// Rotating file writer handle shared by the fmt layer's workers.
#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendCount>>>);

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriterHandle;
    fn make_writer(&'a self) -> Self::Writer {
        RotWriterHandle(self.0.clone())
    }
}

#[derive(Clone)]
struct RotWriterHandle(Arc<Mutex<FileRotate<AppendCount>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("log writer poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("log writer poisoned"))?
            .flush()
    }
}

fn filter_for(level: &str) -> EnvFilter {
    // RUST_LOG wins when present; otherwise the configured level applies
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Console layer always; a rotating file layer when `file` is configured.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let console = fmt::layer()
        .with_target(true)
        .with_filter(filter_for(&settings.console_level));

    let file_layer = match &settings.file {
        Some(path) => {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create log directory for {path}"))?;
                }
            }
            let rotate = FileRotate::new(
                path,
                AppendCount::new(settings.max_backups),
                ContentLimit::Bytes((settings.max_size_mb * 1024 * 1024) as usize),
                Compression::None,
                #[cfg(unix)]
                None,
            );
            let writer = RotWriter(Arc::new(Mutex::new(rotate)));
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter_for(&settings.file_level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/app.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let rotate = FileRotate::new(
            &path,
            AppendCount::new(2),
            ContentLimit::Bytes(1024 * 1024),
            Compression::None,
            #[cfg(unix)]
            None,
        );
        let writer = RotWriter(Arc::new(Mutex::new(rotate)));
        let mut handle = fmt::MakeWriter::make_writer(&writer);
        handle.write_all(b"hello\n").unwrap();
        handle.flush().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("hello"));
    }
}
