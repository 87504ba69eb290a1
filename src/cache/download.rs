//! Bounded-concurrency downloads with single-flight per source URL.
//!
//! At most one extraction runs per URL at any time; late callers wait on the
//! first flight's outcome. The semaphore caps how many extractions run across
//! all URLs.

use crate::error::{MeloError, Result};
use crate::extractor::{AudioExtractor, AUDIO_EXTENSIONS};
use crate::models::derived_id;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tracks shorter than this are rejected as jingles/noise, longer ones as
/// full mixes or streams.
const MIN_DURATION_SECS: u64 = 10;
const MAX_DURATION_SECS: u64 = 1800;
const EXTRACT_RETRIES: u32 = 3;

#[derive(Clone)]
enum SharedOutcome {
    Done(PathBuf),
    Failed(String),
    Cancelled,
}

pub struct DownloadCoordinator {
    extractor: Arc<dyn AudioExtractor>,
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<SharedOutcome>>>,
    temp_dir: PathBuf,
    download_timeout: Duration,
    cancel: CancellationToken,
}

impl DownloadCoordinator {
    pub fn new(
        extractor: Arc<dyn AudioExtractor>,
        temp_dir: PathBuf,
        max_concurrent: usize,
        download_timeout: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            extractor,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Mutex::new(HashMap::new()),
            temp_dir,
            download_timeout,
            cancel: CancellationToken::new(),
        })
    }

    /// Download the audio behind `url` into the temp directory and return the
    /// produced file. Concurrent calls for the same URL share one flight.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf> {
        if url.is_empty() {
            return Err(MeloError::Download("track has no resolvable url".into()));
        }
        if self.cancel.is_cancelled() {
            return Err(MeloError::Cancelled);
        }

        let waiter = {
            let mut flights = self.in_flight.lock().await;
            match flights.get(url) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    flights.insert(url.to_string(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = waiter {
            debug!(url, "joining in-flight download");
            return match receiver.recv().await {
                Ok(SharedOutcome::Done(path)) => Ok(path),
                Ok(SharedOutcome::Failed(message)) => Err(MeloError::Download(message)),
                Ok(SharedOutcome::Cancelled) | Err(_) => Err(MeloError::Cancelled),
            };
        }

        let result = self.fetch_inner(url).await;

        let sender = self.in_flight.lock().await.remove(url);
        if let Some(sender) = sender {
            let shared = match &result {
                Ok(path) => SharedOutcome::Done(path.clone()),
                Err(MeloError::Cancelled) => SharedOutcome::Cancelled,
                Err(err) => SharedOutcome::Failed(err.to_string()),
            };
            let _ = sender.send(shared);
        }
        result
    }

    async fn fetch_inner(&self, url: &str) -> Result<PathBuf> {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MeloError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| MeloError::Cancelled)?
            }
        };

        // reject unsuitable media before spending bandwidth on it
        if let Ok(Some(probe)) = self.extractor.probe(url).await {
            if let Some(duration) = probe.duration {
                let secs = duration.max(0.0).round() as u64;
                if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&secs) {
                    return Err(MeloError::Download(format!(
                        "duration {secs}s outside [{MIN_DURATION_SECS}s, {MAX_DURATION_SECS}s]"
                    )));
                }
            }
        }

        let temp_id = derived_id(url);
        let template = self
            .temp_dir
            .join(format!("{temp_id}.%(ext)s"))
            .to_string_lossy()
            .into_owned();

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(MeloError::Cancelled),
            extracted = self.extractor.extract(url, &template, self.download_timeout, EXTRACT_RETRIES) => extracted,
        };

        match result {
            Ok(path) => {
                let accepted = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        AUDIO_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext))
                    });
                if !accepted {
                    let _ = std::fs::remove_file(&path);
                    return Err(MeloError::Download(format!(
                        "extractor produced unsupported file {}",
                        path.display()
                    )));
                }
                Ok(path)
            }
            Err(err) => {
                self.remove_partials(&temp_id);
                Err(err)
            }
        }
    }

    /// Cancel all in-flight extractions. Waiters observe a cancellation
    /// error; partial files are removed by the owning flight.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn remove_partials(&self, temp_id: &str) {
        let Ok(entries) = std::fs::read_dir(&self.temp_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let matches = path
                .file_stem()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name == temp_id);
            if matches {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "failed to remove partial download");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::MediaProbe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockExtractor {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        probed_duration: Option<f64>,
    }

    impl MockExtractor {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                delay,
                probed_duration: None,
            }
        }

        fn with_duration(mut self, secs: f64) -> Self {
            self.probed_duration = Some(secs);
            self
        }
    }

    #[async_trait]
    impl AudioExtractor for MockExtractor {
        async fn extract(
            &self,
            _url: &str,
            out_template: &str,
            _timeout: Duration,
            _retries: u32,
        ) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let path = PathBuf::from(out_template.replace(".%(ext)s", ".mp3"));
            std::fs::write(&path, b"audio-bytes")?;
            Ok(path)
        }

        async fn probe(&self, _url: &str) -> Result<Option<MediaProbe>> {
            Ok(self.probed_duration.map(|duration| MediaProbe {
                title: "probed".into(),
                duration: Some(duration),
            }))
        }
    }

    fn coordinator(
        extractor: Arc<MockExtractor>,
        temp: &std::path::Path,
        max_concurrent: usize,
    ) -> DownloadCoordinator {
        DownloadCoordinator::new(
            extractor,
            temp.to_path_buf(),
            max_concurrent,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn same_url_is_single_flight() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(50)));
        let coordinator = Arc::new(coordinator(extractor.clone(), temp.path(), 4));

        let a = coordinator.clone();
        let b = coordinator.clone();
        let (first, second) = tokio::join!(
            a.fetch("https://example.com/v/1"),
            b.fetch("https://example.com/v/1"),
        );

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_urls_respect_the_semaphore() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(30)));
        let coordinator = Arc::new(coordinator(extractor.clone(), temp.path(), 2));

        let mut handles = Vec::new();
        for i in 0..4 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.fetch(&format!("https://example.com/v/{i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 4);
        assert!(extractor.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn duration_filter_rejects_before_download() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = Arc::new(MockExtractor::new(Duration::from_millis(1)).with_duration(5.0));
        let coordinator = coordinator(extractor.clone(), temp.path(), 2);

        let err = coordinator.fetch("https://example.com/v/short").await;
        assert!(matches!(err, Err(MeloError::Download(_))));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

        let long = Arc::new(MockExtractor::new(Duration::from_millis(1)).with_duration(3600.0));
        let coordinator = DownloadCoordinator::new(
            long.clone(),
            temp.path().to_path_buf(),
            2,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(coordinator.fetch("https://example.com/v/long").await.is_err());
        assert_eq!(long.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiters() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = Arc::new(MockExtractor::new(Duration::from_secs(30)));
        let coordinator = Arc::new(coordinator(extractor, temp.path(), 1));

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.fetch("https://example.com/v/slow").await })
        };
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.fetch("https://example.com/v/slow").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.shutdown();

        assert!(matches!(leader.await.unwrap(), Err(MeloError::Cancelled)));
        assert!(matches!(waiter.await.unwrap(), Err(MeloError::Cancelled)));
    }
}
