//! Band asset retrieval into a local download cache.
//!
//! Each band file is streamed in fixed-size chunks into a hidden `.part`
//! file next to its destination and renamed into place only after the whole
//! body arrived (and matched the advertised length). A file carrying the
//! final name is therefore always complete, and re-running a fetch against a
//! populated directory touches neither the signer nor the network.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::io::catalog::AssetSigner;
use crate::types::{AssetReference, CatalogItem, LocalBandFile, VegError, VegResult};

/// Progress of one band transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub band: String,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}

impl TransferProgress {
    pub fn percent_complete(&self) -> Option<f64> {
        self.total_bytes
            .filter(|total| *total > 0)
            .map(|total| (self.bytes_transferred as f64 / total as f64) * 100.0)
    }
}

/// Receives transfer events. Returning `ControlFlow::Break` from
/// [`on_progress`](ProgressObserver::on_progress) cancels the transfer.
pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, _band: &str, _total_bytes: Option<u64>) {}

    fn on_progress(&self, progress: &TransferProgress) -> ControlFlow<()>;

    fn on_finish(&self, _band: &str) {}
}

/// Observer that never reports and never cancels
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl ProgressObserver for SilentProgress {
    fn on_progress(&self, _progress: &TransferProgress) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Logs a debug line roughly every `interval` bytes of each transfer
#[derive(Debug, Default)]
pub struct LogProgress {
    interval: u64,
    last_logged: std::sync::Mutex<std::collections::HashMap<String, u64>>,
}

impl LogProgress {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            last_logged: Default::default(),
        }
    }
}

impl ProgressObserver for LogProgress {
    fn on_progress(&self, progress: &TransferProgress) -> ControlFlow<()> {
        let Ok(mut last_logged) = self.last_logged.lock() else {
            return ControlFlow::Continue(());
        };
        let last = last_logged.entry(progress.band.clone()).or_insert(0);
        if progress.bytes_transferred.saturating_sub(*last) >= self.interval.max(1) {
            *last = progress.bytes_transferred;
            match progress.percent_complete() {
                Some(percent) => log::debug!(
                    "{}: {} bytes ({:.1}%)",
                    progress.band,
                    progress.bytes_transferred,
                    percent
                ),
                None => log::debug!("{}: {} bytes", progress.band, progress.bytes_transferred),
            }
        }
        ControlFlow::Continue(())
    }

    fn on_finish(&self, band: &str) {
        if let Ok(mut last_logged) = self.last_logged.lock() {
            last_logged.remove(band);
        }
    }
}

/// Terminal progress bars, one per band
#[cfg(feature = "progress")]
pub struct ProgressBarObserver {
    bars: indicatif::MultiProgress,
    active: std::sync::Mutex<std::collections::HashMap<String, indicatif::ProgressBar>>,
}

#[cfg(feature = "progress")]
impl ProgressBarObserver {
    pub fn new() -> Self {
        Self {
            bars: indicatif::MultiProgress::new(),
            active: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn style() -> indicatif::ProgressStyle {
        indicatif::ProgressStyle::default_bar()
            .template("DL {msg} [{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("##-")
    }
}

#[cfg(feature = "progress")]
impl Default for ProgressBarObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "progress")]
impl ProgressObserver for ProgressBarObserver {
    fn on_start(&self, band: &str, total_bytes: Option<u64>) {
        let bar = self.bars.add(indicatif::ProgressBar::new(total_bytes.unwrap_or(0)));
        bar.set_style(Self::style());
        bar.set_message(band.to_string());
        if let Ok(mut active) = self.active.lock() {
            active.insert(band.to_string(), bar);
        }
    }

    fn on_progress(&self, progress: &TransferProgress) -> ControlFlow<()> {
        if let Ok(active) = self.active.lock() {
            if let Some(bar) = active.get(&progress.band) {
                bar.set_position(progress.bytes_transferred);
            }
        }
        ControlFlow::Continue(())
    }

    fn on_finish(&self, band: &str) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(bar) = active.remove(band) {
                bar.finish();
            }
        }
    }
}

/// An open remote asset body
pub struct AssetStream {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

/// Opens resolved asset URLs for reading
pub trait AssetSource: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<AssetStream>;
}

/// HTTP(S) asset source backed by a blocking reqwest client
pub struct HttpAssetSource {
    client: reqwest::blocking::Client,
}

impl HttpAssetSource {
    pub fn new(timeout: Duration) -> VegResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| transport_error("building HTTP client for asset transfers", e))?;
        Ok(Self { client })
    }
}

fn transport_error(context: &str, cause: impl std::fmt::Display) -> VegError {
    VegError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", context, cause),
    ))
}

impl AssetSource for HttpAssetSource {
    fn open(&self, url: &str) -> std::io::Result<AssetStream> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("HTTP {}", status),
            ));
        }

        Ok(AssetStream {
            content_length: response.content_length(),
            reader: Box::new(response),
        })
    }
}

/// Transfer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Bytes read per chunk
    pub chunk_size: usize,
    /// Fetch bands concurrently (needs the `parallel` feature)
    pub parallel: bool,
    /// Reject cached or downloaded files whose size differs from the
    /// advertised content length
    pub verify_length: bool,
    /// Whole-transfer timeout for the HTTP source (connect through last byte)
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            parallel: true,
            verify_length: true,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Outcome of fetching the bands of one item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub item_id: String,
    /// Band name -> local file, for every band present after the fetch
    pub files: BTreeMap<String, LocalBandFile>,
    /// Bands the item does not carry
    pub unavailable: Vec<String>,
}

/// Calls [`ProgressObserver::on_finish`] when dropped
struct FinishOnDrop<'o> {
    observer: &'o dyn ProgressObserver,
    band: &'o str,
}

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.observer.on_finish(self.band);
    }
}

/// Downloads band assets of a catalog item into a destination directory.
pub struct AssetFetcher<'a> {
    signer: &'a dyn AssetSigner,
    source: Box<dyn AssetSource + 'a>,
    observer: Box<dyn ProgressObserver + 'a>,
    options: FetchOptions,
}

impl<'a> AssetFetcher<'a> {
    pub fn new(signer: &'a dyn AssetSigner, source: Box<dyn AssetSource + 'a>) -> Self {
        Self {
            signer,
            source,
            observer: Box::new(LogProgress::new(1_000_000)),
            options: FetchOptions::default(),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressObserver + 'a>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Fetch `bands` of `item` into `destination`.
    ///
    /// Bands missing from the item are logged and listed in
    /// [`FetchReport::unavailable`]; any other failure aborts the fetch.
    pub fn fetch<S: AsRef<str> + Sync>(
        &self,
        item: &CatalogItem,
        bands: &[S],
        destination: &Path,
    ) -> VegResult<FetchReport> {
        std::fs::create_dir_all(destination)?;
        log::info!(
            "Fetching {} band(s) of {} into {}",
            bands.len(),
            item.id,
            destination.display()
        );

        let results = self.fetch_all(item, bands, destination);

        let mut report = FetchReport {
            item_id: item.id.clone(),
            ..FetchReport::default()
        };
        for result in results {
            match result {
                Ok(file) => {
                    report.files.insert(file.band.clone(), file);
                }
                Err(VegError::BandUnavailable { item, band }) => {
                    log::warn!("Band {} not found for product {}", band, item);
                    report.unavailable.push(band);
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "Fetch complete for {}: {} file(s), {} unavailable",
            item.id,
            report.files.len(),
            report.unavailable.len()
        );
        Ok(report)
    }

    #[cfg(feature = "parallel")]
    fn fetch_all<S: AsRef<str> + Sync>(
        &self,
        item: &CatalogItem,
        bands: &[S],
        destination: &Path,
    ) -> Vec<VegResult<LocalBandFile>> {
        if self.options.parallel {
            bands
                .par_iter()
                .map(|band| self.fetch_band(item, band.as_ref(), destination))
                .collect()
        } else {
            bands
                .iter()
                .map(|band| self.fetch_band(item, band.as_ref(), destination))
                .collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn fetch_all<S: AsRef<str> + Sync>(
        &self,
        item: &CatalogItem,
        bands: &[S],
        destination: &Path,
    ) -> Vec<VegResult<LocalBandFile>> {
        bands
            .iter()
            .map(|band| self.fetch_band(item, band.as_ref(), destination))
            .collect()
    }

    /// Fetch a single band, reusing a complete cached file when present.
    pub fn fetch_band(
        &self,
        item: &CatalogItem,
        band: &str,
        destination: &Path,
    ) -> VegResult<LocalBandFile> {
        let asset = item.asset(band).ok_or_else(|| VegError::BandUnavailable {
            item: item.id.clone(),
            band: band.to_string(),
        })?;

        let file_name = asset.file_name()?;
        let target = destination.join(&file_name);

        if let Some(size) = self.cached_size(&target, asset.content_length)? {
            log::info!("{} already present ({} bytes)", file_name, size);
            return Ok(LocalBandFile {
                band: band.to_string(),
                path: target,
                size,
            });
        }

        let url = self.signer.sign(&asset.href)?;
        let size = self.download(asset, &url, &target)?;

        Ok(LocalBandFile {
            band: band.to_string(),
            path: target,
            size,
        })
    }

    /// Size of a usable cached file, or `None` when it must be (re)downloaded.
    ///
    /// `expected` is the catalog's advertised length. Downloads are refused
    /// when the server disagrees with it, so a file persisted by
    /// [`download`](Self::download) always passes this check.
    fn cached_size(&self, path: &Path, expected: Option<u64>) -> VegResult<Option<u64>> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let size = metadata.len();
        if !metadata.is_file() || size == 0 {
            return Ok(None);
        }
        if let (true, Some(expected)) = (self.options.verify_length, expected) {
            if expected != size {
                log::warn!(
                    "{} has {} bytes, expected {}; downloading again",
                    path.display(),
                    size,
                    expected
                );
                return Ok(None);
            }
        }
        Ok(Some(size))
    }

    fn download(&self, asset: &AssetReference, url: &str, target: &Path) -> VegResult<u64> {
        let band = asset.band.as_str();
        let transfer_error = |reason: String| VegError::Transfer {
            band: band.to_string(),
            url: asset.href.clone(),
            reason,
        };

        let directory = target.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let file_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut stream = self
            .source
            .open(url)
            .map_err(|e| transfer_error(e.to_string()))?;
        if let (true, Some(advertised), Some(served)) = (
            self.options.verify_length,
            asset.content_length,
            stream.content_length,
        ) {
            if advertised != served {
                return Err(transfer_error(format!(
                    "catalog advertises {} bytes, server sends {}",
                    advertised, served
                )));
            }
        }
        let expected = asset.content_length.or(stream.content_length);

        // Dropped (and deleted) on every early return below.
        let mut partial = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(".part")
            .tempfile_in(&directory)?;

        self.observer.on_start(band, expected);
        let finish = FinishOnDrop {
            observer: &*self.observer,
            band,
        };

        let mut buffer = vec![0u8; self.options.chunk_size.max(1)];
        let mut progress = TransferProgress {
            band: band.to_string(),
            bytes_transferred: 0,
            total_bytes: expected,
        };

        loop {
            let n = match stream.reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(transfer_error(e.to_string())),
            };
            partial
                .write_all(&buffer[..n])
                .map_err(|e| transfer_error(format!("writing {}: {}", file_name, e)))?;

            progress.bytes_transferred += n as u64;
            if self.observer.on_progress(&progress).is_break() {
                return Err(transfer_error("cancelled".to_string()));
            }
        }

        drop(finish);

        let transferred = progress.bytes_transferred;
        if transferred == 0 {
            return Err(transfer_error("empty response body".to_string()));
        }
        if let (true, Some(expected)) = (self.options.verify_length, expected) {
            if expected != transferred {
                return Err(transfer_error(format!(
                    "expected {} bytes, received {}",
                    expected, transferred
                )));
            }
        }

        partial.as_file().sync_all()?;
        partial
            .persist(target)
            .map_err(|e| transfer_error(format!("finalizing {}: {}", file_name, e.error)))?;

        log::info!("Downloaded {} ({} bytes)", file_name, transferred);
        Ok(transferred)
    }
}
