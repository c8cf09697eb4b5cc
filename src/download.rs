use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use indicatif::{ProgressBar, ProgressStyle};
use md5::{Digest, Md5};

use crate::auth::TokenProvider;
use crate::config::ClientConfig;
use crate::error::{DownloadError, DownloadErrorKind, Result, summarize_body};
use crate::http::{Failure, Transport};
use crate::product::ProductDescriptor;
use crate::util::{backoff, urljoin};

const DEFAULT_WORKERS: usize = 4;
const CHUNK_SIZE: usize = 64 * 1024;

/// Result of a successful [`Downloader::download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    /// The destination already held a file of the expected size and checksum.
    AlreadyPresent { path: PathBuf },
}

impl DownloadOutcome {
    pub fn path(&self) -> &Path {
        match self {
            DownloadOutcome::Downloaded { path, .. } | DownloadOutcome::AlreadyPresent { path } => path,
        }
    }
}

/// Stops a running batch. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct DownloadItem {
    pub product_id: String,
    pub name: String,
    pub result: std::result::Result<DownloadOutcome, DownloadError>,
}

/// Per-product results of a batch, in input order.
#[derive(Debug)]
pub struct DownloadReport {
    items: Vec<DownloadItem>,
}

impl DownloadReport {
    pub fn items(&self) -> &[DownloadItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<DownloadItem> {
        self.items
    }

    /// Downloaded or already present.
    pub fn successes(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    /// Items that failed for a reason other than cancellation.
    pub fn failures(&self) -> impl Iterator<Item = &DownloadItem> {
        self.items
            .iter()
            .filter(|i| matches!(&i.result, Err(e) if !e.is_cancelled()))
    }

    pub fn cancelled(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(&i.result, Err(e) if e.is_cancelled()))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.successes() == self.items.len()
    }
}

/// What a single transfer needs to know about its product.
#[derive(Debug)]
struct Job {
    product_id: String,
    url: String,
    size: Option<u64>,
    md5: Option<String>,
}

enum Attempt {
    /// Worth restarting the transfer from byte zero.
    Retry(DownloadErrorKind),
    Fatal(DownloadErrorKind),
}

/// Fetches product archives to disk.
///
/// Each body is streamed into `<dest>.partial` and renamed onto `dest` only
/// after its size and MD5 checksum have been verified, so `dest` never holds a
/// truncated file.
#[derive(Debug, Clone)]
pub struct Downloader {
    transport: Transport,
    auth: Arc<TokenProvider>,
    download_base: String,
    progress: bool,
    workers: usize,
}

impl Downloader {
    pub fn from_config(cfg: &ClientConfig, auth: Arc<TokenProvider>) -> Result<Self> {
        Ok(Self::new(Transport::new(cfg)?, auth, cfg))
    }

    pub(crate) fn new(transport: Transport, auth: Arc<TokenProvider>, cfg: &ClientConfig) -> Self {
        Self {
            transport,
            auth,
            download_base: cfg.urls.download.clone(),
            progress: true,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Number of concurrent transfers used by [`Downloader::download_all`].
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Downloads one product to `dest`.
    pub fn download(
        &self,
        product: &ProductDescriptor,
        dest: impl AsRef<Path>,
    ) -> std::result::Result<DownloadOutcome, DownloadError> {
        let job = self.job(product);
        let bar = self.byte_bar(product.name());
        let result = self.fetch(&job, dest.as_ref(), &CancelToken::new(), &bar);
        bar.finish_and_clear();
        result
    }

    /// Downloads a product known only by its id. Without a size or checksum to
    /// compare against, an existing `dest` is always replaced.
    pub fn download_by_id(
        &self,
        product_id: &str,
        dest: impl AsRef<Path>,
    ) -> std::result::Result<DownloadOutcome, DownloadError> {
        let job = Job {
            product_id: product_id.to_string(),
            url: self.product_url(product_id),
            size: None,
            md5: None,
        };
        let bar = self.byte_bar(product_id);
        let result = self.fetch(&job, dest.as_ref(), &CancelToken::new(), &bar);
        bar.finish_and_clear();
        result
    }

    /// Downloads every product into `out_dir/<name>`.
    pub fn download_all(&self, products: &[ProductDescriptor], out_dir: impl AsRef<Path>) -> DownloadReport {
        self.download_all_with_cancel(products, out_dir, &CancelToken::new())
    }

    /// Like [`Downloader::download_all`], stopping once `cancel` fires. Items
    /// not yet finished at that point are reported as cancelled.
    pub fn download_all_with_cancel(
        &self,
        products: &[ProductDescriptor],
        out_dir: impl AsRef<Path>,
        cancel: &CancelToken,
    ) -> DownloadReport {
        let out_dir = out_dir.as_ref();
        let destinations = batch_destinations(out_dir, products);
        let next = AtomicUsize::new(0);
        let slots: Vec<Mutex<Option<std::result::Result<DownloadOutcome, DownloadError>>>> =
            products.iter().map(|_| Mutex::new(None)).collect();
        let bar = self.count_bar(products.len());
        let workers = self.workers.min(products.len()).max(1);
        tracing::debug!(products = products.len(), workers, "starting batch download");

        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    let hidden = ProgressBar::hidden();
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(product) = products.get(i) else { break };
                        let result = self.fetch(&self.job(product), &destinations[i], cancel, &hidden);
                        if let Err(e) = &result {
                            if !e.is_cancelled() {
                                tracing::warn!(product_id = product.id(), error = %e, "download failed");
                            }
                        }
                        bar.inc(1);
                        *slots[i].lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                    }
                });
            }
        });
        bar.finish_and_clear();

        let items = products
            .iter()
            .zip(slots)
            .zip(destinations)
            .map(|((product, slot), dest)| {
                let result = slot
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unwrap_or_else(|| {
                        Err(DownloadError::new(product.id(), dest, DownloadErrorKind::Cancelled))
                    });
                DownloadItem {
                    product_id: product.id().to_string(),
                    name: product.name().to_string(),
                    result,
                }
            })
            .collect();
        let report = DownloadReport { items };
        tracing::info!(
            successes = report.successes(),
            failures = report.failures().count(),
            cancelled = report.cancelled(),
            "batch download finished"
        );
        report
    }

    fn job(&self, product: &ProductDescriptor) -> Job {
        Job {
            product_id: product.id().to_string(),
            url: match product.download_url() {
                // Relative links such as `Products(<id>)/$value` hang off the
                // download service root.
                Some(link) => urljoin(&self.download_base, link),
                None => self.product_url(product.id()),
            },
            size: product.size(),
            md5: product.checksum("MD5").map(str::to_string),
        }
    }

    fn product_url(&self, product_id: &str) -> String {
        urljoin(&self.download_base, &format!("Products({product_id})/$value"))
    }

    fn fetch(
        &self,
        job: &Job,
        dest: &Path,
        cancel: &CancelToken,
        bar: &ProgressBar,
    ) -> std::result::Result<DownloadOutcome, DownloadError> {
        let error = |kind| DownloadError::new(&job.product_id, dest, kind);
        if cancel.is_cancelled() {
            return Err(error(DownloadErrorKind::Cancelled));
        }
        if let Some(outcome) = already_present(job, dest).map_err(error)? {
            return Ok(outcome);
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| {
                error(DownloadErrorKind::Io {
                    path: parent.to_path_buf(),
                    source,
                })
            })?;
        }

        let partial = partial_path(dest);
        let result = self.transfer(job, dest, &partial, cancel, bar).map_err(error);
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }

    /// Runs attempts until one succeeds, restarting interrupted bodies from
    /// byte zero, then verifies and moves the file into place.
    fn transfer(
        &self,
        job: &Job,
        dest: &Path,
        partial: &Path,
        cancel: &CancelToken,
        bar: &ProgressBar,
    ) -> std::result::Result<DownloadOutcome, DownloadErrorKind> {
        let retry = self.transport.retry();
        let mut tries = 0usize;
        let mut sleep = retry.backoff;
        let (bytes, digest) = loop {
            match self.attempt(job, partial, cancel, bar) {
                Ok(done) => break done,
                Err(Attempt::Retry(kind)) if tries < retry.max_retries && !cancel.is_cancelled() => {
                    tries += 1;
                    tracing::warn!(product_id = %job.product_id, error = %kind, attempt = tries, "transfer interrupted, restarting");
                    thread::sleep(sleep);
                    sleep = backoff(sleep, retry.max_backoff);
                }
                Err(Attempt::Retry(kind)) | Err(Attempt::Fatal(kind)) => return Err(kind),
            }
        };

        if let Some(expected) = job.size {
            if bytes != expected {
                return Err(DownloadErrorKind::SizeMismatch {
                    expected,
                    actual: bytes,
                });
            }
        }
        if let (Some(expected), Some(actual)) = (&job.md5, digest) {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(DownloadErrorKind::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        fs::rename(partial, dest).map_err(|source| DownloadErrorKind::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        tracing::info!(product_id = %job.product_id, path = %dest.display(), bytes, "download complete");
        Ok(DownloadOutcome::Downloaded {
            path: dest.to_path_buf(),
            bytes,
        })
    }

    /// One GET streamed into `partial`. Returns the byte count and, when an
    /// MD5 is expected, the hex digest of what was written.
    fn attempt(
        &self,
        job: &Job,
        partial: &Path,
        cancel: &CancelToken,
        bar: &ProgressBar,
    ) -> std::result::Result<(u64, Option<String>), Attempt> {
        let url = job.url.as_str();
        tracing::debug!(product_id = %job.product_id, url, "requesting product");
        let cancelled = || cancel.is_cancelled();
        let mut resp = self
            .transport
            .authorized_get(&self.auth, url, &[], &cancelled)
            .map_err(|failure| {
                Attempt::Fatal(match failure {
                    Failure::Transport(source) => DownloadErrorKind::Transport {
                        url: url.to_string(),
                        source,
                    },
                    Failure::Auth(e) => DownloadErrorKind::Auth(Box::new(e)),
                    Failure::TooManyRedirects => DownloadErrorKind::TooManyRedirects { url: url.to_string() },
                    Failure::Cancelled => DownloadErrorKind::Cancelled,
                })
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(Attempt::Fatal(DownloadErrorKind::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: summarize_body(status, &text),
            }));
        }

        if let Some(total) = job.size.or(resp.content_length()) {
            bar.set_length(total);
        }
        bar.set_position(0);

        let io_error = |source| {
            Attempt::Fatal(DownloadErrorKind::Io {
                path: partial.to_path_buf(),
                source,
            })
        };
        let mut out = File::create(partial).map_err(io_error)?;
        let mut hasher = job.md5.as_ref().map(|_| Md5::new());
        let mut written = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(Attempt::Fatal(DownloadErrorKind::Cancelled));
            }
            let n = match resp.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(Attempt::Retry(DownloadErrorKind::Interrupted {
                        url: url.to_string(),
                        source,
                    }));
                }
            };
            out.write_all(&buf[..n]).map_err(io_error)?;
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..n]);
            }
            written += n as u64;
            bar.inc(n as u64);
        }
        out.flush().map_err(io_error)?;

        Ok((written, hasher.map(|h| format!("{:x}", h.finalize()))))
    }

    fn byte_bar(&self, name: &str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {msg} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
            )
            .map(|s| s.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(name.to_string());
        pb
    }

    fn count_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} {pos}/{len} products {wide_bar} {elapsed}")
                .map(|s| s.progress_chars("=>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    }
}

/// `out_dir/<name>`, using the id when the name is not a plain file name.
fn default_destination(out_dir: &Path, product: &ProductDescriptor) -> PathBuf {
    let name = Path::new(product.name())
        .file_name()
        .filter(|n| Path::new(n) == Path::new(product.name()))
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| product.id().into());
    out_dir.join(name)
}

/// One destination per product. A name already claimed by an earlier item
/// falls back to the product id, then to the id suffixed with the position.
fn batch_destinations(out_dir: &Path, products: &[ProductDescriptor]) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    products
        .iter()
        .enumerate()
        .map(|(i, product)| {
            let preferred = default_destination(out_dir, product);
            let dest = [preferred.clone(), out_dir.join(product.id())]
                .into_iter()
                .find(|p| !taken.contains(p))
                .unwrap_or_else(|| out_dir.join(format!("{}-{i}", product.id())));
            if dest != preferred {
                tracing::debug!(
                    product_id = product.id(),
                    name = product.name(),
                    path = %dest.display(),
                    "name already used in this batch"
                );
            }
            taken.insert(dest.clone());
            dest
        })
        .collect()
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Checks whether `dest` already holds the expected file. `None` means it
/// has to be (re)downloaded.
fn already_present(job: &Job, dest: &Path) -> std::result::Result<Option<DownloadOutcome>, DownloadErrorKind> {
    let meta = match fs::metadata(dest) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Ok(None),
    };
    if job.size.is_none() && job.md5.is_none() {
        tracing::debug!(path = %dest.display(), "existing file cannot be verified, downloading again");
        return Ok(None);
    }
    if job.size.is_some_and(|size| size != meta.len()) {
        return Ok(None);
    }
    if let Some(expected) = &job.md5 {
        let actual = md5_file(dest).map_err(|source| DownloadErrorKind::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        if !expected.eq_ignore_ascii_case(&actual) {
            return Ok(None);
        }
    }

    tracing::info!(product_id = %job.product_id, path = %dest.display(), "already present, skipping");
    Ok(Some(DownloadOutcome::AlreadyPresent {
        path: dest.to_path_buf(),
    }))
}

fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
