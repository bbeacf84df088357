use crate::{
    error::OpResult,
    identity::{identity_hash, parse_identity, Version},
    package::SOURCE_EXTENSION,
};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

const USER_AGENT: &str = "modvault";
const PART_EXTENSION: &str = "part";

#[derive(Debug, Clone)]
pub struct NetPackage {
    pub identity: String,
    pub hash: u64,
    pub core_name: String,
    pub version: Option<Version>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub dependencies: Vec<String>,
    pub url: String,
    pub file_name: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub repo: String,
    progress: Arc<AtomicU32>,
}

impl NetPackage {
    pub fn progress_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.progress)
    }

    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct NetRepo {
    pub url: String,
    pub title: String,
    pub packages: Vec<NetPackage>,
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    title: String,
    #[serde(default)]
    packages: Vec<CatalogPackage>,
}

#[derive(Debug, Deserialize)]
struct CatalogPackage {
    identity: String,
    url: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !name.contains(['/', '\\'])
}

/// Where a download of `file_name` lands, or None when the name would
/// escape `library_dir`.
pub fn download_dest(library_dir: &Path, file_name: &str) -> Option<PathBuf> {
    if !is_plain_name(file_name) {
        return None;
    }
    let dest = library_dir.join(file_name);
    dest.starts_with(library_dir).then_some(dest)
}

/// Decodes a JSON catalog into a repository listing. Local file names come
/// from the identity; entries whose identity is not a plain name are dropped.
pub fn parse_catalog(url: &str, raw: &str) -> Result<NetRepo> {
    let catalog: Catalog = serde_json::from_str(raw).context("parse repository catalog")?;
    let packages = catalog
        .packages
        .into_iter()
        .filter(|pkg| {
            let identity = pkg.identity.trim();
            if is_plain_name(identity) {
                return true;
            }
            if !identity.is_empty() {
                warn!(repo = url, identity, "catalog entry dropped, identity is not a file name");
            }
            false
        })
        .map(|pkg| {
            let identity = pkg.identity.trim().to_string();
            let parsed = parse_identity(&identity);
            let file_name = format!("{identity}.{SOURCE_EXTENSION}");
            NetPackage {
                hash: identity_hash(&identity),
                core_name: parsed.core_name,
                version: parsed.version,
                category: pkg.category,
                description: pkg.description,
                dependencies: pkg.dependencies,
                url: pkg.url,
                file_name,
                size: pkg.size,
                checksum: pkg.checksum.map(|sum| sum.to_lowercase()),
                repo: url.to_string(),
                identity,
                progress: Arc::new(AtomicU32::new(0)),
            }
        })
        .collect();
    let title = if catalog.title.is_empty() {
        url.to_string()
    } else {
        catalog.title
    };
    Ok(NetRepo {
        url: url.to_string(),
        title,
        packages,
    })
}

pub trait RepoQuerier: Send + Sync {
    fn query(&self, url: &str) -> Result<NetRepo>;
}

pub struct HttpRepoQuerier {
    agent: ureq::Agent,
}

impl Default for HttpRepoQuerier {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRepoQuerier {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(10))
            .timeout_write(Duration::from_secs(10))
            .build();
        Self { agent }
    }
}

impl RepoQuerier for HttpRepoQuerier {
    fn query(&self, url: &str) -> Result<NetRepo> {
        let response = self
            .agent
            .get(url)
            .set("User-Agent", USER_AGENT)
            .call()
            .with_context(|| format!("fetch repository {url}"))?;
        let body = response.into_string().context("read repository catalog")?;
        parse_catalog(url, &body)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub hash: u64,
    pub url: String,
    pub dest: PathBuf,
    pub checksum: Option<String>,
    /// Bytes per second, `None` for unlimited.
    pub rate_limit: Option<u64>,
}

/// Receives download events. Returning false from `on_progress` stops the transfer.
pub trait DownloadEvents: Send + Sync {
    fn on_progress(&self, hash: u64, received: u64, total: u64) -> bool;
    fn on_finished(&self, hash: u64, result: OpResult, path: Option<PathBuf>, error: String);
}

/// Transfer backend used by the download queue. `start` must not block on the
/// transfer; completion is reported through `on_finished` exactly once.
pub trait Downloader: Send + Sync {
    fn start(&self, request: DownloadRequest, events: Arc<dyn DownloadEvents>) -> Result<()>;
    fn stop(&self, hash: u64);
}

pub struct HttpDownloader {
    agent: ureq::Agent,
    stops: Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>>,
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDownloader {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(60))
            .timeout_write(Duration::from_secs(60))
            .build();
        Self {
            agent,
            stops: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Downloader for HttpDownloader {
    fn start(&self, request: DownloadRequest, events: Arc<dyn DownloadEvents>) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        self.stops
            .lock()
            .map_err(|_| anyhow!("download registry poisoned"))?
            .insert(request.hash, Arc::clone(&stop));
        let agent = self.agent.clone();
        let stops = Arc::clone(&self.stops);
        thread::spawn(move || {
            let hash = request.hash;
            info!(hash, url = %request.url, "download started");
            let outcome = fetch_to_file(&agent, &request, &stop, events.as_ref());
            if let Ok(mut stops) = stops.lock() {
                stops.remove(&hash);
            }
            match outcome {
                Ok(path) => events.on_finished(hash, OpResult::Ok, Some(path), String::new()),
                Err(err) => {
                    let result = crate::error::result_for(&err);
                    let message = crate::error::summarize(&err);
                    warn!(hash, "download failed: {message}");
                    events.on_finished(hash, result, None, message);
                }
            }
        });
        Ok(())
    }

    fn stop(&self, hash: u64) {
        if let Ok(stops) = self.stops.lock() {
            if let Some(flag) = stops.get(&hash) {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PART_EXTENSION);
    dest.with_file_name(name)
}

fn fetch_to_file(
    agent: &ureq::Agent,
    request: &DownloadRequest,
    stop: &AtomicBool,
    events: &dyn DownloadEvents,
) -> Result<PathBuf> {
    let response = agent
        .get(&request.url)
        .set("User-Agent", USER_AGENT)
        .call()
        .with_context(|| format!("download {}", request.url))?;
    let total = response
        .header("Content-Length")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    if let Some(parent) = request.dest.parent() {
        fs::create_dir_all(parent).context("create download dir")?;
    }
    let part = part_path(&request.dest);
    let mut reader = response.into_reader();
    let copied = (|| -> Result<()> {
        let mut file = File::create(&part).with_context(|| format!("create {part:?}"))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 16384];
        let mut received: u64 = 0;
        let started = Instant::now();
        loop {
            if stop.load(Ordering::Relaxed) || !events.on_progress(request.hash, received, total) {
                return Err(crate::error::ModError::Aborted.into());
            }
            let read = reader.read(&mut buffer).context("read download stream")?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).context("write download")?;
            hasher.update(&buffer[..read]);
            received += read as u64;
            throttle(request.rate_limit, received, started);
        }
        file.flush().context("flush download")?;
        if let Some(expected) = &request.checksum {
            let actual = format!("{:x}", hasher.finalize());
            if actual != expected.to_lowercase() {
                return Err(anyhow!("checksum mismatch for {}", request.url));
            }
        }
        events.on_progress(request.hash, received, received.max(total));
        Ok(())
    })();
    if let Err(err) = copied {
        let _ = fs::remove_file(&part);
        return Err(err);
    }
    fs::rename(&part, &request.dest)
        .with_context(|| format!("move download into {:?}", request.dest))?;
    debug!(hash = request.hash, "download stored at {:?}", request.dest);
    Ok(request.dest.clone())
}

fn throttle(limit: Option<u64>, received: u64, started: Instant) {
    let Some(limit) = limit.filter(|limit| *limit > 0) else {
        return;
    };
    let expected = Duration::from_secs_f64(received as f64 / limit as f64);
    let elapsed = started.elapsed();
    if expected > elapsed {
        thread::sleep(expected - elapsed);
    }
}
