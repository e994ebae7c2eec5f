//! The build repository client.
//!
//! Talks to the artifact store that holds every published build, keeps a
//! local builder catalog with a 24 hour expiry, resolves fuzzy build names
//! to concrete builds, and materializes archives onto disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use log::debug;
use pbr::{ProgressBar, Units};
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_LENGTH;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tee::TeeReader;
use xz2::read::XzDecoder;

use crate::builds::Build;
use crate::config::Config;
use crate::errors::{ArchiveError, DownloadError};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("unknown builder name: {0:?}")]
    UnknownBuilder(String),
    #[error("builder {0:?} may be misconfigured (no resolvable builds)")]
    NoBuilds(String),
    #[error("build {0:?} has no downloadable archive")]
    NoSource(String),
    #[error("could not download build: {0}")]
    Download(#[from] DownloadError),
    #[error("unable to extract {} to {}: {err}", archive.display(), dest.display())]
    Extract {
        archive: PathBuf,
        dest: PathBuf,
        #[source]
        err: ArchiveError,
    },
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("malformed store reply: {0}")]
    MalformedReply(#[from] serde_json::Error),
}

/// One archive object in a builder's namespace.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub name: String,
    pub url: String,
}

/// The capability the artifact store has to provide. The repository client
/// only ever needs these three operations.
pub trait ArtifactStore {
    fn list_builders(&self) -> Result<Vec<String>, StoreError>;
    fn list_archives(&self, prefix: &str) -> Result<Vec<ArchiveEntry>, StoreError>;
    fn download(&self, url: &str, dest: &Path) -> Result<(), StoreError>;
}

/// Wire documents of the object-store listing API.
#[derive(Deserialize)]
struct PrefixList {
    #[serde(default)]
    prefixes: Vec<String>,
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectEntry>,
}

#[derive(Deserialize)]
struct ObjectEntry {
    name: String,
    #[serde(rename = "mediaLink")]
    media_link: String,
}

/// HTTP implementation against a cloud object store.
pub struct HttpStore {
    client: Client,
    objects_url: String,
}

impl HttpStore {
    pub fn new(cfg: &Config) -> HttpStore {
        HttpStore {
            client: Client::new(),
            objects_url: format!("{}/b/{}/o", cfg.store_url, cfg.bucket),
        }
    }
}

impl ArtifactStore for HttpStore {
    /// Every builder is a top-level folder in the bucket.
    fn list_builders(&self) -> Result<Vec<String>, StoreError> {
        debug!("listing builders from <{}>", self.objects_url);
        let reply: PrefixList = self
            .client
            .get(&self.objects_url)
            .query(&[("delimiter", "/"), ("fields", "prefixes")])
            .send()?
            .error_for_status()?
            .json()?;
        Ok(reply
            .prefixes
            .iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .collect())
    }

    fn list_archives(&self, prefix: &str) -> Result<Vec<ArchiveEntry>, StoreError> {
        debug!("listing builds under {prefix:?}");
        let prefix_param = format!("{prefix}/");
        let reply: ObjectList = self
            .client
            .get(&self.objects_url)
            .query(&[
                ("delimiter", "/"),
                ("fields", "kind,items(name, mediaLink)"),
                ("prefix", prefix_param.as_str()),
            ])
            .send()?
            .error_for_status()?
            .json()?;
        Ok(reply
            .items
            .into_iter()
            .map(|item| ArchiveEntry {
                name: item.name,
                url: item.media_link,
            })
            .collect())
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), StoreError> {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut reader = download_progress(&self.client, &name, url)?;
        let mut file = fs::File::create(dest).map_err(|err| DownloadError::Write {
            path: dest.to_path_buf(),
            err,
        })?;
        io::copy(&mut reader, &mut file).map_err(|err| DownloadError::Write {
            path: dest.to_path_buf(),
            err,
        })?;
        Ok(())
    }
}

pub fn download_progress(
    client: &Client,
    name: &str,
    url: &str,
) -> Result<TeeReader<Response, ProgressBar<io::Stdout>>, DownloadError> {
    debug!("downloading <{}>...", url);

    let response = client.get(url).send().map_err(DownloadError::Reqwest)?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(DownloadError::NotFound(url.to_string()));
    }
    let response = response.error_for_status().map_err(DownloadError::Reqwest)?;

    let length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|c| c.to_str().ok()?.parse().ok())
        .unwrap_or(0);
    let mut bar = ProgressBar::new(length);
    bar.set_units(Units::Bytes);
    bar.message(&format!("{name}: "));

    Ok(TeeReader::new(response, bar))
}

/// Extracts a tar archive, picking the decoder from the file name.
fn extract_archive(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = fs::File::open(archive).map_err(ArchiveError::Archive)?;
    let name = archive.to_string_lossy().to_lowercase();
    if name.ends_with(".xz") || name.ends_with(".txz") {
        unarchive(XzDecoder::new(file), dest)
    } else if name.ends_with(".gz") || name.ends_with(".tgz") {
        unarchive(GzDecoder::new(file), dest)
    } else {
        unarchive(file, dest)
    }
}

fn unarchive<R: Read>(r: R, dest: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(dest).map_err(ArchiveError::CreateDir)?;
    Archive::new(r).unpack(dest).map_err(ArchiveError::Archive)
}

/// The expiry applied to a cached catalog.
const CATALOG_TTL_HOURS: i64 = 24;

/// A cached mapping from builder name to the store prefix that holds its
/// artifacts, stamped with the time it was fetched.
#[derive(Debug, Serialize, Deserialize)]
pub struct BuilderCatalog {
    builders: BTreeMap<String, String>,
    fetched_at: DateTime<Utc>,
}

impl BuilderCatalog {
    pub fn from_path(path: &Path) -> Result<BuilderCatalog, StoreError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.fetched_at + Duration::hours(CATALOG_TTL_HOURS)
    }

    pub fn prefix_of(&self, builder: &str) -> Option<&str> {
        self.builders.get(builder).map(String::as_str)
    }

    pub fn builder_names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }
}

/// High-level access to builders and builds, combining the artifact store
/// with the local catalog and archive caches.
pub struct Repository<'a> {
    cfg: &'a Config,
    store: Box<dyn ArtifactStore + 'a>,
}

impl<'a> Repository<'a> {
    pub fn new(cfg: &'a Config) -> Repository<'a> {
        let store = Box::new(HttpStore::new(cfg));
        Repository { cfg, store }
    }

    pub fn with_store(cfg: &'a Config, store: Box<dyn ArtifactStore + 'a>) -> Repository<'a> {
        Repository { cfg, store }
    }

    /// Loads the builder catalog, refetching from the store when missing,
    /// expired, unreadable, or when `force` is set.
    fn load_catalog(&self, force: bool) -> Result<BuilderCatalog, StoreError> {
        let path = self.cfg.catalog_path();
        if !force && path.exists() {
            if let Ok(catalog) = BuilderCatalog::from_path(&path) {
                if !catalog.is_expired() {
                    return Ok(catalog);
                }
            }
        }

        let mut builders = BTreeMap::new();
        for name in self.store.list_builders()? {
            builders.insert(name.clone(), name);
        }
        let catalog = BuilderCatalog {
            builders,
            fetched_at: Utc::now(),
        };
        catalog.to_path(&path)?;
        Ok(catalog)
    }

    /// All builder names, sorted.
    pub fn list_builders(&self) -> Result<Vec<String>, StoreError> {
        if self.cfg.only_use_cache {
            return sorted_dir_names(&self.cfg.build_cache_dir());
        }
        Ok(self
            .load_catalog(false)?
            .builder_names()
            .map(str::to_string)
            .collect())
    }

    /// All resolvable builds of one builder, sorted ascending (oldest
    /// first). A builder that lists successfully but yields nothing is a
    /// misconfiguration, not an empty result.
    pub fn list_builds(&self, builder: &str) -> Result<Vec<Build>, StoreError> {
        if self.cfg.only_use_cache {
            return self.list_cached_builds(builder);
        }

        let mut catalog = self.load_catalog(false)?;
        if catalog.prefix_of(builder).is_none() {
            // The builder may have appeared since the last refresh; refetch
            // once before giving up on the name.
            catalog = self.load_catalog(true)?;
        }
        let prefix = catalog
            .prefix_of(builder)
            .ok_or_else(|| StoreError::UnknownBuilder(builder.to_string()))?;

        let mut builds: Vec<Build> = self
            .store
            .list_archives(prefix)?
            .into_iter()
            .map(|entry| Build::from_basename(&entry.name, Some(entry.url)))
            .filter(|build| build.revision.is_some())
            .collect();
        if builds.is_empty() {
            return Err(StoreError::NoBuilds(builder.to_string()));
        }
        builds.sort();
        Ok(builds)
    }

    fn list_cached_builds(&self, builder: &str) -> Result<Vec<Build>, StoreError> {
        let dir = self.cfg.build_cache_dir().join(builder);
        if !dir.is_dir() {
            return Err(StoreError::UnknownBuilder(builder.to_string()));
        }
        let mut builds = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let build = Build::from_basename(&name, None);
            if build.revision.is_some() {
                builds.push(build);
            }
        }
        if builds.is_empty() {
            return Err(StoreError::NoBuilds(builder.to_string()));
        }
        builds.sort();
        Ok(builds)
    }

    /// Materializes `build`: the archive lands at `root_path` (from the
    /// local cache when possible) and is extracted into `builddir_path`,
    /// which must not exist yet.
    pub fn fetch_build_to_path(
        &self,
        builder: &str,
        build: &Build,
        root_path: &Path,
        builddir_path: &Path,
    ) -> Result<(), StoreError> {
        let basename = build.to_basename(true);
        let cache_path = (self.cfg.cache_builds || self.cfg.only_use_cache)
            .then(|| self.cfg.build_cache_dir().join(builder).join(&basename));

        match cache_path.as_ref().filter(|p| p.exists()) {
            Some(cached) => {
                debug!("build cache hit for {basename}");
                fs::copy(cached, root_path)?;
            }
            None => {
                let url = build
                    .source_url
                    .as_deref()
                    .ok_or_else(|| StoreError::NoSource(basename.clone()))?;
                self.store.download(url, root_path)?;
                // Keep a copy for offline reuse if the cache is enabled.
                if let Some(cache) = &cache_path {
                    if self.cfg.cache_builds {
                        if let Some(parent) = cache.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::copy(root_path, cache)?;
                    }
                }
            }
        }

        fs::create_dir(builddir_path)?;
        extract_archive(root_path, builddir_path).map_err(|err| StoreError::Extract {
            archive: root_path.to_path_buf(),
            dest: builddir_path.to_path_buf(),
            err,
        })
    }
}

fn sorted_dir_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Resolves a user-typed partial build name against an ascending build
/// list: `None` means the most recent build; an exact basename prefix or
/// an exact revision wins immediately; otherwise the most recent build not
/// exceeding the requested one is returned.
pub fn best_match<'b>(builds: &'b [Build], name: Option<&str>) -> Option<&'b Build> {
    let name = match name {
        None => return builds.last(),
        Some(name) => name,
    };
    let target = Build::from_basename(name, None);

    let mut best = None;
    for build in builds {
        if build.to_basename(true).starts_with(name) {
            return Some(build);
        }
        if build.revision.is_some() && build.revision == target.revision {
            return Some(build);
        }
        // Past the target; nothing further can get closer.
        if *build > target {
            break;
        }
        best = Some(build);
    }
    best
}

#[cfg(test)]
pub mod testing {
    //! An in-memory [`ArtifactStore`] for exercising the repository client
    //! and the driver without a network.

    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct FakeStore {
        /// builder name -> archive basename -> archive bytes
        pub archives: RefCell<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
        pub builder_listings: Cell<usize>,
        pub downloads: Cell<usize>,
    }

    impl FakeStore {
        pub fn add_archive(&self, builder: &str, basename: &str, bytes: Vec<u8>) {
            self.archives
                .borrow_mut()
                .entry(builder.to_string())
                .or_default()
                .insert(basename.to_string(), bytes);
        }

        /// A gzipped tar archive holding a single `marker` file.
        pub fn tar_gz_with_marker(contents: &str) -> Vec<u8> {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let gz = GzEncoder::new(Vec::new(), Compression::default());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "marker", contents.as_bytes())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap()
        }
    }

    impl ArtifactStore for &FakeStore {
        fn list_builders(&self) -> Result<Vec<String>, StoreError> {
            <FakeStore as ArtifactStore>::list_builders(self)
        }

        fn list_archives(&self, prefix: &str) -> Result<Vec<ArchiveEntry>, StoreError> {
            <FakeStore as ArtifactStore>::list_archives(self, prefix)
        }

        fn download(&self, url: &str, dest: &Path) -> Result<(), StoreError> {
            <FakeStore as ArtifactStore>::download(self, url, dest)
        }
    }

    impl ArtifactStore for FakeStore {
        fn list_builders(&self) -> Result<Vec<String>, StoreError> {
            self.builder_listings.set(self.builder_listings.get() + 1);
            Ok(self.archives.borrow().keys().cloned().collect())
        }

        fn list_archives(&self, prefix: &str) -> Result<Vec<ArchiveEntry>, StoreError> {
            let archives = self.archives.borrow();
            let builder = archives
                .get(prefix)
                .ok_or_else(|| StoreError::UnknownBuilder(prefix.to_string()))?;
            Ok(builder
                .keys()
                .map(|name| ArchiveEntry {
                    name: format!("{prefix}/{name}"),
                    url: format!("fake://{prefix}/{name}"),
                })
                .collect())
        }

        fn download(&self, url: &str, dest: &Path) -> Result<(), StoreError> {
            self.downloads.set(self.downloads.get() + 1);
            let path = url.trim_start_matches("fake://");
            let (builder, name) = path.split_once('/').expect("fake url");
            let archives = self.archives.borrow();
            let bytes = archives
                .get(builder)
                .and_then(|b| b.get(name))
                .ok_or_else(|| StoreError::Download(DownloadError::NotFound(url.to_string())))?;
            fs::write(dest, bytes)?;
            Ok(())
        }
    }
}
