use atlas::logging::{self, Logger};
use atlas::time;
use hashbrown::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// Content type inferred from the file extension.
pub fn mime_type(path: &str) -> &'static str {
    let extension = match path.rfind('.') {
        Some(dot) => &path[dot..],
        None => return "application/octet-stream",
    };
    match extension {
        ".html" => "text/html; charset=utf-8",
        ".css" => "text/css; charset=utf-8",
        ".js" => "application/javascript; charset=utf-8",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".ico" => "image/x-icon",
        ".svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[derive(Clone)]
struct CacheEntry {
    bytes: Arc<Vec<u8>>,
    mtime: SystemTime,
}

/// Outcome of a cache lookup.
pub enum Served {
    Hit {
        bytes: Arc<Vec<u8>>,
        mime: &'static str,
    },
    /// The file no longer exists on disk.
    NotFound,
    /// The file exists but could not be (re)read.
    ReadError,
}

/// In-memory static-file cache. The whole tree under the root is loaded
/// eagerly at construction; lookups revalidate against the filesystem mtime
/// and refresh stale entries. `/index.html` is aliased to `/`.
///
/// Reads from any I/O loop share the lock; the rare mtime-driven refresh
/// takes it exclusively.
pub struct StaticFileCache {
    root: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    log: Logger,
}

impl StaticFileCache {
    /// Fails when the root directory is missing, which callers treat as a
    /// fatal startup error.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        root: impl Into<PathBuf>,
        log: L,
    ) -> io::Result<StaticFileCache> {
        let root = root.into();
        let log = match log.into() {
            Some(log) => log.new(logging::o!("static_root" => root.display().to_string())),
            _ => logging::null(),
        };

        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("static root {} does not exist", root.display()),
            ));
        }

        let cache = StaticFileCache {
            root: root.clone(),
            entries: RwLock::new(HashMap::new()),
            log,
        };
        cache.load_dir(&root);
        Ok(cache)
    }

    fn load_dir(&self, dir: &Path) {
        let listing = match fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(err) => {
                logging::warn!(self.log, "directory walk failed";
                               "context" => "load_dir", "dir" => dir.display().to_string(),
                               "error" => %err);
                return;
            }
        };

        for entry in listing.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.load_dir(&path);
            } else if let Err(err) = self.cache_file(&path) {
                logging::warn!(self.log, "static file skipped";
                               "context" => "load_dir", "file" => path.display().to_string(),
                               "error" => %err);
            }
        }
    }

    fn cache_file(&self, file_path: &Path) -> io::Result<()> {
        let metadata = fs::metadata(file_path)?;
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let bytes = Arc::new(fs::read(file_path)?);

        let web_path = match file_path.strip_prefix(&self.root) {
            Ok(relative) => format!("/{}", relative.to_string_lossy()),
            Err(_) => return Ok(()),
        };

        logging::info!(self.log, "static file cached";
                       "context" => "cache_file", "path" => &web_path,
                       "size" => bytes.len(), "mtime" => time::secs_since_epoch(mtime));

        let mut entries = self.entries.write().unwrap();
        if web_path == "/index.html" {
            entries.insert(
                "/".to_string(),
                CacheEntry {
                    bytes: Arc::clone(&bytes),
                    mtime,
                },
            );
        }
        entries.insert(web_path, CacheEntry { bytes, mtime });
        Ok(())
    }

    /// Every cached web path, for route registration.
    pub fn paths(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    /// Serves `request_path` from memory after revalidating the backing file:
    /// gone from disk means not-found, a newer mtime refreshes the entry
    /// first.
    pub fn serve(&self, request_path: &str) -> Served {
        let web_path = if request_path == "/" {
            "/index.html"
        } else {
            request_path
        };
        let file_path = self.root.join(web_path.trim_start_matches('/'));

        let metadata = match fs::metadata(&file_path) {
            Ok(metadata) => metadata,
            Err(_) => return Served::NotFound,
        };
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let stale = {
            let entries = self.entries.read().unwrap();
            match entries.get(web_path) {
                Some(entry) => entry.mtime < mtime,
                None => true,
            }
        };

        if stale {
            if let Err(err) = self.cache_file(&file_path) {
                logging::error!(self.log, "static file refresh failed";
                                "context" => "serve", "path" => web_path, "error" => %err);
                return Served::ReadError;
            }
            logging::info!(self.log, "static file refreshed";
                           "context" => "serve", "path" => web_path);
        }

        let entries = self.entries.read().unwrap();
        match entries.get(web_path) {
            Some(entry) => Served::Hit {
                bytes: Arc::clone(&entry.bytes),
                mime: mime_type(web_path),
            },
            None => Served::ReadError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "boneaged-static-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("assets")).unwrap();
        fs::write(dir.join("index.html"), b"<html/>").unwrap();
        fs::write(dir.join("assets/site.css"), b"body {}").unwrap();
        dir
    }

    fn hit_bytes(served: Served) -> (Vec<u8>, &'static str) {
        match served {
            Served::Hit { bytes, mime } => ((*bytes).clone(), mime),
            _ => panic!("expected a cache hit"),
        }
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let missing = std::env::temp_dir().join("boneaged-no-such-root");
        assert!(StaticFileCache::new(missing, None).is_err());
    }

    #[test]
    fn test_eager_load_and_index_alias() {
        let root = temp_root("alias");
        let cache = StaticFileCache::new(&root, None).unwrap();

        let mut paths = cache.paths();
        paths.sort();
        assert_eq!(paths, vec!["/", "/assets/site.css", "/index.html"]);

        let (bytes, mime) = hit_bytes(cache.serve("/"));
        assert_eq!(bytes, b"<html/>");
        assert_eq!(mime, "text/html; charset=utf-8");

        let (bytes, mime) = hit_bytes(cache.serve("/assets/site.css"));
        assert_eq!(bytes, b"body {}");
        assert_eq!(mime, "text/css; charset=utf-8");
    }

    #[test]
    fn test_disappeared_file_is_not_found() {
        let root = temp_root("gone");
        let cache = StaticFileCache::new(&root, None).unwrap();

        fs::remove_file(root.join("assets/site.css")).unwrap();
        assert!(matches!(cache.serve("/assets/site.css"), Served::NotFound));
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let root = temp_root("unknown");
        let cache = StaticFileCache::new(&root, None).unwrap();
        assert!(matches!(cache.serve("/nope.bin"), Served::NotFound));
    }

    #[test]
    fn test_stale_entry_is_refreshed() {
        let root = temp_root("stale");
        let cache = StaticFileCache::new(&root, None).unwrap();

        // Age the cached entry, then rewrite the backing file.
        cache
            .entries
            .write()
            .unwrap()
            .get_mut("/index.html")
            .unwrap()
            .mtime = SystemTime::UNIX_EPOCH;
        let mut file = fs::File::create(root.join("index.html")).unwrap();
        file.write_all(b"<html>v2</html>").unwrap();
        drop(file);

        let (bytes, _) = hit_bytes(cache.serve("/index.html"));
        assert_eq!(bytes, b"<html>v2</html>");
    }

    #[test]
    fn test_mime_table() {
        assert_eq!(mime_type("/a.html"), "text/html; charset=utf-8");
        assert_eq!(mime_type("/a.js"), "application/javascript; charset=utf-8");
        assert_eq!(mime_type("/a.jpeg"), "image/jpeg");
        assert_eq!(mime_type("/a.jpg"), "image/jpeg");
        assert_eq!(mime_type("/a.svg"), "image/svg+xml");
        assert_eq!(mime_type("/a.ico"), "image/x-icon");
        assert_eq!(mime_type("/a.bin"), "application/octet-stream");
        assert_eq!(mime_type("/noext"), "application/octet-stream");
    }
}
