//! End-to-end runs of the bundle pipeline against synthetic upstream
//! releases served from a temporary directory.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use debugger_bundler::archive::{read_archive, EntryKind};
use debugger_bundler::config::parse_config;
use debugger_bundler::fetch::{ResponseMeta, SourceFetcher, Transport};
use debugger_bundler::fsutil::sha256_bytes;
use debugger_bundler::tree::path;
use debugger_bundler::{
    BundleConfig, BundleError, ErrorKind, IntegrationDriver, ManifestStore, RunSummary, Target,
    TargetState,
};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

const MIRROR: &str = "https://mirror.invalid/";

/// Serves `https://mirror.invalid/<name>` from a directory, failing the
/// first few requests for a name when told to.
#[derive(Default)]
struct Mirror {
    root: PathBuf,
    failures: Mutex<HashMap<String, Vec<Failure>>>,
    requests: Mutex<Vec<String>>,
}

#[derive(Clone, Copy)]
enum Failure {
    Status(u16),
    /// Declare the full length but send only half the body.
    ShortBody,
}

impl Mirror {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ..Self::default()
        }
    }

    fn fail(&self, name: &str, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .entry(format!("{MIRROR}{name}"))
            .or_default()
            .push(failure);
    }

    fn requests_for(&self, name: &str) -> usize {
        let url = format!("{MIRROR}{name}");
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == url)
            .count()
    }
}

impl Transport for Mirror {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        _timeout: Option<Duration>,
    ) -> io::Result<ResponseMeta> {
        self.requests.lock().unwrap().push(url.to_string());
        let failure = {
            let mut map = self.failures.lock().unwrap();
            map.get_mut(url)
                .and_then(|q| (!q.is_empty()).then(|| q.remove(0)))
        };
        let name = url
            .strip_prefix(MIRROR)
            .ok_or_else(|| io::Error::other("unknown host"))?;
        let body = match fs::read(self.root.join(name)) {
            Ok(b) => b,
            Err(_) => {
                return Ok(ResponseMeta {
                    status: 404,
                    content_length: None,
                })
            }
        };
        match failure {
            Some(Failure::Status(status)) => Ok(ResponseMeta {
                status,
                content_length: None,
            }),
            Some(Failure::ShortBody) => {
                sink.write_all(&body[..body.len() / 2])?;
                Ok(ResponseMeta {
                    status: 200,
                    content_length: Some(body.len() as u64),
                })
            }
            None => {
                sink.write_all(&body)?;
                Ok(ResponseMeta {
                    status: 200,
                    content_length: Some(body.len() as u64),
                })
            }
        }
    }
}

enum Fx<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8], u32),
    Link(&'a str, &'a str),
}

fn tar_bytes(entries: &[Fx<'_>]) -> Vec<u8> {
    let mut b = Builder::new(Vec::new());
    for e in entries {
        let mut h = Header::new_gnu();
        match e {
            Fx::Dir(p) => {
                h.set_entry_type(EntryType::Directory);
                h.set_mode(0o755);
                h.set_size(0);
                b.append_data(&mut h, p, io::empty()).unwrap();
            }
            Fx::File(p, bytes, mode) => {
                h.set_entry_type(EntryType::Regular);
                h.set_mode(*mode);
                h.set_size(bytes.len() as u64);
                b.append_data(&mut h, p, *bytes).unwrap();
            }
            Fx::Link(p, target) => {
                h.set_entry_type(EntryType::Symlink);
                h.set_mode(0o777);
                h.set_size(0);
                b.append_link(&mut h, p, target).unwrap();
            }
        }
    }
    b.into_inner().unwrap()
}

fn xz(bytes: &[u8]) -> Vec<u8> {
    let mut w = xz2::write::XzEncoder::new(Vec::new(), 6);
    w.write_all(bytes).unwrap();
    w.finish().unwrap()
}

fn zst(bytes: &[u8]) -> Vec<u8> {
    zstd::stream::encode_all(bytes, 3).unwrap()
}

fn deb(data_name: &str, data: &[u8]) -> Vec<u8> {
    let mut b = ar::Builder::new(Vec::new());
    let version = b"2.0\n";
    b.append(
        &ar::Header::new(b"debian-binary".to_vec(), version.len() as u64),
        &version[..],
    )
    .unwrap();
    let control = zst(&tar_bytes(&[Fx::File("./control", b"Package: lldb\n", 0o644)]));
    b.append(
        &ar::Header::new(b"control.tar.zst".to_vec(), control.len() as u64),
        &control[..],
    )
    .unwrap();
    b.append(
        &ar::Header::new(data_name.as_bytes().to_vec(), data.len() as u64),
        data,
    )
    .unwrap();
    b.into_inner().unwrap()
}

const LIBLLDB: &[u8] = b"\x7fELF liblldb 21";

/// Upstream releases: an LLVM tarball, a Debian bindings package with an
/// indirection link, and a prebuilt Python runtime as a zstd tarball.
struct Upstream {
    dir: TempDir,
}

impl Upstream {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let llvm = tar_bytes(&[
            Fx::Dir("LLVM-21.1.5-Linux-X64/"),
            Fx::File("LLVM-21.1.5-Linux-X64/bin/lldb", b"\x7fELF lldb", 0o755),
            Fx::File("LLVM-21.1.5-Linux-X64/bin/lldb-server", b"\x7fELF server", 0o755),
            Fx::File("LLVM-21.1.5-Linux-X64/lib/liblldb.so.21", LIBLLDB, 0o644),
            Fx::Link("LLVM-21.1.5-Linux-X64/lib/liblldb.so", "liblldb.so.21"),
        ]);
        fs::write(dir.path().join("llvm.tar.xz"), xz(&llvm)).unwrap();

        let bindings = tar_bytes(&[
            Fx::Dir("./usr/lib/llvm-21/lib/python3.10/site-packages/lldb/"),
            Fx::File(
                "./usr/lib/llvm-21/lib/python3.10/site-packages/lldb/__init__.py",
                b"import _lldb\n",
                0o644,
            ),
            Fx::File("./usr/lib/llvm-21/lib/liblldb.so.1", LIBLLDB, 0o644),
            Fx::Link(
                "./usr/lib/llvm-21/lib/python3.10/site-packages/lldb/_lldb.so",
                "../../../liblldb.so.1",
            ),
            Fx::Dir("./usr/lib/python3/dist-packages/"),
            Fx::Link(
                "./usr/lib/python3/dist-packages/lldb",
                "../../llvm-21/lib/python3.10/site-packages/lldb",
            ),
        ]);
        fs::write(
            dir.path().join("python3-lldb-21_amd64.deb"),
            deb("data.tar.xz", &xz(&bindings)),
        )
        .unwrap();

        let python = tar_bytes(&[
            Fx::File("bin/python3.10", b"\x7fELF python", 0o755),
            Fx::Link("bin/python3", "python3.10"),
            Fx::File("lib/python3.10/os.py", b"import sys\n", 0o644),
            Fx::File("lib/python3.10/test/test_os.py", b"import unittest\n", 0o644),
            Fx::File("lib/python3.10/tkinter/__init__.py", b"import _tkinter\n", 0o644),
            Fx::File("lib/python3.10/encodings/utf_8.py", b"# utf-8\n", 0o644),
            Fx::Link("lib/python3.10/encodings/default.py", "utf_8.py"),
        ]);
        fs::write(dir.path().join("python.tar.zst"), zst(&python)).unwrap();

        Self { dir }
    }

    fn sha(&self, name: &str) -> String {
        sha256_bytes(&fs::read(self.dir.path().join(name)).unwrap())
    }
}

const TARGET_LINUX: &str = r#"
[[target]]
platform = "linux"
arch = "x86_64"
version = "21.1.5"

[[target.source]]
name = "llvm"
url = "https://mirror.invalid/llvm.tar.xz"
select = "LLVM-21.1.5-Linux-X64"

[[target.source]]
name = "python"
mount = "python"
url = "https://mirror.invalid/python.tar.zst"
trim = true

[[target.source]]
name = "bindings"
mount = "python/lib/python3.10/site-packages/lldb"
url = "https://mirror.invalid/python3-lldb-21_amd64.deb"
select = "usr/lib/python3/dist-packages/lldb"
"#;

const LINK_FIX: &str = r#"
[[target.link]]
link = "python/lib/python3.10/site-packages/lldb/_lldb.so"
target = "lib/liblldb.so.21"
"#;

fn config(work: &Path, targets: &str) -> BundleConfig {
    let text = format!(
        r#"
[bundle]
name = "lldb"
output_dir = "dist/assets"
manifest = "dist/manifest.json"
cache_dir = "cache"
compression = "fast"
jobs = 2
fetch_retries = 2
{targets}
"#
    );
    parse_config(&text, &work.join("bundle.toml")).unwrap()
}

fn run(work: &Path, mirror: Arc<Mirror>, targets: &str) -> RunSummary {
    IntegrationDriver::new(config(work, targets))
        .with_transport(mirror)
        .run()
        .unwrap()
}

fn linux() -> Target {
    Target::new("linux", "x86_64", "21.1.5").unwrap()
}

fn outcome<'a>(summary: &'a RunSummary, key: &str) -> &'a debugger_bundler::TargetOutcome {
    summary
        .targets
        .iter()
        .find(|t| t.target == key)
        .unwrap_or_else(|| panic!("no outcome for {key}"))
}

fn asset_path(work: &Path) -> PathBuf {
    work.join("dist/assets/lldb-21.1.5-linux-x86_64.tar.zst")
}

#[test]
fn publishes_a_verified_bundle_with_resolvable_links() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let mirror = Arc::new(Mirror::new(up.dir.path()));
    let summary = run(work.path(), mirror, &format!("{TARGET_LINUX}{LINK_FIX}"));

    let t = outcome(&summary, "linux-x86_64-21.1.5");
    assert_eq!(t.state, TargetState::Published, "{:?}", t.message);
    let asset = t.asset.as_ref().unwrap();
    assert_eq!(asset.relative_path, "assets/lldb-21.1.5-linux-x86_64.tar.zst");

    let store = ManifestStore::new(&work.path().join("dist/manifest.json"));
    assert!(store.verify(&linux()).unwrap());
    let record = store.load().unwrap().get(&linux()).cloned().unwrap();
    assert_eq!(record.sha256, asset.sha256);
    assert_eq!(record.provenance.len(), 3);
    assert_eq!(record.provenance[0].urls, vec![format!("{MIRROR}llvm.tar.xz")]);

    let entries = read_archive(&asset_path(work.path())).unwrap();
    let by_path: HashMap<_, _> = entries.iter().map(|e| (e.path.as_str(), e)).collect();
    assert!(by_path.contains_key("bin/lldb"));
    assert!(by_path.contains_key("python/lib/python3.10/os.py"));
    assert!(!by_path.contains_key("python/lib/python3.10/test/test_os.py"));
    assert!(!by_path.contains_key("python/lib/python3.10/tkinter/__init__.py"));
    assert!(by_path.contains_key("python/lib/python3.10/site-packages/lldb/__init__.py"));
    assert!(t.trimmed_bytes > 0);

    // Every link lands on a file with the content it pointed at upstream.
    let stub = by_path["python/lib/python3.10/site-packages/lldb/_lldb.so"];
    assert_eq!(stub.kind, EntryKind::Symlink);
    let text = stub.link_target.as_deref().unwrap();
    assert_eq!(text, "../../../../../lib/liblldb.so.21");
    let landed = path::resolve_from(path::parent(&stub.path), text).unwrap();
    assert_eq!(by_path[landed.as_str()].sha256.as_deref(), Some(sha256_bytes(LIBLLDB).as_str()));

    for link in entries.iter().filter(|e| e.kind == EntryKind::Symlink) {
        let target = path::resolve_from(
            path::parent(&link.path),
            link.link_target.as_deref().unwrap(),
        )
        .unwrap();
        assert!(by_path.contains_key(target.as_str()), "{} dangles", link.path);
    }
}

#[test]
fn misaligned_bindings_link_fails_without_an_explicit_rewrite() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let summary = run(work.path(), Arc::new(Mirror::new(up.dir.path())), TARGET_LINUX);

    let t = outcome(&summary, "linux-x86_64-21.1.5");
    assert_eq!(t.state, TargetState::Failed);
    assert_eq!(t.error_kind, Some(ErrorKind::DanglingLink));
    assert_eq!(t.failed_stage, Some(TargetState::Assembling));
    assert_eq!(
        t.error_path.as_deref(),
        Some("python/lib/python3.10/site-packages/lldb/_lldb.so")
    );
    assert!(!asset_path(work.path()).exists());
}

#[test]
fn rebuilds_are_byte_identical_and_leave_the_manifest_unchanged() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let targets = format!("{TARGET_LINUX}{LINK_FIX}");
    let manifest = work.path().join("dist/manifest.json");

    let first = run(work.path(), Arc::new(Mirror::new(up.dir.path())), &targets);
    let manifest_once = fs::read(&manifest).unwrap();
    let archive_once = fs::read(asset_path(work.path())).unwrap();

    // Second run is served entirely from the cache.
    let mirror = Arc::new(Mirror::new(up.dir.path()));
    let second = run(work.path(), Arc::clone(&mirror), &targets);
    assert_eq!(mirror.requests_for("llvm.tar.xz"), 0);

    assert_eq!(
        first.targets[0].asset.as_ref().unwrap().sha256,
        second.targets[0].asset.as_ref().unwrap().sha256
    );
    assert_eq!(fs::read(asset_path(work.path())).unwrap(), archive_once);
    assert_eq!(fs::read(&manifest).unwrap(), manifest_once);
}

#[test]
fn verify_fails_after_a_single_byte_changes() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    run(
        work.path(),
        Arc::new(Mirror::new(up.dir.path())),
        &format!("{TARGET_LINUX}{LINK_FIX}"),
    );
    let store = ManifestStore::new(&work.path().join("dist/manifest.json"));
    assert!(store.verify(&linux()).unwrap());

    let path = asset_path(work.path());
    let mut bytes = fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    fs::write(&path, bytes).unwrap();
    assert!(!store.verify(&linux()).unwrap());
}

#[test]
fn building_one_target_leaves_other_manifest_entries_untouched() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let other = r#"
[[target]]
platform = "linux"
arch = "x86_64"
version = "20.1.0"

[[target.source]]
name = "llvm"
url = "https://mirror.invalid/llvm.tar.xz"
select = "LLVM-21.1.5-Linux-X64"
"#;
    run(work.path(), Arc::new(Mirror::new(up.dir.path())), other);
    let store = ManifestStore::new(&work.path().join("dist/manifest.json"));
    let older = Target::new("linux", "x86_64", "20.1.0").unwrap();
    let before = store.load().unwrap().get(&older).cloned().unwrap();

    run(
        work.path(),
        Arc::new(Mirror::new(up.dir.path())),
        &format!("{TARGET_LINUX}{LINK_FIX}"),
    );
    let manifest = store.load().unwrap();
    assert_eq!(manifest.assets.len(), 2);
    assert_eq!(manifest.get(&older), Some(&before));
    assert_eq!(
        manifest.latest("linux", "x86_64").unwrap().target.version,
        "21.1.5"
    );
}

#[test]
fn checksum_mismatch_is_fetch_error_and_caches_nothing() {
    let up = Upstream::new();
    let cache = TempDir::new().unwrap();
    let mirror = Arc::new(Mirror::new(up.dir.path()));
    let fetcher = SourceFetcher::open(cache.path(), mirror).unwrap();

    let wrong = sha256_bytes(b"not the archive");
    let err = fetcher
        .fetch(&format!("{MIRROR}llvm.tar.xz"), Some(&wrong))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fetch);

    let leftovers: Vec<_> = walkdir::WalkDir::new(cache.path())
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.path().starts_with(cache.path().join("locks")))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    assert!(fetcher
        .lookup(&format!("{MIRROR}llvm.tar.xz"))
        .unwrap()
        .is_none());

    let right = up.sha("llvm.tar.xz");
    let entry = fetcher
        .fetch(&format!("{MIRROR}llvm.tar.xz"), Some(&right))
        .unwrap();
    assert_eq!(entry.checksum, right);
}

#[test]
fn transient_http_failures_are_retried() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let mirror = Arc::new(Mirror::new(up.dir.path()));
    mirror.fail("llvm.tar.xz", Failure::Status(503));
    mirror.fail("python.tar.zst", Failure::ShortBody);

    let summary = run(
        work.path(),
        Arc::clone(&mirror),
        &format!("{TARGET_LINUX}{LINK_FIX}"),
    );
    assert_eq!(summary.published(), 1);
    assert_eq!(mirror.requests_for("llvm.tar.xz"), 2);
    assert_eq!(mirror.requests_for("python.tar.zst"), 2);
}

#[test]
fn persistent_http_failure_fails_only_that_target() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let mirror = Arc::new(Mirror::new(up.dir.path()));
    let arm = r#"
[[target]]
platform = "linux"
arch = "arm64"
version = "21.1.5"

[[target.source]]
name = "python"
url = "https://mirror.invalid/python-arm64.tar.zst"
"#;
    fs::copy(
        up.dir.path().join("python.tar.zst"),
        up.dir.path().join("python-arm64.tar.zst"),
    )
    .unwrap();
    // one failure per allowed attempt
    mirror.fail("python-arm64.tar.zst", Failure::Status(500));
    mirror.fail("python-arm64.tar.zst", Failure::Status(500));

    let summary = run(
        work.path(),
        Arc::clone(&mirror),
        &format!("{TARGET_LINUX}{LINK_FIX}{arm}"),
    );
    assert_eq!(summary.published(), 1);
    let t = outcome(&summary, "linux-arm64-21.1.5");
    assert_eq!(t.error_kind, Some(ErrorKind::Fetch));
    assert_eq!(
        t.error_path.as_deref(),
        Some("https://mirror.invalid/python-arm64.tar.zst")
    );

    let written: RunSummary = serde_json::from_slice(
        &fs::read(work.path().join("dist/run-summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(written.failed(), 1);
    assert_eq!(written.published(), 1);
}

#[test]
fn conflicting_tool_fails_before_any_output_is_written() {
    let up = Upstream::new();
    let tool_a = tar_bytes(&[Fx::File("bin/tool", b"tool from a", 0o755)]);
    let tool_b = tar_bytes(&[Fx::File("bin/tool", b"tool from b", 0o755)]);
    fs::write(up.dir.path().join("a.tar.zst"), zst(&tool_a)).unwrap();
    fs::write(up.dir.path().join("b.tar.xz"), xz(&tool_b)).unwrap();
    let work = TempDir::new().unwrap();
    let targets = r#"
[[target]]
platform = "linux"
arch = "x86_64"
version = "21.1.5"

[[target.source]]
name = "a"
url = "https://mirror.invalid/a.tar.zst"

[[target.source]]
name = "b"
url = "https://mirror.invalid/b.tar.xz"
"#;
    let summary = run(work.path(), Arc::new(Mirror::new(up.dir.path())), targets);
    let t = outcome(&summary, "linux-x86_64-21.1.5");
    assert_eq!(t.error_kind, Some(ErrorKind::Conflict));
    assert_eq!(t.error_path.as_deref(), Some("bin/tool"));
    assert!(!asset_path(work.path()).exists());
    assert!(!work.path().join("dist/manifest.json").exists());
    let stray: Vec<_> = fs::read_dir(work.path().join("dist/assets"))
        .unwrap()
        .collect();
    assert!(stray.is_empty());
}

#[test]
fn trimming_a_live_link_target_is_reported() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let targets = r#"
[[target]]
platform = "linux"
arch = "x86_64"
version = "21.1.5"
exclude = ["suffix:utf_8.py"]

[[target.source]]
name = "python"
url = "https://mirror.invalid/python.tar.zst"
trim = true
"#;
    let summary = run(work.path(), Arc::new(Mirror::new(up.dir.path())), targets);
    let t = outcome(&summary, "linux-x86_64-21.1.5");
    assert_eq!(t.error_kind, Some(ErrorKind::DanglingLink));
    assert_eq!(t.failed_stage, Some(TargetState::Trimming));
    assert_eq!(
        t.error_path.as_deref(),
        Some("lib/python3.10/encodings/default.py")
    );
}

#[test]
fn deb_indirection_select_yields_the_real_bindings() {
    let up = Upstream::new();
    let work = TempDir::new().unwrap();
    let targets = r#"
[[target]]
platform = "linux"
arch = "x86_64"
version = "21.1.5"

[[target.source]]
name = "bindings"
url = "https://mirror.invalid/python3-lldb-21_amd64.deb"
select = "usr/lib/llvm-21/lib"
"#;
    let summary = run(work.path(), Arc::new(Mirror::new(up.dir.path())), targets);
    assert_eq!(summary.published(), 1, "{}", summary.table());
    let entries = read_archive(&asset_path(work.path())).unwrap();
    let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"python3.10/site-packages/lldb/__init__.py"));
    assert!(paths.contains(&"liblldb.so.1"));

    // Through the dist-packages indirection the same content is reached.
    let fetcher = SourceFetcher::open(
        &work.path().join("cache"),
        Arc::new(Mirror::new(up.dir.path())),
    )
    .unwrap();
    let cached = fetcher
        .lookup(&format!("{MIRROR}python3-lldb-21_amd64.deb"))
        .unwrap()
        .unwrap();
    let mut ex =
        debugger_bundler::ContainerExtractor::new(&work.path().join("spill")).unwrap();
    let tree = ex
        .extract(&cached.local_path, debugger_bundler::ContainerFormat::Deb)
        .unwrap();
    let via_link = debugger_bundler::extract::select(
        &tree,
        "usr/lib/python3/dist-packages/lldb",
        &cached.local_path,
    )
    .unwrap();
    assert!(via_link.get("__init__.py").is_some());
    assert!(matches!(
        debugger_bundler::extract::select(&tree, "usr/lib/python3/dist-packages/missing", &cached.local_path),
        Err(BundleError::Extract { .. })
    ));
}

#[cfg(unix)]
#[test]
fn directory_source_links_survive_into_the_archive() {
    let work = TempDir::new().unwrap();
    let runtime = work.path().join("runtime");
    fs::create_dir_all(runtime.join("lib")).unwrap();
    fs::create_dir_all(runtime.join("bin")).unwrap();
    let libpython: &[u8] = b"\x7fELF libpython";
    let interpreter: &[u8] = b"\x7fELF python";
    fs::write(runtime.join("lib/libpython3.10.so.1.0"), libpython).unwrap();
    fs::write(runtime.join("bin/python3.10"), interpreter).unwrap();
    std::os::unix::fs::symlink(
        "libpython3.10.so.1.0",
        runtime.join("lib/libpython3.10.so"),
    )
    .unwrap();
    // A link the producing host could only record.
    fs::write(
        runtime.join(".bundle-symlinks.json"),
        br#"[{"path": "bin/python3", "target": "python3.10"}]"#,
    )
    .unwrap();

    let targets = r#"
[[target]]
platform = "linux"
arch = "x86_64"
version = "21.1.5"

[[target.source]]
name = "runtime"
path = "runtime"
"#;
    let summary = run(work.path(), Arc::new(Mirror::new(work.path())), targets);
    let t = outcome(&summary, "linux-x86_64-21.1.5");
    assert_eq!(t.state, TargetState::Published, "{:?}", t.message);

    let entries = read_archive(&asset_path(work.path())).unwrap();
    let by_path: HashMap<_, _> = entries.iter().map(|e| (e.path.as_str(), e)).collect();
    assert!(!by_path.contains_key(".bundle-symlinks.json"));
    for (link, text, content) in [
        ("lib/libpython3.10.so", "libpython3.10.so.1.0", libpython),
        ("bin/python3", "python3.10", interpreter),
    ] {
        let entry = by_path[link];
        assert_eq!(entry.kind, EntryKind::Symlink, "{link}");
        assert_eq!(entry.link_target.as_deref(), Some(text));
        let landed = path::resolve_from(path::parent(link), text).unwrap();
        assert_eq!(
            by_path[landed.as_str()].sha256.as_deref(),
            Some(sha256_bytes(content).as_str())
        );
    }
}
