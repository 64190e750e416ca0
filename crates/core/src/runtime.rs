use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

static ORT_PROBE: OnceLock<Result<PathBuf, RuntimeLoadError>> = OnceLock::new();

/// The ONNX Runtime shared library could not be opened.
#[derive(Debug, Clone, Error)]
#[error("failed to load ONNX Runtime library '{}': {detail}", library.display())]
pub struct RuntimeLoadError {
    pub library: PathBuf,
    pub detail: String,
}

/// Search directories relative to the current executable for runtime libraries.
///
/// Probes these locations in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` (Unix only)
///   6. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn prepend_candidate_dirs_to_path(dirs: &[PathBuf]) {
    let current: Option<OsString> = env::var_os("PATH");
    let mut merged: Vec<PathBuf> = dirs.iter().filter(|d| d.is_dir()).cloned().collect();
    if let Some(path) = current.as_ref() {
        merged.extend(env::split_paths(path).filter(|d| !d.as_os_str().is_empty()));
    }
    if let Ok(joined) = env::join_paths(merged) {
        env::set_var("PATH", joined);
    }
}

/// Return a load-priority tier for CUDA runtime libs, or `None` for anything
/// that must not be preloaded (ORT itself and its providers, unrelated libs).
///
///   0: CUDA runtime (libcudart, libcublas, libcublasLt, libcufft, libcurand)
///   1: cuDNN (libcudnn*)
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("libcudart")
        || name.starts_with("libcublaslt")
        || name.starts_with("libcublas")
        || name.starts_with("libcufft")
        || name.starts_with("libcurand")
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("cudart64_")
        || name.starts_with("cublas64_")
        || name.starts_with("cublaslt64_")
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else {
        None
    }
}

/// Pre-load CUDA libraries with RTLD_GLOBAL so the CUDA execution provider
/// finds them once ORT initialises. glibc caches `LD_LIBRARY_PATH` at
/// startup, so setting it from `main()` would have no effect.
///
/// The first directory containing a given file name wins.
fn preload_libs_from_dirs(dirs: &[PathBuf]) {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }

            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    for (_, name, lib_path) in &libs {
        debug!(library = %name, "Preloading runtime library");
        unsafe { load_library(lib_path) };
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) =
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) = libloading::Library::new(path) {
        std::mem::forget(lib);
    }
}

/// Auto-detect runtime library paths before ORT initialisation.
///
/// Call this at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
        }

        #[cfg(windows)]
        prepend_candidate_dirs_to_path(&dirs);
    }

    preload_libs_from_dirs(&dirs);
}

/// Check once per process whether the ONNX Runtime library can be opened.
///
/// Every ORT-backed code path goes through here first: with `load-dynamic`
/// the `ort` crate would otherwise abort on first use when the library is
/// missing.
pub fn onnx_runtime() -> Result<PathBuf, RuntimeLoadError> {
    ORT_PROBE
        .get_or_init(|| probe_library(&ort_library_candidate()))
        .clone()
}

fn ort_library_candidate() -> PathBuf {
    env::var_os(ORT_DYLIB_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(ORT_LIB_NAME))
}

fn probe_library(library: &Path) -> Result<PathBuf, RuntimeLoadError> {
    match unsafe { libloading::Library::new(library) } {
        Ok(lib) => {
            std::mem::forget(lib);
            Ok(library.to_path_buf())
        }
        Err(error) => Err(RuntimeLoadError {
            library: library.to_path_buf(),
            detail: error.to_string(),
        }),
    }
}

/// Log which runtime libraries were resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    if let Ok(ort) = env::var(ORT_DYLIB_ENV) {
        if Path::new(&ort).is_file() {
            info!("ORT library: {ort}");
        } else {
            warn!("{ORT_DYLIB_ENV} set to {ort} but file not found");
        }
    } else {
        warn!("{ORT_DYLIB_ENV} not set; ORT will try default search paths");
    }

    match onnx_runtime() {
        Ok(path) => debug!(library = %path.display(), "ONNX Runtime available"),
        Err(error) => warn!(
            error = %error,
            "ONNX Runtime unavailable; only the native backend can run"
        ),
    }
}
