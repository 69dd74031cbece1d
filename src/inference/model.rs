//! Model file lookup and input shape handling.

use std::path::{Path, PathBuf};
use tracing::debug;

use super::provider::{Provider, AUTO_ORDER};

/// Extra directory searched before the built-in roots
pub const MODEL_DIR_ENV: &str = "VINYL_RESTORE_MODEL_DIR";
/// QNN backend library used when none is configured
pub const QNN_BACKEND_ENV: &str = "VINYL_RESTORE_QNN_BACKEND_PATH";
/// DirectML adapter index used when the configured one is negative
pub const DML_DEVICE_ENV: &str = "VINYL_RESTORE_DML_DEVICE_ID";

pub const DEFAULT_MODEL_BASE: &str = "rnnoise_48k";

const MODELS_SUBDIR: &str = "models";
const DATA_DIR_NAME: &str = "vinyl-restore";

/// Resolves which model files to try and in what order
#[derive(Debug, Clone)]
pub struct ModelLocator {
    base: String,
    /// Fixed roots; `None` reads the environment on every lookup
    roots: Option<Vec<PathBuf>>,
}

impl Default for ModelLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLocator {
    pub fn new() -> Self {
        Self {
            base: DEFAULT_MODEL_BASE.to_string(),
            roots: None,
        }
    }

    /// Search only the given roots
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            base: DEFAULT_MODEL_BASE.to_string(),
            roots: Some(roots),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Filenames to look for, most specific first
    pub fn filename_priority(&self, preferred: Provider) -> Vec<String> {
        let accelerators: Vec<Provider> = match preferred {
            Provider::Auto => AUTO_ORDER
                .into_iter()
                .filter(Provider::is_accelerator)
                .collect(),
            p if p.is_accelerator() => vec![p],
            _ => Vec::new(),
        };

        let mut names: Vec<String> = accelerators
            .iter()
            .map(|p| format!("{}_olive_{}.onnx", self.base, p.tag()))
            .collect();
        names.push(format!("{}_olive_{}.onnx", self.base, Provider::Cpu.tag()));
        names.push(format!("{}.onnx", self.base));
        names
    }

    /// Directories whose `models/` subfolder is searched
    pub fn search_roots(&self) -> Vec<PathBuf> {
        if let Some(roots) = &self.roots {
            return dedup(roots.clone());
        }

        let mut roots = Vec::new();
        if let Some(dir) = std::env::var_os(MODEL_DIR_ENV).filter(|v| !v.is_empty()) {
            roots.push(PathBuf::from(dir));
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                roots.push(dir.to_path_buf());
                if let Some(parent) = bundle_parent(dir) {
                    roots.push(parent);
                }
            }
        }
        if let Some(data) = dirs::data_dir() {
            roots.push(data.join(DATA_DIR_NAME));
        }
        dedup(roots)
    }

    /// Every path to try, in order. The explicit path, if any, comes first.
    ///
    /// Paths are not checked for existence.
    pub fn candidates(&self, explicit: Option<&Path>, preferred: Provider) -> Vec<PathBuf> {
        let names = self.filename_priority(preferred);
        let mut paths: Vec<PathBuf> = explicit.map(Path::to_path_buf).into_iter().collect();

        for root in self.search_roots() {
            let dir = root.join(MODELS_SUBDIR);
            paths.extend(names.iter().map(|name| dir.join(name)));
        }

        let paths = dedup(paths);
        debug!("{} model candidates for {}", paths.len(), preferred);
        paths
    }

    /// First candidate that exists on disk
    pub fn find(&self, explicit: Option<&Path>, preferred: Provider) -> Option<PathBuf> {
        self.candidates(explicit, preferred)
            .into_iter()
            .find(|p| p.is_file())
    }
}

/// Directory containing the `.app` bundle that holds `dir`, if any
pub fn bundle_parent(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .find(|a| a.extension().is_some_and(|ext| ext == "app"))
        .and_then(Path::parent)
        .map(Path::to_path_buf)
}

/// Shape to feed the model for one frame, given its declared input shape.
///
/// Dynamic (negative) dimensions take the frame size. Ranks 1 to 3 are
/// normalized to `[frame]`, `[1, frame]` and `[1, 1, frame]`. A model that
/// declares no shape gets `[1, frame]`.
pub fn resolve_input_shape(declared: &[i64], frame_size: usize) -> Vec<i64> {
    let frame = frame_size as i64;
    match declared.len() {
        0 | 2 => vec![1, frame],
        1 => vec![frame],
        3 => vec![1, 1, frame],
        _ => declared
            .iter()
            .map(|&dim| if dim < 0 { frame } else { dim })
            .collect(),
    }
}

fn dedup(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths {
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}
