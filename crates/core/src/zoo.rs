//! Catalog of known pretrained models and where their weights come from.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{SrError, SrResult};
use crate::loader;
use crate::nn::{ChannelOrder, TensorLayout, ValueRange};

const REALESRGAN_RELEASES: &str = "https://github.com/xinntao/Real-ESRGAN/releases/download";

/// Network architecture a descriptor's weights were trained for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetArch {
    SrResNet,
    Rrdb {
        num_feat: u32,
        num_block: u32,
        num_grow_ch: u32,
    },
    SrVggCompact {
        num_feat: u32,
        num_conv: u32,
    },
    VendorFrozen,
}

impl std::fmt::Display for NetArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SrResNet => write!(f, "srresnet"),
            Self::Rrdb {
                num_feat,
                num_block,
                num_grow_ch,
            } => write!(f, "rrdb({num_feat}/{num_block}/{num_grow_ch})"),
            Self::SrVggCompact { num_feat, num_conv } => {
                write!(f, "srvgg-compact({num_feat}/{num_conv})")
            }
            Self::VendorFrozen => write!(f, "vendor-frozen"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightSource {
    /// Fetched on demand into the models directory.
    Remote {
        url: String,
        file_name: String,
        sha256: Option<String>,
    },
    /// Must already be present in the models directory.
    Local { file_name: String },
}

impl WeightSource {
    pub fn file_name(&self) -> &str {
        match self {
            Self::Remote { file_name, .. } | Self::Local { file_name } => file_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendDescriptor {
    pub name: String,
    pub native_scale: u32,
    pub arch: NetArch,
    pub weights: WeightSource,
    pub layout: TensorLayout,
    /// Original upstream weights, quoted in "not found" hints.
    pub upstream_url: Option<String>,
    pub description: String,
}

fn rrdb(num_block: u32) -> NetArch {
    NetArch::Rrdb {
        num_feat: 64,
        num_block,
        num_grow_ch: 32,
    }
}

fn torch_export_layout() -> TensorLayout {
    TensorLayout {
        channel_order: ChannelOrder::Rgb,
        value_range: ValueRange::UnitInterval,
        pad_align: 1,
    }
}

fn local_gan(name: &str, scale: u32, arch: NetArch, release: &str, description: &str) -> BackendDescriptor {
    BackendDescriptor {
        name: name.into(),
        native_scale: scale,
        arch,
        weights: WeightSource::Local {
            file_name: format!("{name}.onnx"),
        },
        layout: torch_export_layout(),
        upstream_url: Some(format!("{REALESRGAN_RELEASES}/{release}/{name}.pth")),
        description: description.into(),
    }
}

fn builtin_catalog() -> Vec<BackendDescriptor> {
    vec![
        local_gan(
            "RealESRGAN_x4plus",
            4,
            rrdb(23),
            "v0.1.0",
            "Real-ESRGAN x4 general-purpose model (RRDB, 23 blocks)",
        ),
        BackendDescriptor {
            name: "RealESRGAN_x4plus_anime_6B".into(),
            native_scale: 4,
            arch: rrdb(6),
            weights: WeightSource::Remote {
                url: "https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus_anime_6B.onnx".into(),
                file_name: "RealESRGAN_x4plus_anime_6B.onnx".into(),
                sha256: None,
            },
            layout: TensorLayout {
                channel_order: ChannelOrder::Rgb,
                value_range: ValueRange::ByteRange,
                pad_align: 4,
            },
            upstream_url: Some(format!(
                "{REALESRGAN_RELEASES}/v0.2.2.4/RealESRGAN_x4plus_anime_6B.pth"
            )),
            description: "Real-ESRGAN x4 anime-optimized model (6-block variant, 17.9 MB)".into(),
        },
        local_gan(
            "RealESRNet_x4plus",
            4,
            rrdb(23),
            "v0.1.0",
            "Real-ESRNet x4 (MSE-trained, no GAN loss)",
        ),
        local_gan(
            "RealESRGAN_x2plus",
            2,
            rrdb(23),
            "v0.2.1",
            "Real-ESRGAN x2 general-purpose model",
        ),
        local_gan(
            "realesr-animevideov3",
            4,
            NetArch::SrVggCompact {
                num_feat: 64,
                num_conv: 32,
            },
            "v0.2.5",
            "Real-ESRGAN compact model for anime video",
        ),
    ]
}

/// Descriptor for a model name the catalog does not know: RRDB 64/23/32 at
/// `round(max(1, scale))`, weights expected as `{name}.onnx`.
pub fn fallback_descriptor(name: &str, scale: f64) -> BackendDescriptor {
    let native_scale = scale.max(1.0).round() as u32;
    BackendDescriptor {
        name: name.into(),
        native_scale,
        arch: rrdb(23),
        weights: WeightSource::Local {
            file_name: format!("{name}.onnx"),
        },
        layout: torch_export_layout(),
        upstream_url: None,
        description: "Uncataloged model (assumed RRDB 64/23/32)".into(),
    }
}

pub struct ModelZoo {
    models_dir: PathBuf,
    entries: Vec<BackendDescriptor>,
}

impl ModelZoo {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Add an entry for every `.onnx` file in the models directory that no
    /// catalog entry claims. Discovered entries are sorted by name.
    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        if !dir.is_dir() {
            return Ok(());
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("cannot list models directory {}", dir.display()))?
        {
            let path = entry?.path();
            if let Some(descriptor) = self.uncataloged_export(&path) {
                found.push(descriptor);
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));

        for descriptor in &found {
            info!(
                model = %descriptor.name,
                native_scale = descriptor.native_scale,
                "Discovered uncataloged ONNX export"
            );
        }
        self.entries.extend(found);
        Ok(())
    }

    fn uncataloged_export(&self, path: &Path) -> Option<BackendDescriptor> {
        if !path.extension()?.eq_ignore_ascii_case("onnx") {
            return None;
        }
        let file_name = path.file_name()?.to_str()?;
        let name = path.file_stem()?.to_str()?;
        let claimed = self
            .entries
            .iter()
            .any(|e| e.name == name || e.weights.file_name() == file_name);
        if claimed {
            return None;
        }

        let mut descriptor = fallback_descriptor(name, 1.0);
        descriptor.native_scale = loader::scale_hint_from_file_name(path);
        descriptor.weights = WeightSource::Local {
            file_name: file_name.to_string(),
        };
        descriptor.description = "Discovered in the models directory (assumed RRDB 64/23/32)".into();
        Some(descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&BackendDescriptor> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[BackendDescriptor] {
        &self.entries
    }

    /// Catalog entry for `name`, or [`fallback_descriptor`] at `scale`.
    pub fn resolve(&self, name: &str, scale: f64) -> BackendDescriptor {
        match self.get(name) {
            Some(entry) => entry.clone(),
            None => {
                warn!(model = %name, scale, "Model not in catalog; assuming RRDB 64/23/32");
                fallback_descriptor(name, scale)
            }
        }
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.path_of(e).is_file())
            .unwrap_or(false)
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.path_of(e))
    }

    pub fn path_of(&self, descriptor: &BackendDescriptor) -> PathBuf {
        self.models_dir.join(descriptor.weights.file_name())
    }

    /// Local weights for `descriptor`, downloading remote ones when missing.
    pub fn ensure_weights(&self, descriptor: &BackendDescriptor) -> SrResult<PathBuf> {
        let path = self.path_of(descriptor);
        if path.is_file() {
            return Ok(path);
        }

        match &descriptor.weights {
            WeightSource::Remote { url, .. } => {
                fetch(&self.models_dir, descriptor).map_err(|e| SrError::ArtifactNotFound {
                    path: path.clone(),
                    hint: Some(format!("download from {url} failed: {e:#}")),
                })
            }
            WeightSource::Local { .. } => {
                let hint = match &descriptor.upstream_url {
                    Some(upstream) => format!(
                        "export the weights from {upstream} to ONNX and place them in {}",
                        self.models_dir.display()
                    ),
                    None => format!(
                        "place an ONNX export named {} in {}",
                        descriptor.weights.file_name(),
                        self.models_dir.display()
                    ),
                };
                Err(SrError::ArtifactNotFound {
                    path,
                    hint: Some(hint),
                })
            }
        }
    }

    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .get(name)
            .with_context(|| format!("model {name} is not in the catalog"))?;
        fetch(&self.models_dir, entry)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }
}

fn fetch(models_dir: &Path, entry: &BackendDescriptor) -> Result<PathBuf> {
    let WeightSource::Remote {
        url,
        file_name,
        sha256,
    } = &entry.weights
    else {
        bail!(
            "model {} has no download source; its weights must be exported locally",
            entry.name
        );
    };

    info!(model = %entry.name, url = %url, "Downloading weights");
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(30 * 60))
        .build()
        .context("cannot build HTTP client")?;
    let response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("request for {url} failed"))?;

    let path = stage_weights(models_dir, file_name, response, sha256.as_deref())?;
    info!(model = %entry.name, path = %path.display(), "Weights ready");
    Ok(path)
}

/// Stream `body` into `{file_name}.part`, check its digest against
/// `expected_sha256` and move it into place. The partial file never survives
/// a failure.
fn stage_weights(
    models_dir: &Path,
    file_name: &str,
    mut body: impl Read,
    expected_sha256: Option<&str>,
) -> Result<PathBuf> {
    fs::create_dir_all(models_dir)
        .with_context(|| format!("cannot create models directory {}", models_dir.display()))?;

    let partial = PartialFile::create(models_dir.join(format!("{file_name}.part")))?;
    let mut sink = DigestWriter {
        inner: &partial.file,
        digest: Sha256::new(),
    };
    std::io::copy(&mut body, &mut sink)
        .with_context(|| format!("download of {file_name} was interrupted"))?;
    let actual = format!("{:x}", sink.digest.finalize());
    partial
        .file
        .sync_all()
        .with_context(|| format!("cannot flush {}", partial.path.display()))?;

    match expected_sha256 {
        Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
            bail!("{file_name} has SHA-256 {actual}, expected {expected}")
        }
        Some(_) => debug!(file_name, "SHA-256 verified"),
        None => warn!(file_name, sha256 = %actual, "No SHA-256 pinned; weights not verified"),
    }

    partial.persist(&models_dir.join(file_name))
}

/// A `.part` file removed on drop unless [`persist`](Self::persist)ed.
struct PartialFile {
    path: PathBuf,
    file: fs::File,
    kept: bool,
}

impl PartialFile {
    fn create(path: PathBuf) -> Result<Self> {
        let file =
            fs::File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self {
            path,
            file,
            kept: false,
        })
    }

    fn persist(mut self, target: &Path) -> Result<PathBuf> {
        fs::rename(&self.path, target).with_context(|| {
            format!("cannot move {} to {}", self.path.display(), target.display())
        })?;
        self.kept = true;
        Ok(target.to_path_buf())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.kept {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Hashes everything written through it.
struct DigestWriter<W> {
    inner: W,
    digest: Sha256,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
