//! On-disk generation directory.
//!
//! ```text
//! data_dir/
//!   records.log                       store write log (NVLOG001)
//!   manifest.json                     active generation + checksums
//!   generations/
//!     gen-<gid>-snap-<sid>.nvx        one file per generation (NVGEN001)
//! ```
//!
//! Every file is written to a temp path, fsynced, renamed into place and the
//! parent directory fsynced. The manifest is written last, so after a crash
//! it always names files that are complete.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use nodevec_core::{format, VectorStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::generation::{now_unix_ms, GenerationId, IndexGeneration};

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestGeneration {
    pub generation_id: GenerationId,
    pub snapshot_id: u64,
    pub snapshot_counter: u64,
    pub file: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub dimension: usize,
    pub active: Option<ManifestGeneration>,
    pub log_file: String,
    pub log_write_counter: u64,
    /// Highest snapshot id handed out before the checkpoint.
    #[serde(default)]
    pub last_snapshot_id: u64,
    pub updated_at_ms: u64,
}

pub struct GenerationStore {
    dimension: usize,
    log_path: PathBuf,
    generations_dir: PathBuf,
    manifest_path: PathBuf,
    write_lock: Mutex<()>,
}

impl GenerationStore {
    /// Create the directory layout if needed and clear leftover temp files.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let generations_dir = config.generations_dir();
        std::fs::create_dir_all(&generations_dir)
            .with_context(|| format!("creating {:?}", generations_dir))?;

        let store = Self {
            dimension: config.dimension,
            log_path: config.log_path(),
            generations_dir,
            manifest_path: config.manifest_path(),
            write_lock: Mutex::new(()),
        };
        store.remove_temp_files()?;
        Ok(store)
    }

    pub fn generation_path(&self, generation_id: GenerationId, snapshot_id: u64) -> PathBuf {
        self.generations_dir
            .join(format!("gen-{generation_id}-snap-{snapshot_id}.nvx"))
    }

    pub fn read_manifest(&self) -> Result<Option<Manifest>> {
        if !self.manifest_path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.manifest_path)
            .with_context(|| format!("reading manifest {:?}", self.manifest_path))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing manifest {:?}", self.manifest_path))?;
        if manifest.version != MANIFEST_VERSION {
            bail!("unsupported manifest version {}", manifest.version);
        }
        if manifest.dimension != self.dimension {
            bail!(
                "manifest dimension {} does not match configured dimension {}",
                manifest.dimension,
                self.dimension
            );
        }
        Ok(Some(manifest))
    }

    /// Replay the store log, or start an empty store if there is none.
    ///
    /// Snapshot ids continue after the last one the manifest recorded.
    pub fn load_store(&self) -> Result<VectorStore> {
        let store = if self.log_path.exists() {
            let store = VectorStore::load(&self.log_path, self.dimension)
                .with_context(|| format!("replaying store log {:?}", self.log_path))?;
            tracing::info!(
                path = %self.log_path.display(),
                write_counter = store.write_counter(),
                live = store.live_count(),
                "replayed store log"
            );
            store
        } else {
            VectorStore::new(self.dimension)?
        };
        if let Some(manifest) = self.read_manifest()? {
            let last = manifest
                .active
                .as_ref()
                .map_or(manifest.last_snapshot_id, |a| {
                    a.snapshot_id.max(manifest.last_snapshot_id)
                });
            store.reserve_snapshot_ids_after(last);
        }
        Ok(store)
    }

    /// Load the generation the manifest marks active, verifying its checksum.
    pub fn load_active(&self) -> Result<Option<IndexGeneration>> {
        let Some(manifest) = self.read_manifest()? else {
            return Ok(None);
        };
        let Some(entry) = manifest.active else {
            return Ok(None);
        };

        let path = self.generations_dir.join(&entry.file);
        let hash = sha256_file(&path)?;
        if hash != entry.sha256 {
            bail!(
                "generation checksum mismatch for {:?}: expected {}, got {}",
                path,
                entry.sha256,
                hash
            );
        }
        let generation = read_generation_file(&path)?;
        if generation.id() != entry.generation_id {
            bail!(
                "{:?} holds generation {}, manifest expects {}",
                path,
                generation.id(),
                entry.generation_id
            );
        }
        Ok(Some(generation))
    }

    /// Persist `store`'s log and `active`, then point the manifest at them.
    pub fn checkpoint(&self, store: &VectorStore, active: Option<&IndexGeneration>) -> Result<Manifest> {
        let _guard = self.write_lock.lock();

        let active = match active {
            Some(generation) => Some(self.write_generation(generation)?),
            None => self.read_manifest()?.and_then(|m| m.active),
        };

        let log_write_counter = store
            .save_log(&self.log_path)
            .with_context(|| format!("saving store log {:?}", self.log_path))?;
        sync_parent(&self.log_path)?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            dimension: self.dimension,
            active,
            log_file: file_name(&self.log_path),
            log_write_counter,
            last_snapshot_id: store.last_snapshot_id(),
            updated_at_ms: now_unix_ms(),
        };
        let tmp = self.manifest_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)
            .with_context(|| format!("writing {:?}", tmp))?;
        File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &self.manifest_path)?;
        sync_parent(&self.manifest_path)?;
        Ok(manifest)
    }

    fn write_generation(&self, generation: &IndexGeneration) -> Result<ManifestGeneration> {
        let path = self.generation_path(generation.id(), generation.snapshot_id());
        if !path.exists() {
            write_generation_file(&path, generation)?;
        }
        Ok(ManifestGeneration {
            generation_id: generation.id(),
            snapshot_id: generation.snapshot_id(),
            snapshot_counter: generation.snapshot_counter(),
            file: file_name(&path),
            size_bytes: std::fs::metadata(&path)?.len(),
            sha256: sha256_file(&path)?,
        })
    }

    /// Delete the files of `ids`, never the manifest's active generation.
    pub fn remove_generations(&self, ids: &[GenerationId]) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let active = self
            .read_manifest()?
            .and_then(|m| m.active)
            .map(|a| a.generation_id);

        let mut deleted = 0usize;
        for (id, path) in self.list_generation_files()? {
            if Some(id) == active || !ids.contains(&id) {
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete every generation file the manifest does not reference.
    pub fn remove_unreferenced(&self) -> Result<usize> {
        let active = self
            .read_manifest()?
            .and_then(|m| m.active)
            .map(|a| a.generation_id);
        let ids: Vec<GenerationId> = self
            .list_generation_files()?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| Some(*id) != active)
            .collect();
        self.remove_generations(&ids)
    }

    fn list_generation_files(&self) -> Result<Vec<(GenerationId, PathBuf)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.generations_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(id) = parse_generation_id(name) {
                out.push((id, path));
            }
        }
        Ok(out)
    }

    fn remove_temp_files(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.generations_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                tracing::warn!(path = %path.display(), "removing partial generation file");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Write one generation as a standalone artifact (temp file + rename).
pub fn write_generation_file(path: &Path, generation: &IndexGeneration) -> Result<()> {
    let tmp = path.with_extension("nvx.tmp");
    {
        let mut writer = BufWriter::new(
            File::create(&tmp).with_context(|| format!("creating {:?}", tmp))?,
        );
        format::write_generation(&mut writer, &generation.header(), generation.index())
            .with_context(|| format!("writing generation {}", generation.id()))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("renaming {:?} -> {:?}", tmp, path))?;
    sync_parent(path)?;
    Ok(())
}

/// Read a generation artifact back without rebuilding it.
pub fn read_generation_file(path: &Path) -> Result<IndexGeneration> {
    let mut reader =
        BufReader::new(File::open(path).with_context(|| format!("opening {:?}", path))?);
    let (header, index) = format::read_generation(&mut reader)
        .with_context(|| format!("decoding generation {:?}", path))?;
    Ok(IndexGeneration::from_header(&header, index))
}

fn parse_generation_id(name: &str) -> Option<GenerationId> {
    let rest = name.strip_prefix("gen-")?.strip_suffix(".nvx")?;
    let (id, _) = rest.split_once("-snap-")?;
    id.parse().ok()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

fn sync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("{:?} has no parent directory", path))?;
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}
