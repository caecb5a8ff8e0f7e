// ============================================================================
// CHECKPOINT SERIALIZATION
// ============================================================================

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::model::{ModelConfig, RnnModel};

const VERSION: &str = "1.0-bin";

#[derive(Serialize, Deserialize, Clone)]
pub struct Checkpoint {
    pub version: String,
    pub timestamp: String,
    pub metadata: Option<String>,
    pub config: ModelConfig,
    pub param_data: Vec<f32>,
}

/// Training context stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub val_loss: f32,
    pub lr: f32,
}

impl Checkpoint {
    pub fn capture(model: &RnnModel, g: &Graph, meta: Option<&CheckpointMeta>) -> Self {
        let ids = model.param_ids();
        let mut param_data = Vec::with_capacity(model.total_params(g));
        for &t in &ids {
            param_data.extend_from_slice(g.data(t));
        }
        Checkpoint {
            version: VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: meta.and_then(|m| serde_json::to_string(m).ok()),
            config: model.config().clone(),
            param_data,
        }
    }

    pub fn meta(&self) -> Option<CheckpointMeta> {
        self.metadata.as_deref().and_then(|m| serde_json::from_str(m).ok())
    }

    /// Rebuilds the model described by `config` on a fresh graph and copies
    /// the stored parameters into it. The model comes back in eval mode.
    pub fn restore(&self, path: &Path) -> Result<(Graph, RnnModel)> {
        let mut g = Graph::new();
        // Values are overwritten below; the rng only feeds the throwaway init.
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = RnnModel::new(self.config.clone(), &mut g, &mut rng)?;
        let expected = model.total_params(&g);
        if expected != self.param_data.len() {
            return Err(corrupt(path, format!(
                "expected {} parameters for {} model, found {}",
                expected,
                self.config.kind,
                self.param_data.len()
            )));
        }
        let mut off = 0;
        for t in model.param_ids() {
            let dst = g.data_mut(t);
            let len = dst.len();
            dst.copy_from_slice(&self.param_data[off..off + len]);
            off += len;
        }
        model.eval();
        Ok((g, model))
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Error {
    Error::Checkpoint { path: path.to_path_buf(), reason: reason.into() }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Writes the model atomically: a sibling temp file is synced, renamed over
/// `path`, and the parent directory is synced so the rename survives a crash.
pub fn save(path: &Path, model: &RnnModel, g: &Graph, meta: Option<&CheckpointMeta>) -> Result<()> {
    let cp = Checkpoint::capture(model, g, meta);
    let bytes = bincode::serialize(&cp).map_err(|e| corrupt(path, e.to_string()))?;
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        file.write_all(&bytes).map_err(|e| Error::io(&tmp, e))?;
        file.sync_all().map_err(|e| Error::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    sync_dir(parent).map_err(|e| Error::io(parent, e))?;
    info!(path = %path.display(), mb = bytes.len() as f64 / 1_048_576.0, "saved checkpoint");
    Ok(())
}

pub fn read(path: &Path) -> Result<Checkpoint> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    let cp: Checkpoint = bincode::deserialize(&bytes).map_err(|e| corrupt(path, e.to_string()))?;
    if cp.version != VERSION {
        return Err(corrupt(path, format!("unsupported version {}", cp.version)));
    }
    Ok(cp)
}

/// Reads and restores in one go.
pub fn load(path: &Path) -> Result<(Graph, RnnModel)> {
    let cp = read(path)?;
    let restored = cp.restore(path)?;
    info!(
        path = %path.display(),
        params = cp.param_data.len(),
        kind = %cp.config.kind,
        saved = %cp.timestamp,
        "loaded checkpoint"
    );
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;

    fn model(seed: u64) -> (Graph, RnnModel) {
        let mut g = Graph::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let cfg = ModelConfig { kind: ModelKind::Gru, ntoken: 5, ninp: 3, nhid: 3, nlayers: 2, dropout: 0.2, tied: true };
        let m = RnnModel::new(cfg, &mut g, &mut rng).unwrap();
        (g, m)
    }

    #[test]
    fn save_leaves_no_temp_file_and_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pt");
        let (g, m) = model(4);
        save(&path, &m, &g, Some(&CheckpointMeta { epoch: 1, val_loss: 2.0, lr: 20.0 })).unwrap();
        save(&path, &m, &g, Some(&CheckpointMeta { epoch: 2, val_loss: 1.0, lr: 20.0 })).unwrap();

        assert!(!tmp_path(&path).exists());
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("model.pt")]);
        assert_eq!(read(&path).unwrap().meta().unwrap().epoch, 2);
    }

    #[test]
    fn restored_model_produces_identical_logits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pt");
        let (mut g, mut m) = model(9);
        let meta = CheckpointMeta { epoch: 3, val_loss: 1.5, lr: 5.0 };
        save(&path, &m, &g, Some(&meta)).unwrap();

        let (mut g2, m2) = load(&path).unwrap();
        assert!(!m2.is_training());
        m.eval();
        let mut rng = StdRng::seed_from_u64(0);
        let (a, ha) = m.step(1, m.init_hidden(1), &mut g, &mut rng);
        let (b, hb) = m2.step(1, m2.init_hidden(1), &mut g2, &mut rng);
        assert_eq!(a, b);
        assert_eq!(ha, hb);
        assert_eq!(read(&path).unwrap().meta(), Some(meta));
    }

    #[test]
    fn truncated_file_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pt");
        let (g, m) = model(1);
        save(&path, &m, &g, None).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(load(&path), Err(Error::Checkpoint { .. })));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let res = load(Path::new("/nonexistent/model.pt"));
        assert!(matches!(res, Err(Error::Io { .. })));
    }
}
