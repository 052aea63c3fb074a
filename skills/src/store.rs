//! Filesystem store and in-memory registry.
//!
//! Layout: `«root»/skills/«name»/SKILL.md` plus optional `scripts/`,
//! `references/` and `assets/` side files. Writes go through a temp file
//! and rename; modified documents leave a timestamped backup behind, with
//! the oldest pruned past a small retention.

use std::{
    collections::HashMap,
    fs,
    path::{Component, Path, PathBuf},
};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    document::{parse_document, render_document},
    error::SkillError,
    types::{is_valid_skill_name, Skill},
};

pub const SKILL_FILE: &str = "SKILL.md";
pub const MAX_SIDE_FILE_BYTES: u64 = 1024 * 1024;
const MAX_BACKUPS: usize = 3;

pub struct SkillStore {
    root: PathBuf,
}

impl SkillStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join("skills")
    }

    pub fn skill_dir(&self, name: &str) -> PathBuf {
        self.skills_dir().join(name)
    }

    fn skill_file(&self, name: &str) -> PathBuf {
        self.skill_dir(name).join(SKILL_FILE)
    }

    /// Load every skill directory. A missing root is an empty store;
    /// documents that fail to parse are skipped with a warning so one bad
    /// skill cannot take the library down.
    pub fn load_all(&self) -> Result<Vec<Skill>, SkillError> {
        let dir = self.skills_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("skill root {} does not exist yet", dir.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut skills = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.load(&name) {
                Ok(skill) => skills.push(skill),
                Err(err) => warn!("Skipping skill '{}': {}", name, err),
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(skills)
    }

    pub fn load(&self, name: &str) -> Result<Skill, SkillError> {
        let path = self.skill_file(name);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SkillError::NotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let skill = parse_document(&source)?;
        if skill.name != name {
            return Err(SkillError::Validation(format!(
                "directory '{}' contains skill named '{}'",
                name, skill.name
            )));
        }
        Ok(skill)
    }

    /// Validate and persist a skill, backing up any previous document.
    pub fn save(&self, skill: &Skill) -> Result<(), SkillError> {
        let rendered = render_document(skill)?;
        let path = self.skill_file(&skill.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            backup_file(&path)?;
        }
        atomic_write(&path, rendered.as_bytes())?;
        info!("Saved skill '{}'", skill.name);
        Ok(())
    }

    /// Remove the whole skill directory.
    pub fn delete(&self, name: &str) -> Result<(), SkillError> {
        if !is_valid_skill_name(name) {
            return Err(SkillError::InvalidName(name.to_string()));
        }
        let dir = self.skill_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Deleted skill '{}'", name);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SkillError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read a side file (scripts, references, assets) of a skill.
    pub fn read_file(&self, name: &str, relative: &str) -> Result<Vec<u8>, SkillError> {
        let path = self.resolve_side_path(name, relative)?;
        let metadata = fs::metadata(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                SkillError::NotFound(format!("{name}/{relative}"))
            } else {
                err.into()
            }
        })?;
        if metadata.len() > MAX_SIDE_FILE_BYTES {
            return Err(SkillError::FileTooLarge {
                size: metadata.len(),
                limit: MAX_SIDE_FILE_BYTES,
            });
        }
        Ok(fs::read(&path)?)
    }

    /// Write a side file, creating parent directories.
    pub fn write_file(&self, name: &str, relative: &str, bytes: &[u8]) -> Result<(), SkillError> {
        if bytes.len() as u64 > MAX_SIDE_FILE_BYTES {
            return Err(SkillError::FileTooLarge {
                size: bytes.len() as u64,
                limit: MAX_SIDE_FILE_BYTES,
            });
        }
        let path = self.resolve_side_path(name, relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            backup_file(&path)?;
        }
        atomic_write(&path, bytes)?;
        Ok(())
    }

    /// Join a relative side-file path under the skill directory, rejecting
    /// anything that could escape it.
    fn resolve_side_path(&self, name: &str, relative: &str) -> Result<PathBuf, SkillError> {
        if !is_valid_skill_name(name) {
            return Err(SkillError::InvalidName(name.to_string()));
        }
        let relative_path = Path::new(relative);
        let clean = relative_path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if relative.is_empty() || !clean {
            return Err(SkillError::InvalidPath(relative.to_string()));
        }
        Ok(self.skill_dir(name).join(relative_path))
    }
}

/// Write via `«path».tmp` then rename.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), SkillError> {
    let tmp = path.with_extension(
        path.extension()
            .map(|ext| format!("{}.tmp", ext.to_string_lossy()))
            .unwrap_or_else(|| "tmp".to_string()),
    );
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Copy to `«path».backup-«YYYYMMDD-HHMMSS»` and prune oldest-first.
fn backup_file(path: &Path) -> Result<(), SkillError> {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let backup_name = format!("{file_name}.backup-{stamp}");
    let backup = path.with_file_name(&backup_name);
    fs::copy(path, &backup)?;
    prune_backups(path, &file_name)?;
    Ok(())
}

fn prune_backups(path: &Path, file_name: &str) -> Result<(), SkillError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    let prefix = format!("{file_name}.backup-");
    let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect();
    // Timestamped names sort chronologically.
    backups.sort();
    while backups.len() > MAX_BACKUPS {
        let oldest = backups.remove(0);
        debug!("Pruning backup {}", oldest.display());
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

/// In-memory index over the store.
///
/// Loaded at startup and on explicit refresh; CRUD re-validates and
/// re-indexes.
pub struct SkillRegistry {
    store: SkillStore,
    skills: RwLock<HashMap<String, Skill>>,
}

impl SkillRegistry {
    pub fn new(store: SkillStore) -> Self {
        Self {
            store,
            skills: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SkillStore {
        &self.store
    }

    /// Reload everything from disk. Returns the number of skills indexed.
    pub fn refresh(&self) -> Result<usize, SkillError> {
        let loaded = self.store.load_all()?;
        let count = loaded.len();
        let mut skills = self.skills.write();
        skills.clear();
        for skill in loaded {
            skills.insert(skill.name.clone(), skill);
        }
        info!("Skill registry loaded: {} skill(s)", count);
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Skill> {
        self.skills.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self.skills.read().values().cloned().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// Active skills only; the view prompts and tools are built from.
    pub fn active(&self) -> Vec<Skill> {
        self.list().into_iter().filter(Skill::is_active).collect()
    }

    pub fn save(&self, skill: Skill) -> Result<(), SkillError> {
        self.store.save(&skill)?;
        self.skills.write().insert(skill.name.clone(), skill);
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), SkillError> {
        self.store.delete(name)?;
        self.skills.write().remove(name);
        Ok(())
    }
}
