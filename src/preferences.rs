//! Persisted auto-load preferences.
//!
//! A JSON object mapping task identifiers to "load on startup", e.g.
//! `{"whisper":true,"tts":false,"llm":false}`. Read once when the workbench
//! is built; written only when the user changes a preference.

use crate::error::Result;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Preferences {
    autoload: BTreeMap<Task, bool>,
}

impl Preferences {
    /// `~/.config/modelhost/preferences.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("modelhost")
            .join("preferences.json")
    }

    /// Read preferences from `path`.
    ///
    /// A missing file yields empty preferences (nothing auto-loads). A file
    /// that is not a valid preference object is logged and ignored, so a
    /// corrupt file never blocks startup.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no preferences file");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read preferences");
                return Self::default();
            }
        };

        match Self::parse(&contents) {
            Ok(preferences) => preferences,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring invalid preferences");
                Self::default()
            }
        }
    }

    /// Parse a preference object. Unknown task keys are skipped.
    pub fn parse(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, bool> = serde_json::from_str(json)?;
        let autoload = raw
            .into_iter()
            .filter_map(|(key, enabled)| match key.parse::<Task>() {
                Ok(task) => Some((task, enabled)),
                Err(_) => {
                    debug!(key, "skipping unknown preference key");
                    None
                }
            })
            .collect();
        Ok(Self { autoload })
    }

    /// Write preferences to `path`, creating its directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Whether `task` should load at startup. Defaults to false.
    pub fn autoload(&self, task: Task) -> bool {
        self.autoload.get(&task).copied().unwrap_or(false)
    }

    pub fn set_autoload(&mut self, task: Task, enabled: bool) {
        self.autoload.insert(task, enabled);
    }

    /// Tasks flagged for auto-load, in task order.
    pub fn autoload_tasks(&self) -> Vec<Task> {
        Task::ALL
            .into_iter()
            .filter(|task| self.autoload(*task))
            .collect()
    }
}
