use std::path::{Path, PathBuf};

use crate::protocol::SoundKind;
use crate::settings::SoundSettings;

/// Maps each cue kind to its clip file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipLibrary {
    dir: PathBuf,
    sparkle: String,
    explosion: String,
    step_complete: String,
}

impl ClipLibrary {
    pub fn from_settings(settings: &SoundSettings) -> Self {
        Self {
            dir: settings.dir.clone(),
            sparkle: settings.sparkle.clone(),
            explosion: settings.explosion.clone(),
            step_complete: settings.step_complete.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: SoundKind) -> PathBuf {
        let file = match kind {
            SoundKind::StepComplete => &self.step_complete,
            SoundKind::Sparkle => &self.sparkle,
            SoundKind::Explosion => &self.explosion,
        };
        self.dir.join(file)
    }

    /// Clips that are configured but not present.
    pub fn missing(&self) -> Vec<PathBuf> {
        SoundKind::ALL
            .into_iter()
            .map(|kind| self.path_for(kind))
            .filter(|path| !path.is_file())
            .collect()
    }
}
