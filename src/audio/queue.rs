use std::path::PathBuf;

use crate::protocol::SoundKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub kind: SoundKind,
    pub path: PathBuf,
    pub repeat: u32,
}

/// One cue playing, at most one waiting.
///
/// A cue offered while another is already waiting takes its place, so a burst
/// of requests collapses to the latest one instead of piling up.
#[derive(Debug, Default)]
pub struct CueSlot {
    active: Option<Cue>,
    pending: Option<Cue>,
}

impl CueSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cue that was displaced from the pending position, if any.
    pub fn offer(&mut self, cue: Cue) -> Option<Cue> {
        if self.active.is_none() {
            self.active = Some(cue);
            return None;
        }
        self.pending.replace(cue)
    }

    pub fn active(&self) -> Option<&Cue> {
        self.active.as_ref()
    }

    pub fn pending(&self) -> Option<&Cue> {
        self.pending.as_ref()
    }

    /// Promotes the pending cue; returns the new active one.
    pub fn finish_active(&mut self) -> Option<&Cue> {
        self.active = self.pending.take();
        self.active.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(kind: SoundKind) -> Cue {
        Cue {
            kind,
            path: PathBuf::from(kind.token()),
            repeat: kind.repeat_count(),
        }
    }

    #[test]
    fn first_offer_becomes_active() {
        let mut slot = CueSlot::new();
        assert!(slot.is_idle());
        assert_eq!(slot.offer(cue(SoundKind::Sparkle)), None);
        assert_eq!(slot.active().map(|c| c.kind), Some(SoundKind::Sparkle));
        assert!(slot.pending().is_none());
    }

    #[test]
    fn newer_cue_replaces_pending_not_active() {
        let mut slot = CueSlot::new();
        slot.offer(cue(SoundKind::Explosion));
        slot.offer(cue(SoundKind::Sparkle));

        let displaced = slot.offer(cue(SoundKind::StepComplete));
        assert_eq!(displaced.map(|c| c.kind), Some(SoundKind::Sparkle));
        assert_eq!(slot.active().map(|c| c.kind), Some(SoundKind::Explosion));
        assert_eq!(slot.pending().map(|c| c.kind), Some(SoundKind::StepComplete));
    }

    #[test]
    fn finishing_promotes_pending_then_goes_idle() {
        let mut slot = CueSlot::new();
        slot.offer(cue(SoundKind::Explosion));
        slot.offer(cue(SoundKind::Sparkle));

        assert_eq!(slot.finish_active().map(|c| c.kind), Some(SoundKind::Sparkle));
        assert!(slot.pending().is_none());
        assert_eq!(slot.finish_active(), None);
        assert!(slot.is_idle());
    }
}
