pub mod clips;
pub mod queue;

pub use clips::ClipLibrary;
pub use queue::{Cue, CueSlot};

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{
    mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::BridgeError;
use crate::protocol::SoundKind;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Plays one clip to completion.
pub trait ClipPlayer {
    fn play_clip(&mut self, path: &Path) -> Result<(), BridgeError>;
}

/// Builds the player on the audio thread; rodio's output stream is not `Send`.
pub type PlayerFactory = Arc<dyn Fn() -> Box<dyn ClipPlayer> + Send + Sync>;

/// Default output device via rodio. The stream is opened on first use.
#[derive(Default)]
pub struct RodioClipPlayer {
    output: Option<(OutputStream, OutputStreamHandle)>,
}

impl RodioClipPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_output(&mut self) -> Result<&OutputStreamHandle, BridgeError> {
        if self.output.is_none() {
            let opened = OutputStream::try_default().map_err(|e| {
                BridgeError::Playback(format!("Failed to create audio output stream: {}", e))
            })?;
            self.output = Some(opened);
        }
        match &self.output {
            Some((_, handle)) => Ok(handle),
            None => Err(BridgeError::Playback("audio output unavailable".into())),
        }
    }
}

impl ClipPlayer for RodioClipPlayer {
    fn play_clip(&mut self, path: &Path) -> Result<(), BridgeError> {
        let file = File::open(path)
            .map_err(|e| BridgeError::Playback(format!("{}: {}", path.display(), e)))?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|e| BridgeError::Playback(format!("{}: {}", path.display(), e)))?;

        let handle = self.ensure_output()?;
        let sink = Sink::try_new(handle)
            .map_err(|e| BridgeError::Playback(format!("Failed to create audio sink: {}", e)))?;
        sink.append(source);
        sink.sleep_until_end();
        Ok(())
    }
}

enum CueCommand {
    Play(Cue),
    Shutdown,
}

/// Front end of the `audio-cues` thread.
///
/// `play` returns as soon as the cue is queued; repeats and the gap between
/// them run on the audio thread.
pub struct CuePlayerHandle {
    clips: ClipLibrary,
    gap: Duration,
    factory: PlayerFactory,
    tx: Arc<Mutex<Option<Sender<CueCommand>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CuePlayerHandle {
    pub fn new(clips: ClipLibrary, gap: Duration) -> Self {
        Self::with_player(
            clips,
            gap,
            Arc::new(|| Box::new(RodioClipPlayer::new()) as Box<dyn ClipPlayer>),
        )
    }

    pub fn with_player(clips: ClipLibrary, gap: Duration, factory: PlayerFactory) -> Self {
        Self {
            clips,
            gap,
            factory,
            tx: Arc::new(Mutex::new(None)),
            thread: Mutex::new(None),
        }
    }

    pub fn clips(&self) -> &ClipLibrary {
        &self.clips
    }

    fn ensure_thread(&self) -> Result<Sender<CueCommand>, BridgeError> {
        let mut guard = self
            .tx
            .lock()
            .map_err(|e| BridgeError::Playback(e.to_string()))?;
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<CueCommand>();
        let factory = Arc::clone(&self.factory);
        let gap = self.gap;

        let handle = thread::Builder::new()
            .name("audio-cues".to_string())
            .spawn(move || {
                let mut player = factory();
                cue_loop(player.as_mut(), &rx, gap);
            })
            .map_err(|e| BridgeError::Playback(e.to_string()))?;

        if let Ok(mut thread) = self.thread.lock() {
            *thread = Some(handle);
        }
        *guard = Some(tx.clone());
        Ok(tx)
    }

    /// Queues `kind` to be played `repeat` times.
    pub fn play(&self, kind: SoundKind, repeat: u32) -> Result<(), BridgeError> {
        let path = self.clips.path_for(kind);
        if !path.is_file() {
            return Err(BridgeError::Playback(format!(
                "clip for {} not found at {}",
                kind.token(),
                path.display()
            )));
        }
        if repeat == 0 {
            return Ok(());
        }

        let tx = self.ensure_thread()?;
        tx.send(CueCommand::Play(Cue { kind, path, repeat }))
            .map_err(|e| BridgeError::Playback(e.to_string()))
    }

    /// Asks the audio thread to stop after the clip it is playing.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(CueCommand::Shutdown);
            }
        }
    }

    /// `shutdown`, then wait for the thread to exit.
    pub fn close(&self) {
        self.shutdown();
        let handle = match self.thread.lock() {
            Ok(mut thread) => thread.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log_error!("Audio thread panicked");
            }
        }
    }
}

/// Pulls every queued command into the slot. `false` means stop.
fn drain(rx: &Receiver<CueCommand>, slot: &mut CueSlot) -> bool {
    loop {
        match rx.try_recv() {
            Ok(CueCommand::Play(cue)) => offer(slot, cue),
            Ok(CueCommand::Shutdown) | Err(TryRecvError::Disconnected) => return false,
            Err(TryRecvError::Empty) => return true,
        }
    }
}

fn offer(slot: &mut CueSlot, cue: Cue) {
    if let Some(dropped) = slot.offer(cue) {
        log_debug!("Dropping queued {} cue for a newer one", dropped.kind.token());
    }
}

/// Waits out the gap between repeats while still accepting cues.
fn wait_gap(rx: &Receiver<CueCommand>, slot: &mut CueSlot, gap: Duration) -> bool {
    let deadline = Instant::now() + gap;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match rx.recv_timeout(remaining) {
            Ok(CueCommand::Play(cue)) => offer(slot, cue),
            Ok(CueCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
            Err(RecvTimeoutError::Timeout) => return true,
        }
    }
}

fn cue_loop(player: &mut dyn ClipPlayer, rx: &Receiver<CueCommand>, gap: Duration) {
    let mut slot = CueSlot::new();

    loop {
        if slot.is_idle() {
            match rx.recv() {
                Ok(CueCommand::Play(cue)) => offer(&mut slot, cue),
                Ok(CueCommand::Shutdown) | Err(_) => return,
            }
        }
        if !drain(rx, &mut slot) {
            return;
        }

        let Some(cue) = slot.active().cloned() else {
            continue;
        };

        for attempt in 1..=cue.repeat {
            if attempt > 1 && !wait_gap(rx, &mut slot, gap) {
                return;
            }
            log_info!("Playing {} ({}/{})", cue.kind.token(), attempt, cue.repeat);
            if let Err(err) = player.play_clip(&cue.path) {
                log_warn!(
                    "Abandoning {} after {} of {} plays: {}",
                    cue.kind.token(),
                    attempt - 1,
                    cue.repeat,
                    err
                );
                break;
            }
        }

        slot.finish_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SoundSettings;
    use std::fs;
    use std::path::PathBuf;

    #[derive(Clone, Default)]
    struct FakePlayer {
        played: Arc<Mutex<Vec<(PathBuf, Instant)>>>,
        fail_on_play: Option<usize>,
        clip_length: Duration,
    }

    impl ClipPlayer for FakePlayer {
        fn play_clip(&mut self, path: &Path) -> Result<(), BridgeError> {
            let mut played = self.played.lock().unwrap();
            played.push((path.to_path_buf(), Instant::now()));
            if Some(played.len()) == self.fail_on_play {
                return Err(BridgeError::Playback("device unplugged".into()));
            }
            drop(played);
            thread::sleep(self.clip_length);
            Ok(())
        }
    }

    fn clip_dir() -> (tempfile::TempDir, ClipLibrary) {
        let dir = tempfile::tempdir().unwrap();
        let settings = SoundSettings {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        for kind in SoundKind::ALL {
            let clips = ClipLibrary::from_settings(&settings);
            fs::write(clips.path_for(kind), b"ID3").unwrap();
        }
        let clips = ClipLibrary::from_settings(&settings);
        (dir, clips)
    }

    /// Polls until `count` plays were recorded or two seconds pass.
    fn wait_for(played: &Arc<Mutex<Vec<(PathBuf, Instant)>>>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while played.lock().unwrap().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        // Give a stray extra play a chance to show up.
        thread::sleep(Duration::from_millis(30));
    }

    fn handle(clips: ClipLibrary, gap: Duration, player: FakePlayer) -> CuePlayerHandle {
        CuePlayerHandle::with_player(
            clips,
            gap,
            Arc::new(move || Box::new(player.clone()) as Box<dyn ClipPlayer>),
        )
    }

    #[test]
    fn explosion_plays_three_times_with_gap() {
        let (_dir, clips) = clip_dir();
        let player = FakePlayer::default();
        let played = Arc::clone(&player.played);
        let gap = Duration::from_millis(40);
        let cues = handle(clips.clone(), gap, player);

        cues.play(SoundKind::Explosion, 3).unwrap();
        wait_for(&played, 3);
        cues.close();

        let played = played.lock().unwrap();
        assert_eq!(played.len(), 3);
        assert!(played
            .iter()
            .all(|(path, _)| *path == clips.path_for(SoundKind::Explosion)));
        for pair in played.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= gap);
        }
    }

    #[test]
    fn playback_error_abandons_remaining_repeats() {
        let (_dir, clips) = clip_dir();
        let player = FakePlayer {
            fail_on_play: Some(2),
            ..Default::default()
        };
        let played = Arc::clone(&player.played);
        let cues = handle(clips, Duration::from_millis(5), player);

        cues.play(SoundKind::Explosion, 3).unwrap();
        wait_for(&played, 2);
        cues.close();

        assert_eq!(played.lock().unwrap().len(), 2);
    }

    #[test]
    fn error_only_affects_its_own_cue() {
        let (_dir, clips) = clip_dir();
        let player = FakePlayer {
            fail_on_play: Some(1),
            clip_length: Duration::from_millis(20),
            ..Default::default()
        };
        let played = Arc::clone(&player.played);
        let cues = handle(clips.clone(), Duration::from_millis(5), player);

        cues.play(SoundKind::Explosion, 3).unwrap();
        cues.play(SoundKind::Sparkle, 1).unwrap();
        wait_for(&played, 2);
        cues.close();

        let paths: Vec<PathBuf> = played.lock().unwrap().iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(
            paths,
            vec![
                clips.path_for(SoundKind::Explosion),
                clips.path_for(SoundKind::Sparkle)
            ]
        );
    }

    #[test]
    fn overlapping_cues_never_interleave() {
        let (_dir, clips) = clip_dir();
        let player = FakePlayer {
            clip_length: Duration::from_millis(20),
            ..Default::default()
        };
        let played = Arc::clone(&player.played);
        let cues = handle(clips.clone(), Duration::from_millis(5), player);

        cues.play(SoundKind::Explosion, 3).unwrap();
        thread::sleep(Duration::from_millis(5));
        // Both arrive while the explosion is still going; only the last waits.
        cues.play(SoundKind::Sparkle, 1).unwrap();
        cues.play(SoundKind::StepComplete, 1).unwrap();
        wait_for(&played, 4);
        cues.close();

        let paths: Vec<PathBuf> = played.lock().unwrap().iter().map(|(p, _)| p.clone()).collect();
        let explosion = clips.path_for(SoundKind::Explosion);
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[..3], [explosion.clone(), explosion.clone(), explosion]);
        assert_eq!(paths[3..], [clips.path_for(SoundKind::StepComplete)]);
    }

    #[test]
    fn missing_clip_is_rejected_before_queueing() {
        let dir = tempfile::tempdir().unwrap();
        let clips = ClipLibrary::from_settings(&SoundSettings {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let player = FakePlayer::default();
        let played = Arc::clone(&player.played);
        let cues = handle(clips, Duration::ZERO, player);

        let err = cues.play(SoundKind::Sparkle, 1).unwrap_err();
        assert!(matches!(err, BridgeError::Playback(_)));
        cues.close();
        assert!(played.lock().unwrap().is_empty());
    }
}
