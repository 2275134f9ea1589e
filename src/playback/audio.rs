/// Local audio output for resolved HTTP streams
use crate::error::ProviderError;
use crate::models::Source;
use crate::providers::soundcloud::AudioOutput;
use crate::providers::{BackendReport, ReportSender};
use rodio::{Decoder, OutputStream, Sink, Source as _};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Control handle for one playback thread
#[derive(Clone)]
pub struct PlaybackHandle {
    stop_flag: Arc<AtomicBool>,
    volume: Arc<AtomicU8>,
}

impl PlaybackHandle {
    fn new(volume: Arc<AtomicU8>) -> Self {
        Self {
            stop_flag: Arc::new(AtomicBool::new(false)),
            volume,
        }
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    fn gain(&self) -> f32 {
        f32::from(self.volume.load(Ordering::SeqCst)) / 100.0
    }
}

/// Plays streams through the default output device with rodio
pub struct RodioOutput {
    current: Mutex<Option<PlaybackHandle>>,
    volume: Arc<AtomicU8>,
    reports: Option<ReportSender>,
}

impl RodioOutput {
    pub fn new(reports: Option<ReportSender>) -> Self {
        Self {
            current: Mutex::new(None),
            volume: Arc::new(AtomicU8::new(100)),
            reports,
        }
    }

    fn play_http_audio(url: &str, start: Duration, handle: &PlaybackHandle) -> Result<(), String> {
        let (_stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| format!("Failed to get audio output: {}", e))?;

        let response = reqwest::blocking::Client::new()
            .get(url)
            .send()
            .map_err(|e| format!("Failed to fetch audio: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("Failed to fetch audio: HTTP {}", response.status()));
        }
        let bytes = response
            .bytes()
            .map_err(|e| format!("Failed to read response body: {}", e))?;

        if handle.should_stop() {
            return Ok(());
        }

        let source = Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| format!("Failed to decode audio: {}", e))?;
        let sink =
            Sink::try_new(&stream_handle).map_err(|e| format!("Failed to create sink: {}", e))?;

        let mut gain = handle.gain();
        sink.set_volume(gain);
        sink.append(source.skip_duration(start).convert_samples::<f32>());
        tracing::info!(offset_ms = start.as_millis() as u64, "Playing stream");

        while !handle.should_stop() && !sink.empty() {
            let wanted = handle.gain();
            if (wanted - gain).abs() > f32::EPSILON {
                gain = wanted;
                sink.set_volume(gain);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        sink.stop();
        Ok(())
    }
}

impl Default for RodioOutput {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AudioOutput for RodioOutput {
    fn play(&self, track_id: &str, url: &str, start: Duration, volume: u8) -> Result<(), ProviderError> {
        self.volume.store(volume.min(100), Ordering::SeqCst);
        let handle = PlaybackHandle::new(Arc::clone(&self.volume));
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = current.replace(handle.clone()) {
                previous.stop();
            }
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ProviderError::Command(format!("no runtime for audio playback: {}", e)))?;
        let url = url.to_string();
        let track_id = track_id.to_string();
        let reports = self.reports.clone();

        // rodio is blocking; the output stream lives on the blocking thread.
        runtime.spawn_blocking(move || match Self::play_http_audio(&url, start, &handle) {
            Ok(()) => tracing::debug!(track_id = %track_id, "Stream playback ended"),
            Err(e) => {
                tracing::error!(track_id = %track_id, "Audio playback error: {}", e);
                if let Some(reports) = reports {
                    let _ = reports.send(BackendReport::Failed {
                        source: Source::Soundcloud,
                        id: track_id,
                        reason: e,
                    });
                }
            }
        });
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.stop();
        }
    }

    fn set_volume(&self, percent: u8) {
        self.volume.store(percent.min(100), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_reaches_running_handle() {
        let output = RodioOutput::default();
        let handle = PlaybackHandle::new(Arc::clone(&output.volume));
        *output.current.lock().unwrap() = Some(handle.clone());

        output.stop();
        assert!(handle.should_stop());
        assert!(output.current.lock().unwrap().is_none());
    }

    #[test]
    fn test_volume_changes_are_shared_with_handle() {
        let output = RodioOutput::default();
        let handle = PlaybackHandle::new(Arc::clone(&output.volume));
        output.set_volume(40);
        assert!((handle.gain() - 0.4).abs() < f32::EPSILON);
        output.set_volume(250);
        assert!((handle.gain() - 1.0).abs() < f32::EPSILON);
    }
}
