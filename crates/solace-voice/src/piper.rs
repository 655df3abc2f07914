use crate::adapter::{SynthesizedAudio, Synthesizer};
use crate::audio::AudioStore;
use crate::error::AdapterError;
use async_trait::async_trait;
use solace_types::VoiceProfile;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum text input size for synthesis (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Piper emits 16-bit mono PCM at this rate for the bundled voices.
const PIPER_SAMPLE_RATE: u64 = 22_050;

const SERVICE: &str = "synthesis";

/// Local synthesizer that shells out to the Piper binary.
///
/// Voices are looked up as `<voices_dir>/<voice_id>.onnx`.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    binary: PathBuf,
    voices_dir: PathBuf,
    store: AudioStore,
    timeout: Duration,
}

impl PiperSynthesizer {
    pub fn new(
        binary: impl Into<PathBuf>,
        voices_dir: impl Into<PathBuf>,
        store: AudioStore,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            voices_dir: voices_dir.into(),
            store,
            timeout,
        }
    }

    fn model_path(&self, voice_id: &str) -> Result<PathBuf, AdapterError> {
        let valid = !voice_id.is_empty()
            && voice_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AdapterError::rejected(
                SERVICE,
                format!("invalid voice id: {:?}", voice_id),
            ));
        }
        let path = self.voices_dir.join(format!("{}.onnx", voice_id));
        if !path.exists() {
            return Err(AdapterError::rejected(
                SERVICE,
                format!("model file not found: {:?}", path),
            ));
        }
        Ok(path)
    }

    async fn run_piper(&self, text: &str, profile: &VoiceProfile) -> Result<Vec<u8>, AdapterError> {
        let model_path = self.model_path(profile.voice_id())?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--model")
            .arg(model_path)
            .arg("--output_raw")
            // Length scale is the inverse of speed.
            .arg("--length_scale")
            .arg((1.0 / profile.speed()).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let VoiceProfile::Therapeutic {
            sentence_pause_ms, ..
        } = profile
        {
            command
                .arg("--sentence_silence")
                .arg((*sentence_pause_ms as f32 / 1000.0).to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| AdapterError::unavailable(SERVICE, format!("failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::unavailable(SERVICE, "failed to open piper stdin"))?;
        let text_owned = text.to_string();

        // Write from a separate task so a full stdout pipe cannot deadlock us.
        let write_task = tokio::spawn(async move { stdin.write_all(text_owned.as_bytes()).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AdapterError::Timeout {
                service: SERVICE,
                timeout: self.timeout,
            })??;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => {
                return Err(AdapterError::unavailable(
                    SERVICE,
                    format!("stdin task failed: {}", e),
                ))
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::unavailable(
                SERVICE,
                format!("piper failed: {}", stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }
}

/// Duration of 16-bit mono PCM at Piper's sample rate.
pub fn pcm_duration_ms(bytes: usize) -> u64 {
    (bytes as u64 / 2) * 1000 / PIPER_SAMPLE_RATE
}

#[async_trait]
impl Synthesizer for PiperSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<SynthesizedAudio, AdapterError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(AdapterError::rejected(
                SERVICE,
                format!(
                    "text exceeds maximum size: {} bytes (limit: {} bytes)",
                    text.len(),
                    MAX_TTS_INPUT_BYTES
                ),
            ));
        }

        let pcm = self.run_piper(text, profile).await?;
        let duration_estimate_ms = pcm_duration_ms(pcm.len());
        let audio_ref = self.store.put(&pcm, "pcm").await?;
        Ok(SynthesizedAudio {
            audio_ref,
            duration_estimate_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesizer(dir: &std::path::Path) -> PiperSynthesizer {
        PiperSynthesizer::new(
            "/nonexistent/piper",
            dir,
            AudioStore::new(dir.join("audio")),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn one_second_of_pcm() {
        assert_eq!(pcm_duration_ms(44_100), 1000);
        assert_eq!(pcm_duration_ms(0), 0);
    }

    #[tokio::test]
    async fn missing_voice_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = synthesizer(dir.path())
            .synthesize("Olá", &VoiceProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rejected { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn voice_ids_cannot_escape_the_voices_dir() {
        let dir = tempfile::tempdir().unwrap();
        let profile = VoiceProfile::Standard {
            voice_id: "../../etc/passwd".to_string(),
            speed: 1.0,
        };
        let err = synthesizer(dir.path())
            .synthesize("Olá", &profile)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid voice id"));
    }

    #[tokio::test]
    async fn missing_binary_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.onnx"), b"model").unwrap();
        let err = synthesizer(dir.path())
            .synthesize("Olá", &VoiceProfile::default())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let text = "a".repeat(MAX_TTS_INPUT_BYTES + 1);
        let err = synthesizer(dir.path())
            .synthesize(&text, &VoiceProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rejected { .. }));
    }
}
