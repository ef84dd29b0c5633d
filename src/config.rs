//! Configuration types for the assistant.
//!
//! Settings resolve once at startup, highest priority first: process
//! environment, env file, TOML file, built-in defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AssistantError, Result};

/// Environment variable naming an explicit env file.
pub const ENV_FILE_VAR: &str = "AI_BOX_ENV_FILE";

/// Env files probed when [`ENV_FILE_VAR`] is unset, first existing wins.
pub const ENV_FILE_CANDIDATES: &[&str] = &["/userdata/AI_BOX/ai_box.env", "./ai_box.env"];

/// Top-level configuration for the assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Microphone capture settings.
    pub capture: CaptureConfig,
    /// Utterance segmentation thresholds.
    pub segmenter: SegmenterConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Wake gate settings.
    pub wake: WakeConfig,
    /// Intent phrase tables.
    pub intent: IntentConfig,
    /// Cloud endpoints, models and credentials.
    pub cloud: CloudConfig,
    /// Text generation settings.
    pub llm: LlmConfig,
    /// Speech output settings.
    pub playback: PlaybackConfig,
    /// Background music settings.
    pub music: MusicConfig,
    /// Hardware mixer settings.
    pub volume: VolumeConfig,
}

/// Microphone capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture program (ALSA `arecord` compatible).
    pub program: String,
    /// Capture device name.
    pub device: String,
    /// Interleaved channel count of the microphone array.
    pub channels: u16,
    /// Capture sample rate in Hz.
    pub rate: u32,
    /// Samples per channel in one capture frame.
    pub period_size: usize,
    /// Driver buffer size in frames.
    pub buffer_size: usize,
    /// Channel used when the echo canceller cannot process a frame.
    pub reference_channel: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "arecord".to_owned(),
            device: "hw:2,0".to_owned(),
            channels: 10,
            rate: 16_000,
            period_size: 256,
            buffer_size: 16_384,
            reference_channel: 0,
        }
    }
}

impl CaptureConfig {
    /// Interleaved samples in one capture frame.
    pub fn frame_samples(&self) -> usize {
        self.period_size * usize::from(self.channels)
    }
}

/// Speech/silence run-length thresholds for utterance segmentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Samples per VAD frame.
    pub vad_frame_samples: usize,
    /// Consecutive speech frames that must be exceeded before music ducks.
    pub duck_frames: u32,
    /// Consecutive speech frames that must be exceeded before recording commits.
    pub trigger_frames: u32,
    /// Consecutive silent frames that must be exceeded to finalise an utterance.
    pub silence_frames: u32,
    /// Hard cap on utterance length.
    pub max_utterance_ms: u64,
    /// Utterances at or below this many samples are discarded as noise.
    pub min_utterance_samples: usize,
    /// Rolling pre-roll kept while idle so first words are not clipped.
    pub preroll_samples: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            vad_frame_samples: 320,
            duck_frames: 2,
            trigger_frames: 10,
            silence_frames: 10,
            max_utterance_ms: 8_000,
            min_utterance_samples: 4_800,
            preroll_samples: 8_000,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Detector backend. Only `"energy"` ships with the crate.
    pub backend: String,
    /// RMS threshold in int16 units above which a frame counts as speech.
    pub energy_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            backend: "energy".to_owned(),
            energy_threshold: 1_500.0,
        }
    }
}

/// Wake gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Wake phrases, including common mis-recognition variants.
    pub phrases: Vec<String>,
    /// Acknowledgement spoken after a pure wake.
    pub ack_text: String,
    /// Seconds of inactivity before returning to sleep.
    pub idle_timeout_secs: u64,
    /// Idle monitor tick in seconds.
    pub tick_secs: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrases: strings(&["你好小瑞", "你好小睿", "你好晓瑞", "小瑞", "小睿", "晓瑞"]),
            ack_text: "我在".to_owned(),
            idle_timeout_secs: 90,
            tick_secs: 2,
        }
    }
}

impl WakeConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Phrase tables driving intent classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Phrases that shut the assistant down.
    pub exit_phrases: Vec<String>,
    /// Phrases that stop whatever is currently playing.
    pub interrupt_phrases: Vec<String>,
    /// Phrases that skip to another track while music plays.
    pub quick_switch_phrases: Vec<String>,
    /// Phrases that stop background music.
    pub music_stop_phrases: Vec<String>,
    /// Verbs introducing a song query.
    pub music_verbs: Vec<String>,
    /// Phrases asking for any song.
    pub random_play_phrases: Vec<String>,
    /// Prefixes that negate a music request.
    pub negation_prefixes: Vec<String>,
    /// Queries too generic to name a track.
    pub generic_queries: Vec<String>,
    /// Keywords that switch the LLM to its search-enabled model.
    pub search_keywords: Vec<String>,
    /// Spoken before shutting down.
    pub farewell_text: String,
    /// Percent applied by a bare "louder"/"quieter" request.
    pub volume_step_percent: u8,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            exit_phrases: strings(&[
                "关闭系统", "关机", "退出程序", "再见", "退下", "拜拜", "结束吧", "结束程序",
                "停止运行", "关闭助手", "关闭",
            ]),
            interrupt_phrases: strings(&[
                "闭嘴", "停止", "安静", "别说了", "暂停", "打断", "等一下", "不要说了",
            ]),
            quick_switch_phrases: strings(&["换首歌", "下一首", "切歌", "换一首"]),
            music_stop_phrases: strings(&["停止音乐", "关掉音乐", "别放了", "不要放了", "停止播放"]),
            music_verbs: strings(&["播放", "想要听", "要听", "想听", "来首", "放首", "听听"]),
            random_play_phrases: strings(&[
                "唱首歌", "放首歌", "来首歌", "放音乐", "放歌", "听歌", "随便放", "随机播放",
            ]),
            negation_prefixes: strings(&["不要", "别", "不想", "不用"]),
            generic_queries: strings(&["歌", "音乐", "歌曲", "首歌", "一首歌", "点歌", "音乐吧"]),
            search_keywords: strings(&["天气", "今天", "星期几", "实时", "最新"]),
            farewell_text: "好的，再见".to_owned(),
            volume_step_percent: 5,
        }
    }
}

/// Cloud service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Bearer token for every cloud call.
    pub api_key: String,
    /// Speech recognition socket URL.
    pub asr_url: String,
    /// Speech synthesis socket URL.
    pub tts_url: String,
    /// Text generation endpoint.
    pub llm_url: String,
    /// Model for ordinary chat.
    pub llm_model_fast: String,
    /// Model used when live search is enabled.
    pub llm_model_search: String,
    /// Recognition model.
    pub asr_model: String,
    /// Recognition input sample rate in Hz.
    pub asr_sample_rate: u32,
    /// Bytes per recognition audio frame.
    pub asr_chunk_bytes: usize,
    /// Gap between recognition audio frames.
    pub asr_chunk_gap_ms: u64,
    /// Overall recognition deadline.
    pub asr_timeout_ms: u64,
    /// Utterances shorter than this are not sent for recognition.
    pub asr_min_audio_ms: u64,
    /// Synthesis model.
    pub tts_model: String,
    /// Synthesis voice.
    pub tts_voice: String,
    /// Synthesis output sample rate in Hz.
    pub tts_sample_rate: u32,
    /// Synthesis volume (0-100).
    pub tts_volume: u32,
    /// Deadline for opening a socket.
    pub connect_timeout_ms: u64,
    /// Deadline for the task-started acknowledgement.
    pub started_timeout_ms: u64,
    /// Deadline for the task-finished acknowledgement.
    pub finish_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            asr_url: "wss://dashscope.aliyuncs.com/api-ws/v1/inference/".to_owned(),
            tts_url: "wss://dashscope.aliyuncs.com/api-ws/v1/inference/".to_owned(),
            llm_url: "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation"
                .to_owned(),
            llm_model_fast: "qwen-turbo-latest".to_owned(),
            llm_model_search: "qwen-max".to_owned(),
            asr_model: "paraformer-realtime-v2".to_owned(),
            asr_sample_rate: 16_000,
            asr_chunk_bytes: 3_200,
            asr_chunk_gap_ms: 5,
            asr_timeout_ms: 15_000,
            asr_min_audio_ms: 500,
            tts_model: "cosyvoice-v1".to_owned(),
            tts_voice: "longwan".to_owned(),
            tts_sample_rate: 22_050,
            tts_volume: 50,
            connect_timeout_ms: 5_000,
            started_timeout_ms: 5_000,
            finish_timeout_ms: 10_000,
        }
    }
}

/// Text generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// System prompt sent with every turn.
    pub system_prompt: String,
    /// Bytes buffered before the first chunk is spoken.
    pub first_chunk_bytes: usize,
    /// First-chunk threshold when live search is enabled.
    pub search_first_chunk_bytes: usize,
    /// Bytes buffered before each later chunk is spoken.
    pub next_chunk_bytes: usize,
    /// Deadline for the whole streamed response.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            system_prompt: "你是智能助手。仅在用户【明确要求播放音乐】（如“放首歌”、“听周杰伦”）时，\
                            才在回复末尾添加 [PLAY: 歌名]（随机播放用 [PLAY: RANDOM]）。\
                            如果用户要求停止，加上 [STOP]。\
                            回答天气、新闻、闲聊等普通问题时，【严禁】添加任何播放指令。"
                .to_owned(),
            first_chunk_bytes: 30,
            search_first_chunk_bytes: 15,
            next_chunk_bytes: 80,
            request_timeout_secs: 60,
        }
    }
}

/// Speech output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Player program (ALSA `aplay` compatible).
    pub program: String,
    /// Output device name.
    pub device: String,
    /// Player buffer length in microseconds.
    pub buffer_us: u32,
    /// Delay between the drain sentinel and closing the player input.
    pub drain_grace_ms: u64,
    /// Upper bound on waiting for the farewell to drain before shutdown.
    pub farewell_timeout_ms: u64,
    /// Capacity of the text-chunk queue feeding synthesis.
    pub text_queue_capacity: usize,
    /// Capacity of the PCM queue feeding the speech player.
    pub pcm_queue_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            program: "aplay".to_owned(),
            device: "default".to_owned(),
            buffer_us: 20_000,
            drain_grace_ms: 500,
            farewell_timeout_ms: 5_000,
            text_queue_capacity: 100,
            pcm_queue_capacity: 500,
        }
    }
}

/// Background music configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicConfig {
    /// Directory scanned for `*.wav` tracks.
    pub dir: PathBuf,
    /// Expected track sample rate in Hz.
    pub sample_rate: u32,
    /// Samples per write to the player.
    pub chunk_samples: usize,
    /// Look-ahead the pacing loop sleeps back down to.
    pub target_ahead_ms: u64,
    /// Look-ahead that triggers a pacing sleep.
    pub max_ahead_ms: u64,
    /// Volume target while ducked.
    pub duck_target: f64,
    /// Ceiling applied to the current volume the moment a duck starts.
    pub duck_ceiling: f64,
    /// Smoothing time constant while the volume falls.
    pub duck_tau_ms: u64,
    /// Smoothing time constant while the volume rises.
    pub unduck_tau_ms: u64,
    /// Player buffer length in microseconds.
    pub buffer_us: u32,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/userdata/AI_BOX/music"),
            sample_rate: 16_000,
            chunk_samples: 640,
            target_ahead_ms: 120,
            max_ahead_ms: 180,
            duck_target: 0.2,
            duck_ceiling: 0.35,
            duck_tau_ms: 120,
            unduck_tau_ms: 900,
            buffer_us: 80_000,
        }
    }
}

/// Hardware mixer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Mixer program (ALSA `amixer` compatible).
    pub program: String,
    /// Sound card index.
    pub card: u32,
    /// Control read with `cget`.
    pub get_control: String,
    /// Simple control written with `sset`.
    pub set_control: String,
    /// Lowest raw control value.
    pub raw_min: i64,
    /// Highest raw control value.
    pub raw_max: i64,
    /// Whether a larger raw value means a quieter output.
    pub inverted: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            program: "amixer".to_owned(),
            card: 1,
            get_control: "aw_dev_0_rx_volume".to_owned(),
            set_control: "aw_dev_0_rx_volume,0".to_owned(),
            raw_min: 0,
            raw_max: 1023,
            inverted: true,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

impl AssistantConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AssistantError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AssistantError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/aibox/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("aibox")
            .join("config.toml")
    }

    /// Resolve the effective configuration.
    ///
    /// `config_path` falls back to [`default_config_path`](Self::default_config_path)
    /// and is skipped when that file does not exist. `env_file` falls back to
    /// [`ENV_FILE_VAR`] and then [`ENV_FILE_CANDIDATES`].
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be read or parsed.
    pub fn load(config_path: Option<&Path>, env_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::default_config_path();
                if path.is_file() {
                    info!(path = %path.display(), "loading config file");
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        let file_vars = match env_file {
            Some(path) => parse_env_file(&std::fs::read_to_string(path)?),
            None => load_env_file_from_candidates()?,
        };

        config.apply_env(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        });
        Ok(config)
    }

    /// Apply `AI_BOX_*` overrides read through `lookup`.
    ///
    /// Blank values are treated as unset. Unparseable numbers are logged and
    /// ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(key) = get("AI_BOX_DASH_API_KEY").or_else(|| get("DASHSCOPE_API_KEY")) {
            self.cloud.api_key = key;
        }

        set_string(&mut self.cloud.tts_url, get("AI_BOX_TTS_WS_URL"));
        set_string(&mut self.cloud.llm_url, get("AI_BOX_LLM_URL"));
        set_string(&mut self.cloud.asr_url, get("AI_BOX_ASR_WS_URL"));
        set_string(&mut self.cloud.llm_model_fast, get("AI_BOX_LLM_MODEL_FAST"));
        set_string(&mut self.cloud.llm_model_search, get("AI_BOX_LLM_MODEL_SEARCH"));
        set_string(&mut self.cloud.tts_model, get("AI_BOX_TTS_MODEL"));
        set_string(&mut self.cloud.tts_voice, get("AI_BOX_TTS_VOICE"));
        set_parsed(&mut self.cloud.tts_sample_rate, "AI_BOX_TTS_SAMPLE_RATE", get("AI_BOX_TTS_SAMPLE_RATE"));
        set_parsed(&mut self.cloud.tts_volume, "AI_BOX_TTS_VOLUME", get("AI_BOX_TTS_VOLUME"));
        set_string(&mut self.cloud.asr_model, get("AI_BOX_ASR_MODEL"));
        set_parsed(&mut self.cloud.asr_sample_rate, "AI_BOX_ASR_SAMPLE_RATE", get("AI_BOX_ASR_SAMPLE_RATE"));

        if let Some(dir) = get("AI_BOX_MUSIC_DIR") {
            self.music.dir = PathBuf::from(dir);
        }

        set_string(&mut self.capture.device, get("AI_BOX_ARECORD_DEVICE"));
        set_parsed(&mut self.capture.channels, "AI_BOX_ARECORD_CHANNELS", get("AI_BOX_ARECORD_CHANNELS"));
        set_parsed(&mut self.capture.rate, "AI_BOX_ARECORD_RATE", get("AI_BOX_ARECORD_RATE"));
        set_parsed(&mut self.capture.period_size, "AI_BOX_ARECORD_PERIOD_SIZE", get("AI_BOX_ARECORD_PERIOD_SIZE"));
        set_parsed(&mut self.capture.buffer_size, "AI_BOX_ARECORD_BUFFER_SIZE", get("AI_BOX_ARECORD_BUFFER_SIZE"));

        set_string(&mut self.wake.ack_text, get("AI_BOX_WAKE_ACK_TEXT"));
        if let Some(raw) = get("AI_BOX_WAKE_IDLE_TIMEOUT") {
            match parse_duration(&raw) {
                Some(d) => self.wake.idle_timeout_secs = d.as_secs().max(1),
                None => warn!(value = %raw, "ignoring invalid AI_BOX_WAKE_IDLE_TIMEOUT"),
            }
        }
        if let Some(raw) = get("AI_BOX_WAKE_WORDS") {
            let words = split_list(&raw);
            if !words.is_empty() {
                self.wake.phrases = words;
            }
        }
    }

    /// Check settings the runtime cannot work without.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.cloud.api_key.trim().is_empty() {
            return Err(AssistantError::Config(
                "missing API key: set AI_BOX_DASH_API_KEY in the environment or env file".into(),
            ));
        }
        if self.capture.channels == 0 || self.capture.period_size == 0 {
            return Err(AssistantError::Config("capture frame must not be empty".into()));
        }
        if self.capture.reference_channel >= self.capture.channels {
            return Err(AssistantError::Config(format!(
                "reference channel {} out of range for {} channels",
                self.capture.reference_channel, self.capture.channels
            )));
        }
        if self.segmenter.vad_frame_samples == 0 || self.music.chunk_samples == 0 {
            return Err(AssistantError::Config("frame sizes must be positive".into()));
        }
        if self.wake.phrases.is_empty() {
            return Err(AssistantError::Config("at least one wake phrase is required".into()));
        }
        if self.music.max_ahead_ms < self.music.target_ahead_ms {
            return Err(AssistantError::Config(
                "music.max_ahead_ms must not be below music.target_ahead_ms".into(),
            ));
        }
        Ok(())
    }
}

fn set_string(slot: &mut String, value: Option<String>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: Option<String>) {
    if let Some(raw) = value {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring invalid numeric override"),
        }
    }
}

/// Split a `,` or `，` separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', '，'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse `90`, `90s`, `1500ms`, `2m` or `1h` into a duration.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1_000.0,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

/// Parse `KEY=VALUE` lines. Supports `#` comments, an `export ` prefix and
/// single or double quotes around the value.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.to_owned(), value.to_owned());
    }
    vars
}

fn load_env_file_from_candidates() -> Result<HashMap<String, String>> {
    if let Some(path) = std::env::var(ENV_FILE_VAR)
        .ok()
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty())
    {
        let content = std::fs::read_to_string(&path)?;
        info!(path = %path, "loaded env file");
        return Ok(parse_env_file(&content));
    }

    for candidate in ENV_FILE_CANDIDATES {
        match std::fs::read_to_string(candidate) {
            Ok(content) => {
                info!(path = %candidate, "loaded env file");
                return Ok(parse_env_file(&content));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(HashMap::new())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_consistent() {
        let config = AssistantConfig::default();
        assert_eq!(config.capture.frame_samples(), 2_560);
        assert_eq!(config.segmenter.vad_frame_samples, 320);
        assert_eq!(config.music.chunk_samples, 640);
        assert!(config.music.duck_tau_ms < config.music.unduck_tau_ms);
        assert!(config.music.duck_target < config.music.duck_ceiling);
        assert_eq!(config.wake.idle_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn validate_requires_api_key() {
        let mut config = AssistantConfig::default();
        assert!(config.validate().is_err());
        config.cloud.api_key = "sk-test".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_reference_channel_out_of_range() {
        let mut config = AssistantConfig::default();
        config.cloud.api_key = "sk-test".into();
        config.capture.reference_channel = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AssistantConfig::default();
        config.capture.device = "hw:1,0".into();
        config.music.duck_target = 0.1;
        config.wake.phrases = vec!["你好小盒".into()];

        config.save_to_file(&path).unwrap();
        let loaded = AssistantConfig::from_file(&path).unwrap();
        assert_eq!(loaded.capture.device, "hw:1,0");
        assert!((loaded.music.duck_target - 0.1).abs() < f64::EPSILON);
        assert_eq!(loaded.wake.phrases, vec!["你好小盒".to_owned()]);
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(AssistantConfig::from_file(&path).is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: AssistantConfig = toml::from_str(
            r#"
            [music]
            dir = "/srv/music"
            "#,
        )
        .unwrap();
        assert_eq!(config.music.dir, PathBuf::from("/srv/music"));
        assert_eq!(config.music.chunk_samples, 640);
        assert_eq!(config.capture.channels, 10);
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = AssistantConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("aibox"));
    }

    // ── env overrides ─────────────────────────────────────────

    #[test]
    fn api_key_falls_back_to_dashscope_variable() {
        let mut config = AssistantConfig::default();
        config.apply_env(lookup(&[("DASHSCOPE_API_KEY", "sk-fallback")]));
        assert_eq!(config.cloud.api_key, "sk-fallback");

        config.apply_env(lookup(&[
            ("AI_BOX_DASH_API_KEY", "sk-primary"),
            ("DASHSCOPE_API_KEY", "sk-fallback"),
        ]));
        assert_eq!(config.cloud.api_key, "sk-primary");
    }

    #[test]
    fn numeric_overrides_parse_and_invalid_values_are_ignored() {
        let mut config = AssistantConfig::default();
        config.apply_env(lookup(&[
            ("AI_BOX_ARECORD_CHANNELS", "8"),
            ("AI_BOX_TTS_SAMPLE_RATE", "not-a-number"),
        ]));
        assert_eq!(config.capture.channels, 8);
        assert_eq!(config.cloud.tts_sample_rate, 22_050);
    }

    #[test]
    fn wake_words_and_idle_timeout_override() {
        let mut config = AssistantConfig::default();
        config.apply_env(lookup(&[
            ("AI_BOX_WAKE_WORDS", "小盒子，你好盒子, ,"),
            ("AI_BOX_WAKE_IDLE_TIMEOUT", "2m"),
        ]));
        assert_eq!(config.wake.phrases, vec!["小盒子".to_owned(), "你好盒子".to_owned()]);
        assert_eq!(config.wake.idle_timeout_secs, 120);
    }

    #[test]
    fn blank_override_is_ignored() {
        let mut config = AssistantConfig::default();
        config.apply_env(lookup(&[("AI_BOX_TTS_VOICE", "   ")]));
        assert_eq!(config.cloud.tts_voice, "longwan");
    }

    // ── parsing helpers ───────────────────────────────────────

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1500ms"), Some(Duration::from_millis(1_500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5d"), None);
    }

    #[test]
    fn parse_env_file_handles_comments_export_and_quotes() {
        let vars = parse_env_file(
            "# deployment\n\
             export AI_BOX_DASH_API_KEY=\"sk-quoted\"\n\
             AI_BOX_MUSIC_DIR='/data/music'\n\
             AI_BOX_TTS_VOICE = longxiaochun \n\
             not a pair\n\
             =missing-key\n",
        );
        assert_eq!(vars.get("AI_BOX_DASH_API_KEY").map(String::as_str), Some("sk-quoted"));
        assert_eq!(vars.get("AI_BOX_MUSIC_DIR").map(String::as_str), Some("/data/music"));
        assert_eq!(vars.get("AI_BOX_TTS_VOICE").map(String::as_str), Some("longxiaochun"));
        assert_eq!(vars.len(), 3);
    }
}
