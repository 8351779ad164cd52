//! `-filter_complex` construction for timeline exports.
//!
//! Clips are concatenated back to back in timeline order. `timeline_start`
//! and any gaps between clips are ignored, so the output lasts exactly the
//! sum of the clip durations. Input `i` of the encoder must be the staged file
//! for clip `i`.

use std::path::Path;

use crate::error::ExportError;
use crate::timeline::NormalizedTimeline;

/// Label of the concatenated video stream.
pub const VIDEO_OUT: &str = "vout";
/// Label of the concatenated audio stream.
pub const AUDIO_OUT: &str = "aout";

/// Sample format used for synthesized silence.
const SILENCE_SOURCE: &str = "anullsrc=r=48000:cl=stereo";

/// ffmpeg time values resolve to microseconds; `trim`/`atrim` read a zero
/// duration as "unbounded", so positive durations never go below this.
const MIN_DURATION: f64 = 0.000_001;

/// A complete filter program plus the number of indexed inputs it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterGraph {
    pub program: String,
    pub input_count: usize,
}

/// Builds the trim/concat graph for `timeline`.
///
/// `has_audio[i]` tells whether input `i` carries audio; clips without audio
/// get a silent track of their own duration so every concat segment has one
/// video and one audio stream.
pub fn build_filter_graph(
    timeline: &NormalizedTimeline,
    has_audio: &[bool],
) -> Result<FilterGraph, ExportError> {
    let clips = timeline.clips();
    if clips.is_empty() {
        return Err(ExportError::validation("timeline has no usable clips"));
    }
    if clips.len() != has_audio.len() {
        return Err(ExportError::Internal(format!(
            "expected {} audio flags, got {}",
            clips.len(),
            has_audio.len()
        )));
    }

    let mut stages = Vec::with_capacity(clips.len() * 2 + 1);
    let mut concat_inputs = String::new();

    for (index, (clip, audio)) in clips.iter().zip(has_audio).enumerate() {
        let start = format_seconds(clip.trim_in);
        let duration = format_duration(clip.duration());

        stages.push(format!(
            "[{index}:v]trim=start={start}:duration={duration},setpts=PTS-STARTPTS[v{index}]"
        ));

        if *audio {
            stages.push(format!(
                "[{index}:a]atrim=start={start}:duration={duration},asetpts=PTS-STARTPTS[a{index}]"
            ));
        } else {
            stages.push(format!(
                "{SILENCE_SOURCE},atrim=duration={duration},asetpts=PTS-STARTPTS[a{index}]"
            ));
        }

        // The concat filter pairs streams positionally: v0 a0 v1 a1 ...
        concat_inputs.push_str(&format!("[v{index}][a{index}]"));
    }

    stages.push(format!(
        "{concat_inputs}concat=n={}:v=1:a=1[{VIDEO_OUT}][{AUDIO_OUT}]",
        clips.len()
    ));

    Ok(FilterGraph {
        program: stages.join(";"),
        input_count: clips.len(),
    })
}

/// Seconds with microsecond precision, without trailing zeros.
pub fn format_seconds(value: f64) -> String {
    let text = format!("{value:.6}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() || text == "-" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

fn format_duration(value: f64) -> String {
    format_seconds(value.max(MIN_DURATION))
}

/// Fixed encoding profile for published exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeProfile {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx264".into(),
            preset: "veryfast".into(),
            crf: 23,
            pixel_format: "yuv420p".into(),
            audio_codec: "aac".into(),
            audio_bitrate: "128k".into(),
        }
    }
}

impl EncodeProfile {
    /// Full ffmpeg argument list: one `-i` per staged input in order, the
    /// filter graph, explicit stream maps and the encoding settings.
    pub fn encoder_args(&self, inputs: &[&Path], graph: &FilterGraph, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into(), "-nostdin".into()];
        for input in inputs {
            args.push("-i".into());
            args.push(input.to_string_lossy().into_owned());
        }
        args.extend([
            "-filter_complex".to_string(),
            graph.program.clone(),
            "-map".into(),
            format!("[{VIDEO_OUT}]"),
            "-map".into(),
            format!("[{AUDIO_OUT}]"),
            "-c:v".into(),
            self.video_codec.clone(),
            "-preset".into(),
            self.preset.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            "-c:a".into(),
            self.audio_codec.clone(),
            "-b:a".into(),
            self.audio_bitrate.clone(),
            "-movflags".into(),
            "+faststart".into(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }
}

/// Arguments that grab a single poster frame `at` seconds into `video`.
pub fn thumbnail_args(video: &Path, at: f64, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-nostdin".into(),
        "-ss".into(),
        format_seconds(at),
        "-i".into(),
        video.to_string_lossy().into_owned(),
        "-frames:v".into(),
        "1".into(),
        "-q:v".into(),
        "3".into(),
        output.to_string_lossy().into_owned(),
    ]
}
