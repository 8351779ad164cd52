//! Audio stream detection for staged inputs.

use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use tracing::debug;

use crate::process::ProcessRunner;

/// Text `ffprobe` prints for the selected stream when it is an audio stream.
const AUDIO_MARKER: &str = "audio";

fn probe_args(path: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-select_streams".into(),
        "a:0".into(),
        "-show_entries".into(),
        "stream=codec_type".into(),
        "-of".into(),
        "csv=p=0".into(),
        path.to_string_lossy().into_owned(),
    ]
}

/// Reports whether `path` has a first audio stream.
///
/// Best effort: a missing binary, a failing probe or unexpected output all
/// count as "no audio", which only costs a synthesized silent track.
pub async fn has_audio_stream(runner: &dyn ProcessRunner, ffprobe: &str, path: &Path) -> bool {
    match runner.run(ffprobe, &probe_args(path)).await {
        Ok(output) => output
            .stdout
            .lines()
            .any(|line| line.trim() == AUDIO_MARKER),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "audio probe failed, assuming no audio");
            false
        }
    }
}

/// Probes every path concurrently; results line up with `paths`.
pub async fn probe_all(runner: &dyn ProcessRunner, ffprobe: &str, paths: &[PathBuf]) -> Vec<bool> {
    join_all(
        paths
            .iter()
            .map(|path| has_audio_stream(runner, ffprobe, path)),
    )
    .await
}
