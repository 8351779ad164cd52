//! Timeline export: turns a client cut list into a newly published video.
//!
//! One [`ExportService::export`] call owns a private scratch directory for its
//! whole lifetime and runs these steps strictly in order:
//!
//! 1. create the scratch tree (`inputs/`, `out/`);
//! 2. validate the title and normalize the timeline;
//! 3. require a configured bucket;
//! 4. resolve every distinct source id in one catalog lookup;
//! 5. download the sources one by one, in timeline order;
//! 6. probe each staged file for audio;
//! 7. build the trim/concat filter graph;
//! 8. encode with ffmpeg (and grab a poster frame, best effort);
//! 9. upload the result;
//! 10. insert the published record;
//! 11. remove the scratch directory, whatever happened before.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::error::{ExportError, ExportResult};
use crate::filter_graph::{EncodeProfile, build_filter_graph, thumbnail_args};
use crate::probe::probe_all;
use crate::process::ProcessRunner;
use crate::publish::{
    DEFAULT_CATEGORY, PublishedVideo, Visibility, generate_video_id, normalize_tags,
};
use crate::security::sanitize_key_segment;
use crate::storage::ObjectStorage;
use crate::timeline::{NormalizedTimeline, normalize_timeline};

/// Catalog row for a clip source. `storage_key` is `None` for sources that
/// were registered without stored media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAsset {
    pub source_id: String,
    pub storage_key: Option<String>,
}

/// A source downloaded into the scratch directory. `index` is the clip's
/// position in the timeline and the encoder input number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    pub index: usize,
    pub local_path: PathBuf,
    pub has_audio: bool,
}

/// Looks up where source media lives.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Returns rows for the ids that exist; unknown ids are left out.
    async fn resolve_sources(&self, ids: &[String]) -> ExportResult<Vec<SourceAsset>>;
}

/// Persists published exports.
#[async_trait]
pub trait VideoPublisher: Send + Sync {
    async fn publish_video(&self, record: &PublishedVideo) -> ExportResult<()>;
}

/// Body of an export request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Comma separated.
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub timeline_name: Option<String>,
    #[serde(default)]
    pub timeline: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    pub video_id: String,
    pub timeline_name: Option<String>,
    pub storage_key: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Destination bucket. Jobs fail with a configuration error without it.
    pub bucket: Option<String>,
    /// Parent directory for per-job scratch trees; the system temp dir when
    /// unset.
    pub scratch_root: Option<PathBuf>,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub profile: EncodeProfile,
    /// Whole-job deadline. On expiry running tools are killed and the
    /// scratch directory is removed.
    pub deadline: Option<Duration>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            scratch_root: None,
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            profile: EncodeProfile::default(),
            deadline: None,
        }
    }
}

/// Per-job working directory, removed when closed or dropped.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
    inputs: PathBuf,
    out: PathBuf,
}

impl ScratchDir {
    pub fn create(root: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("export-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let inputs = dir.path().join("inputs");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&inputs)?;
        std::fs::create_dir_all(&out)?;
        Ok(Self { dir, inputs, out })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn inputs(&self) -> &Path {
        &self.inputs
    }

    pub fn out(&self) -> &Path {
        &self.out
    }

    /// Removes the tree on the blocking pool. Failures are logged and never
    /// replace the job's own result.
    pub async fn close(self) {
        let path = self.dir.path().to_path_buf();
        let dir = self.dir;
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(path = %path.display(), error = %err, "failed to remove export scratch directory")
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "scratch cleanup task failed")
            }
        }
    }
}

/// Drives export jobs against injected collaborators.
#[derive(Clone)]
pub struct ExportService {
    config: ExportConfig,
    catalog: Arc<dyn SourceCatalog>,
    storage: Arc<dyn ObjectStorage>,
    runner: Arc<dyn ProcessRunner>,
    publisher: Arc<dyn VideoPublisher>,
}

impl ExportService {
    pub fn new(
        config: ExportConfig,
        catalog: Arc<dyn SourceCatalog>,
        storage: Arc<dyn ObjectStorage>,
        runner: Arc<dyn ProcessRunner>,
        publisher: Arc<dyn VideoPublisher>,
    ) -> Self {
        Self {
            config,
            catalog,
            storage,
            runner,
            publisher,
        }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Runs one export for `owner_id`. The scratch directory never outlives
    /// this call.
    pub async fn export(
        &self,
        owner_id: &str,
        request: &ExportRequest,
    ) -> ExportResult<ExportOutcome> {
        let scratch = match ScratchDir::create(self.config.scratch_root.as_deref()) {
            Ok(scratch) => scratch,
            Err(err) => {
                error!(owner_id, error = %err, "failed to create export scratch directory");
                return Err(err.into());
            }
        };
        debug!(scratch = %scratch.path().display(), "created export scratch directory");

        let job = self.run_job(&scratch, owner_id, request);
        let result = match self.config.deadline {
            Some(deadline) => tokio::time::timeout(deadline, job)
                .await
                .unwrap_or(Err(ExportError::Timeout(deadline))),
            None => job.await,
        };

        scratch.close().await;

        match &result {
            Ok(outcome) => info!(
                owner_id,
                video_id = %outcome.video_id,
                duration = outcome.duration_seconds,
                "export published"
            ),
            Err(err) if err.is_client_error() => warn!(owner_id, error = %err, "export rejected"),
            Err(err) => error!(owner_id, error = %err, "export failed"),
        }
        result
    }

    async fn run_job(
        &self,
        scratch: &ScratchDir,
        owner_id: &str,
        request: &ExportRequest,
    ) -> ExportResult<ExportOutcome> {
        let title = request
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .ok_or_else(|| ExportError::validation("title is required"))?
            .to_string();
        let timeline = normalize_timeline(&request.timeline);
        if timeline.is_empty() {
            return Err(ExportError::validation(
                "timeline must contain at least one valid clip",
            ));
        }

        let bucket = self
            .config
            .bucket
            .as_deref()
            .filter(|bucket| !bucket.trim().is_empty())
            .ok_or_else(|| ExportError::config("no storage bucket configured"))?;

        info!(owner_id, clips = timeline.len(), "starting export");

        let keys = self.resolve_storage_keys(&timeline).await?;
        let paths = self.download_inputs(scratch, bucket, &timeline, &keys).await?;

        let flags = probe_all(self.runner.as_ref(), &self.config.ffprobe, &paths).await;
        let staged: Vec<StagedInput> = paths
            .into_iter()
            .zip(flags)
            .enumerate()
            .map(|(index, (local_path, has_audio))| StagedInput {
                index,
                local_path,
                has_audio,
            })
            .collect();
        debug!(
            with_audio = staged.iter().filter(|input| input.has_audio).count(),
            total = staged.len(),
            "probed staged inputs"
        );

        let audio: Vec<bool> = staged.iter().map(|input| input.has_audio).collect();
        let graph = build_filter_graph(&timeline, &audio)?;

        let output_name = output_file_name();
        let output = scratch.out().join(&output_name);
        let inputs: Vec<&Path> = staged.iter().map(|input| input.local_path.as_path()).collect();
        let args = self.config.profile.encoder_args(&inputs, &graph, &output);
        self.runner.run(&self.config.ffmpeg, &args).await?;
        info!(output = %output_name, "encoded export");

        let duration = timeline.total_duration();
        let thumbnail = self.render_thumbnail(scratch, &output, duration).await;

        let owner_segment = sanitize_key_segment(owner_id);
        let storage_key = format!("videos/{owner_segment}/{output_name}");
        let content_type = mime_guess::from_path(&output).first_or_octet_stream();
        self.storage
            .upload(bucket, &storage_key, &output, content_type.essence_str())
            .await?;

        let thumbnail_key = match thumbnail {
            Some(path) => self.upload_thumbnail(bucket, &owner_segment, &path).await,
            None => None,
        };

        let record = PublishedVideo {
            id: generate_video_id(),
            owner_id: owner_id.to_string(),
            title,
            description: request.description.clone().unwrap_or_default(),
            category: DEFAULT_CATEGORY.to_string(),
            visibility: Visibility::parse_or_public(request.visibility.as_deref()),
            tags: normalize_tags(request.tags.as_deref()),
            storage_key: storage_key.clone(),
            thumbnail_key,
            duration_seconds: duration,
            timeline_name: request.timeline_name.clone(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.publisher.publish_video(&record).await?;

        Ok(ExportOutcome {
            video_id: record.id,
            timeline_name: record.timeline_name,
            storage_key,
            duration_seconds: duration,
        })
    }

    /// Maps every source id in the timeline to its storage key, failing on
    /// the first clip whose source is unknown or has nothing stored.
    async fn resolve_storage_keys(
        &self,
        timeline: &NormalizedTimeline,
    ) -> ExportResult<HashMap<String, String>> {
        let ids = timeline.distinct_source_ids();
        let assets = self.catalog.resolve_sources(&ids).await?;
        let found: HashMap<String, Option<String>> = assets
            .into_iter()
            .map(|asset| (asset.source_id, asset.storage_key))
            .collect();

        if let Some(missing) = ids.iter().find(|id| !found.contains_key(*id)) {
            return Err(ExportError::UnknownSource(missing.clone()));
        }

        let mut keys = HashMap::with_capacity(found.len());
        for id in &ids {
            let key = found
                .get(id)
                .cloned()
                .flatten()
                .filter(|key| !key.trim().is_empty())
                .ok_or_else(|| ExportError::MissingStorageKey(id.clone()))?;
            keys.insert(id.clone(), key);
        }
        Ok(keys)
    }

    /// Downloads one file per clip, sequentially and in timeline order, so
    /// the returned paths line up with the encoder input numbers.
    async fn download_inputs(
        &self,
        scratch: &ScratchDir,
        bucket: &str,
        timeline: &NormalizedTimeline,
        keys: &HashMap<String, String>,
    ) -> ExportResult<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(timeline.len());
        for (index, clip) in timeline.clips().iter().enumerate() {
            let key = keys.get(&clip.source_id).ok_or_else(|| {
                ExportError::Internal(format!("no storage key for {}", clip.source_id))
            })?;
            let dest = scratch
                .inputs()
                .join(staged_file_name(index, &clip.source_id, key));
            self.storage.download(bucket, key, &dest).await?;
            debug!(index, source = %clip.source_id, "staged input");
            paths.push(dest);
        }
        Ok(paths)
    }

    async fn render_thumbnail(
        &self,
        scratch: &ScratchDir,
        video: &Path,
        duration: f64,
    ) -> Option<PathBuf> {
        let thumbnail = video.with_extension("jpg");
        let at = (duration / 2.0).min(1.0);
        let args = thumbnail_args(video, at, &thumbnail);
        match self.runner.run(&self.config.ffmpeg, &args).await {
            Ok(_) if thumbnail.exists() => Some(thumbnail),
            Ok(_) => {
                warn!(scratch = %scratch.path().display(), "thumbnail extraction produced no file");
                None
            }
            Err(err) => {
                warn!(error = %err, "thumbnail extraction failed");
                None
            }
        }
    }

    async fn upload_thumbnail(&self, bucket: &str, owner_segment: &str, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        let key = format!("thumbnails/{owner_segment}/{name}");
        match self.storage.upload(bucket, &key, path, "image/jpeg").await {
            Ok(()) => Some(key),
            Err(err) => {
                warn!(error = %err, "thumbnail upload failed");
                None
            }
        }
    }
}

/// `NNN_<source>.<ext>`: position first so names never collide when one
/// source appears several times.
fn staged_file_name(index: usize, source_id: &str, storage_key: &str) -> String {
    let extension = Path::new(storage_key)
        .extension()
        .map(|ext| sanitize_key_segment(&ext.to_string_lossy()))
        .unwrap_or_else(|| "mp4".to_string());
    format!(
        "{index:03}_{}.{extension}",
        sanitize_key_segment(source_id)
    )
}

/// Timestamp plus random suffix, unique enough for concurrent exports.
fn output_file_name() -> String {
    format!(
        "export-{}-{:08x}.mp4",
        Utc::now().timestamp_millis(),
        OsRng.next_u32()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_graph::VIDEO_OUT;
    use crate::metadata::MetadataStore;
    use crate::process::{ProcessError, ProcessOutput};
    use crate::storage::{LocalStorage, StorageError, StorageResult};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeRunner {
        /// Source ids whose staged files report an audio stream.
        audio_sources: Vec<String>,
        probe_fails: bool,
        encode_fails: bool,
        thumbnail_fails: bool,
        encode_delay: Option<Duration>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
        inputs_present_at_encode: Mutex<Option<bool>>,
    }

    impl FakeRunner {
        fn encode_args(&self) -> Option<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(_, args)| args.iter().any(|arg| arg == "-filter_complex"))
                .map(|(_, args)| args.clone())
        }

        fn probe_count(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(program, _)| program == "ffprobe")
                .count()
        }
    }

    fn failed(program: &str, message: &str) -> ProcessError {
        ProcessError::Failed {
            program: program.to_string(),
            code: Some(1),
            message: message.to_string(),
        }
    }

    #[async_trait]
    impl ProcessRunner for FakeRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
        ) -> Result<ProcessOutput, ProcessError> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            let last = PathBuf::from(args.last().cloned().unwrap_or_default());

            if program == "ffprobe" {
                if self.probe_fails {
                    return Err(failed(program, "moov atom not found"));
                }
                let name = last.file_name().unwrap().to_string_lossy().into_owned();
                let audio = self
                    .audio_sources
                    .iter()
                    .any(|id| name.contains(&format!("_{id}.")));
                return Ok(ProcessOutput {
                    stdout: if audio { "audio\n".into() } else { String::new() },
                    stderr: String::new(),
                });
            }

            if args.iter().any(|arg| arg == "-filter_complex") {
                let present = args
                    .windows(2)
                    .filter(|pair| pair[0] == "-i")
                    .all(|pair| Path::new(&pair[1]).exists());
                *self.inputs_present_at_encode.lock().unwrap() = Some(present);
                if let Some(delay) = self.encode_delay {
                    tokio::time::sleep(delay).await;
                }
                if self.encode_fails {
                    return Err(failed(program, "Error initializing complex filters"));
                }
            } else if self.thumbnail_fails {
                return Err(failed(program, "Output file is empty"));
            }

            std::fs::write(&last, b"encoded").unwrap();
            Ok(ProcessOutput::default())
        }
    }

    #[derive(Default)]
    struct FakeStorage {
        objects: HashMap<String, Vec<u8>>,
        fail_uploads: bool,
        downloads: Mutex<Vec<(String, String, PathBuf)>>,
        uploads: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeStorage {
        fn with_objects(keys: &[&str]) -> Self {
            Self {
                objects: keys
                    .iter()
                    .map(|key| (key.to_string(), key.as_bytes().to_vec()))
                    .collect(),
                ..Self::default()
            }
        }

        fn download_keys(&self) -> Vec<String> {
            self.downloads
                .lock()
                .unwrap()
                .iter()
                .map(|(_, key, _)| key.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ObjectStorage for FakeStorage {
        async fn download(&self, bucket: &str, key: &str, dest: &Path) -> StorageResult<()> {
            self.downloads
                .lock()
                .unwrap()
                .push((bucket.to_string(), key.to_string(), dest.to_path_buf()));
            let bytes = self.objects.get(key).ok_or_else(|| StorageError::DownloadFailed {
                key: key.to_string(),
                message: "NoSuchKey".into(),
            })?;
            std::fs::write(dest, bytes).unwrap();
            Ok(())
        }

        async fn upload(
            &self,
            bucket: &str,
            key: &str,
            src: &Path,
            content_type: &str,
        ) -> StorageResult<()> {
            assert!(src.exists(), "uploaded file must still be staged");
            if self.fail_uploads {
                return Err(StorageError::UploadFailed {
                    key: key.to_string(),
                    message: "503 Slow Down".into(),
                });
            }
            self.uploads.lock().unwrap().push((
                bucket.to_string(),
                key.to_string(),
                content_type.to_string(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCatalog {
        rows: HashMap<String, Option<String>>,
        lookups: Mutex<Vec<Vec<String>>>,
    }

    impl FakeCatalog {
        fn with_rows(rows: &[(&str, Option<&str>)]) -> Self {
            Self {
                rows: rows
                    .iter()
                    .map(|(id, key)| (id.to_string(), key.map(str::to_string)))
                    .collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl SourceCatalog for FakeCatalog {
        async fn resolve_sources(&self, ids: &[String]) -> ExportResult<Vec<SourceAsset>> {
            self.lookups.lock().unwrap().push(ids.to_vec());
            Ok(ids
                .iter()
                .filter_map(|id| {
                    self.rows.get(id).map(|key| SourceAsset {
                        source_id: id.clone(),
                        storage_key: key.clone(),
                    })
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        fail: bool,
        records: Mutex<Vec<PublishedVideo>>,
    }

    #[async_trait]
    impl VideoPublisher for FakePublisher {
        async fn publish_video(&self, record: &PublishedVideo) -> ExportResult<()> {
            if self.fail {
                return Err(ExportError::database("database is locked"));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Harness {
        scratch_root: tempfile::TempDir,
        runner: Arc<FakeRunner>,
        storage: Arc<FakeStorage>,
        catalog: Arc<FakeCatalog>,
        publisher: Arc<FakePublisher>,
        bucket: Option<String>,
        deadline: Option<Duration>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                scratch_root: tempdir().unwrap(),
                runner: Arc::new(FakeRunner {
                    audio_sources: vec!["A".into()],
                    ..FakeRunner::default()
                }),
                storage: Arc::new(FakeStorage::with_objects(&["src/a.mp4", "src/b.mov"])),
                catalog: Arc::new(FakeCatalog::with_rows(&[
                    ("A", Some("src/a.mp4")),
                    ("B", Some("src/b.mov")),
                ])),
                publisher: Arc::new(FakePublisher::default()),
                bucket: Some("media".into()),
                deadline: None,
            }
        }

        fn service(&self) -> ExportService {
            ExportService::new(
                ExportConfig {
                    bucket: self.bucket.clone(),
                    scratch_root: Some(self.scratch_root.path().to_path_buf()),
                    deadline: self.deadline,
                    ..ExportConfig::default()
                },
                self.catalog.clone(),
                self.storage.clone(),
                self.runner.clone(),
                self.publisher.clone(),
            )
        }

        async fn export(&self, request: &ExportRequest) -> ExportResult<ExportOutcome> {
            self.service().export("user-1", request).await
        }

        fn assert_scratch_removed(&self) {
            let leftovers = std::fs::read_dir(self.scratch_root.path()).unwrap().count();
            assert_eq!(leftovers, 0, "scratch directory must not survive the job");
        }
    }

    fn request(timeline: Value) -> ExportRequest {
        ExportRequest {
            title: Some("My cut".into()),
            description: Some("two clips".into()),
            tags: Some("Funny, funny , CATS,,cats".into()),
            visibility: Some("hidden".into()),
            timeline_name: Some("Draft 1".into()),
            timeline,
        }
    }

    fn two_clips() -> Value {
        json!([
            {"videoId": "B", "start": 5, "in": 0, "out": 3},
            {"videoId": "A", "start": 0, "in": 2, "out": 5},
        ])
    }

    #[tokio::test]
    async fn publishes_two_clip_timeline() {
        let harness = Harness::new();
        let outcome = harness.export(&request(two_clips())).await.unwrap();

        let args = harness.runner.encode_args().expect("encoder invoked");
        let graph_pos = args.iter().position(|arg| arg == "-filter_complex").unwrap();
        assert_eq!(
            args[graph_pos + 1],
            "[0:v]trim=start=2:duration=3,setpts=PTS-STARTPTS[v0];\
             [0:a]atrim=start=2:duration=3,asetpts=PTS-STARTPTS[a0];\
             [1:v]trim=start=0:duration=3,setpts=PTS-STARTPTS[v1];\
             anullsrc=r=48000:cl=stereo,atrim=duration=3,asetpts=PTS-STARTPTS[a1];\
             [v0][a0][v1][a1]concat=n=2:v=1:a=1[vout][aout]"
        );
        let inputs: Vec<&String> = args
            .windows(2)
            .filter(|pair| pair[0] == "-i")
            .map(|pair| &pair[1])
            .collect();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0].ends_with("inputs/000_A.mp4"));
        assert!(inputs[1].ends_with("inputs/001_B.mov"));
        assert!(args.contains(&format!("[{VIDEO_OUT}]")));
        assert_eq!(*harness.runner.inputs_present_at_encode.lock().unwrap(), Some(true));

        assert_eq!(harness.storage.download_keys(), vec!["src/a.mp4", "src/b.mov"]);
        let uploads = harness.storage.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 2);
        let (bucket, key, content_type) = &uploads[0];
        assert_eq!(bucket, "media");
        assert!(key.starts_with("videos/user-1/export-") && key.ends_with(".mp4"));
        assert_eq!(content_type, "video/mp4");
        assert!(uploads[1].1.starts_with("thumbnails/user-1/export-"));
        assert_eq!(uploads[1].2, "image/jpeg");

        let records = harness.publisher.records.lock().unwrap().clone();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, outcome.video_id);
        assert_eq!(record.title, "My cut");
        assert_eq!(record.category, DEFAULT_CATEGORY);
        assert_eq!(record.visibility, Visibility::Public);
        assert_eq!(record.tags, vec!["funny", "cats"]);
        assert_eq!(record.storage_key, *key);
        assert_eq!(record.thumbnail_key.as_deref(), Some(uploads[1].1.as_str()));
        assert_eq!(record.duration_seconds, 6.0);
        assert_eq!(outcome.timeline_name.as_deref(), Some("Draft 1"));

        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn blank_title_is_rejected() {
        let harness = Harness::new();
        let mut req = request(two_clips());
        req.title = Some("   ".into());
        let err = harness.export(&req).await.unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
        assert!(harness.catalog.lookups.lock().unwrap().is_empty());
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn empty_or_degenerate_timeline_is_rejected() {
        let harness = Harness::new();
        for timeline in [
            json!([]),
            json!({"videoId": "A"}),
            json!([{"videoId": "A", "in": 4, "out": 4}]),
        ] {
            let err = harness.export(&request(timeline)).await.unwrap_err();
            assert!(matches!(err, ExportError::Validation(_)));
        }
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn missing_bucket_is_a_config_error() {
        let mut harness = Harness::new();
        harness.bucket = None;
        let err = harness.export(&request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::Config(_)));
        assert!(!err.is_client_error());
        assert!(harness.storage.download_keys().is_empty());
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn unknown_source_fails_before_any_download() {
        let harness = Harness::new();
        let timeline = json!([
            {"videoId": "A", "start": 0, "out": 1},
            {"videoId": "ghost", "start": 1, "out": 1},
            {"videoId": "B", "start": 2, "out": 1},
        ]);
        let err = harness.export(&request(timeline)).await.unwrap_err();
        match err {
            ExportError::UnknownSource(id) => assert_eq!(id, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
        let lookups = harness.catalog.lookups.lock().unwrap().clone();
        assert_eq!(lookups, vec![vec!["A".to_string(), "ghost".into(), "B".into()]]);
        assert!(harness.storage.download_keys().is_empty());
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn source_without_storage_key_is_rejected() {
        let mut harness = Harness::new();
        harness.catalog = Arc::new(FakeCatalog::with_rows(&[
            ("A", Some("src/a.mp4")),
            ("B", None),
        ]));
        let err = harness.export(&request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::MissingStorageKey(ref id) if id == "B"));
        assert!(err.is_client_error());
        assert!(harness.storage.download_keys().is_empty());
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn download_failure_aborts_the_job() {
        let mut harness = Harness::new();
        harness.storage = Arc::new(FakeStorage::with_objects(&["src/a.mp4"]));
        let err = harness.export(&request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::Storage(StorageError::DownloadFailed { .. })));
        assert_eq!(harness.runner.probe_count(), 0);
        assert!(harness.runner.encode_args().is_none());
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn repeated_sources_are_staged_per_clip() {
        let harness = Harness::new();
        let timeline = json!([
            {"videoId": "A", "start": 0, "in": 0, "out": 1},
            {"videoId": "B", "start": 1, "in": 0, "out": 1},
            {"videoId": "A", "start": 2, "in": 5, "out": 6},
        ]);
        harness.export(&request(timeline)).await.unwrap();

        assert_eq!(
            harness.storage.download_keys(),
            vec!["src/a.mp4", "src/b.mov", "src/a.mp4"]
        );
        assert_eq!(harness.catalog.lookups.lock().unwrap()[0], vec!["A", "B"]);
        let args = harness.runner.encode_args().unwrap();
        let graph = &args[args.iter().position(|arg| arg == "-filter_complex").unwrap() + 1];
        assert!(graph.contains("[2:a]atrim=start=5:duration=1"));
        assert!(graph.ends_with("[v0][a0][v1][a1][v2][a2]concat=n=3:v=1:a=1[vout][aout]"));
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn probe_failures_degrade_to_silence() {
        let mut harness = Harness::new();
        harness.runner = Arc::new(FakeRunner {
            probe_fails: true,
            ..FakeRunner::default()
        });
        harness.export(&request(two_clips())).await.unwrap();

        let args = harness.runner.encode_args().unwrap();
        let graph = &args[args.iter().position(|arg| arg == "-filter_complex").unwrap() + 1];
        assert_eq!(graph.matches("anullsrc").count(), 2);
        assert!(!graph.contains(":a]"));
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn encode_failure_skips_upload() {
        let mut harness = Harness::new();
        harness.runner = Arc::new(FakeRunner {
            encode_fails: true,
            ..FakeRunner::default()
        });
        let err = harness.export(&request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::Process(_)));
        assert!(harness.storage.uploads.lock().unwrap().is_empty());
        assert!(harness.publisher.records.lock().unwrap().is_empty());
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn upload_failure_skips_insert() {
        let mut harness = Harness::new();
        harness.storage = Arc::new(FakeStorage {
            fail_uploads: true,
            ..FakeStorage::with_objects(&["src/a.mp4", "src/b.mov"])
        });
        let err = harness.export(&request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::Storage(StorageError::UploadFailed { .. })));
        assert!(harness.publisher.records.lock().unwrap().is_empty());
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn insert_failure_still_cleans_up() {
        let mut harness = Harness::new();
        harness.publisher = Arc::new(FakePublisher {
            fail: true,
            ..FakePublisher::default()
        });
        let err = harness.export(&request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::Database(_)));
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn thumbnail_failure_is_not_fatal() {
        let mut harness = Harness::new();
        harness.runner = Arc::new(FakeRunner {
            thumbnail_fails: true,
            ..FakeRunner::default()
        });
        harness.export(&request(two_clips())).await.unwrap();
        let records = harness.publisher.records.lock().unwrap().clone();
        assert_eq!(records[0].thumbnail_key, None);
        assert_eq!(harness.storage.uploads.lock().unwrap().len(), 1);
        harness.assert_scratch_removed();
    }

    #[tokio::test]
    async fn deadline_expiry_times_out_and_cleans_up() {
        let mut harness = Harness::new();
        harness.runner = Arc::new(FakeRunner {
            encode_delay: Some(Duration::from_secs(30)),
            ..FakeRunner::default()
        });
        harness.deadline = Some(Duration::from_millis(50));
        let err = harness.export(&request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::Timeout(_)));
        assert!(harness.storage.uploads.lock().unwrap().is_empty());
        harness.assert_scratch_removed();
    }

    #[test]
    fn staged_names_encode_position_and_source() {
        assert_eq!(staged_file_name(0, "A", "src/a.mp4"), "000_A.mp4");
        assert_eq!(staged_file_name(12, "../x", "raw/blob"), "012____x.mp4");
        assert_eq!(staged_file_name(3, "B", "b.MOV"), "003_B.MOV");
    }

    #[test]
    fn output_names_are_unique_mp4_files() {
        let first = output_file_name();
        let second = output_file_name();
        assert!(first.starts_with("export-") && first.ends_with(".mp4"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn scratch_dir_has_inputs_and_out() {
        let root = tempdir().unwrap();
        let scratch = ScratchDir::create(Some(root.path())).unwrap();
        assert!(scratch.inputs().is_dir());
        assert!(scratch.out().is_dir());
        std::fs::write(scratch.inputs().join("000_A.mp4"), b"staged").unwrap();
        let path = scratch.path().to_path_buf();
        scratch.close().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unusable_scratch_root_fails_before_any_work() {
        let harness = Harness::new();
        let blocker = harness.scratch_root.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let service = ExportService::new(
            ExportConfig {
                bucket: Some("media".into()),
                scratch_root: Some(blocker.join("scratch")),
                ..ExportConfig::default()
            },
            harness.catalog.clone(),
            harness.storage.clone(),
            harness.runner.clone(),
            harness.publisher.clone(),
        );
        let err = service.export("user-1", &request(two_clips())).await.unwrap_err();
        assert!(matches!(err, ExportError::Io(_)));
        assert!(!err.is_client_error());
        assert!(harness.catalog.lookups.lock().unwrap().is_empty());
        assert!(harness.storage.download_keys().is_empty());
    }

    /// Full run against the real libsql store and local disk storage.
    #[tokio::test]
    async fn exports_against_real_store_and_local_storage() {
        let temp = tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(&temp.path().join("metadata.db")).await.unwrap());
        let storage_root = temp.path().join("storage");
        let storage = Arc::new(LocalStorage::new(&storage_root));

        for (id, key) in [("A", "sources/a.mp4"), ("B", "sources/b.mp4")] {
            let path = storage_root.join("media").join(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, id).unwrap();
            store
                .insert_video(&PublishedVideo {
                    id: id.into(),
                    owner_id: "someone".into(),
                    title: format!("Source {id}"),
                    description: String::new(),
                    category: DEFAULT_CATEGORY.into(),
                    visibility: Visibility::Public,
                    tags: vec![],
                    storage_key: key.into(),
                    thumbnail_key: None,
                    duration_seconds: 10.0,
                    timeline_name: None,
                    created_at: "2024-01-01T00:00:00+00:00".into(),
                })
                .await
                .unwrap();
        }

        let scratch_root = temp.path().join("scratch");
        let service = ExportService::new(
            ExportConfig {
                bucket: Some("media".into()),
                scratch_root: Some(scratch_root.clone()),
                ..ExportConfig::default()
            },
            store.clone(),
            storage,
            Arc::new(FakeRunner {
                audio_sources: vec!["A".into()],
                ..FakeRunner::default()
            }),
            store.clone(),
        );

        let mut req = request(two_clips());
        req.visibility = Some("Unlisted".into());
        let outcome = service.export("user-1", &req).await.unwrap();

        let saved = store.get_video(&outcome.video_id).await.unwrap().unwrap();
        assert_eq!(saved.visibility, Visibility::Unlisted);
        assert_eq!(saved.tags, vec!["funny", "cats"]);
        assert_eq!(saved.storage_key, outcome.storage_key);
        assert!(storage_root.join("media").join(&saved.storage_key).exists());
        assert_eq!(std::fs::read_dir(&scratch_root).unwrap().count(), 0);
    }
}
