//! Frame-folder video dataset
//!
//! Each line of a label list describes one video as
//! `<relative dir> <start frame> <end frame> <label>` (or the three-field form
//! `<relative dir> <num frames> <label>`). Frames are individual image files
//! named by an image template such as `{:05d}.jpg`.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{DataConfig, Modality};
use crate::dataset::augmentation::{eval_views, ClipTransform};
use crate::dataset::loader::{ClipSample, ClipSource};
use crate::dataset::registry::DatasetEntry;
use crate::utils::error::{Result, SslError};

/// One video of a label list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub path: String,
    pub start_frame: usize,
    pub end_frame: usize,
    pub label: usize,
}

impl VideoRecord {
    pub fn num_frames(&self) -> usize {
        self.end_frame + 1 - self.start_frame
    }

    /// Parse one list line
    pub fn parse(line: &str, separator: &str) -> Result<Self> {
        let fields: Vec<&str> = if separator.trim().is_empty() {
            line.split_whitespace().collect()
        } else {
            line.split(separator).map(str::trim).collect()
        };
        let number = |s: &str| {
            s.parse::<usize>()
                .map_err(|_| SslError::Dataset(format!("Malformed list line '{}'", line)))
        };
        match fields.as_slice() {
            [path, start, end, label] => {
                let (start_frame, end_frame) = (number(start)?, number(end)?);
                if end_frame < start_frame {
                    return Err(SslError::Dataset(format!("End before start in '{}'", line)));
                }
                Ok(Self {
                    path: path.to_string(),
                    start_frame,
                    end_frame,
                    label: number(label)?,
                })
            }
            [path, frames, label] => {
                let frames = number(frames)?;
                if frames == 0 {
                    return Err(SslError::Dataset(format!("Empty video in '{}'", line)));
                }
                Ok(Self {
                    path: path.to_string(),
                    start_frame: 1,
                    end_frame: frames,
                    label: number(label)?,
                })
            }
            _ => Err(SslError::Dataset(format!("Malformed list line '{}'", line))),
        }
    }
}

/// Read a label list, dropping videos shorter than `filter_video` frames
pub fn read_list<P: AsRef<Path>>(path: P, separator: &str, filter_video: usize) -> Result<Vec<VideoRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SslError::PathNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    let mut dropped = 0;
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let record = VideoRecord::parse(line, separator)?;
        if record.num_frames() < filter_video {
            dropped += 1;
            continue;
        }
        records.push(record);
    }
    if dropped > 0 {
        info!("{:?}: dropped {} videos shorter than {} frames", path, dropped, filter_video);
    }
    Ok(records)
}

/// Frame file name template: `{}` is the flow direction, `{:0Nd}` the frame index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTemplate {
    raw: String,
}

impl ImageTemplate {
    pub fn new(raw: &str) -> Self {
        Self { raw: raw.to_string() }
    }

    pub fn format(&self, index: usize, direction: Option<&str>) -> String {
        let mut out = String::with_capacity(self.raw.len() + 8);
        let mut rest = self.raw.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let Some(close) = rest[open..].find('}') else {
                out.push_str(&rest[open..]);
                return out;
            };
            let spec = &rest[open + 1..open + close];
            if spec.is_empty() {
                out.push_str(direction.unwrap_or(""));
            } else {
                let width = spec
                    .trim_start_matches(":0")
                    .trim_end_matches('d')
                    .parse::<usize>()
                    .unwrap_or(0);
                out.push_str(&format!("{:0width$}", index, width = width));
            }
            rest = &rest[open + close + 1..];
        }
        out.push_str(rest);
        out
    }
}

/// Temporal sampling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub duration: usize,
    pub frames_per_group: usize,
    pub dense: bool,
    pub num_clips: usize,
}

impl Sampling {
    pub fn from_config(data: &DataConfig) -> Self {
        Self {
            duration: data.duration,
            frames_per_group: data.frames_per_group,
            dense: data.dense_sampling,
            num_clips: data.num_clips,
        }
    }

    /// The same sampling at twice the temporal stride
    pub fn fast(self) -> Self {
        Self {
            frames_per_group: self.frames_per_group * 2,
            dense: true,
            ..self
        }
    }

    /// Random frame offsets for training
    pub fn train_offsets(&self, num_frames: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
        let num_frames = num_frames.max(1);
        if self.dense {
            let span = self.duration * self.frames_per_group;
            let start = if num_frames > span {
                rng.gen_range(0..=num_frames - span)
            } else {
                0
            };
            (0..self.duration)
                .map(|i| (start + i * self.frames_per_group) % num_frames)
                .collect()
        } else {
            let segment = num_frames as f64 / self.duration as f64;
            (0..self.duration)
                .map(|i| {
                    let jitter = if segment >= 1.0 { rng.gen_range(0.0..segment) } else { 0.0 };
                    ((i as f64 * segment + jitter) as usize).min(num_frames - 1)
                })
                .collect()
        }
    }

    /// Evenly spaced frame offsets for every evaluation clip
    pub fn eval_offsets(&self, num_frames: usize) -> Vec<Vec<usize>> {
        let num_frames = num_frames.max(1);
        (0..self.num_clips)
            .map(|clip| {
                if self.dense {
                    let span = self.duration * self.frames_per_group;
                    let free = num_frames.saturating_sub(span);
                    let start = if self.num_clips > 1 {
                        free * clip / (self.num_clips - 1)
                    } else {
                        free / 2
                    };
                    (0..self.duration)
                        .map(|i| (start + i * self.frames_per_group) % num_frames)
                        .collect()
                } else {
                    let segment = num_frames as f64 / self.duration as f64;
                    let shift = segment * (clip as f64 + 0.5) / self.num_clips as f64;
                    (0..self.duration)
                        .map(|i| ((i as f64 * segment + shift) as usize).min(num_frames - 1))
                        .collect()
                }
            })
            .collect()
    }
}

/// How samples are turned into views
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipMode {
    /// One random view
    Train,
    /// Two random views at different temporal strides
    TwoView,
    /// `num_clips x num_crops` deterministic views
    Eval { num_crops: usize },
}

impl ClipMode {
    pub fn views(&self, num_clips: usize) -> usize {
        match self {
            ClipMode::Train => 1,
            ClipMode::TwoView => 2,
            ClipMode::Eval { num_crops } => num_crops * num_clips,
        }
    }
}

fn fits_fast_view(num_frames: usize, fast: Sampling) -> bool {
    num_frames >= fast.duration * fast.frames_per_group
}

/// Videos whose second unlabeled view falls back to regular sampling
pub fn fast_view_fallbacks(records: &[VideoRecord], sampling: Sampling) -> usize {
    let fast = sampling.fast();
    records.iter().filter(|r| !fits_fast_view(r.num_frames(), fast)).count()
}

/// Dataset of frame folders described by a label list
pub struct VideoDataSet {
    root: PathBuf,
    records: Vec<VideoRecord>,
    template: ImageTemplate,
    modality: Modality,
    sampling: Sampling,
    transform: ClipTransform,
    mode: ClipMode,
}

impl VideoDataSet {
    pub fn new(
        data: &DataConfig,
        entry: &DatasetEntry,
        list_name: &str,
        list_root: &Path,
        mode: ClipMode,
    ) -> Result<Self> {
        let list_path = list_root.join(list_name);
        let records = read_list(&list_path, &entry.separator, entry.filter_video)?;
        if records.is_empty() {
            return Err(SslError::Dataset(format!("{:?} lists no usable videos", list_path)));
        }
        if let Some(bad) = records.iter().find(|r| r.label >= entry.num_classes) {
            return Err(SslError::Dataset(format!(
                "Label {} of '{}' exceeds {} classes",
                bad.label, bad.path, entry.num_classes
            )));
        }
        info!("Loaded {} videos from {:?}", records.len(), list_path);

        let sampling = Sampling::from_config(data);
        if mode == ClipMode::TwoView {
            let short = fast_view_fallbacks(&records, sampling);
            if short > 0 {
                warn!(
                    "{} of {} videos are too short for the fast view and use regular sampling twice",
                    short,
                    records.len()
                );
            }
        }

        let template = match data.modality {
            Modality::Rgb => ImageTemplate::new(&entry.image_tmpl),
            Modality::Flow => ImageTemplate::new(&entry.flow_tmpl),
        };

        Ok(Self {
            root: data.data_dir.clone(),
            records,
            template,
            modality: data.modality,
            sampling,
            transform: ClipTransform::new(data),
            mode,
        })
    }

    pub fn records(&self) -> &[VideoRecord] {
        &self.records
    }

    fn open(&self, path: PathBuf) -> Result<DynamicImage> {
        image::open(&path).map_err(|e| SslError::FrameLoad(path, e.to_string()))
    }

    /// Channel images of the frames at `offsets`
    fn load_frames(&self, record: &VideoRecord, offsets: &[usize]) -> Result<Vec<Vec<DynamicImage>>> {
        let dir = self.root.join(&record.path);
        offsets
            .iter()
            .map(|&offset| match self.modality {
                Modality::Rgb => {
                    let name = self.template.format(record.start_frame + offset, None);
                    Ok(vec![self.open(dir.join(name))?])
                }
                Modality::Flow => {
                    // five consecutive x/y pairs
                    let mut stack = Vec::with_capacity(10);
                    for k in 0..5 {
                        let index = (record.start_frame + offset + k).min(record.end_frame);
                        for direction in ["x", "y"] {
                            let name = self.template.format(index, Some(direction));
                            stack.push(self.open(dir.join(name))?);
                        }
                    }
                    Ok(stack)
                }
            })
            .collect()
    }
}

impl ClipSource for VideoDataSet {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn label(&self, index: usize) -> usize {
        self.records[index].label
    }

    fn views(&self) -> usize {
        self.mode.views(self.sampling.num_clips)
    }

    fn clip_dims(&self) -> [usize; 4] {
        let size = self.transform.input_size();
        [self.modality.input_channels(), self.sampling.duration, size, size]
    }

    fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<ClipSample> {
        let record = &self.records[index];
        let num_frames = record.num_frames();

        let views = match self.mode {
            ClipMode::Train => {
                let offsets = self.sampling.train_offsets(num_frames, rng);
                vec![self.transform.train(&self.load_frames(record, &offsets)?, rng)]
            }
            ClipMode::TwoView => {
                let slow = self.sampling.train_offsets(num_frames, rng);
                let fast_sampling = self.sampling.fast();
                // runs on loader workers: no logging here, see fast_view_fallbacks
                let fast = if fits_fast_view(num_frames, fast_sampling) {
                    fast_sampling.train_offsets(num_frames, rng)
                } else {
                    self.sampling.train_offsets(num_frames, rng)
                };
                vec![
                    self.transform.train(&self.load_frames(record, &slow)?, rng),
                    self.transform.train(&self.load_frames(record, &fast)?, rng),
                ]
            }
            ClipMode::Eval { num_crops } => {
                let mut views = Vec::with_capacity(self.views());
                for offsets in self.sampling.eval_offsets(num_frames) {
                    let frames = self.load_frames(record, &offsets)?;
                    for view in eval_views(num_crops) {
                        views.push(self.transform.eval(&frames, view));
                    }
                }
                views
            }
        };

        Ok(ClipSample {
            views,
            label: record.label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::SeedableRng;

    #[test]
    fn test_parse_list_lines() {
        let record = VideoRecord::parse("abc/def 1 40 7", " ").unwrap();
        assert_eq!(record.num_frames(), 40);
        assert_eq!(record.label, 7);

        let record = VideoRecord::parse("clip,12,3", ",").unwrap();
        assert_eq!((record.start_frame, record.end_frame, record.label), (1, 12, 3));

        assert!(VideoRecord::parse("clip 5", " ").is_err());
        assert!(VideoRecord::parse("clip 9 3 1", " ").is_err());
    }

    #[test]
    fn test_read_list_filters_short_videos() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "a 1 40 0\nb 1 10 1\n\nc 1 31 2\n").unwrap();
        let records = read_list(&path, " ", 30).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn test_image_template() {
        assert_eq!(ImageTemplate::new("{:05d}.jpg").format(7, None), "00007.jpg");
        assert_eq!(ImageTemplate::new("img_{:03d}.png").format(12, None), "img_012.png");
        assert_eq!(ImageTemplate::new("{}_{:05d}.jpg").format(3, Some("x")), "x_00003.jpg");
    }

    #[test]
    fn test_sampling_offsets_in_range() {
        let sampling = Sampling {
            duration: 8,
            frames_per_group: 1,
            dense: false,
            num_clips: 2,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for num_frames in [3, 8, 50] {
            let offsets = sampling.train_offsets(num_frames, &mut rng);
            assert_eq!(offsets.len(), 8);
            assert!(offsets.iter().all(|&o| o < num_frames));
            assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        }
        let clips = sampling.eval_offsets(80);
        assert_eq!(clips.len(), 2);
        assert_ne!(clips[0], clips[1]);
    }

    #[test]
    fn test_fast_view_doubles_stride() {
        let sampling = Sampling {
            duration: 4,
            frames_per_group: 2,
            dense: true,
            num_clips: 1,
        };
        let fast = sampling.fast();
        let offsets = fast.train_offsets(100, &mut ChaCha8Rng::seed_from_u64(1));
        assert!(offsets.windows(2).all(|w| w[1] - w[0] == 4));
    }

    #[test]
    fn test_fast_view_fallbacks_counted_up_front() {
        let sampling = Sampling {
            duration: 4,
            frames_per_group: 1,
            dense: false,
            num_clips: 1,
        };
        let record = |end_frame| VideoRecord {
            path: "v".to_string(),
            start_frame: 1,
            end_frame,
            label: 0,
        };
        // fast view spans 4 x 2 frames
        let records = vec![record(20), record(8), record(7)];
        assert_eq!(fast_view_fallbacks(&records, sampling), 1);
    }

    #[test]
    fn test_load_rgb_clip_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let video_dir = dir.path().join("frames/vid0");
        std::fs::create_dir_all(&video_dir).unwrap();
        for i in 1..=6 {
            RgbImage::from_pixel(20, 16, Rgb([i as u8 * 30, 0, 0]))
                .save(video_dir.join(format!("{:05}.jpg", i)))
                .unwrap();
        }
        std::fs::write(dir.path().join("val.txt"), "vid0 1 6 1\n").unwrap();

        let mut config = crate::config::RunConfig::default();
        config.data.data_dir = dir.path().join("frames");
        config.data.duration = 3;
        config.data.input_size = 8;
        config.data.num_clips = 2;
        let mut entry = crate::dataset::registry::DatasetRegistry::builtin()
            .get("ucf101")
            .unwrap()
            .clone();
        entry.val_list = "val.txt".into();

        let dataset = VideoDataSet::new(
            &config.data,
            &entry,
            "val.txt",
            dir.path(),
            ClipMode::Eval { num_crops: 3 },
        )
        .unwrap();
        assert_eq!(dataset.views(), 6);
        assert_eq!(dataset.clip_dims(), [3, 3, 8, 8]);

        let sample = dataset.load(0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(sample.label, 1);
        assert_eq!(sample.views.len(), 6);
        assert!(sample.views.iter().all(|v| v.len() == 3 * 3 * 64));
    }

    #[test]
    fn test_missing_frame_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.txt"), "missing 1 4 0\n").unwrap();
        let mut config = crate::config::RunConfig::default();
        config.data.data_dir = dir.path().to_path_buf();
        let entry = crate::dataset::registry::DatasetRegistry::builtin()
            .get("ucf101")
            .unwrap()
            .clone();
        let dataset =
            VideoDataSet::new(&config.data, &entry, "train.txt", dir.path(), ClipMode::Train).unwrap();
        let err = dataset.load(0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(err, SslError::FrameLoad(_, _)));
    }
}
