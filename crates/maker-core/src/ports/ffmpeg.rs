//! Processor backed by the `ffmpeg` and `ffprobe` executables.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use super::process;
use super::{MediaProbe, PortError, Processor, TransformRequest};
use crate::cancel::CancellationToken;
use crate::derive::OutputFormat;
use crate::timerange::Span;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FfmpegProcessor {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    timeout: Option<Duration>,
}

impl FfmpegProcessor {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn ffmpeg(&self, args: Vec<OsString>, cancel: &CancellationToken) -> Result<(), PortError> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-hide_banner").arg("-y").args(args);
        process::run(cmd, cancel, self.timeout).map(|_| ())
    }

    fn render_gif(&self, request: &TransformRequest<'_>, cancel: &CancellationToken) -> Result<(), PortError> {
        let palette = request.output.with_extension("palette.png");

        let mut first = trim_input_args(request.input, request.start, request.span);
        first.extend([OsString::from("-vf"), OsString::from("palettegen=max_colors=256")]);
        first.push(palette.clone().into_os_string());

        let mut second = trim_input_args(request.input, request.start, request.span);
        second.extend([OsString::from("-i"), palette.clone().into_os_string()]);
        second.extend([OsString::from("-lavfi"), OsString::from("[0:v][1:v]paletteuse")]);
        second.push(request.output.as_os_str().to_owned());

        let result = self.ffmpeg(first, cancel).and_then(|_| self.ffmpeg(second, cancel));
        if palette.exists() {
            let _ = fs::remove_file(&palette);
        }
        result
    }
}

impl Processor for FfmpegProcessor {
    fn transform(&self, request: &TransformRequest<'_>, cancel: &CancellationToken) -> Result<PathBuf, PortError> {
        info!(
            input = %request.input.display(),
            output = %request.output.display(),
            format = %request.format,
            "rendering"
        );

        if request.format == OutputFormat::Gif {
            self.render_gif(request, cancel)?;
            return Ok(request.output.to_path_buf());
        }

        let has_audio = self.probe(request.input, cancel)?.has_audio;
        if !has_audio && (request.format.is_audio() || !request.allow_no_audio) {
            return Err(PortError::Other(format!(
                "{} has no audio stream",
                request.input.display()
            )));
        }

        let mut args = trim_input_args(request.input, request.start, request.span);
        if request.format.is_audio() {
            args.push(OsString::from("-vn"));
        } else if !has_audio {
            args.push(OsString::from("-an"));
        }
        args.extend(codec_args(request.format).iter().map(OsString::from));
        args.push(request.output.as_os_str().to_owned());

        self.ffmpeg(args, cancel)?;
        Ok(request.output.to_path_buf())
    }

    fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<MediaProbe, PortError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args(["-v", "error", "-show_format", "-show_streams", "-of", "json"])
            .arg(path);
        let output = process::run(cmd, cancel, self.timeout)?;
        let probe = parse_probe(&output.stdout).map_err(|reason| PortError::Output {
            program: self.ffprobe_bin.clone(),
            reason,
        })?;
        debug!(path = %path.display(), ?probe, "probed");
        Ok(probe)
    }
}

/// Seek before the input, then bound the duration; `ToEnd` omits `-t`.
fn trim_input_args(input: &Path, start: f64, span: Span) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-ss".into(), format!("{:.3}", start).into()];
    if let Span::Seconds(duration) = span {
        args.extend([OsString::from("-t"), OsString::from(format!("{:.3}", duration))]);
    }
    args.extend([OsString::from("-i"), input.as_os_str().to_owned()]);
    args
}

fn codec_args(format: OutputFormat) -> &'static [&'static str] {
    match format {
        OutputFormat::Mp4 => &["-c:v", "libx264", "-c:a", "aac", "-movflags", "+faststart"],
        OutputFormat::Mkv => &["-c:v", "libx264", "-c:a", "aac", "-f", "matroska"],
        OutputFormat::Webm => &["-c:v", "libvpx-vp9", "-c:a", "libopus", "-f", "webm"],
        OutputFormat::Gif => &[],
        OutputFormat::M4a => &["-c:a", "aac"],
        OutputFormat::Wav => &["-c:a", "pcm_s16le"],
        OutputFormat::Mp3 => &["-c:a", "libmp3lame"],
    }
}

fn parse_probe(stdout: &[u8]) -> Result<MediaProbe, String> {
    let out: FfprobeOutput = serde_json::from_slice(stdout).map_err(|e| e.to_string())?;
    let streams = out.streams.unwrap_or_default();
    let video = streams.iter().find(|s| s.codec_type.as_deref() == Some("video"));

    Ok(MediaProbe {
        duration: out
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse().ok()),
        width: video.and_then(|v| v.width),
        height: video.and_then(|v| v.height),
        fps: video
            .and_then(|v| v.r_frame_rate.as_deref())
            .and_then(parse_frame_rate),
        has_audio: streams.iter().any(|s| s.codec_type.as_deref() == Some("audio")),
        container: out.format.and_then(|f| f.format_name),
    })
}

/// `"30000/1001"` -> 29.97
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    (den != 0.0).then(|| num / den)
}
