//! 视频片段检查
//!
//! 拼接前确认每个片段可读。启用 `ffmpeg-probe` 特性时用 FFmpeg 读取视频流参数，
//! 否则只检查文件存在且非空。

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

/// 视频流参数
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_secs: f64,
}

/// 片段检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct ClipInfo {
    pub size_bytes: u64,
    /// 未启用 FFmpeg 检查时为 None
    pub video: Option<StreamInfo>,
}

pub fn probe_clip(path: &Path) -> Result<ClipInfo> {
    let size_bytes = std::fs::metadata(path)
        .with_context(|| format!("无法读取片段: {}", path.display()))?
        .len();
    if size_bytes == 0 {
        anyhow::bail!("片段为空: {}", path.display());
    }

    Ok(ClipInfo {
        size_bytes,
        video: probe_stream(path)?,
    })
}

#[cfg(feature = "ffmpeg-probe")]
fn probe_stream(path: &Path) -> Result<Option<StreamInfo>> {
    use ffmpeg_next as ffmpeg;

    ffmpeg::init().context("初始化 FFmpeg 失败")?;
    // 只输出错误级别日志
    unsafe {
        ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
    }

    let ictx = ffmpeg::format::input(&path).context("无法打开视频文件")?;
    let stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .context("未找到视频流")?;

    let codec = format!("{:?}", stream.parameters().id());
    let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("无法创建解码器上下文")?
        .decoder()
        .video()
        .context("无法创建视频解码器")?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };
    let duration_secs = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;

    Ok(Some(StreamInfo {
        codec,
        width: decoder.width(),
        height: decoder.height(),
        fps,
        duration_secs,
    }))
}

#[cfg(not(feature = "ffmpeg-probe"))]
fn probe_stream(_path: &Path) -> Result<Option<StreamInfo>> {
    Ok(None)
}

/// 流拷贝拼接要求编码和分辨率一致；不一致时只告警
pub fn check_uniform(clips: &[ClipInfo]) -> bool {
    let streams: Vec<&StreamInfo> = clips.iter().filter_map(|c| c.video.as_ref()).collect();
    let Some(first) = streams.first() else {
        return true;
    };
    let uniform = streams
        .iter()
        .all(|s| s.codec == first.codec && s.width == first.width && s.height == first.height);
    if !uniform {
        warn!("⚠️  [视频拼接] 片段编码或分辨率不一致，流拷贝拼接结果可能异常");
    }
    uniform
}
