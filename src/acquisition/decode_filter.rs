// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// FFmpeg抽帧过滤器模块
/// FFmpeg sampling filter module
use crossbeam_channel::Sender;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame as AvFrame};
use image::{DynamicImage, RgbImage};

use super::{effective_fps, sampling_interval, Frame};

/// FFmpeg抽帧过滤器: 视频流(rgb24) → 每 interval 帧取一帧 → 发送给采集线程
///
/// 间隔在第一帧到达时由帧自带的 duration/time_base 推出帧率后确定,
/// 不单独打开连接探测。
pub struct SamplingFilter {
    tx: Sender<Frame>,
    sampling_fps: f64,
    interval: Option<usize>,
    target: usize,
    read_count: usize,
    sent: usize,
}

impl SamplingFilter {
    pub fn new(tx: Sender<Frame>, sampling_fps: f64, target: usize) -> Self {
        Self {
            tx,
            sampling_fps,
            interval: None,
            target,
            read_count: 0,
            sent: 0,
        }
    }

    /// 首帧确定抽帧间隔, 之后不再变化
    fn resolve_interval(&mut self, reported_fps: Option<f64>) -> usize {
        if let Some(interval) = self.interval {
            return interval;
        }
        let fps = effective_fps(reported_fps);
        let interval = sampling_interval(fps, self.sampling_fps);
        tracing::debug!("🎞️ 流帧率 {:.1} (报告 {:?}) → 每 {} 帧取 1 帧", fps, reported_fps, interval);
        self.interval = Some(interval);
        interval
    }

    /// 第 read_count 帧是否应保留 (计数从 1 开始)
    fn should_keep(&self, read_count: usize) -> bool {
        let interval = self.interval.unwrap_or(1).max(1);
        self.sent < self.target && read_count % interval == 0
    }
}

/// 帧时长 × time_base → 帧率; 任一缺失返回 None
unsafe fn frame_fps(frame: &AvFrame) -> Option<f64> {
    let raw = &*frame.as_ptr();
    let tb = raw.time_base;
    if raw.duration <= 0 || tb.num <= 0 || tb.den <= 0 {
        return None;
    }
    let secs = raw.duration as f64 * tb.num as f64 / tb.den as f64;
    (secs > 0.0).then(|| 1.0 / secs)
}

impl FrameFilter for SamplingFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::debug!("✅ 抽帧过滤器启动 (目标 {} 帧)", self.target);
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: AvFrame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<AvFrame>, String> {
        unsafe {
            if frame.as_ptr().is_null() {
                return Ok(Some(frame));
            }
        }

        if self.interval.is_none() {
            let reported = unsafe { frame_fps(&frame) };
            self.resolve_interval(reported);
        }

        self.read_count += 1;
        if !self.should_keep(self.read_count) {
            return Ok(Some(frame));
        }

        // 帧内容不做校验: 黑屏/花屏帧照常交给检测
        if let Some(image) = unsafe { rgb24_to_image(&frame) } {
            // try_send 避免阻塞解码线程
            if self.tx.try_send(DynamicImage::ImageRgb8(image)).is_ok() {
                self.sent += 1;
            }
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        tracing::debug!("✅ 抽帧过滤器退出: 读取 {} 帧, 保留 {} 帧", self.read_count, self.sent);
    }
}

/// rgb24 AVFrame → RgbImage (按 linesize 逐行拷贝)
unsafe fn rgb24_to_image(frame: &AvFrame) -> Option<RgbImage> {
    let raw = &*frame.as_ptr();
    if raw.width <= 0 || raw.height <= 0 || raw.data[0].is_null() {
        return None;
    }

    let w = raw.width as usize;
    let h = raw.height as usize;
    let row_bytes = w * 3;
    let stride = raw.linesize[0];
    if stride < row_bytes as i32 {
        return None;
    }
    let stride = stride as usize;

    let mut rgb = Vec::with_capacity(row_bytes * h);
    for y in 0..h {
        let row = std::slice::from_raw_parts(raw.data[0].add(y * stride), row_bytes);
        rgb.extend_from_slice(row);
    }

    RgbImage::from_raw(w as u32, h as u32, rgb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_every_interval_frame_until_target() {
        let (tx, _rx) = crossbeam_channel::bounded(10);
        // 3fps 流, 1fps 采样 → 间隔 3
        let mut filter = SamplingFilter::new(tx, 1.0, 2);
        assert_eq!(filter.resolve_interval(Some(3.0)), 3);

        let kept: Vec<usize> = (1..=12).filter(|&n| filter.should_keep(n)).collect();
        assert_eq!(kept, vec![3, 6, 9, 12]);

        filter.sent = 2;
        assert!(!filter.should_keep(15));
    }

    #[test]
    fn test_interval_falls_back_to_default_fps() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let mut filter = SamplingFilter::new(tx, 1.0, 5);
        assert_eq!(filter.resolve_interval(None), 25);
        // 已确定后不再改变
        assert_eq!(filter.resolve_interval(Some(10.0)), 25);

        let (tx, _rx) = crossbeam_channel::bounded(1);
        let mut insane = SamplingFilter::new(tx, 1.0, 5);
        assert_eq!(insane.resolve_interval(Some(240.0)), 25);
    }

    #[test]
    fn test_fast_sampling_keeps_every_frame() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let mut filter = SamplingFilter::new(tx, 50.0, 5);
        assert_eq!(filter.resolve_interval(Some(25.0)), 1);
        assert!(filter.should_keep(1));
    }
}
