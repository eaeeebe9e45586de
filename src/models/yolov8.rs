// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 人数统计模型
// 包含: 模型加载、letterbox 预处理、推理、person 类后处理

use std::time::Instant;

use anyhow::{anyhow, Result};
use fast_image_resize as fr;
use image::DynamicImage;
use ndarray::{Array, IxDyn};
use tracing::info;

use crate::detection::PersonCounter;
use crate::ort_backend::{OrtBackend, OrtEP, OrtOutput};
use crate::{non_max_suppression, Bbox};

/// COCO person 类别编号
pub const PERSON_CLASS_ID: usize = 0;
const CXYWH_OFFSET: usize = 4;
/// letterbox 填充灰度
const PAD_VALUE: u8 = 114;

/// letterbox 变换参数 (原图 → 模型输入)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub new_w: u32,
    pub new_h: u32,
}

impl Letterbox {
    pub fn new(w0: u32, h0: u32, size: u32) -> Self {
        let scale = (size as f32 / w0 as f32).min(size as f32 / h0 as f32);
        let new_w = ((w0 as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((h0 as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            pad_x: ((size - new_w) / 2) as f32,
            pad_y: ((size - new_h) / 2) as f32,
            new_w,
            new_h,
        }
    }
}

/// YOLOv8 检测模型 (只统计 person)
pub struct YoloPersonCounter {
    engine: OrtBackend,
    size: u32,
    iou: f32,
    resizer: fr::Resizer,
}

impl YoloPersonCounter {
    /// 加载模型并预热; 失败即启动失败
    pub fn new(model: &str, device: &str, iou: f32, input_size: u32) -> Result<Self> {
        let ep: OrtEP = device.parse()?;
        let engine = OrtBackend::build(model, ep)?;
        let mut counter = Self {
            engine,
            size: input_size,
            iou,
            resizer: fr::Resizer::new(),
        };
        counter.warmup()?;
        Ok(counter)
    }

    /// 全尺寸黑图预热, 避免首帧推理耗时异常
    fn warmup(&mut self) -> Result<()> {
        let t = Instant::now();
        let dummy = DynamicImage::new_rgb8(self.size, self.size);
        let n = self.count_people(&dummy, 0.5)?;
        info!(
            "✅ 模型预热完成: {:.0}ms (EP {:?}, 检测到 {} 人)",
            t.elapsed().as_secs_f64() * 1000.0,
            self.engine.ep(),
            n
        );
        Ok(())
    }

    /// letterbox + 归一化 → [1, 3, S, S]
    pub fn preprocess(&mut self, frame: &DynamicImage) -> Result<(Array<f32, IxDyn>, Letterbox)> {
        let size = self.size;
        let rgb = frame.to_rgb8();
        let (w0, h0) = rgb.dimensions();
        if w0 == 0 || h0 == 0 {
            return Err(anyhow!("空图像 {}x{}", w0, h0));
        }
        let lb = Letterbox::new(w0, h0, size);

        let src = fr::images::Image::from_vec_u8(w0, h0, rgb.into_raw(), fr::PixelType::U8x3)?;
        let mut dst = fr::images::Image::new(lb.new_w, lb.new_h, fr::PixelType::U8x3);
        self.resizer.resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )?;

        let s = size as usize;
        let mut xs = Array::from_elem(IxDyn(&[1, 3, s, s]), PAD_VALUE as f32 / 255.0);
        let pixels = dst.buffer();
        let (px, py) = (lb.pad_x as usize, lb.pad_y as usize);
        for y in 0..lb.new_h as usize {
            for x in 0..lb.new_w as usize {
                let i = (y * lb.new_w as usize + x) * 3;
                for c in 0..3 {
                    xs[[0, c, y + py, x + px]] = pixels[i + c] as f32 / 255.0;
                }
            }
        }
        Ok((xs, lb))
    }

    /// YOLOv8 输出 → person 框 (原图坐标, 已 NMS)
    pub fn postprocess(
        output: &OrtOutput,
        lb: &Letterbox,
        confidence: f32,
        iou: f32,
    ) -> Result<Vec<Bbox>> {
        let (channels, anchors, transposed) = match output.shape.as_slice() {
            // 部分导出为 [1, anchors, 4+nc]
            [1, a, b] if *a > *b && *b > CXYWH_OFFSET => (*b, *a, true),
            [1, a, b] if *a > CXYWH_OFFSET => (*a, *b, false),
            other => return Err(anyhow!("无法识别的输出形状 {:?}", other)),
        };
        if output.data.len() < channels * anchors {
            return Err(anyhow!("输出数据长度不足"));
        }

        // 取第 k 个通道、第 i 个 anchor
        let at = |k: usize, i: usize| {
            if transposed {
                output.data[i * channels + k]
            } else {
                output.data[k * anchors + i]
            }
        };

        let mut boxes = Vec::new();
        for i in 0..anchors {
            let score = at(CXYWH_OFFSET + PERSON_CLASS_ID, i);
            if score < confidence {
                continue;
            }
            let cx = (at(0, i) - lb.pad_x) / lb.scale;
            let cy = (at(1, i) - lb.pad_y) / lb.scale;
            let w = at(2, i) / lb.scale;
            let h = at(3, i) / lb.scale;
            boxes.push(Bbox::new(
                (cx - w / 2.).max(0.),
                (cy - h / 2.).max(0.),
                w,
                h,
                PERSON_CLASS_ID,
                score,
            ));
        }

        non_max_suppression(&mut boxes, iou);
        Ok(boxes)
    }

    pub fn detect(&mut self, frame: &DynamicImage, confidence: f32) -> Result<Vec<Bbox>> {
        let (xs, lb) = self.preprocess(frame)?;
        let ys = self.engine.run(xs)?;
        Self::postprocess(&ys, &lb, confidence, self.iou)
    }
}

impl PersonCounter for YoloPersonCounter {
    fn count_people(&mut self, frame: &DynamicImage, confidence: f32) -> Result<usize> {
        Ok(self.detect(frame, confidence)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 构造 [1, 4+nc, n] 输出
    fn output(nc: usize, preds: &[[f32; 5]], extra_class: &[f32]) -> OrtOutput {
        let n = preds.len();
        let channels = CXYWH_OFFSET + nc;
        let mut data = vec![0.0; channels * n];
        for (i, p) in preds.iter().enumerate() {
            for k in 0..5 {
                data[k * n + i] = p[k];
            }
            if nc > 1 {
                data[5 * n + i] = extra_class.get(i).copied().unwrap_or(0.0);
            }
        }
        OrtOutput {
            shape: vec![1, channels, n],
            data,
        }
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::new(1280, 720, 640);
        assert_eq!(lb.scale, 0.5);
        assert_eq!((lb.new_w, lb.new_h), (640, 360));
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 140.0));
    }

    #[test]
    fn test_postprocess_counts_person_only() {
        let lb = Letterbox::new(640, 640, 640);
        // 两个分开的人, 一个低分, 一个只有别的类别高分
        let out = output(
            2,
            &[
                [100., 100., 50., 100., 0.9],
                [400., 300., 50., 100., 0.8],
                [200., 200., 50., 100., 0.2],
                [500., 500., 50., 100., 0.1],
            ],
            &[0.0, 0.0, 0.0, 0.95],
        );
        let boxes = YoloPersonCounter::postprocess(&out, &lb, 0.4, 0.45).unwrap();
        assert_eq!(boxes.len(), 2);
        assert!(boxes.iter().all(|b| b.id() == PERSON_CLASS_ID));
    }

    #[test]
    fn test_postprocess_suppresses_overlaps() {
        let lb = Letterbox::new(640, 640, 640);
        let out = output(
            1,
            &[[100., 100., 50., 100., 0.9], [102., 101., 50., 100., 0.85]],
            &[],
        );
        let boxes = YoloPersonCounter::postprocess(&out, &lb, 0.4, 0.45).unwrap();
        assert_eq!(boxes.len(), 1);
        assert!((boxes[0].confidence() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_postprocess_maps_back_to_original() {
        let lb = Letterbox::new(1280, 720, 640);
        let out = output(1, &[[320., 320., 100., 200., 0.9]], &[]);
        let boxes = YoloPersonCounter::postprocess(&out, &lb, 0.4, 0.45).unwrap();
        let b = &boxes[0];
        assert!((b.width() - 200.).abs() < 1e-3);
        assert!((b.xmin() - 540.).abs() < 1e-3);
        assert!((b.ymin() - 160.).abs() < 1e-3);
    }

    #[test]
    fn test_postprocess_rejects_bad_shape() {
        let lb = Letterbox::new(640, 640, 640);
        let out = OrtOutput {
            shape: vec![2, 3],
            data: vec![0.0; 6],
        };
        assert!(YoloPersonCounter::postprocess(&out, &lb, 0.4, 0.45).is_err());
    }
}
