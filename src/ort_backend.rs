// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ONNX Runtime 后端 (ort)
//!
//! 负责执行器选择、会话构建与单输入推理。

use std::str::FromStr;

use anyhow::{anyhow, Result};
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::info;

/// 执行器 (Execution Provider)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
}

impl FromStr for OrtEP {
    type Err = anyhow::Error;

    /// `cpu` / `cuda` / `cuda:N`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "" | "cpu" => Ok(OrtEP::CPU),
            "cuda" | "gpu" => Ok(OrtEP::CUDA(0)),
            _ => match s.strip_prefix("cuda:") {
                Some(id) => id
                    .parse::<i32>()
                    .map(OrtEP::CUDA)
                    .map_err(|_| anyhow!("无效的 CUDA 设备编号: {}", id)),
                None => Err(anyhow!("不支持的计算设备: {}", s)),
            },
        }
    }
}

/// 推理输出: (形状, 按行主序展开的数据)
pub struct OrtOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

pub struct OrtBackend {
    session: Session,
    input_name: String,
    ep: OrtEP,
}

impl OrtBackend {
    pub fn build(model: &str, ep: OrtEP) -> Result<Self> {
        info!("🧠 加载 ONNX 模型: {} ({:?})", model, ep);

        let builder = Session::builder()?;
        let builder = match ep {
            OrtEP::CPU => {
                builder.with_execution_providers([CPUExecutionProvider::default().build()])?
            }
            OrtEP::CUDA(id) => builder.with_execution_providers([
                CUDAExecutionProvider::default().with_device_id(id).build(),
                CPUExecutionProvider::default().build(),
            ])?,
        };
        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "images".to_string());

        Ok(Self {
            session,
            input_name,
            ep,
        })
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }

    /// 单输入 → 第一个输出
    pub fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<OrtOutput> {
        let shape: Vec<usize> = xs.shape().to_vec();
        let (data, _) = xs.into_raw_vec_and_offset();
        let value = ort::value::Value::from_array((shape.as_slice(), data.into_boxed_slice()))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => value])?;
        let (out_shape, out_data) = outputs[0].try_extract_tensor::<f32>()?;

        Ok(OrtOutput {
            shape: out_shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: out_data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!("cpu".parse::<OrtEP>().unwrap(), OrtEP::CPU);
        assert_eq!("CUDA".parse::<OrtEP>().unwrap(), OrtEP::CUDA(0));
        assert_eq!("cuda:1".parse::<OrtEP>().unwrap(), OrtEP::CUDA(1));
        assert!("cuda:x".parse::<OrtEP>().is_err());
        assert!("tpu".parse::<OrtEP>().is_err());
    }
}
