use anyhow::{bail, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "receiver-simulator", about = "闪烁监测接收机模拟器")]
pub struct Config {
    /// TCP 监听地址，连接上的客户端都收到同样的数据
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// 输出文件
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// 历元间隔（毫秒）
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    /// 模拟卫星数
    #[arg(long, default_value_t = 8)]
    pub sats: u16,

    /// 闪烁强度，0 表示无闪烁
    #[arg(long, default_value_t = 0.2)]
    pub scintillation: f64,

    /// 每个相关块的样本数
    #[arg(long, default_value_t = 50)]
    pub samples: usize,

    /// 回放目录，按文件名顺序发送其中的 *.bin 文件
    #[arg(long)]
    pub replay_dir: Option<PathBuf>,

    /// 发送的历元数，0 表示不限
    #[arg(long, default_value_t = 0)]
    pub epochs: u64,

    /// 随机数种子
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_none() && self.output.is_none() {
            bail!("either --listen or --output is required");
        }
        if self.listen.is_some() && self.output.is_some() {
            bail!("--listen and --output are mutually exclusive");
        }
        if self.interval_ms == 0 {
            bail!("--interval-ms must be positive");
        }
        if !(1..=32).contains(&self.sats) {
            bail!("--sats must be within 1..=32, got {}", self.sats);
        }
        if !self.scintillation.is_finite() || self.scintillation < 0.0 {
            bail!("--scintillation must be non-negative");
        }
        if self.samples == 0 {
            bail!("--samples must be positive");
        }
        Ok(())
    }
}
