//! MinerMon-RS - 局域网比特币独立矿机发现与监控引擎
//!
//! 面向 Bitaxe、Avalon Nano、Magic Miner 等家用独立矿机的
//! 发现与监控服务：
//! - 网络扫描：CIDR × 端口集的有界并发探测与协议分类
//! - 矿机注册表：每台矿机一个独立轮询任务，失败退避、自动恢复
//! - 时序存储：SQLite 指标样本，按保留期自动清理
//! - 实时推送：主题化 WebSocket 发布/订阅
//! - HTTP API：发现、矿机管理、历史指标查询
//!
//! ## 架构特点
//!
//! ### 协议适配器
//! - 每种矿机协议一个适配器，统一的 trait 接口
//! - HTTP JSON、原始 TCP JSON、网页抓取三种接入方式
//! - 通用适配器按配置映射任意 JSON 状态接口
//!
//! ### 可靠性设计
//! - 扫描取消是协作式的，在途探测允许完成
//! - 慢 WebSocket 客户端被丢弃，不阻塞其余订阅者
//! - 删除矿机先停轮询任务再删记录，不留孤儿写入

pub mod adapter;
pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod monitor;
pub mod registry;
pub mod scanner;
pub mod storage;

pub use config::Config;
pub use error::MonitorError;
pub use monitor::MonitorManager;

/// 程序版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 程序名称
pub const NAME: &str = "minermon-rs";
