//! SciStar - 科学问答智能体执行引擎
//!
//! 模块划分：
//! - **agent**: 按配置装配 LLM、工具、运行时与委派协调器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 预算、错误分类、恢复策略、关闭信号
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **observability**: tracing 日志
//! - **react**: ReAct 状态机、单步执行、反思、管理者/子智能体委派
//! - **runner**: 任务加载、并发运行、结果日志
//! - **tools**: 工具注册表与内置工具（搜索、抓取、检查、检索、代码执行）

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod runner;
pub mod tools;
