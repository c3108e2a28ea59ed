//! Bot Framework 主程序入口
//!
//! 从配置目录加载观察者并广播消息

use anyhow::{Context, Result};
use bot_framework::cli::args::{Args, Commands};
use bot_framework::cli::commands::{Command, ObserversCommand, RunCommand, SendCommand};
use bot_framework::logging::{LogConfig, LoggingSystem};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 初始化日志系统
    let log_config = LogConfig {
        level: args.log_level.clone().into(),
        json_format: args.json_logs,
        ..Default::default()
    };
    LoggingSystem::setup_logging(log_config).context("初始化日志系统失败")?;

    info!("Bot Framework v{} 启动", bot_framework::VERSION);

    if let Err(e) = execute_command(&args).await {
        error!("命令执行失败: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// 执行CLI命令
async fn execute_command(args: &Args) -> Result<()> {
    let command: Box<dyn Command> = match &args.command {
        Commands::Run => Box::new(RunCommand),
        Commands::Send { .. } => Box::new(SendCommand),
        Commands::Observers { .. } => Box::new(ObserversCommand),
    };
    command.execute(args).await
}
