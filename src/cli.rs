use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tproxy-mitm")]
#[command(author, version, about = "Transparent interception proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行透明代理
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "tproxy-mitm.toml")]
        config: PathBuf,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: PathBuf,
    },
    /// 生成根证书和私钥
    Ca {
        /// 根证书输出路径
        #[arg(long, value_name = "PATH", default_value = "rootCA.pem")]
        cert_out: PathBuf,

        /// 私钥输出路径（PKCS#8 PEM）
        #[arg(long, value_name = "PATH", default_value = "rootCA.key")]
        key_out: PathBuf,

        /// 根证书的 Common Name
        #[arg(long, default_value = "tproxy-mitm Root CA")]
        common_name: String,

        /// 根证书的组织名
        #[arg(long, default_value = "tproxy-mitm")]
        organization: String,
    },
}
