use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "trojan-tunnel")]
#[command(author, version, about = "Composable trojan tunnel with mux and rule routing", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (off, error, warn, info, debug, trace)，默认使用配置文件中的 log_level
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 按配置文件中的 run_type 运行客户端或服务端
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 模板类型
        #[arg(value_parser = ["server", "client"])]
        template_type: String,

        /// 输出文件路径（默认输出到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成测试用的自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["trojan-tunnel", "run", "-c", "server.toml", "-l", "debug"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Run { ref config } if config == "server.toml"));
    }

    #[test]
    fn test_parse_cert_alt_names() {
        let cli = Cli::try_parse_from([
            "trojan-tunnel",
            "cert",
            "--common-name",
            "example.com",
            "--alt-names",
            "a.example.com,b.example.com",
        ])
        .unwrap();
        match cli.command {
            Commands::Cert { alt_names, common_name, .. } => {
                assert_eq!(common_name, "example.com");
                assert_eq!(alt_names, vec!["a.example.com", "b.example.com"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_template_type_restricted() {
        assert!(Cli::try_parse_from(["trojan-tunnel", "template", "relay"]).is_err());
    }
}
