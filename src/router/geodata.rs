use ipnetwork::IpNetwork;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::rules::{parse_cidr, DomainMatcher};
use crate::error::{Result, TunnelError};

/// geoip/geosite 数据来源
pub trait GeoData: Send + Sync {
    fn load_geoip(&self, code: &str) -> Result<Vec<IpNetwork>>;

    fn load_geosite(&self, code: &str) -> Result<Vec<DomainMatcher>>;
}

/// 内置的 `geoip:private`
const PRIVATE_NETWORKS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

/// 文本格式的地理数据目录
///
/// `<dir>/geoip/<code>.txt` 每行一个 CIDR；`<dir>/geosite/<code>.txt` 每行一条域名规则，
/// 支持 `domain:`、`full:`、`keyword:`、`regexp:` 前缀，无前缀按后缀匹配。`#` 开头为注释。
#[derive(Debug, Clone, Default)]
pub struct TextGeoData {
    dir: Option<PathBuf>,
}

impl TextGeoData {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn lines(&self, kind: &str, code: &str) -> Result<Option<Vec<String>>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = dir.join(kind).join(format!("{}.txt", code));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_lines(&path)?))
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|e| {
        TunnelError::config_error(format!("Failed to read geodata {:?}: {}", path, e))
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

impl GeoData for TextGeoData {
    fn load_geoip(&self, code: &str) -> Result<Vec<IpNetwork>> {
        let lines = match self.lines("geoip", code)? {
            Some(lines) => lines,
            None if code == "private" => PRIVATE_NETWORKS.iter().map(|s| s.to_string()).collect(),
            None => {
                return Err(TunnelError::config_error(format!("geoip:{} not found", code)));
            }
        };
        let nets = lines.iter().map(|line| parse_cidr(line)).collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} networks for geoip:{}", nets.len(), code);
        Ok(nets)
    }

    fn load_geosite(&self, code: &str) -> Result<Vec<DomainMatcher>> {
        let lines = self
            .lines("geosite", code)?
            .ok_or_else(|| TunnelError::config_error(format!("geosite:{} not found", code)))?;
        let mut matchers = Vec::with_capacity(lines.len());
        for line in &lines {
            let matcher = match line.split_once(':') {
                Some(("domain", value)) => DomainMatcher::suffix(value),
                Some(("full", value)) => DomainMatcher::full(value),
                Some(("keyword", value)) => DomainMatcher::keyword(value),
                Some(("regexp", value)) => DomainMatcher::regex(value)?,
                _ => DomainMatcher::suffix(line),
            };
            matchers.push(matcher);
        }
        debug!("Loaded {} domains for geosite:{}", matchers.len(), code);
        Ok(matchers)
    }
}
