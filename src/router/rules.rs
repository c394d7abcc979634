use ipnetwork::IpNetwork;
use regex::Regex;
use std::net::IpAddr;
use std::str::FromStr;

use super::geodata::GeoData;
use crate::error::{Result, TunnelError};

/// 域名匹配器
#[derive(Debug, Clone)]
pub enum DomainMatcher {
    /// 完全相等
    Full(String),
    /// 后缀匹配，锚定在 `.` 或开头
    Suffix(String),
    /// 子串
    Keyword(String),
    /// 正则搜索
    Regex(Regex),
}

impl DomainMatcher {
    pub fn full(value: &str) -> Self {
        DomainMatcher::Full(value.to_ascii_lowercase())
    }

    pub fn suffix(value: &str) -> Self {
        DomainMatcher::Suffix(value.trim_start_matches('.').to_ascii_lowercase())
    }

    pub fn keyword(value: &str) -> Self {
        DomainMatcher::Keyword(value.to_ascii_lowercase())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(DomainMatcher::Regex)
            .map_err(|e| TunnelError::config_error(format!("Invalid regex '{}': {}", pattern, e)))
    }

    /// 正则按原样匹配，其余类型不区分大小写
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainMatcher::Regex(re) => re.is_match(domain),
            other => other.matches_folded(&domain.to_ascii_lowercase()),
        }
    }

    /// `domain` 需已转为小写
    fn matches_folded(&self, domain: &str) -> bool {
        match self {
            DomainMatcher::Full(value) => domain == value,
            DomainMatcher::Suffix(value) => {
                domain == value
                    || (domain.len() > value.len()
                        && domain.ends_with(value.as_str())
                        && domain.as_bytes()[domain.len() - value.len() - 1] == b'.')
            }
            DomainMatcher::Keyword(value) => domain.contains(value.as_str()),
            DomainMatcher::Regex(re) => re.is_match(domain),
        }
    }
}

/// 一条规则文本 `<prefix>:<value>`
#[derive(Debug, Clone)]
pub enum RuleSpec {
    Domain(DomainMatcher),
    Cidr(IpNetwork),
    GeoIp(String),
    GeoSite(String),
}

impl FromStr for RuleSpec {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (prefix, value) = match s.split_once(':') {
            Some((prefix, value)) if is_prefix(prefix) => (prefix, value),
            // 无前缀（或 IPv6 之类不认识的前缀）按关键字处理
            _ => ("keyword", s),
        };
        if value.is_empty() {
            return Err(TunnelError::config_error(format!("Empty rule value in '{}'", s)));
        }
        let spec = match prefix {
            "domain" => RuleSpec::Domain(DomainMatcher::suffix(value)),
            "full" => RuleSpec::Domain(DomainMatcher::full(value)),
            "regex" | "regexp" => RuleSpec::Domain(DomainMatcher::regex(value)?),
            "cidr" => RuleSpec::Cidr(parse_cidr(value)?),
            "geoip" => RuleSpec::GeoIp(value.to_ascii_lowercase()),
            "geosite" => RuleSpec::GeoSite(value.to_ascii_lowercase()),
            _ => RuleSpec::Domain(DomainMatcher::keyword(value)),
        };
        Ok(spec)
    }
}

fn is_prefix(prefix: &str) -> bool {
    matches!(
        prefix,
        "domain" | "full" | "keyword" | "regex" | "regexp" | "cidr" | "geoip" | "geosite"
    )
}

/// 解析 CIDR，单个 IP 视为主机路由
pub fn parse_cidr(value: &str) -> Result<IpNetwork> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(IpNetwork::from(ip));
    }
    value
        .parse::<IpNetwork>()
        .map_err(|e| TunnelError::config_error(format!("Invalid CIDR '{}': {}", value, e)))
}

/// 同一策略下的全部规则
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    domains: Vec<DomainMatcher>,
    cidrs: Vec<IpNetwork>,
}

impl RuleSet {
    /// 解析规则文本，geoip/geosite 通过 `geodata` 展开
    pub fn from_rules(rules: &[String], geodata: &dyn GeoData) -> Result<Self> {
        let mut set = RuleSet::default();
        for rule in rules {
            match rule.parse::<RuleSpec>()? {
                RuleSpec::Domain(matcher) => set.domains.push(matcher),
                RuleSpec::Cidr(net) => set.cidrs.push(net),
                RuleSpec::GeoIp(code) => set.cidrs.extend(geodata.load_geoip(&code)?),
                RuleSpec::GeoSite(code) => set.domains.extend(geodata.load_geosite(&code)?),
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.cidrs.is_empty()
    }

    pub fn has_cidrs(&self) -> bool {
        !self.cidrs.is_empty()
    }

    pub fn match_domain(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.');
        let folded = domain.to_ascii_lowercase();
        self.domains.iter().any(|m| match m {
            DomainMatcher::Regex(re) => re.is_match(domain),
            other => other.matches_folded(&folded),
        })
    }

    pub fn match_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.cidrs.iter().any(|net| net.contains(ip))
    }
}
