use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha224};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 密码的 SHA-224 十六进制摘要（56 个小写字符）
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// 已认证用户
pub trait User: Send + Sync {
    /// 用户密码的摘要
    fn hash(&self) -> &str;

    /// 累加流量（发送给客户端 / 从客户端接收）
    fn add_traffic(&self, sent: u64, recv: u64);

    /// 当前累计流量 `(sent, recv)`
    fn traffic(&self) -> (u64, u64);

    /// 登记来源 IP，超过并发 IP 限制时返回 false
    fn add_ip(&self, ip: IpAddr) -> bool;

    /// 释放来源 IP
    fn del_ip(&self, ip: IpAddr);
}

/// 用户认证器
pub trait Authenticator: Send + Sync {
    fn auth_user(&self, hash: &str) -> Option<Arc<dyn User>>;

    fn add_user(&self, hash: &str);

    fn del_user(&self, hash: &str);

    fn list_users(&self) -> Vec<Arc<dyn User>>;
}

/// 内存中的用户
#[derive(Debug)]
pub struct MemoryUser {
    hash: String,
    sent: AtomicU64,
    recv: AtomicU64,
    ip_limit: usize,
    ips: Mutex<HashMap<IpAddr, usize>>,
}

impl MemoryUser {
    pub fn new(hash: String, ip_limit: usize) -> Self {
        Self {
            hash,
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            ip_limit,
            ips: Mutex::new(HashMap::new()),
        }
    }

    /// 当前在线的来源 IP 数
    pub fn ip_count(&self) -> usize {
        self.ips.lock().len()
    }
}

impl User for MemoryUser {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn add_traffic(&self, sent: u64, recv: u64) {
        self.sent.fetch_add(sent, Ordering::Relaxed);
        self.recv.fetch_add(recv, Ordering::Relaxed);
    }

    fn traffic(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.recv.load(Ordering::Relaxed),
        )
    }

    fn add_ip(&self, ip: IpAddr) -> bool {
        let mut ips = self.ips.lock();
        if let Some(count) = ips.get_mut(&ip) {
            *count += 1;
            return true;
        }
        if self.ip_limit > 0 && ips.len() >= self.ip_limit {
            return false;
        }
        ips.insert(ip, 1);
        true
    }

    fn del_ip(&self, ip: IpAddr) {
        let mut ips = self.ips.lock();
        if let Some(count) = ips.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                ips.remove(&ip);
            }
        }
    }
}

/// 基于内存表的认证器
#[derive(Default)]
pub struct MemoryAuthenticator {
    users: RwLock<HashMap<String, Arc<MemoryUser>>>,
    ip_limit: usize,
}

impl MemoryAuthenticator {
    pub fn new(ip_limit: usize) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            ip_limit,
        }
    }

    /// 由明文密码列表构建
    pub fn from_passwords(passwords: &[String], ip_limit: usize) -> Self {
        let auth = Self::new(ip_limit);
        for password in passwords {
            auth.add_user(&password_hash(password));
        }
        auth
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

impl Authenticator for MemoryAuthenticator {
    fn auth_user(&self, hash: &str) -> Option<Arc<dyn User>> {
        self.users
            .read()
            .get(hash)
            .map(|user| user.clone() as Arc<dyn User>)
    }

    fn add_user(&self, hash: &str) {
        debug!("Adding user {}", hash);
        self.users
            .write()
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(MemoryUser::new(hash.to_string(), self.ip_limit)));
    }

    fn del_user(&self, hash: &str) {
        self.users.write().remove(hash);
    }

    fn list_users(&self) -> Vec<Arc<dyn User>> {
        self.users
            .read()
            .values()
            .map(|user| user.clone() as Arc<dyn User>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash() {
        let hash = password_hash("p");
        assert_eq!(hash.len(), 56);
        assert!(hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        // SHA-224("")
        assert_eq!(
            password_hash(""),
            "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
    }

    #[test]
    fn test_auth_lookup() {
        let auth = MemoryAuthenticator::from_passwords(&["p".to_string()], 0);
        assert!(auth.auth_user(&password_hash("p")).is_some());
        assert!(auth.auth_user(&password_hash("q")).is_none());

        auth.del_user(&password_hash("p"));
        assert!(auth.is_empty());
    }

    #[test]
    fn test_traffic_counters() {
        let user = MemoryUser::new("h".to_string(), 0);
        user.add_traffic(10, 0);
        user.add_traffic(5, 7);
        assert_eq!(user.traffic(), (15, 7));
    }

    #[test]
    fn test_ip_limit() {
        let user = MemoryUser::new("h".to_string(), 1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(user.add_ip(a));
        assert!(user.add_ip(a));
        assert!(!user.add_ip(b));

        user.del_ip(a);
        assert!(!user.add_ip(b));
        user.del_ip(a);
        assert_eq!(user.ip_count(), 0);
        assert!(user.add_ip(b));
    }
}
